//! Fund identity lookup from a detected fund name.

use std::collections::HashMap;

use crate::models::Fund;

/// Case- and whitespace-insensitive lookup key for fund names.
pub fn fund_key(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Maps a detected fund name to a known fund. `None` means the rows of that
/// table cannot be attributed and are reported instead of committed.
pub trait FundDirectory: Send + Sync {
    fn lookup(&self, fund_name: &str, amc_hint: Option<&str>) -> Option<Fund>;
}

/// A fixed set of funds, for deployments with a curated fund master.
#[derive(Clone, Debug, Default)]
pub struct StaticFundDirectory {
    funds: HashMap<String, Fund>,
}

impl StaticFundDirectory {
    pub fn new(funds: impl IntoIterator<Item = Fund>) -> Self {
        Self {
            funds: funds
                .into_iter()
                .map(|f| (fund_key(&f.fund_name), f))
                .collect(),
        }
    }

    /// Register an extra spelling for an existing fund.
    pub fn with_alias(mut self, alias: &str, fund_id: &str) -> Self {
        if let Some(fund) = self.funds.values().find(|f| f.fund_id == fund_id).cloned() {
            self.funds.insert(fund_key(alias), fund);
        }
        self
    }
}

impl FundDirectory for StaticFundDirectory {
    fn lookup(&self, fund_name: &str, _amc_hint: Option<&str>) -> Option<Fund> {
        self.funds.get(&fund_key(fund_name)).cloned()
    }
}

/// Accepts every named fund, deriving a stable id from the normalized name.
#[derive(Clone, Copy, Debug, Default)]
pub struct DerivedFundDirectory;

impl DerivedFundDirectory {
    pub fn fund_id(fund_name: &str) -> String {
        let crc = crc32fast::hash(fund_key(fund_name).as_bytes()) & 0x7FFF_FFFF;
        format!("fund-{crc:08x}")
    }
}

impl FundDirectory for DerivedFundDirectory {
    fn lookup(&self, fund_name: &str, amc_hint: Option<&str>) -> Option<Fund> {
        let name = fund_name.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return None;
        }
        let amc = amc_hint
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .or_else(|| name.split_whitespace().next())
            .unwrap_or_default()
            .to_string();
        Some(Fund {
            fund_id: Self::fund_id(&name),
            fund_name: name,
            amc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_lookup_ignores_case_and_spacing() {
        let dir = StaticFundDirectory::new(vec![Fund {
            fund_id: "F1".into(),
            fund_name: "HDFC Flexi Cap Fund".into(),
            amc: "HDFC".into(),
        }])
        .with_alias("HDFC Equity Fund", "F1");
        assert_eq!(dir.lookup("hdfc  FLEXI cap fund", None).unwrap().fund_id, "F1");
        assert_eq!(dir.lookup("HDFC Equity Fund", None).unwrap().fund_id, "F1");
        assert!(dir.lookup("Axis Bluechip Fund", None).is_none());
    }

    #[test]
    fn test_derived_ids_are_stable() {
        let a = DerivedFundDirectory.lookup("Axis  Bluechip Fund", None).unwrap();
        let b = DerivedFundDirectory.lookup("axis bluechip fund", Some("Axis")).unwrap();
        assert_eq!(a.fund_id, b.fund_id);
        assert!(a.fund_id.starts_with("fund-"));
        assert_eq!(a.fund_name, "Axis Bluechip Fund");
        assert_eq!(a.amc, "Axis");
        assert!(DerivedFundDirectory.lookup("   ", None).is_none());
    }

    #[test]
    fn test_derived_amc_prefers_hint() {
        let fund = DerivedFundDirectory
            .lookup("Parag Parikh Flexi Cap Fund", Some("PPFAS"))
            .unwrap();
        assert_eq!(fund.amc, "PPFAS");
    }
}
