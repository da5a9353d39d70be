//! Asset taxonomy assignment.
//!
//! Rules are tried in priority order; each rule looks at the security name
//! and then at the raw category. The first hit decides. Nothing matching
//! yields `OTHER / Unclassified`, so classification never fails.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{AssetClass, ClassifiedHolding, NormalizedHolding};

pub const UNCLASSIFIED: &str = "Unclassified";

/// Sub-types whose members are listed shares and therefore resolvable
/// against the instrument registry.
pub const RESOLVABLE_SUB_TYPES: &[&str] = &["Indian Equity", "Foreign Equity", "Preferential Shares"];

struct Rule {
    pattern: Regex,
    asset_class: AssetClass,
    sub_type: &'static str,
}

fn rule(pattern: &str, asset_class: AssetClass, sub_type: &'static str) -> Rule {
    Rule {
        pattern: Regex::new(&format!("(?i){pattern}")).unwrap(),
        asset_class,
        sub_type,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    use AssetClass::*;
    vec![
        rule(
            r"net\s+current\s+assets|net\s+receivables?|cash\s*(&|and)\s*cash\s+equivalents?",
            Other,
            "Net Current Assets",
        ),
        rule(
            r"\btreps\b|tri[\s\-]?party\s+repo|\breverse\s+repo\b|\bcblo\b",
            MoneyMarket,
            "TREPS and Others",
        ),
        rule(
            r"treasury\s+bills?|\bt[\s\-]?bills?\b|\b\d{2,3}\s*d(ays?)?\s+(tb|goi)\b",
            GovernmentSecurities,
            "T-Bill",
        ),
        rule(r"commercial\s+papers?|\bcp\b", MoneyMarket, "Commercial Paper"),
        rule(
            r"certificates?\s+of\s+deposits?|\bcds?\b",
            MoneyMarket,
            "Certificate of Deposit",
        ),
        rule(
            r"state\s+development\s+loans?|\bsdl\b|state\s+government",
            GovernmentSecurities,
            "State Government Bonds",
        ),
        rule(
            r"government\s+(of\s+india|securities|bonds?)|\bgoi\b|\bg[\s\-]?secs?\b",
            GovernmentSecurities,
            "Government Bonds",
        ),
        rule(r"index\s+options?", Equity, "Index Options"),
        rule(r"stock\s+options?", Equity, "Stock Options"),
        rule(r"\bfutures?\b", Equity, "Stock Futures"),
        rule(r"gold\s+(etf|bees|exchange\s+traded)", Equity, "Gold ETF"),
        rule(r"silver\s+(etf|bees|exchange\s+traded)", Equity, "Silver ETF"),
        rule(
            r"\breits?\b|\binvits?\b|(real\s+estate|infrastructure)\s+investment\s+trust",
            Equity,
            "REIT/INVIT",
        ),
        rule(r"\betf\b|\bbees\b|exchange\s+traded\s+fund", Equity, "Indian ETF"),
        rule(
            r"mutual\s+fund\s+units?|\bfund\b.*\b(direct|regular)\s+(plan|growth)",
            Equity,
            "Mutual Fund Units",
        ),
        rule(r"zero\s+coupon|\bzcb\b", CorporateDebt, "Zero Coupon Bond"),
        rule(
            r"securiti[sz]ed\s+debt|pass\s+through\s+certificates?|\bptcs?\b",
            CorporateDebt,
            "Securitised Debt",
        ),
        rule(
            r"non[\s\-]*convertible\s+debentures?|\bncds?\b",
            CorporateDebt,
            "Non Convertible Debentures",
        ),
        rule(
            r"convertible\s+debentures?|\bccds?\b",
            CorporateDebt,
            "Convertible Debentures",
        ),
        rule(
            r"\bdebentures?\b|\bbonds?\b|corporate\s+debt|debt\s+instruments?",
            CorporateDebt,
            "Corporate Bonds",
        ),
        rule(r"money\s+market", MoneyMarket, "TREPS and Others"),
        rule(r"preferential|preference\s+shares?", Equity, "Preferential Shares"),
        rule(
            r"foreign\s+(equity|securities|shares)|overseas|\b(adr|gdr)s?\b|\b(inc|plc|ag|n\.v|s\.a)\.?$",
            Equity,
            "Foreign Equity",
        ),
        rule(r"\bcommodit(y|ies)\b|\bgold\b|\bsilver\b", Other, "Commodity"),
        rule(
            r"equity|\bshares?\b|\b(ltd|limited)\.?$|\.(ns|bo)$|^(nse|bse)\s*:",
            Equity,
            "Indian Equity",
        ),
    ]
});

#[derive(Clone, Copy, Debug, Default)]
pub struct AssetClassifier;

impl AssetClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Total and pure: same inputs, same class.
    pub fn classify(&self, raw_category: &str, security_name: &str) -> (AssetClass, String) {
        let name = security_name.trim();
        let category = raw_category.trim();
        RULES
            .iter()
            .find(|r| r.pattern.is_match(name) || r.pattern.is_match(category))
            .map(|r| (r.asset_class, r.sub_type.to_string()))
            .unwrap_or_else(|| (AssetClass::Other, UNCLASSIFIED.to_string()))
    }

    pub fn classify_holding(&self, holding: NormalizedHolding) -> ClassifiedHolding {
        let (asset_class, sub_type) = self.classify(&holding.raw_category, &holding.security_name);
        ClassifiedHolding {
            holding,
            asset_class,
            sub_type,
        }
    }
}

/// Whether identity resolution should be attempted for this class.
pub fn is_resolvable(asset_class: AssetClass, sub_type: &str) -> bool {
    asset_class == AssetClass::Equity && RESOLVABLE_SUB_TYPES.contains(&sub_type)
}
