//! Turning raw table rows into canonical holding records.
//!
//! Free-text cleanup is a capability behind [`TextNormalizer`]; in production
//! it may be a slow, remote model call. [`RecordNormalizer`] drives it row by
//! row, retries transient failures of a single call, and enforces the
//! post-conditions the rest of the pipeline relies on. Rows that violate them
//! are rejected with a reason, never patched up.

use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::errors::{FundGraphError, FundGraphResult};
use crate::extract::merger::{header_signature, normalize_header_cell};
use crate::models::{IngestionIssue, MergedTable, NormalizedHolding};

// ---------------------------------------------------------------------------
// Capability contract
// ---------------------------------------------------------------------------

/// Why a row is not a holding at all.
#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    Blank,
    /// A section title such as "Equity & Equity Related"; carries the title.
    SectionHeader(String),
    Subtotal,
    /// The header repeated at the top of a continuation page.
    RepeatedHeader,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum NormalizationError {
    #[error("row skipped: {0:?}")]
    Skip(SkipReason),
    #[error("malformed row: {0}")]
    Malformed(String),
    /// Transient; the single call may be retried.
    #[error("normalizer unavailable: {0}")]
    Unavailable(String),
}

/// `normalize(raw_row, header) -> NormalizedHolding | NormalizationError`.
///
/// Implementations parse weights written with symbols and either locale's
/// separators, and recognise blank, section-header and subtotal rows.
pub trait TextNormalizer: Send + Sync {
    fn normalize(
        &self,
        row: &[String],
        header: &[String],
    ) -> Result<NormalizedHolding, NormalizationError>;
}

// ---------------------------------------------------------------------------
// Number parsing
// ---------------------------------------------------------------------------

const EMPTY_MARKERS: &[&str] = &["-", "--", "nil", "na", "n.a.", "n/a"];

/// Parse a weight such as `"9.18%"`, `"9,18 %"`, `"1,234.5"` or `"(0.52)"`.
///
/// With both separators present the later one is the decimal point. A lone
/// comma followed by exactly three digits is read as a thousands separator.
pub fn parse_weight(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || EMPTY_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }
    let negative = trimmed.starts_with('-')
        || trimmed.starts_with('\u{2212}')
        || (trimmed.starts_with('(') && trimmed.ends_with(')'));

    let kept: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_dot = kept.rfind('.');
    let last_comma = kept.rfind(',');
    let canonical = match (last_dot, last_comma) {
        (Some(d), Some(c)) if c > d => kept.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => kept.replace(',', ""),
        (None, Some(c)) => {
            let digits_after = kept.len() - c - 1;
            if kept.matches(',').count() == 1 && digits_after != 3 {
                kept.replace(',', ".")
            } else {
                kept.replace(',', "")
            }
        }
        (Some(_), None) if kept.matches('.').count() > 1 => kept.replace('.', ""),
        _ => kept,
    };

    let value: f64 = canonical.trim_matches('.').parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Quantities are whole or fractional units; same separator rules.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    parse_weight(raw).filter(|q| *q >= 0.0)
}

// ---------------------------------------------------------------------------
// Heuristic capability
// ---------------------------------------------------------------------------

const NAME_KEYWORDS: &[&str] = &[
    "security", "instrument", "name", "company", "issuer", "holding", "scrip", "stock",
];
const WEIGHT_KEYWORDS: &[&str] = &[
    "%", "weight", "nav", "netasset", "allocation", "aum", "exposure",
];
const QUANTITY_KEYWORDS: &[&str] = &["quantity", "qty", "units", "shares"];
const CATEGORY_KEYWORDS: &[&str] = &["category", "assetclass", "instrumenttype", "type"];

/// Whole-cell aggregate labels only; "Total SA" is a security.
static SUBTOTAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(sub[\s\-]*total|grand\s+total|total(\s+(net\s+assets?|assets|holdings|investments|portfolio|equity|debt))?)\s*[:\-]?\s*$",
    )
    .unwrap()
});
static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(equity\s*(&|and)\s*equity\s+related|debt\s+instruments|money\s+market\s+instruments|(listed|unlisted)\s+/|listed\s*/\s*awaiting|privately\s+placed|awaiting\s+listing)",
    )
    .unwrap()
});

#[derive(Clone, Copy, Debug, PartialEq)]
struct ColumnRoles {
    name: usize,
    weight: Option<usize>,
    quantity: Option<usize>,
    category: Option<usize>,
}

fn find_column(normalized: &[String], keywords: &[&str], taken: &[usize]) -> Option<usize> {
    normalized
        .iter()
        .enumerate()
        .filter(|(i, _)| !taken.contains(i))
        .find(|(_, name)| keywords.iter().any(|k| name.contains(k)))
        .map(|(i, _)| i)
}

fn detect_roles(header: &[String]) -> ColumnRoles {
    let normalized = header_signature(header);
    let weight = find_column(&normalized, WEIGHT_KEYWORDS, &[]);
    let taken: Vec<usize> = weight.into_iter().collect();
    let name = find_column(&normalized, NAME_KEYWORDS, &taken)
        .or_else(|| (0..header.len()).find(|i| Some(*i) != weight))
        .unwrap_or(0);
    let mut taken = taken;
    taken.push(name);
    let quantity = find_column(&normalized, QUANTITY_KEYWORDS, &taken);
    taken.extend(quantity);
    let category = find_column(&normalized, CATEGORY_KEYWORDS, &taken);
    ColumnRoles {
        name,
        weight,
        quantity,
        category,
    }
}

fn cell_at(row: &[String], idx: Option<usize>) -> &str {
    idx.and_then(|i| row.get(i)).map(|c| c.trim()).unwrap_or("")
}

/// Deterministic rule-based stand-in for the text-normalization capability.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicNormalizer;

impl TextNormalizer for HeuristicNormalizer {
    fn normalize(
        &self,
        row: &[String],
        header: &[String],
    ) -> Result<NormalizedHolding, NormalizationError> {
        if row.iter().all(|c| c.trim().is_empty()) {
            return Err(NormalizationError::Skip(SkipReason::Blank));
        }
        let row_signature: Vec<String> = row.iter().map(|c| normalize_header_cell(c)).collect();
        if row_signature == header_signature(header) {
            return Err(NormalizationError::Skip(SkipReason::RepeatedHeader));
        }

        let roles = detect_roles(header);
        let name = cell_at(row, Some(roles.name))
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        if SUBTOTAL_RE.is_match(&name) {
            return Err(NormalizationError::Skip(SkipReason::Subtotal));
        }
        if SECTION_RE.is_match(&name) {
            return Err(NormalizationError::Skip(SkipReason::SectionHeader(name)));
        }

        let weight = parse_weight(cell_at(row, roles.weight));
        let weight = match weight {
            Some(w) => w,
            None => {
                let other_numbers = row
                    .iter()
                    .enumerate()
                    .any(|(i, c)| i != roles.name && parse_weight(c).is_some());
                if !name.is_empty() && !other_numbers {
                    return Err(NormalizationError::Skip(SkipReason::SectionHeader(name)));
                }
                return Err(NormalizationError::Malformed(format!(
                    "no numeric weight in column {:?}",
                    roles.weight.and_then(|i| header.get(i)).map(|s| s.as_str()).unwrap_or("?")
                )));
            }
        };

        Ok(NormalizedHolding {
            security_name: name,
            weight_pct: weight,
            quantity: parse_quantity(cell_at(row, roles.quantity)),
            raw_category: cell_at(row, roles.category).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Record normalizer
// ---------------------------------------------------------------------------

/// A holding that passed normalization, with where it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct SourcedHolding {
    pub page_index: usize,
    pub row_index: usize,
    pub holding: NormalizedHolding,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableNormalization {
    pub holdings: Vec<SourcedHolding>,
    pub rejected: Vec<IngestionIssue>,
    pub skipped: usize,
    pub rows_seen: usize,
}

pub struct RecordNormalizer<'a> {
    capability: &'a dyn TextNormalizer,
    max_line_weight_pct: f64,
    max_attempts: u32,
    backoff: Duration,
}

impl<'a> RecordNormalizer<'a> {
    pub fn new(capability: &'a dyn TextNormalizer, config: &PipelineConfig) -> Self {
        Self {
            capability,
            max_line_weight_pct: config.max_line_weight_pct,
            max_attempts: config.normalize_max_attempts.max(1),
            backoff: Duration::from_millis(config.normalize_retry_backoff_ms),
        }
    }

    /// Reject, never repair.
    pub fn check_postconditions(&self, holding: &NormalizedHolding) -> Result<(), String> {
        if holding.security_name.trim().is_empty() {
            return Err("empty security name".to_string());
        }
        let w = holding.weight_pct;
        if !w.is_finite() {
            return Err(format!("weight {w} is not a finite number"));
        }
        if w < 0.0 {
            return Err(format!("negative weight {w}"));
        }
        if w > self.max_line_weight_pct {
            return Err(format!(
                "weight {w} exceeds {}% for a single line",
                self.max_line_weight_pct
            ));
        }
        Ok(())
    }

    /// Call the capability, retrying only `Unavailable` with linear backoff.
    /// Exhausting the attempts fails the whole document.
    fn call_with_retry(
        &self,
        row: &[String],
        header: &[String],
    ) -> FundGraphResult<Result<NormalizedHolding, NormalizationError>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.capability.normalize(row, header) {
                Err(NormalizationError::Unavailable(message)) => {
                    if attempt >= self.max_attempts {
                        return Err(FundGraphError::NormalizationUnavailable {
                            attempts: attempt,
                            message,
                        });
                    }
                    warn!(attempt, message = message.as_str(), "normalizer unavailable, retrying");
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff * attempt);
                    }
                }
                other => return Ok(other),
            }
        }
    }

    pub fn normalize_table(&self, table: &MergedTable) -> FundGraphResult<TableNormalization> {
        let mut out = TableNormalization::default();
        let mut section = String::new();

        for (row_index, row) in table.rows.iter().enumerate() {
            out.rows_seen += 1;
            let reject = |reason: String| IngestionIssue::NormalizationRejected {
                page_index: row.page_index,
                row_index,
                security_name: row
                    .cells
                    .iter()
                    .map(|c| c.trim())
                    .find(|c| !c.is_empty())
                    .unwrap_or("")
                    .to_string(),
                reason,
            };

            match self.call_with_retry(&row.cells, &table.header)? {
                Ok(mut holding) => match self.check_postconditions(&holding) {
                    Ok(()) => {
                        holding.security_name = holding.security_name.trim().to_string();
                        if holding.raw_category.trim().is_empty() {
                            holding.raw_category = section.clone();
                        }
                        out.holdings.push(SourcedHolding {
                            page_index: row.page_index,
                            row_index,
                            holding,
                        });
                    }
                    Err(reason) => out.rejected.push(reject(reason)),
                },
                Err(NormalizationError::Skip(reason)) => {
                    if let SkipReason::SectionHeader(title) = &reason {
                        section = title.clone();
                    }
                    debug!(row_index, reason = ?reason, "skipping non-holding row");
                    out.skipped += 1;
                }
                Err(NormalizationError::Malformed(reason))
                | Err(NormalizationError::Unavailable(reason)) => out.rejected.push(reject(reason)),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawRow;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn table(header: &[&str], rows: &[&[&str]]) -> MergedTable {
        MergedTable {
            fund_name: Some("Test Fund".into()),
            amc_hint: None,
            header: strings(header),
            pages: vec![1],
            rows: rows
                .iter()
                .map(|r| RawRow {
                    page_index: 1,
                    cells: strings(r),
                })
                .collect(),
        }
    }

    fn quiet_config() -> PipelineConfig {
        PipelineConfig {
            normalize_retry_backoff_ms: 0,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_parse_weight_variants() {
        assert_eq!(parse_weight("9.18%"), Some(9.18));
        assert_eq!(parse_weight(" 9,18 % "), Some(9.18));
        assert_eq!(parse_weight("1,234.50"), Some(1234.5));
        assert_eq!(parse_weight("1.234,5"), Some(1234.5));
        assert_eq!(parse_weight("1,234"), Some(1234.0));
        assert_eq!(parse_weight("(0.52)"), Some(-0.52));
        assert_eq!(parse_weight("-0.10%"), Some(-0.1));
        assert_eq!(parse_weight("₹ 12.5"), Some(12.5));
        assert_eq!(parse_weight("--"), None);
        assert_eq!(parse_weight("AAA"), None);
        assert_eq!(parse_weight(""), None);
    }

    #[test]
    fn test_heuristic_normalizes_simple_row() {
        let h = HeuristicNormalizer
            .normalize(&strings(&["HDFC Bank Ltd", "9.18%"]), &strings(&["Security", "Weight%"]))
            .unwrap();
        assert_eq!(h.security_name, "HDFC Bank Ltd");
        assert_eq!(h.weight_pct, 9.18);
        assert_eq!(h.quantity, None);
    }

    #[test]
    fn test_heuristic_finds_columns_by_keyword() {
        let header = strings(&["Market Value", "% to NAV", "Name of the Instrument", "Quantity"]);
        let h = HeuristicNormalizer
            .normalize(&strings(&["1,200.00", "3.40", "Infosys Limited", "12,500"]), &header)
            .unwrap();
        assert_eq!(h.security_name, "Infosys Limited");
        assert_eq!(h.weight_pct, 3.4);
        assert_eq!(h.quantity, Some(12500.0));
    }

    #[test]
    fn test_heuristic_skips_non_holding_rows() {
        let header = strings(&["Security", "Weight%"]);
        let skip = |row: &[&str]| HeuristicNormalizer.normalize(&strings(row), &header).unwrap_err();
        assert_eq!(skip(&["", " "]), NormalizationError::Skip(SkipReason::Blank));
        assert_eq!(skip(&["Security", "Weight %"]), NormalizationError::Skip(SkipReason::RepeatedHeader));
        assert_eq!(skip(&["Sub Total", "65.3"]), NormalizationError::Skip(SkipReason::Subtotal));
        assert_eq!(skip(&["Grand Total", "100.00"]), NormalizationError::Skip(SkipReason::Subtotal));
        assert_eq!(skip(&["Total:", "99.8"]), NormalizationError::Skip(SkipReason::Subtotal));
        assert_eq!(skip(&["Total Net Assets", "100.00"]), NormalizationError::Skip(SkipReason::Subtotal));
        assert_eq!(
            skip(&["Equity & Equity Related", "95.1"]),
            NormalizationError::Skip(SkipReason::SectionHeader("Equity & Equity Related".into()))
        );
        assert_eq!(
            skip(&["Treasury Bills", ""]),
            NormalizationError::Skip(SkipReason::SectionHeader("Treasury Bills".into()))
        );
    }

    #[test]
    fn test_securities_named_total_are_holdings() {
        let header = strings(&["Security", "Weight%"]);
        for name in ["Total SA", "Total Energies SE", "TotalEnergies SE"] {
            let h = HeuristicNormalizer
                .normalize(&strings(&[name, "1.20%"]), &header)
                .unwrap();
            assert_eq!(h.security_name, name);
            assert_eq!(h.weight_pct, 1.2);
        }
    }

    #[test]
    fn test_record_normalizer_rejects_bad_rows_with_reasons() {
        let t = table(
            &["Security", "Weight%"],
            &[
                &["HDFC Bank Ltd", "9.18%"],
                &["Some Hedge", "(0.50)"],
                &["Aggregate Misparse", "250.0"],
                &["", "4.0"],
            ],
        );
        let normalizer = RecordNormalizer::new(&HeuristicNormalizer, &quiet_config());
        let out = normalizer.normalize_table(&t).unwrap();
        assert_eq!(out.holdings.len(), 1);
        assert_eq!(out.rejected.len(), 3);
        assert_eq!(out.rows_seen, 4);
        let reasons: Vec<String> = out
            .rejected
            .iter()
            .map(|i| match i {
                IngestionIssue::NormalizationRejected { reason, .. } => reason.clone(),
                other => panic!("unexpected issue {other:?}"),
            })
            .collect();
        assert!(reasons[0].contains("negative"));
        assert!(reasons[1].contains("exceeds"));
        assert!(reasons[2].contains("empty security name"));
    }

    #[test]
    fn test_section_header_becomes_category() {
        let t = table(
            &["Security", "Weight%"],
            &[
                &["Treasury Bills", ""],
                &["91 Days GOI 2025", "1.30"],
                &["Equity & Equity Related", ""],
                &["ITC Ltd", "2.00"],
            ],
        );
        let out = RecordNormalizer::new(&HeuristicNormalizer, &quiet_config())
            .normalize_table(&t)
            .unwrap();
        assert_eq!(out.skipped, 2);
        assert_eq!(out.holdings[0].holding.raw_category, "Treasury Bills");
        assert_eq!(out.holdings[1].holding.raw_category, "Equity & Equity Related");
    }

    struct Flaky {
        failures_left: AtomicU32,
    }

    impl TextNormalizer for Flaky {
        fn normalize(
            &self,
            row: &[String],
            header: &[String],
        ) -> Result<NormalizedHolding, NormalizationError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(NormalizationError::Unavailable("timeout".into()));
            }
            HeuristicNormalizer.normalize(row, header)
        }
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(2),
        };
        let t = table(&["Security", "Weight%"], &[&["HDFC Bank Ltd", "9.18"]]);
        let out = RecordNormalizer::new(&flaky, &quiet_config())
            .normalize_table(&t)
            .unwrap();
        assert_eq!(out.holdings.len(), 1);
    }

    #[test]
    fn test_exhausted_retries_fail_the_document() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(10),
        };
        let t = table(&["Security", "Weight%"], &[&["HDFC Bank Ltd", "9.18"]]);
        let err = RecordNormalizer::new(&flaky, &quiet_config())
            .normalize_table(&t)
            .unwrap_err();
        assert!(matches!(
            err,
            FundGraphError::NormalizationUnavailable { attempts: 3, .. }
        ));
    }
}
