//! Shared typed models used across extraction, storage, and reporting layers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{FundGraphError, FundGraphResult};

// ---------------------------------------------------------------------------
// 1. Period
// ---------------------------------------------------------------------------

/// A reporting month. Field order makes the derived `Ord` chronological.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> FundGraphResult<Self> {
        let period = Self { year, month };
        period.validate()?;
        Ok(period)
    }

    pub fn validate(&self) -> FundGraphResult<()> {
        if !(1..=12).contains(&self.month) || self.year < 1900 {
            return Err(FundGraphError::InvalidPeriod {
                year: self.year,
                month: self.month,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

// ---------------------------------------------------------------------------
// 2. Extraction input
// ---------------------------------------------------------------------------

/// One table as produced by the external document-analysis collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawTableBlock {
    pub page_index: usize,
    pub header_row: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

/// Non-table text of a page, line by line in reading order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub page_index: usize,
    #[serde(default)]
    pub lines: Vec<String>,
}

/// A factsheet after extraction: its tables, its page text, and the reporting
/// month the holdings are stated for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub as_of: Period,
    #[serde(default)]
    pub blocks: Vec<RawTableBlock>,
    #[serde(default)]
    pub pages: Vec<PageText>,
}

// ---------------------------------------------------------------------------
// 3. Merged tables
// ---------------------------------------------------------------------------

/// A data row together with the page it came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub page_index: usize,
    pub cells: Vec<String>,
}

/// One logical holdings table stitched from consecutive page blocks.
///
/// All rows are laid out in `header` column order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergedTable {
    pub fund_name: Option<String>,
    /// AMC name seen on the first page ("... Mutual Fund"), if any.
    pub amc_hint: Option<String>,
    pub header: Vec<String>,
    /// Pages contributing rows, ascending.
    pub pages: Vec<usize>,
    pub rows: Vec<RawRow>,
}

impl MergedTable {
    pub fn first_page(&self) -> Option<usize> {
        self.rows
            .first()
            .map(|r| r.page_index)
            .or_else(|| self.pages.first().copied())
    }
}

// ---------------------------------------------------------------------------
// 4. Holdings through the pipeline
// ---------------------------------------------------------------------------

/// A row that survived normalization and its post-conditions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedHolding {
    pub security_name: String,
    pub weight_pct: f64,
    pub quantity: Option<f64>,
    pub raw_category: String,
}

/// Closed asset taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetClass {
    Equity,
    CorporateDebt,
    GovernmentSecurities,
    MoneyMarket,
    Other,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Equity => "EQUITY",
            AssetClass::CorporateDebt => "CORPORATE_DEBT",
            AssetClass::GovernmentSecurities => "GOVERNMENT_SECURITIES",
            AssetClass::MoneyMarket => "MONEY_MARKET",
            AssetClass::Other => "OTHER",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = FundGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EQUITY" => Ok(AssetClass::Equity),
            "CORPORATE_DEBT" => Ok(AssetClass::CorporateDebt),
            "GOVERNMENT_SECURITIES" => Ok(AssetClass::GovernmentSecurities),
            "MONEY_MARKET" => Ok(AssetClass::MoneyMarket),
            "OTHER" => Ok(AssetClass::Other),
            other => Err(FundGraphError::Database(format!(
                "unknown asset class {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedHolding {
    #[serde(flatten)]
    pub holding: NormalizedHolding,
    pub asset_class: AssetClass,
    pub sub_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedHolding {
    #[serde(flatten)]
    pub classified: ClassifiedHolding,
    pub instrument_id: Option<String>,
    pub match_confidence: f64,
    pub market_cap_bucket: Option<String>,
}

impl ResolvedHolding {
    pub fn security_name(&self) -> &str {
        &self.classified.holding.security_name
    }

    pub fn weight_pct(&self) -> f64 {
        self.classified.holding.weight_pct
    }

    pub fn quantity(&self) -> Option<f64> {
        self.classified.holding.quantity
    }

    pub fn asset_class(&self) -> AssetClass {
        self.classified.asset_class
    }

    pub fn sub_type(&self) -> &str {
        &self.classified.sub_type
    }
}

// ---------------------------------------------------------------------------
// 5. Graph identities
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fund {
    pub fund_id: String,
    pub fund_name: String,
    pub amc: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_id: String,
    pub name: String,
    pub asset_class: Option<AssetClass>,
    pub sub_type: Option<String>,
    pub market_cap_bucket: Option<String>,
}

/// The unit committed to storage: one fund's holdings for one month.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HoldingSet {
    pub fund: Fund,
    pub as_of: Period,
    pub holdings: Vec<ResolvedHolding>,
}

impl HoldingSet {
    pub fn fund_id(&self) -> &str {
        &self.fund.fund_id
    }

    /// Sum of line weights. Reported for auditing, never enforced to be 100.
    pub fn total_weight_pct(&self) -> f64 {
        self.holdings.iter().map(|h| h.weight_pct()).sum()
    }
}

// ---------------------------------------------------------------------------
// 6. Commit results and stored views
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    Create,
    Supersede,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Created,
    Superseded,
    /// Supersede with byte-identical holdings; edges left untouched.
    Unchanged,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub fund_id: String,
    pub as_of: Period,
    pub snapshot_id: i64,
    pub outcome: CommitOutcome,
    pub instruments_created: usize,
    pub holdings_written: usize,
    pub current_updated: bool,
    pub total_weight_pct: f64,
}

/// A holding edge as read back from a snapshot or the current projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredHolding {
    pub position: i64,
    pub instrument_id: Option<String>,
    pub security_name: String,
    pub weight_pct: f64,
    pub quantity: Option<f64>,
    pub asset_class: AssetClass,
    pub sub_type: String,
    pub match_confidence: f64,
    pub market_cap_bucket: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot_id: i64,
    pub fund_id: String,
    pub as_of: Period,
    pub num_holdings: i64,
    pub total_weight_pct: f64,
    pub content_hash: String,
}

/// A fund currently holding a given instrument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundHolder {
    pub fund_id: String,
    pub fund_name: String,
    pub as_of: Period,
    pub weight_pct: f64,
}

/// SHA-256 over the canonical text form of a holdings list, in order.
///
/// Two commits with equal hashes write identical edges.
pub fn holdings_content_hash(holdings: &[ResolvedHolding]) -> String {
    let mut hasher = Sha256::new();
    for (position, h) in holdings.iter().enumerate() {
        let line = format!(
            "{position}\t{}\t{}\t{:.6}\t{}\t{}\t{}\t{:.6}\t{}\n",
            h.instrument_id.as_deref().unwrap_or(""),
            h.security_name(),
            h.weight_pct(),
            h.quantity().map(|q| format!("{q:.6}")).unwrap_or_default(),
            h.asset_class(),
            h.sub_type(),
            h.match_confidence,
            h.market_cap_bucket.as_deref().unwrap_or(""),
        );
        hasher.update(line.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// 7. Per-document reporting
// ---------------------------------------------------------------------------

/// A non-fatal problem found while ingesting one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestionIssue {
    ExtractionGap {
        page_index: Option<usize>,
        reason: String,
    },
    NormalizationRejected {
        page_index: usize,
        row_index: usize,
        security_name: String,
        reason: String,
    },
    UnresolvedIdentity {
        security_name: String,
        best_candidate: Option<String>,
        best_score: f64,
    },
    AmbiguousFundName {
        chosen: String,
        others: Vec<String>,
    },
    UnknownFund {
        fund_name: Option<String>,
        rows: usize,
    },
    CommitFailure {
        fund_id: String,
        message: String,
    },
}

impl IngestionIssue {
    pub fn stage(&self) -> &'static str {
        match self {
            IngestionIssue::ExtractionGap { .. } | IngestionIssue::AmbiguousFundName { .. } => {
                "merge"
            }
            IngestionIssue::NormalizationRejected { .. } => "normalize",
            IngestionIssue::UnresolvedIdentity { .. } => "resolve",
            IngestionIssue::UnknownFund { .. } | IngestionIssue::CommitFailure { .. } => "commit",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            IngestionIssue::ExtractionGap { .. } => "extraction_gap",
            IngestionIssue::NormalizationRejected { .. } => "normalization_rejected",
            IngestionIssue::UnresolvedIdentity { .. } => "unresolved_identity",
            IngestionIssue::AmbiguousFundName { .. } => "ambiguous_fund_name",
            IngestionIssue::UnknownFund { .. } => "unknown_fund",
            IngestionIssue::CommitFailure { .. } => "commit_failure",
        }
    }

    pub fn severity(&self) -> &'static str {
        match self {
            IngestionIssue::CommitFailure { .. } | IngestionIssue::UnknownFund { .. } => "error",
            _ => "warning",
        }
    }
}

/// An issue as persisted in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: i64,
    pub document_id: String,
    pub severity: String,
    pub issue: IngestionIssue,
    pub created_at: String,
}

/// Everything that happened to one document, successful or not.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document_id: String,
    pub tables_merged: usize,
    pub rows_seen: usize,
    pub rows_normalized: usize,
    pub rows_skipped: usize,
    pub rows_rejected: usize,
    /// Set when the rejected share exceeds the configured fraction.
    pub rejection_warning: bool,
    pub issues: Vec<IngestionIssue>,
    pub commits: Vec<CommitResult>,
}

impl DocumentReport {
    pub fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            ..Self::default()
        }
    }

    /// Security names reported for manual registry curation.
    pub fn unresolved_names(&self) -> Vec<&str> {
        self.issues
            .iter()
            .filter_map(|issue| match issue {
                IngestionIssue::UnresolvedIdentity { security_name, .. } => {
                    Some(security_name.as_str())
                }
                _ => None,
            })
            .collect()
    }

    pub fn has_commit_failure(&self) -> bool {
        self.issues
            .iter()
            .any(|i| matches!(i, IngestionIssue::CommitFailure { .. }))
    }
}
