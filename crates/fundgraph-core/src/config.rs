//! Pipeline tunables, their guard ranges, and environment overrides.

use std::path::Path;

use serde::Deserialize;

use crate::errors::{FundGraphError, FundGraphResult};

pub const DEFAULT_MIN_HEADER_OVERLAP: f64 = 0.75;
pub const DEFAULT_HEADER_COLUMN_SIMILARITY: f64 = 0.85;
pub const DEFAULT_MAX_LINE_WEIGHT_PCT: f64 = 100.0;
pub const DEFAULT_MAX_REJECTED_FRACTION: f64 = 0.25;
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.88;
pub const DEFAULT_TIE_MARGIN: f64 = 0.03;
pub const DEFAULT_NORMALIZE_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_NORMALIZE_RETRY_BACKOFF_MS: u64 = 50;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

// Guard ranges
pub const MAX_NORMALIZE_ATTEMPTS: u32 = 10;
pub const MAX_RETRY_BACKOFF_MS: u64 = 10_000;
pub const MAX_WORKERS: usize = 64;
pub const MAX_BUSY_TIMEOUT_MS: u64 = 60_000;
pub const MIN_MATCH_THRESHOLD: f64 = 0.5;
pub const MAX_TIE_MARGIN: f64 = 0.25;

pub fn clamp_f64(value: f64, minimum: f64, maximum: f64) -> f64 {
    if value.is_nan() {
        return minimum;
    }
    value.max(minimum).min(maximum)
}

pub fn clamp_u64(value: u64, minimum: u64, maximum: u64) -> u64 {
    value.max(minimum).min(maximum)
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fraction of columns that must align for two page blocks to merge.
    pub min_header_overlap: f64,
    /// Edit similarity at which two OCR'd column names count as the same.
    pub header_column_similarity: f64,
    /// Upper bound for a single line's weight; above it the row is rejected.
    pub max_line_weight_pct: f64,
    /// Rejected-row share above which the document report carries a warning.
    pub max_rejected_fraction: f64,
    pub match_threshold: f64,
    pub tie_margin: f64,
    pub normalize_max_attempts: u32,
    pub normalize_retry_backoff_ms: u64,
    pub workers: usize,
    pub busy_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_header_overlap: DEFAULT_MIN_HEADER_OVERLAP,
            header_column_similarity: DEFAULT_HEADER_COLUMN_SIMILARITY,
            max_line_weight_pct: DEFAULT_MAX_LINE_WEIGHT_PCT,
            max_rejected_fraction: DEFAULT_MAX_REJECTED_FRACTION,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            tie_margin: DEFAULT_TIE_MARGIN,
            normalize_max_attempts: DEFAULT_NORMALIZE_MAX_ATTEMPTS,
            normalize_retry_backoff_ms: DEFAULT_NORMALIZE_RETRY_BACKOFF_MS,
            workers: DEFAULT_WORKERS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON object; absent keys keep their defaults.
    pub fn from_json_file(path: &Path) -> FundGraphResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        Ok(config.sanitized())
    }

    /// Apply `FUNDGRAPH_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> FundGraphResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`with_env_overrides`](Self::with_env_overrides) with an
    /// injectable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> FundGraphResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<f64, _>(&lookup, "FUNDGRAPH_MIN_HEADER_OVERLAP")? {
            self.min_header_overlap = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "FUNDGRAPH_HEADER_COLUMN_SIMILARITY")? {
            self.header_column_similarity = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "FUNDGRAPH_MAX_LINE_WEIGHT_PCT")? {
            self.max_line_weight_pct = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "FUNDGRAPH_MAX_REJECTED_FRACTION")? {
            self.max_rejected_fraction = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "FUNDGRAPH_MATCH_THRESHOLD")? {
            self.match_threshold = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "FUNDGRAPH_TIE_MARGIN")? {
            self.tie_margin = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "FUNDGRAPH_NORMALIZE_MAX_ATTEMPTS")? {
            self.normalize_max_attempts = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "FUNDGRAPH_NORMALIZE_RETRY_BACKOFF_MS")? {
            self.normalize_retry_backoff_ms = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "FUNDGRAPH_WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "FUNDGRAPH_BUSY_TIMEOUT_MS")? {
            self.busy_timeout_ms = v;
        }
        Ok(self.sanitized())
    }

    /// Clamp every value into its guard range.
    pub fn sanitized(mut self) -> Self {
        self.min_header_overlap = clamp_f64(self.min_header_overlap, 0.5, 1.0);
        self.header_column_similarity = clamp_f64(self.header_column_similarity, 0.5, 1.0);
        self.max_line_weight_pct = clamp_f64(self.max_line_weight_pct, 1.0, 1000.0);
        self.max_rejected_fraction = clamp_f64(self.max_rejected_fraction, 0.0, 1.0);
        self.match_threshold = clamp_f64(self.match_threshold, MIN_MATCH_THRESHOLD, 1.0);
        self.tie_margin = clamp_f64(self.tie_margin, 0.0, MAX_TIE_MARGIN);
        self.normalize_max_attempts = self.normalize_max_attempts.clamp(1, MAX_NORMALIZE_ATTEMPTS);
        self.normalize_retry_backoff_ms =
            clamp_u64(self.normalize_retry_backoff_ms, 0, MAX_RETRY_BACKOFF_MS);
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.busy_timeout_ms = clamp_u64(self.busy_timeout_ms, 0, MAX_BUSY_TIMEOUT_MS);
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> FundGraphResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FundGraphError::Config(format!("{key}={raw:?} is not a valid value"))),
    }
}
