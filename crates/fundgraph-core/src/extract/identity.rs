//! Mapping security names onto canonical instrument ids.
//!
//! The [`InstrumentRegistry`] is an immutable snapshot shared read-only by
//! every worker. Lookup is exact on a lightly normalized key first, then fuzzy
//! on a heavier one. A fuzzy winner must clear the threshold and beat the
//! runner-up by the tie margin; otherwise the name stays unresolved. A wrong
//! merge of two securities is worse than a missing link.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::errors::{FundGraphError, FundGraphResult};
use crate::extract::classifier::is_resolvable;
use crate::extract::similarity::name_similarity;
use crate::models::{ClassifiedHolding, IngestionIssue, ResolvedHolding};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub fn exact_key(name: &str) -> String {
    name.replace("&amp;", "&")
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn canonical_suffix(token: &str) -> &str {
    match token {
        "ltd" | "limited" => "limited",
        "corp" | "corpn" => "corporation",
        "co" => "company",
        "pvt" => "private",
        other => other,
    }
}

/// Punctuation-free, `&` spelled out, corporate suffixes canonicalised.
pub fn fuzzy_key(name: &str) -> String {
    let spelled = exact_key(name).replace('&', " and ");
    let cleaned: String = spelled
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .map(canonical_suffix)
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub instrument_id: String,
    pub canonical_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub market_cap_bucket: Option<String>,
}

impl RegistryEntry {
    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical_name.as_str()).chain(self.aliases.iter().map(|a| a.as_str()))
    }
}

const CSV_NAME_COLUMN: &str = "NAME OF COMPANY";
const CSV_ID_COLUMN: &str = "ISIN NUMBER";
const CSV_MARKET_CAP_COLUMN: &str = "MARKET CAP";
const CSV_ALIASES_COLUMN: &str = "ALIASES";

#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    entries: IndexMap<String, RegistryEntry>,
    exact_index: HashMap<String, Vec<usize>>,
    /// Fuzzy keys per entry, parallel to `entries`.
    fuzzy_keys: Vec<Vec<String>>,
}

impl InstrumentRegistry {
    /// Build a registry; entries sharing an id are merged, later names
    /// becoming aliases of the first.
    pub fn from_entries(entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        let mut merged: IndexMap<String, RegistryEntry> = IndexMap::new();
        for entry in entries {
            let id = entry.instrument_id.trim().to_string();
            if id.is_empty() || entry.canonical_name.trim().is_empty() {
                continue;
            }
            match merged.get_mut(&id) {
                Some(existing) => {
                    let names: Vec<String> = entry.names().map(str::to_string).collect();
                    for name in names {
                        if name != existing.canonical_name && !existing.aliases.contains(&name) {
                            existing.aliases.push(name);
                        }
                    }
                    if existing.market_cap_bucket.is_none() {
                        existing.market_cap_bucket = entry.market_cap_bucket;
                    }
                }
                None => {
                    merged.insert(
                        id.clone(),
                        RegistryEntry {
                            instrument_id: id,
                            ..entry
                        },
                    );
                }
            }
        }

        let mut exact_index: HashMap<String, Vec<usize>> = HashMap::new();
        let mut fuzzy_keys = Vec::with_capacity(merged.len());
        for (idx, entry) in merged.values().enumerate() {
            let mut keys: Vec<String> = Vec::new();
            for name in entry.names() {
                let ids = exact_index.entry(exact_key(name)).or_default();
                if !ids.contains(&idx) {
                    ids.push(idx);
                }
                let key = fuzzy_key(name);
                if !key.is_empty() && !keys.contains(&key) {
                    keys.push(key);
                }
            }
            fuzzy_keys.push(keys);
        }

        debug!(instruments = merged.len(), "built instrument registry");
        Self {
            entries: merged,
            exact_index,
            fuzzy_keys,
        }
    }

    pub fn from_json_file(path: &Path) -> FundGraphResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<RegistryEntry> = serde_json::from_str(&content)?;
        Ok(Self::from_entries(entries))
    }

    /// Read the exchange master-list layout.
    pub fn from_csv_reader<R: Read>(reader: R) -> FundGraphResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let name_col = column(CSV_NAME_COLUMN)
            .ok_or_else(|| FundGraphError::Registry(format!("missing column {CSV_NAME_COLUMN:?}")))?;
        let id_col = column(CSV_ID_COLUMN)
            .ok_or_else(|| FundGraphError::Registry(format!("missing column {CSV_ID_COLUMN:?}")))?;
        let cap_col = column(CSV_MARKET_CAP_COLUMN);
        let alias_col = column(CSV_ALIASES_COLUMN);

        let mut entries = Vec::new();
        for (line, record) in csv_reader.records().enumerate() {
            let record = record?;
            let field = |idx: Option<usize>| {
                idx.and_then(|i| record.get(i))
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };
            let (Some(name), Some(id)) = (field(Some(name_col)), field(Some(id_col))) else {
                warn!(line = line + 2, "skipping registry row without name or id");
                continue;
            };
            let aliases = field(alias_col)
                .map(|raw| {
                    raw.split('|')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            entries.push(RegistryEntry {
                instrument_id: id,
                canonical_name: name,
                aliases,
                market_cap_bucket: field(cap_col),
            });
        }
        Ok(Self::from_entries(entries))
    }

    pub fn from_csv_path(path: &Path) -> FundGraphResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, instrument_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(instrument_id)
    }

    fn entry_at(&self, idx: usize) -> Option<&RegistryEntry> {
        self.entries.get_index(idx).map(|(_, e)| e)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Matched {
        instrument_id: String,
        confidence: f64,
        market_cap_bucket: Option<String>,
    },
    Unresolved {
        best_candidate: Option<String>,
        best_score: f64,
    },
}

pub struct IdentityResolver {
    registry: Arc<InstrumentRegistry>,
    threshold: f64,
    tie_margin: f64,
}

impl IdentityResolver {
    pub fn new(registry: Arc<InstrumentRegistry>, config: &PipelineConfig) -> Self {
        Self {
            registry,
            threshold: config.match_threshold,
            tie_margin: config.tie_margin,
        }
    }

    fn matched(&self, entry: &RegistryEntry, confidence: f64) -> Resolution {
        Resolution::Matched {
            instrument_id: entry.instrument_id.clone(),
            confidence,
            market_cap_bucket: entry.market_cap_bucket.clone(),
        }
    }

    pub fn resolve(&self, security_name: &str) -> Resolution {
        let key = exact_key(security_name);
        if let Some(ids) = self.registry.exact_index.get(&key) {
            if let [only] = ids.as_slice() {
                if let Some(entry) = self.registry.entry_at(*only) {
                    return self.matched(entry, 1.0);
                }
            }
            debug!(security_name, candidates = ids.len(), "exact name shared by several instruments");
            return Resolution::Unresolved {
                best_candidate: ids
                    .first()
                    .and_then(|i| self.registry.entry_at(*i))
                    .map(|e| e.canonical_name.clone()),
                best_score: 1.0,
            };
        }

        let query = fuzzy_key(security_name);
        if query.is_empty() {
            return Resolution::Unresolved {
                best_candidate: None,
                best_score: 0.0,
            };
        }

        let mut best: Option<(usize, f64)> = None;
        let mut runner_up = 0.0_f64;
        for (idx, keys) in self.registry.fuzzy_keys.iter().enumerate() {
            let score = keys
                .iter()
                .map(|k| name_similarity(&query, k))
                .fold(0.0_f64, f64::max);
            match best {
                Some((_, top)) if score <= top => runner_up = runner_up.max(score),
                Some((_, top)) => {
                    runner_up = runner_up.max(top);
                    best = Some((idx, score));
                }
                None => best = Some((idx, score)),
            }
        }

        let Some((idx, score)) = best else {
            return Resolution::Unresolved {
                best_candidate: None,
                best_score: 0.0,
            };
        };
        let entry = self.registry.entry_at(idx);
        if score >= self.threshold && runner_up < score - self.tie_margin {
            if let Some(entry) = entry {
                return self.matched(entry, score);
            }
        }
        debug!(security_name, score, runner_up, "fuzzy match rejected");
        Resolution::Unresolved {
            best_candidate: entry.map(|e| e.canonical_name.clone()),
            best_score: score,
        }
    }

    /// Attach identity to one classified holding. Ineligible classes pass
    /// through untouched; eligible but unmatched names produce an issue.
    pub fn resolve_holding(
        &self,
        classified: ClassifiedHolding,
    ) -> (ResolvedHolding, Option<IngestionIssue>) {
        if !is_resolvable(classified.asset_class, &classified.sub_type) {
            return (
                ResolvedHolding {
                    classified,
                    instrument_id: None,
                    match_confidence: 0.0,
                    market_cap_bucket: None,
                },
                None,
            );
        }
        match self.resolve(&classified.holding.security_name) {
            Resolution::Matched {
                instrument_id,
                confidence,
                market_cap_bucket,
            } => (
                ResolvedHolding {
                    classified,
                    instrument_id: Some(instrument_id),
                    match_confidence: confidence,
                    market_cap_bucket,
                },
                None,
            ),
            Resolution::Unresolved {
                best_candidate,
                best_score,
            } => {
                let issue = IngestionIssue::UnresolvedIdentity {
                    security_name: classified.holding.security_name.clone(),
                    best_candidate,
                    best_score,
                };
                (
                    ResolvedHolding {
                        classified,
                        instrument_id: None,
                        match_confidence: 0.0,
                        market_cap_bucket: None,
                    },
                    Some(issue),
                )
            }
        }
    }
}
