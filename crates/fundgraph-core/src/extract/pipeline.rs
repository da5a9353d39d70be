//! Document-level orchestration: merge, name, normalize, classify, resolve,
//! then commit one holding set per fund.
//!
//! Everything before the commit is a pure transform over the document and the
//! read-only registry, so documents for different funds run in parallel. A
//! failing document never aborts a batch.

use std::sync::Arc;

use indexmap::IndexMap;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::errors::{FundGraphError, FundGraphResult};
use crate::extract::classifier::AssetClassifier;
use crate::extract::fund_name::FundNameResolver;
use crate::extract::funds::{DerivedFundDirectory, FundDirectory};
use crate::extract::identity::{IdentityResolver, InstrumentRegistry};
use crate::extract::merger::TableMerger;
use crate::extract::normalizer::{HeuristicNormalizer, RecordNormalizer, TextNormalizer};
use crate::models::{
    CommitOutcome, Document, DocumentReport, Fund, HoldingSet, IngestionIssue, ResolvedHolding,
};
use crate::store::writer::TemporalGraphWriter;

/// Holding sets ready to commit, plus everything noticed on the way.
#[derive(Clone, Debug)]
pub struct PreparedDocument {
    pub sets: Vec<HoldingSet>,
    pub report: DocumentReport,
}

/// Outcome of one document in a batch.
#[derive(Debug)]
pub struct BatchItem {
    pub document_id: String,
    pub result: FundGraphResult<DocumentReport>,
}

pub struct IngestionPipeline {
    config: PipelineConfig,
    normalizer: Arc<dyn TextNormalizer>,
    registry: Arc<InstrumentRegistry>,
    funds: Arc<dyn FundDirectory>,
}

impl IngestionPipeline {
    pub fn new(
        config: PipelineConfig,
        normalizer: Arc<dyn TextNormalizer>,
        registry: Arc<InstrumentRegistry>,
        funds: Arc<dyn FundDirectory>,
    ) -> Self {
        Self {
            config: config.sanitized(),
            normalizer,
            registry,
            funds,
        }
    }

    /// Heuristic normalizer, derived fund ids, default tunables.
    pub fn with_registry(registry: Arc<InstrumentRegistry>) -> Self {
        Self::new(
            PipelineConfig::default(),
            Arc::new(HeuristicNormalizer),
            registry,
            Arc::new(DerivedFundDirectory),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage up to, but not including, the commit.
    ///
    /// Fails only when the normalization capability stays unavailable or the
    /// document's period is invalid.
    pub fn prepare(&self, document: &Document) -> FundGraphResult<PreparedDocument> {
        document.as_of.validate()?;
        let mut report = DocumentReport::new(&document.document_id);

        let merged = TableMerger::new(&self.config).merge(&document.blocks);
        report.tables_merged = merged.tables.len();
        report.issues.extend(merged.gaps);

        let name_resolver = FundNameResolver::new();
        let page_names = name_resolver.resolve_pages(&document.pages);
        let normalizer = RecordNormalizer::new(self.normalizer.as_ref(), &self.config);
        let classifier = AssetClassifier::new();
        let resolver = IdentityResolver::new(Arc::clone(&self.registry), &self.config);

        let mut by_fund: IndexMap<String, (Fund, Vec<ResolvedHolding>)> = IndexMap::new();

        for mut table in merged.tables {
            if let Some(issue) = name_resolver.tag(&mut table, &page_names) {
                report.issues.push(issue);
            }

            let normalized = normalizer.normalize_table(&table)?;
            report.rows_seen += normalized.rows_seen;
            report.rows_skipped += normalized.skipped;
            report.rows_rejected += normalized.rejected.len();
            report.rows_normalized += normalized.holdings.len();
            report.issues.extend(normalized.rejected);

            if normalized.holdings.is_empty() {
                continue;
            }

            let fund = table
                .fund_name
                .as_deref()
                .and_then(|name| self.funds.lookup(name, table.amc_hint.as_deref()));
            let Some(fund) = fund else {
                warn!(
                    document_id = document.document_id.as_str(),
                    fund_name = table.fund_name.as_deref().unwrap_or(""),
                    rows = normalized.holdings.len(),
                    "holdings table cannot be attributed to a fund"
                );
                report.issues.push(IngestionIssue::UnknownFund {
                    fund_name: table.fund_name.clone(),
                    rows: normalized.holdings.len(),
                });
                continue;
            };

            let entry = by_fund
                .entry(fund.fund_id.clone())
                .or_insert_with(|| (fund, Vec::new()));
            for sourced in normalized.holdings {
                let classified = classifier.classify_holding(sourced.holding);
                let (resolved, issue) = resolver.resolve_holding(classified);
                if let Some(issue) = issue {
                    report.issues.push(issue);
                }
                entry.1.push(resolved);
            }
        }

        let judged = report.rows_normalized + report.rows_rejected;
        if judged > 0 {
            let fraction = report.rows_rejected as f64 / judged as f64;
            if fraction > self.config.max_rejected_fraction {
                warn!(
                    document_id = document.document_id.as_str(),
                    rejected = report.rows_rejected,
                    judged,
                    "rejected row share above threshold"
                );
                report.rejection_warning = true;
            }
        }

        let sets: Vec<HoldingSet> = by_fund
            .into_values()
            .map(|(fund, holdings)| HoldingSet {
                fund,
                as_of: document.as_of,
                holdings,
            })
            .collect();

        debug!(
            document_id = document.document_id.as_str(),
            tables = report.tables_merged,
            funds = sets.len(),
            rows = report.rows_normalized,
            "document prepared"
        );
        Ok(PreparedDocument { sets, report })
    }

    /// Prepare and commit one document. Commit failures are recorded in the
    /// report per fund; issues are persisted best-effort.
    pub fn ingest(
        &self,
        document: &Document,
        writer: &TemporalGraphWriter,
    ) -> FundGraphResult<DocumentReport> {
        let PreparedDocument { sets, mut report } = self.prepare(document)?;

        for set in &sets {
            match writer.commit(set) {
                Ok(result) => report.commits.push(result),
                Err(err) => {
                    let message = match err {
                        FundGraphError::CommitFailure { message, .. } => message,
                        other => other.to_string(),
                    };
                    report.issues.push(IngestionIssue::CommitFailure {
                        fund_id: set.fund_id().to_string(),
                        message,
                    });
                }
            }
        }

        // Identical re-ingest: these issues were stored on the first pass.
        let replayed = !report.commits.is_empty()
            && !report.has_commit_failure()
            && report
                .commits
                .iter()
                .all(|c| c.outcome == CommitOutcome::Unchanged);
        if replayed {
            debug!(
                document_id = document.document_id.as_str(),
                "unchanged document, issues already recorded"
            );
        } else if let Err(err) = writer
            .database()
            .record_ingestion_issues(&document.document_id, &report.issues)
        {
            warn!(
                document_id = document.document_id.as_str(),
                error = %err,
                "could not persist ingestion issues"
            );
        }

        info!(
            document_id = document.document_id.as_str(),
            year = document.as_of.year,
            month = document.as_of.month,
            commits = report.commits.len(),
            issues = report.issues.len(),
            rows = report.rows_normalized,
            rejected = report.rows_rejected,
            "document ingested"
        );
        Ok(report)
    }

    /// Ingest many documents on a worker pool, in input order.
    pub fn ingest_batch(
        &self,
        documents: &[Document],
        writer: &TemporalGraphWriter,
    ) -> Vec<BatchItem> {
        if documents.is_empty() {
            return vec![];
        }

        let run = |document: &Document| {
            let result = self.ingest(document, writer);
            if let Err(err) = &result {
                warn!(
                    document_id = document.document_id.as_str(),
                    error = %err,
                    "document failed"
                );
            }
            BatchItem {
                document_id: document.document_id.clone(),
                result,
            }
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .build();

        match pool {
            Ok(pool) => pool.install(|| documents.par_iter().map(run).collect()),
            Err(_) => {
                // Fallback to sequential
                documents.iter().map(run).collect()
            }
        }
    }
}
