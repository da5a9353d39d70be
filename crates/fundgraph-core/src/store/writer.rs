//! Atomic commits of monthly holding sets into the temporal graph.
//!
//! A commit upserts the fund and every referenced instrument, writes (or
//! supersedes) the month's snapshot, and advances the fund's current holdings
//! when the month is not older than the current one. All of it runs in one
//! IMMEDIATE transaction under a per-fund lock, so readers see either the
//! previous state or the complete new one.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rusqlite::TransactionBehavior;
use tracing::{debug, info, warn};

use crate::errors::{FundGraphError, FundGraphResult};
use crate::models::{CommitResult, HoldingSet, Instrument, SnapshotMode};
use crate::store::database::Database;

pub struct TemporalGraphWriter {
    db: Database,
    fund_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TemporalGraphWriter {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            fund_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn fund_lock(&self, fund_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.fund_locks.lock();
        locks
            .entry(fund_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Commit `set`, superseding an existing snapshot for the same month.
    pub fn commit(&self, set: &HoldingSet) -> FundGraphResult<CommitResult> {
        self.commit_with_mode(set, SnapshotMode::Supersede)
    }

    /// Commit with an explicit snapshot mode. `Create` refuses to touch an
    /// existing month and returns `SnapshotExists`; any other failure rolls
    /// back and surfaces as `CommitFailure`.
    pub fn commit_with_mode(
        &self,
        set: &HoldingSet,
        mode: SnapshotMode,
    ) -> FundGraphResult<CommitResult> {
        set.as_of.validate()?;
        let fund_id = set.fund_id().to_string();

        let lock = self.fund_lock(&fund_id);
        let _guard = lock.lock();

        match self.commit_locked(set, mode) {
            Ok(result) => {
                info!(
                    fund_id = fund_id.as_str(),
                    year = set.as_of.year,
                    month = set.as_of.month,
                    outcome = ?result.outcome,
                    holdings = result.holdings_written,
                    instruments_created = result.instruments_created,
                    current_updated = result.current_updated,
                    "committed holdings snapshot"
                );
                Ok(result)
            }
            Err(err @ FundGraphError::SnapshotExists { .. }) => Err(err),
            Err(err) => {
                warn!(fund_id = fund_id.as_str(), error = %err, "commit rolled back");
                Err(FundGraphError::CommitFailure {
                    fund_id,
                    message: err.to_string(),
                })
            }
        }
    }

    fn commit_locked(&self, set: &HoldingSet, mode: SnapshotMode) -> FundGraphResult<CommitResult> {
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        Database::upsert_fund(&tx, &set.fund)?;

        let mut instruments: IndexMap<&str, Instrument> = IndexMap::new();
        for h in &set.holdings {
            let Some(id) = h.instrument_id.as_deref() else {
                continue;
            };
            instruments.entry(id).or_insert_with(|| Instrument {
                instrument_id: id.to_string(),
                name: h.security_name().to_string(),
                asset_class: Some(h.asset_class()),
                sub_type: Some(h.sub_type().to_string()),
                market_cap_bucket: h.market_cap_bucket.clone(),
            });
        }
        let mut instruments_created = 0;
        for instrument in instruments.values() {
            if Database::upsert_instrument(&tx, instrument)? {
                instruments_created += 1;
            }
        }

        let write = Database::write_snapshot(&tx, set, mode)?;
        let current_updated =
            Database::set_current_holdings(&tx, set.fund_id(), write.snapshot_id, set.as_of)?;
        tx.commit()?;

        debug!(
            fund_id = set.fund_id(),
            snapshot_id = write.snapshot_id,
            instruments = instruments.len(),
            "snapshot transaction committed"
        );
        Ok(CommitResult {
            fund_id: set.fund_id().to_string(),
            as_of: set.as_of,
            snapshot_id: write.snapshot_id,
            outcome: write.outcome,
            instruments_created,
            holdings_written: set.holdings.len(),
            current_updated,
            total_weight_pct: set.total_weight_pct(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AssetClass, ClassifiedHolding, CommitOutcome, Fund, NormalizedHolding, Period,
        ResolvedHolding,
    };

    fn writer() -> (tempfile::TempDir, TemporalGraphWriter) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::new(tmp.path().join("graph.db")).unwrap();
        db.init_schema().unwrap();
        (tmp, TemporalGraphWriter::new(db))
    }

    fn holding(name: &str, id: Option<&str>, weight: f64) -> ResolvedHolding {
        ResolvedHolding {
            classified: ClassifiedHolding {
                holding: NormalizedHolding {
                    security_name: name.into(),
                    weight_pct: weight,
                    quantity: None,
                    raw_category: String::new(),
                },
                asset_class: AssetClass::Equity,
                sub_type: "Indian Equity".into(),
            },
            instrument_id: id.map(str::to_string),
            match_confidence: if id.is_some() { 1.0 } else { 0.0 },
            market_cap_bucket: None,
        }
    }

    fn set(year: i32, month: u32, holdings: Vec<ResolvedHolding>) -> HoldingSet {
        HoldingSet {
            fund: Fund {
                fund_id: "F1".into(),
                fund_name: "Alpha Growth Fund".into(),
                amc: "Alpha".into(),
            },
            as_of: Period::new(year, month).unwrap(),
            holdings,
        }
    }

    fn current_names(w: &TemporalGraphWriter) -> Vec<String> {
        w.database()
            .current_holdings("F1")
            .unwrap()
            .into_iter()
            .map(|h| h.security_name)
            .collect()
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (_tmp, w) = writer();
        let jan = set(
            2025,
            1,
            vec![
                holding("HDFC Bank Ltd", Some("INE040A01034"), 9.18),
                holding("Mystery Co", None, 1.5),
            ],
        );
        let first = w.commit(&jan).unwrap();
        assert_eq!(first.outcome, CommitOutcome::Created);
        assert_eq!(first.instruments_created, 1);

        let second = w.commit(&jan).unwrap();
        assert_eq!(second.outcome, CommitOutcome::Unchanged);
        assert_eq!(second.snapshot_id, first.snapshot_id);
        assert_eq!(second.instruments_created, 0);

        let db = w.database();
        assert_eq!(db.list_snapshots("F1").unwrap().len(), 1);
        let edges = db.snapshot_holdings("F1", jan.as_of).unwrap().unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[1].instrument_id, None);
        assert_eq!(current_names(&w), vec!["HDFC Bank Ltd", "Mystery Co"]);
    }

    #[test]
    fn test_late_snapshot_does_not_move_current() {
        let (_tmp, w) = writer();
        w.commit(&set(2025, 1, vec![holding("Jan Holding", None, 1.0)])).unwrap();
        let feb = w.commit(&set(2025, 2, vec![holding("Feb Holding", None, 1.0)])).unwrap();
        assert!(feb.current_updated);
        assert_eq!(current_names(&w), vec!["Feb Holding"]);

        let dec = w.commit(&set(2024, 12, vec![holding("Dec Holding", None, 1.0)])).unwrap();
        assert!(!dec.current_updated);
        assert_eq!(current_names(&w), vec!["Feb Holding"]);

        let db = w.database();
        let periods: Vec<Period> = db.list_snapshots("F1").unwrap().iter().map(|s| s.as_of).collect();
        assert_eq!(
            periods,
            vec![
                Period::new(2024, 12).unwrap(),
                Period::new(2025, 1).unwrap(),
                Period::new(2025, 2).unwrap(),
            ]
        );
        assert_eq!(db.latest_period("F1").unwrap(), Some(Period::new(2025, 2).unwrap()));
    }

    #[test]
    fn test_supersede_of_latest_refreshes_current() {
        let (_tmp, w) = writer();
        let first = w.commit(&set(2025, 1, vec![holding("Old", None, 1.0)])).unwrap();
        let again = w
            .commit(&set(2025, 1, vec![holding("New A", None, 2.0), holding("New B", None, 3.0)]))
            .unwrap();
        assert_eq!(again.outcome, CommitOutcome::Superseded);
        assert_eq!(again.snapshot_id, first.snapshot_id);
        assert!(again.current_updated);
        assert_eq!(current_names(&w), vec!["New A", "New B"]);
    }

    #[test]
    fn test_supersede_of_history_leaves_current() {
        let (_tmp, w) = writer();
        w.commit(&set(2025, 1, vec![holding("Jan", None, 1.0)])).unwrap();
        w.commit(&set(2025, 2, vec![holding("Feb", None, 1.0)])).unwrap();
        let fix = w.commit(&set(2025, 1, vec![holding("Jan fixed", None, 1.0)])).unwrap();
        assert_eq!(fix.outcome, CommitOutcome::Superseded);
        assert!(!fix.current_updated);
        assert_eq!(current_names(&w), vec!["Feb"]);
    }

    #[test]
    fn test_create_mode_refuses_existing_month() {
        let (_tmp, w) = writer();
        let jan = set(2025, 1, vec![holding("A", None, 1.0)]);
        w.commit_with_mode(&jan, SnapshotMode::Create).unwrap();
        let err = w.commit_with_mode(&jan, SnapshotMode::Create).unwrap_err();
        assert!(matches!(err, FundGraphError::SnapshotExists { .. }));
    }

    #[test]
    fn test_failed_commit_leaves_no_partial_state() {
        let (_tmp, w) = writer();
        w.commit(&set(2025, 1, vec![holding("Jan", Some("ID-1"), 1.0)])).unwrap();

        // Break the last step of the transaction.
        let conn = w.database().connect().unwrap();
        conn.execute_batch("DROP TABLE fund_latest;").unwrap();
        drop(conn);

        let err = w
            .commit(&set(2025, 2, vec![holding("Feb", Some("ID-2"), 1.0)]))
            .unwrap_err();
        assert!(matches!(err, FundGraphError::CommitFailure { .. }));

        let db = w.database();
        assert_eq!(db.list_snapshots("F1").unwrap().len(), 1);
        assert!(db.get_instrument("ID-2").unwrap().is_none());
        assert_eq!(current_names(&w), vec!["Jan"]);
    }

    #[test]
    fn test_rename_becomes_alias() {
        let (_tmp, w) = writer();
        w.commit(&set(2025, 1, vec![holding("HDFC Bank Ltd.", Some("INE040A01034"), 9.0)]))
            .unwrap();
        w.commit(&set(2025, 2, vec![holding("HDFC BANK LIMITED", Some("INE040A01034"), 9.5)]))
            .unwrap();
        let db = w.database();
        assert_eq!(db.get_instrument("INE040A01034").unwrap().unwrap().name, "HDFC Bank Ltd.");
        assert_eq!(db.instrument_aliases("INE040A01034").unwrap(), vec!["HDFC BANK LIMITED"]);

        let holders = db.funds_holding("INE040A01034").unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].fund_id, "F1");
        assert_eq!(holders[0].weight_pct, 9.5);
    }

    #[test]
    fn test_concurrent_commits_for_different_funds() {
        let (_tmp, w) = writer();
        let w = Arc::new(w);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let w = Arc::clone(&w);
                std::thread::spawn(move || {
                    let mut s = set(2025, 1, vec![holding("Shared Co", Some("ID-S"), 1.0)]);
                    s.fund.fund_id = format!("F{i}");
                    w.commit(&s).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(w.database().funds_holding("ID-S").unwrap().len(), 4);
    }
}
