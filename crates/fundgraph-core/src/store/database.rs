//! SQLite storage layer for the temporal holdings graph.
//!
//! Each public method opens its own connection, so callers never manage
//! connection lifetime. The write primitives used by a commit are associated
//! functions over a borrowed connection; the writer runs them inside one
//! transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::config::{PipelineConfig, DEFAULT_BUSY_TIMEOUT_MS};
use crate::errors::{FundGraphError, FundGraphResult};
use crate::models::{
    holdings_content_hash, AssetClass, CommitOutcome, Fund, FundHolder, HoldingSet,
    IngestionIssue, Instrument, IssueRecord, Period, SnapshotMode, SnapshotSummary,
    StoredHolding,
};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

fn asset_class_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<AssetClass> {
    let raw: String = row.get(idx)?;
    raw.parse::<AssetClass>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const HOLDING_COLUMNS: &str = "position, instrument_id, security_name, weight_pct, quantity, \
     asset_class, sub_type, match_confidence, market_cap_bucket";

fn stored_holding_from_row(row: &Row<'_>) -> rusqlite::Result<StoredHolding> {
    Ok(StoredHolding {
        position: row.get(0)?,
        instrument_id: row.get(1)?,
        security_name: row.get(2)?,
        weight_pct: row.get(3)?,
        quantity: row.get(4)?,
        asset_class: asset_class_column(row, 5)?,
        sub_type: row.get(6)?,
        match_confidence: row.get(7)?,
        market_cap_bucket: row.get(8)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotSummary> {
    Ok(SnapshotSummary {
        snapshot_id: row.get(0)?,
        fund_id: row.get(1)?,
        as_of: Period {
            year: row.get(2)?,
            month: row.get(3)?,
        },
        num_holdings: row.get(4)?,
        total_weight_pct: row.get(5)?,
        content_hash: row.get(6)?,
    })
}

/// What `write_snapshot` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotWrite {
    pub snapshot_id: i64,
    pub outcome: CommitOutcome,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Resolve `db_path` (with `~` expansion) and create parent directories.
    pub fn new(db_path: impl AsRef<Path>) -> FundGraphResult<Self> {
        let db_str = db_path.as_ref().to_string_lossy();
        let expanded = expand_tilde(&db_str);
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            db_path: resolved,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        })
    }

    /// [`new`](Self::new) with the busy timeout taken from `config`.
    pub fn open(db_path: impl AsRef<Path>, config: &PipelineConfig) -> FundGraphResult<Self> {
        Ok(Self::new(db_path)?.with_busy_timeout(config.busy_timeout_ms))
    }

    pub fn with_busy_timeout(mut self, millis: u64) -> Self {
        self.busy_timeout = Duration::from_millis(millis);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a connection with foreign keys enforced and the busy timeout set.
    pub fn connect(&self) -> FundGraphResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Set WAL mode, create all tables and indexes, then run migrations.
    pub fn init_schema(&self) -> FundGraphResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    pub fn schema_version(&self) -> FundGraphResult<i32> {
        let conn = self.connect()?;
        Ok(schema::get_schema_version(&conn))
    }

    pub fn get_meta(&self, key: &str) -> FundGraphResult<Option<String>> {
        let conn = self.connect()?;
        let value = conn
            .query_row(
                "SELECT value FROM graph_meta WHERE key = ?1 LIMIT 1;",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> FundGraphResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO graph_meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Write primitives (run inside the caller's transaction)
    // -----------------------------------------------------------------------

    /// Create the fund or refresh its display name and AMC.
    pub fn upsert_fund(conn: &Connection, fund: &Fund) -> FundGraphResult<()> {
        conn.execute(
            "INSERT INTO funds(fund_id, fund_name, amc) VALUES (?1, ?2, ?3) \
             ON CONFLICT(fund_id) DO UPDATE SET \
                 fund_name = excluded.fund_name, \
                 amc = CASE WHEN excluded.amc = '' THEN funds.amc ELSE excluded.amc END, \
                 updated_at = CURRENT_TIMESTAMP;",
            params![fund.fund_id, fund.fund_name, fund.amc],
        )?;
        Ok(())
    }

    /// Create the instrument if absent; otherwise enrich it. Returns whether a
    /// new row was created.
    ///
    /// The stored name is never changed. A different spelling is kept as an
    /// alias. Classification fills only missing values; the market-cap bucket
    /// is refreshed whenever a value is supplied.
    pub fn upsert_instrument(conn: &Connection, instrument: &Instrument) -> FundGraphResult<bool> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT name FROM instruments WHERE instrument_id = ?1;",
                params![instrument.instrument_id],
                |row| row.get(0),
            )
            .optional()?;
        let asset_class = instrument.asset_class.map(|c| c.as_str());

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO instruments(instrument_id, name, asset_class, sub_type, market_cap_bucket) \
                     VALUES (?1, ?2, ?3, ?4, ?5);",
                    params![
                        instrument.instrument_id,
                        instrument.name,
                        asset_class,
                        instrument.sub_type,
                        instrument.market_cap_bucket,
                    ],
                )?;
                Ok(true)
            }
            Some(name) => {
                if name != instrument.name && !instrument.name.trim().is_empty() {
                    conn.execute(
                        "INSERT OR IGNORE INTO instrument_aliases(instrument_id, alias) VALUES (?1, ?2);",
                        params![instrument.instrument_id, instrument.name],
                    )?;
                }
                conn.execute(
                    "UPDATE instruments SET \
                         asset_class = COALESCE(asset_class, ?2), \
                         sub_type = COALESCE(sub_type, ?3), \
                         market_cap_bucket = COALESCE(?4, market_cap_bucket), \
                         updated_at = CURRENT_TIMESTAMP \
                     WHERE instrument_id = ?1;",
                    params![
                        instrument.instrument_id,
                        asset_class,
                        instrument.sub_type,
                        instrument.market_cap_bucket,
                    ],
                )?;
                Ok(false)
            }
        }
    }

    fn insert_edges(conn: &Connection, snapshot_id: i64, set: &HoldingSet) -> FundGraphResult<()> {
        let mut stmt = conn.prepare(&format!(
            "INSERT INTO snapshot_holdings(snapshot_id, {HOLDING_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);"
        ))?;
        for (position, h) in set.holdings.iter().enumerate() {
            stmt.execute(params![
                snapshot_id,
                position as i64,
                h.instrument_id,
                h.security_name(),
                h.weight_pct(),
                h.quantity(),
                h.asset_class().as_str(),
                h.sub_type(),
                h.match_confidence,
                h.market_cap_bucket,
            ])?;
        }
        Ok(())
    }

    /// Write the `(fund, year, month)` snapshot with one edge per holding.
    ///
    /// An existing snapshot keeps its id; under `Supersede` its edges are
    /// replaced as a unit, or left alone when the content hash is unchanged.
    /// Under `Create` an existing snapshot is an error.
    pub fn write_snapshot(
        conn: &Connection,
        set: &HoldingSet,
        mode: SnapshotMode,
    ) -> FundGraphResult<SnapshotWrite> {
        let fund_id = set.fund_id();
        let period = set.as_of;
        let content_hash = holdings_content_hash(&set.holdings);
        let total_weight = set.total_weight_pct();
        let num_holdings = set.holdings.len() as i64;

        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, content_hash FROM snapshots \
                 WHERE fund_id = ?1 AND year = ?2 AND month = ?3;",
                params![fund_id, period.year, period.month],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO snapshots(fund_id, year, month, content_hash, total_weight_pct, num_holdings) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                    params![fund_id, period.year, period.month, content_hash, total_weight, num_holdings],
                )?;
                let snapshot_id = conn.last_insert_rowid();
                Self::insert_edges(conn, snapshot_id, set)?;
                Ok(SnapshotWrite {
                    snapshot_id,
                    outcome: CommitOutcome::Created,
                })
            }
            Some(_) if mode == SnapshotMode::Create => Err(FundGraphError::SnapshotExists {
                fund_id: fund_id.to_string(),
                year: period.year,
                month: period.month,
            }),
            Some((snapshot_id, stored_hash)) if stored_hash == content_hash => Ok(SnapshotWrite {
                snapshot_id,
                outcome: CommitOutcome::Unchanged,
            }),
            Some((snapshot_id, _)) => {
                conn.execute(
                    "DELETE FROM snapshot_holdings WHERE snapshot_id = ?1;",
                    params![snapshot_id],
                )?;
                conn.execute(
                    "UPDATE snapshots SET content_hash = ?2, total_weight_pct = ?3, \
                         num_holdings = ?4, updated_at = CURRENT_TIMESTAMP \
                     WHERE id = ?1;",
                    params![snapshot_id, content_hash, total_weight, num_holdings],
                )?;
                Self::insert_edges(conn, snapshot_id, set)?;
                Ok(SnapshotWrite {
                    snapshot_id,
                    outcome: CommitOutcome::Superseded,
                })
            }
        }
    }

    /// Point the fund's current holdings at `snapshot_id` unless a later
    /// period is already current. Returns whether the projection changed.
    ///
    /// The projection is copied from the snapshot's edges, never written
    /// from caller data.
    pub fn set_current_holdings(
        conn: &Connection,
        fund_id: &str,
        snapshot_id: i64,
        period: Period,
    ) -> FundGraphResult<bool> {
        let latest: Option<Period> = conn
            .query_row(
                "SELECT year, month FROM fund_latest WHERE fund_id = ?1;",
                params![fund_id],
                |row| {
                    Ok(Period {
                        year: row.get(0)?,
                        month: row.get(1)?,
                    })
                },
            )
            .optional()?;
        if let Some(current) = latest {
            if period < current {
                debug!(fund_id, %period, %current, "older snapshot stored as history only");
                return Ok(false);
            }
        }

        conn.execute(
            "DELETE FROM current_holdings WHERE fund_id = ?1;",
            params![fund_id],
        )?;
        conn.execute(
            &format!(
                "INSERT INTO current_holdings(fund_id, {HOLDING_COLUMNS}) \
                 SELECT ?1, {HOLDING_COLUMNS} FROM snapshot_holdings WHERE snapshot_id = ?2;"
            ),
            params![fund_id, snapshot_id],
        )?;
        conn.execute(
            "INSERT INTO fund_latest(fund_id, snapshot_id, year, month) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(fund_id) DO UPDATE SET \
                 snapshot_id = excluded.snapshot_id, \
                 year = excluded.year, \
                 month = excluded.month, \
                 updated_at = CURRENT_TIMESTAMP;",
            params![fund_id, snapshot_id, period.year, period.month],
        )?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_fund(&self, fund_id: &str) -> FundGraphResult<Option<Fund>> {
        let conn = self.connect()?;
        let fund = conn
            .query_row(
                "SELECT fund_id, fund_name, amc FROM funds WHERE fund_id = ?1;",
                params![fund_id],
                |row| {
                    Ok(Fund {
                        fund_id: row.get(0)?,
                        fund_name: row.get(1)?,
                        amc: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(fund)
    }

    pub fn get_instrument(&self, instrument_id: &str) -> FundGraphResult<Option<Instrument>> {
        let conn = self.connect()?;
        let instrument = conn
            .query_row(
                "SELECT instrument_id, name, asset_class, sub_type, market_cap_bucket \
                 FROM instruments WHERE instrument_id = ?1;",
                params![instrument_id],
                |row| {
                    let asset_class = match row.get::<_, Option<String>>(2)? {
                        Some(_) => Some(asset_class_column(row, 2)?),
                        None => None,
                    };
                    Ok(Instrument {
                        instrument_id: row.get(0)?,
                        name: row.get(1)?,
                        asset_class,
                        sub_type: row.get(3)?,
                        market_cap_bucket: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(instrument)
    }

    pub fn instrument_aliases(&self, instrument_id: &str) -> FundGraphResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT alias FROM instrument_aliases WHERE instrument_id = ?1 ORDER BY alias;",
        )?;
        let aliases = stmt
            .query_map(params![instrument_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(aliases)
    }

    pub fn snapshot_summary(
        &self,
        fund_id: &str,
        period: Period,
    ) -> FundGraphResult<Option<SnapshotSummary>> {
        let conn = self.connect()?;
        let summary = conn
            .query_row(
                "SELECT id, fund_id, year, month, num_holdings, total_weight_pct, content_hash \
                 FROM snapshots WHERE fund_id = ?1 AND year = ?2 AND month = ?3;",
                params![fund_id, period.year, period.month],
                summary_from_row,
            )
            .optional()?;
        Ok(summary)
    }

    /// Edges of one snapshot in position order; `None` if no such snapshot.
    pub fn snapshot_holdings(
        &self,
        fund_id: &str,
        period: Period,
    ) -> FundGraphResult<Option<Vec<StoredHolding>>> {
        let Some(summary) = self.snapshot_summary(fund_id, period)? else {
            return Ok(None);
        };
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HOLDING_COLUMNS} FROM snapshot_holdings \
             WHERE snapshot_id = ?1 ORDER BY position;"
        ))?;
        let holdings = stmt
            .query_map(params![summary.snapshot_id], stored_holding_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(holdings))
    }

    /// All snapshots of a fund, oldest first.
    pub fn list_snapshots(&self, fund_id: &str) -> FundGraphResult<Vec<SnapshotSummary>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, fund_id, year, month, num_holdings, total_weight_pct, content_hash \
             FROM snapshots WHERE fund_id = ?1 ORDER BY year, month;",
        )?;
        let summaries = stmt
            .query_map(params![fund_id], summary_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    pub fn latest_period(&self, fund_id: &str) -> FundGraphResult<Option<Period>> {
        let conn = self.connect()?;
        let period = conn
            .query_row(
                "SELECT year, month FROM fund_latest WHERE fund_id = ?1;",
                params![fund_id],
                |row| {
                    Ok(Period {
                        year: row.get(0)?,
                        month: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(period)
    }

    pub fn current_holdings(&self, fund_id: &str) -> FundGraphResult<Vec<StoredHolding>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HOLDING_COLUMNS} FROM current_holdings \
             WHERE fund_id = ?1 ORDER BY position;"
        ))?;
        let holdings = stmt
            .query_map(params![fund_id], stored_holding_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holdings)
    }

    /// Funds whose current holdings include `instrument_id`, largest weight
    /// first. Several lines of the same instrument in one fund are summed.
    pub fn funds_holding(&self, instrument_id: &str) -> FundGraphResult<Vec<FundHolder>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT f.fund_id, f.fund_name, l.year, l.month, SUM(c.weight_pct) AS weight \
             FROM current_holdings c \
             JOIN funds f ON f.fund_id = c.fund_id \
             JOIN fund_latest l ON l.fund_id = c.fund_id \
             WHERE c.instrument_id = ?1 \
             GROUP BY f.fund_id, f.fund_name, l.year, l.month \
             ORDER BY weight DESC, f.fund_id;",
        )?;
        let holders = stmt
            .query_map(params![instrument_id], |row| {
                Ok(FundHolder {
                    fund_id: row.get(0)?,
                    fund_name: row.get(1)?,
                    as_of: Period {
                        year: row.get(2)?,
                        month: row.get(3)?,
                    },
                    weight_pct: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holders)
    }

    // -----------------------------------------------------------------------
    // Ingestion issues
    // -----------------------------------------------------------------------

    pub fn record_ingestion_issues(
        &self,
        document_id: &str,
        issues: &[IngestionIssue],
    ) -> FundGraphResult<usize> {
        if issues.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ingestion_issues(document_id, stage, category, severity, detail_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5);",
            )?;
            for issue in issues {
                let detail = serde_json::to_string(issue)?;
                stmt.execute(params![
                    document_id,
                    issue.stage(),
                    issue.category(),
                    issue.severity(),
                    detail
                ])?;
            }
        }
        tx.commit()?;
        Ok(issues.len())
    }

    /// Issues newest first, optionally for one document.
    pub fn list_ingestion_issues(
        &self,
        document_id: Option<&str>,
        limit: Option<i64>,
    ) -> FundGraphResult<Vec<IssueRecord>> {
        let effective_limit = std::cmp::max(1, limit.unwrap_or(100));
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, severity, detail_json, COALESCE(created_at, '') \
             FROM ingestion_issues \
             WHERE (?1 IS NULL OR document_id = ?1) \
             ORDER BY id DESC \
             LIMIT ?2;",
        )?;
        let rows = stmt
            .query_map(params![document_id, effective_limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, document_id, severity, detail, created_at)| -> FundGraphResult<IssueRecord> {
                Ok(IssueRecord {
                    id,
                    document_id,
                    severity,
                    issue: serde_json::from_str(&detail)?,
                    created_at,
                })
            })
            .collect()
    }
}
