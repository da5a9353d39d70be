//! SQLite schema DDL and migration framework.
//!
//! The graph is stored relationally: funds and instruments are nodes, each
//! monthly snapshot owns its holding edges, and `current_holdings` is a
//! projection copied from the latest snapshot of every fund.

use rusqlite::Connection;

use crate::errors::FundGraphResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 1;

/// Core DDL: 10 CREATE TABLE + 6 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (10) ─────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS graph_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS funds (
        fund_id TEXT PRIMARY KEY,
        fund_name TEXT NOT NULL,
        amc TEXT NOT NULL DEFAULT '',
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS instruments (
        instrument_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        asset_class TEXT,
        sub_type TEXT,
        market_cap_bucket TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS instrument_aliases (
        instrument_id TEXT NOT NULL REFERENCES instruments(instrument_id),
        alias TEXT NOT NULL,
        first_seen_at TEXT DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY(instrument_id, alias)
    );",
    "CREATE TABLE IF NOT EXISTS snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fund_id TEXT NOT NULL REFERENCES funds(fund_id),
        year INTEGER NOT NULL,
        month INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        total_weight_pct REAL NOT NULL,
        num_holdings INTEGER NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(fund_id, year, month)
    );",
    "CREATE TABLE IF NOT EXISTS snapshot_holdings (
        snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        instrument_id TEXT REFERENCES instruments(instrument_id),
        security_name TEXT NOT NULL,
        weight_pct REAL NOT NULL,
        quantity REAL,
        asset_class TEXT NOT NULL,
        sub_type TEXT NOT NULL,
        match_confidence REAL NOT NULL DEFAULT 0.0,
        market_cap_bucket TEXT,
        PRIMARY KEY(snapshot_id, position)
    );",
    "CREATE TABLE IF NOT EXISTS fund_latest (
        fund_id TEXT PRIMARY KEY REFERENCES funds(fund_id),
        snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
        year INTEGER NOT NULL,
        month INTEGER NOT NULL,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS current_holdings (
        fund_id TEXT NOT NULL REFERENCES funds(fund_id),
        position INTEGER NOT NULL,
        instrument_id TEXT REFERENCES instruments(instrument_id),
        security_name TEXT NOT NULL,
        weight_pct REAL NOT NULL,
        quantity REAL,
        asset_class TEXT NOT NULL,
        sub_type TEXT NOT NULL,
        match_confidence REAL NOT NULL DEFAULT 0.0,
        market_cap_bucket TEXT,
        PRIMARY KEY(fund_id, position)
    );",
    "CREATE TABLE IF NOT EXISTS ingestion_issues (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id TEXT NOT NULL,
        stage TEXT NOT NULL,
        category TEXT NOT NULL,
        severity TEXT NOT NULL DEFAULT 'warning',
        detail_json TEXT NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (6) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_snapshots_fund_period ON snapshots(fund_id, year DESC, month DESC);",
    "CREATE INDEX IF NOT EXISTS idx_current_holdings_instrument ON current_holdings(instrument_id);",
    "CREATE INDEX IF NOT EXISTS idx_instrument_aliases_alias ON instrument_aliases(alias);",
    "CREATE INDEX IF NOT EXISTS idx_ingestion_issues_document ON ingestion_issues(document_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_ingestion_issues_category ON ingestion_issues(category, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_snapshot_holdings_instrument ON snapshot_holdings(instrument_id);",
];

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`]. Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> FundGraphResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT fundgraph_migrate_step;")?;

        let step_result = (|| -> FundGraphResult<()> {
            if next_version == 1 {
                migrate_to_v1(conn)?;
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT fundgraph_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT fundgraph_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT fundgraph_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Stored schema version; 0 when absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM graph_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> FundGraphResult<()> {
    conn.execute(
        "INSERT INTO graph_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> FundGraphResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline created by `SCHEMA_STATEMENTS`.
fn migrate_to_v1(_conn: &Connection) -> FundGraphResult<()> {
    Ok(())
}
