//! Schema definition and migrations (spec §6: "Migrations are idempotent
//! and ordered; the runtime refuses to start if the schema version is
//! older than the code requires").
//!
//! Each migration is a plain `CREATE TABLE IF NOT EXISTS` / `ALTER TABLE`
//! statement tagged with an integer version; `apply_migrations` runs every
//! migration the database hasn't recorded yet, in order, inside one
//! transaction each. A version recorded in the database but absent from
//! `MIGRATIONS` (i.e. the database is newer than this binary) is treated
//! as a fatal startup error, mirroring the teacher's "init_schema runs
//! once, unconditionally" shape but generalized to an ordered sequence.

use rusqlite::Connection;

/// Highest migration version this binary knows how to apply.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS exchanges (
                name TEXT PRIMARY KEY,
                display_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS markets (
                id INTEGER PRIMARY KEY,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                quote_asset TEXT NOT NULL,
                market_type TEXT NOT NULL,
                UNIQUE(exchange, symbol)
            );

            CREATE TABLE IF NOT EXISTS ohlcv (
                market_id INTEGER NOT NULL,
                timeframe TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                base_volume REAL NOT NULL,
                quote_volume REAL NOT NULL,
                trade_count INTEGER NOT NULL,
                inserted_at_ms INTEGER NOT NULL,
                PRIMARY KEY (market_id, timeframe, open_time)
            );

            CREATE INDEX IF NOT EXISTS idx_ohlcv_scan
                ON ohlcv (market_id, timeframe, open_time);

            CREATE TABLE IF NOT EXISTS trades (
                market_id INTEGER NOT NULL,
                exchange_trade_id TEXT,
                timestamp_ms INTEGER NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                taker_side TEXT NOT NULL,
                PRIMARY KEY (market_id, exchange_trade_id, timestamp_ms, price, quantity)
            );

            CREATE INDEX IF NOT EXISTS idx_trades_market_time
                ON trades (market_id, timestamp_ms);

            CREATE TABLE IF NOT EXISTS orderbook_snapshots (
                market_id INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                update_id INTEGER NOT NULL,
                bids_json TEXT NOT NULL,
                asks_json TEXT NOT NULL,
                PRIMARY KEY (market_id, timestamp_ms)
            );

            CREATE TABLE IF NOT EXISTS backfill_tasks (
                id INTEGER PRIMARY KEY,
                market_id INTEGER NOT NULL,
                data_type TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                expected_count INTEGER NOT NULL DEFAULT 0,
                actual_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                UNIQUE(market_id, data_type, timeframe, start_ms, end_ms)
            );

            CREATE INDEX IF NOT EXISTS idx_backfill_status
                ON backfill_tasks (status, priority DESC);

            CREATE TABLE IF NOT EXISTS data_quality_summary (
                market_id INTEGER NOT NULL,
                data_type TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                window_start_ms INTEGER NOT NULL,
                window_end_ms INTEGER NOT NULL,
                expected_count INTEGER NOT NULL,
                actual_count INTEGER NOT NULL,
                missing_count INTEGER NOT NULL,
                duplicate_count INTEGER NOT NULL,
                out_of_order_count INTEGER NOT NULL,
                price_jump_count INTEGER NOT NULL,
                volume_spike_count INTEGER NOT NULL,
                score REAL NOT NULL,
                validated INTEGER NOT NULL,
                issues_json TEXT NOT NULL,
                PRIMARY KEY (market_id, data_type, timeframe, window_start_ms)
            );

            CREATE TABLE IF NOT EXISTS api_error_logs (
                id INTEGER PRIMARY KEY,
                exchange TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                error_class TEXT NOT NULL,
                code INTEGER,
                message TEXT NOT NULL,
                parameters_json TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_api_error_logs_time
                ON api_error_logs (timestamp_ms);

            CREATE TABLE IF NOT EXISTS critical_events (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL,
                affected_markets_json TEXT NOT NULL,
                preserve_raw INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        description: "canonicalize market symbols (merge BTC/USDT-style duplicates into BTCUSDT form)",
        sql: "", // handled procedurally, see `merge_duplicate_markets`
    },
];

/// Runs every migration newer than what's recorded in `schema_migrations`,
/// in order, each inside its own transaction. Refuses to proceed if a
/// recorded version exceeds `CURRENT_SCHEMA_VERSION` (the database was
/// last touched by newer code than this binary).
pub fn apply_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at_ms INTEGER NOT NULL
        )",
    )?;

    let recorded_max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if recorded_max > CURRENT_SCHEMA_VERSION {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISUSE),
            Some(format!(
                "database schema version {recorded_max} is newer than this binary supports ({CURRENT_SCHEMA_VERSION})"
            )),
        ));
    }

    for migration in MIGRATIONS {
        if migration.version <= recorded_max {
            continue;
        }

        let tx = conn.transaction()?;
        if migration.version == 2 {
            merge_duplicate_markets(&tx)?;
        } else if !migration.sql.is_empty() {
            tx.execute_batch(migration.sql)?;
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, description, applied_at_ms) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                crate::util::now_ms()
            ],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// One-time normalization per the "Symbol format" design note: a market
/// row whose `symbol` contains a separator (`BTC/USDT`, `BTC-USDT`) is
/// remapped onto the canonical separator-free row, merging references in
/// every table that carries a `market_id` foreign key and deleting the
/// non-canonical row.
fn merge_duplicate_markets(tx: &rusqlite::Transaction) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare("SELECT id, exchange, symbol FROM markets")?;
    let rows: Vec<(i64, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    for (id, exchange, symbol) in &rows {
        let canonical = symbol.replace(['/', '-', '_'], "").to_uppercase();
        if &canonical == symbol {
            continue;
        }

        let canonical_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM markets WHERE exchange = ?1 AND symbol = ?2",
                rusqlite::params![exchange, canonical],
                |row| row.get(0),
            )
            .ok();

        let target_id = match canonical_id {
            Some(existing) if existing != *id => existing,
            _ => {
                tx.execute(
                    "UPDATE markets SET symbol = ?1 WHERE id = ?2",
                    rusqlite::params![canonical, id],
                )?;
                continue;
            }
        };

        for table in [
            "ohlcv",
            "trades",
            "orderbook_snapshots",
            "backfill_tasks",
            "data_quality_summary",
        ] {
            tx.execute(
                &format!("UPDATE OR IGNORE {table} SET market_id = ?1 WHERE market_id = ?2"),
                rusqlite::params![target_id, id],
            )?;
            tx.execute(
                &format!("DELETE FROM {table} WHERE market_id = ?1"),
                rusqlite::params![id],
            )?;
        }
        tx.execute("DELETE FROM markets WHERE id = ?1", rusqlite::params![id])?;
    }

    Ok(())
}
