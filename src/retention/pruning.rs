//! Per-tier retention (spec §4.6): raw `1m`/trades kept 7 days, `5m` 30
//! days, `15m` 90 days, `1h` 180 days, `1d` unbounded, order-book
//! snapshots 3 days. Pruning is suppressed for any row whose timestamp
//! falls inside a `CriticalEvent` with `preserve_raw` set.

use rusqlite::{params, Connection};

use crate::db::queries;
use crate::model::{CriticalEvent, Timeframe};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
pub const TRADE_RETENTION_DAYS: i64 = 7;
pub const SNAPSHOT_RETENTION_DAYS: i64 = 3;

/// Retention window in days for a candle tier, or `None` for `1d`
/// (unbounded, per spec §4.6's table).
pub fn candle_retention_days(timeframe: Timeframe) -> Option<i64> {
    match timeframe {
        Timeframe::M1 => Some(7),
        Timeframe::M5 => Some(30),
        Timeframe::M15 => Some(90),
        Timeframe::H1 => Some(180),
        Timeframe::D1 => None,
    }
}

/// Deletes `ohlcv` rows for `timeframe` older than its retention window,
/// skipping rows suppressed by a preserve-raw critical event. No-op for
/// `1d` (unbounded retention). Returns rows deleted.
pub fn prune_candles(conn: &Connection, timeframe: Timeframe, now_ms: i64) -> rusqlite::Result<usize> {
    let Some(days) = candle_retention_days(timeframe) else {
        return Ok(0);
    };
    let cutoff = now_ms - days * DAY_MS;
    let preserved = preserved_events(conn)?;

    let mut stmt = conn.prepare(
        "SELECT market_id, open_time FROM ohlcv WHERE timeframe = ?1 AND open_time < ?2",
    )?;
    let candidates: Vec<(i64, i64)> = stmt
        .query_map(params![timeframe.to_string(), cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    let mut deleted = 0usize;
    for (market_id, open_time) in candidates {
        if is_suppressed(&preserved, market_id, open_time) {
            continue;
        }
        conn.execute(
            "DELETE FROM ohlcv WHERE market_id = ?1 AND timeframe = ?2 AND open_time = ?3",
            params![market_id, timeframe.to_string(), open_time],
        )?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Deletes `trades` rows older than `TRADE_RETENTION_DAYS`, same
/// suppression rule as candles.
pub fn prune_trades(conn: &Connection, now_ms: i64) -> rusqlite::Result<usize> {
    let cutoff = now_ms - TRADE_RETENTION_DAYS * DAY_MS;
    let preserved = preserved_events(conn)?;

    let mut stmt = conn.prepare("SELECT market_id, timestamp_ms FROM trades WHERE timestamp_ms < ?1")?;
    let candidates: Vec<(i64, i64)> = stmt
        .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    let mut deleted = 0usize;
    for (market_id, ts) in candidates {
        if is_suppressed(&preserved, market_id, ts) {
            continue;
        }
        conn.execute(
            "DELETE FROM trades WHERE market_id = ?1 AND timestamp_ms = ?2",
            params![market_id, ts],
        )?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Deletes `orderbook_snapshots` rows older than `SNAPSHOT_RETENTION_DAYS`.
pub fn prune_snapshots(conn: &Connection, now_ms: i64) -> rusqlite::Result<usize> {
    let cutoff = now_ms - SNAPSHOT_RETENTION_DAYS * DAY_MS;
    let preserved = preserved_events(conn)?;

    let mut stmt = conn.prepare("SELECT market_id, timestamp_ms FROM orderbook_snapshots WHERE timestamp_ms < ?1")?;
    let candidates: Vec<(i64, i64)> = stmt
        .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    let mut deleted = 0usize;
    for (market_id, ts) in candidates {
        if is_suppressed(&preserved, market_id, ts) {
            continue;
        }
        conn.execute(
            "DELETE FROM orderbook_snapshots WHERE market_id = ?1 AND timestamp_ms = ?2",
            params![market_id, ts],
        )?;
        deleted += 1;
    }
    Ok(deleted)
}

fn preserved_events(conn: &Connection) -> rusqlite::Result<Vec<CriticalEvent>> {
    Ok(queries::list_critical_events(conn)?
        .into_iter()
        .filter(|e| e.preserve_raw)
        .collect())
}

/// An event with an empty `affected_markets` list is treated as applying
/// to every market (a global critical event, e.g. an exchange-wide
/// outage), per the resolution recorded in DESIGN.md.
fn is_suppressed(events: &[CriticalEvent], market_id: i64, timestamp_ms: i64) -> bool {
    events.iter().any(|event| {
        timestamp_ms >= event.start_ms
            && timestamp_ms < event.end_ms
            && (event.affected_markets.is_empty() || event.affected_markets.contains(&market_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::apply_migrations;
    use crate::model::Candle;

    fn conn_with_market() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO markets (exchange, symbol, base_asset, quote_asset, market_type)
             VALUES ('binance', 'BTCUSDT', 'BTC', 'USDT', 'spot')",
            [],
        )
        .unwrap();
        conn
    }

    fn candle(open_time: i64, timeframe: Timeframe) -> Candle {
        Candle {
            market_id: 1,
            timeframe,
            open_time,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            base_volume: 1.0,
            quote_volume: 1.0,
            trade_count: 1,
        }
    }

    #[test]
    fn prunes_candles_older_than_tier_window() {
        let conn = conn_with_market();
        let old = 0i64;
        let recent = 100 * DAY_MS;
        queries::upsert_candle(&conn, &candle(old, Timeframe::M1)).unwrap();
        queries::upsert_candle(&conn, &candle(recent, Timeframe::M1)).unwrap();

        let now_ms = 100 * DAY_MS + 8 * DAY_MS;
        let deleted = prune_candles(&conn, Timeframe::M1, now_ms).unwrap();
        assert_eq!(deleted, 1);

        let remaining: i64 = conn.query_row("SELECT COUNT(*) FROM ohlcv", [], |r| r.get(0)).unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn daily_tier_is_never_pruned() {
        let conn = conn_with_market();
        queries::upsert_candle(&conn, &candle(0, Timeframe::D1)).unwrap();
        let deleted = prune_candles(&conn, Timeframe::D1, 10_000 * DAY_MS).unwrap();
        assert_eq!(deleted, 0);
    }

    #[test]
    fn critical_event_suppresses_pruning() {
        let conn = conn_with_market();
        queries::upsert_candle(&conn, &candle(0, Timeframe::M1)).unwrap();
        conn.execute(
            "INSERT INTO critical_events (name, kind, start_ms, end_ms, affected_markets_json, preserve_raw)
             VALUES ('flash-crash', 'market-event', -1, 1000, '[]', 1)",
            [],
        )
        .unwrap();

        let now_ms = 100 * DAY_MS;
        let deleted = prune_candles(&conn, Timeframe::M1, now_ms).unwrap();
        assert_eq!(deleted, 0);

        let remaining: i64 = conn.query_row("SELECT COUNT(*) FROM ohlcv", [], |r| r.get(0)).unwrap();
        assert_eq!(remaining, 1);
    }
}
