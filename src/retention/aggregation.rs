//! Incremental tier materialization (spec §4.6): once every constituent
//! finer-tier candle for a coarser interval is closed and persisted, the
//! coarser candle is derived and upserted. Consistent with "closed-only
//! persistence" — a coarser candle is never materialized from a partial
//! set of finer rows.

use rusqlite::Connection;

use crate::db::queries;
use crate::model::{Candle, Timeframe};

/// Materializes `finer.next_coarser()` over `[window_start_ms,
/// window_end_ms)`, skipping any coarser interval that isn't fully
/// covered by finer rows yet or that hasn't itself closed relative to
/// `now_ms`. Returns how many coarser rows were written.
pub fn materialize_coarser_tier(
    conn: &Connection,
    market_id: i64,
    finer: Timeframe,
    window_start_ms: i64,
    window_end_ms: i64,
    now_ms: i64,
) -> rusqlite::Result<usize> {
    let Some(coarser) = finer.next_coarser() else {
        return Ok(0);
    };
    let coarser_delta = coarser.duration_ms();
    let finer_delta = finer.duration_ms();
    let finer_per_coarser = coarser_delta / finer_delta;

    let mut materialized = 0usize;
    let mut t = align_down(window_start_ms, coarser_delta);
    while t < window_end_ms {
        if !is_closed(t, coarser_delta, now_ms) {
            t += coarser_delta;
            continue;
        }

        let finer_rows = queries::candles_in_window(conn, market_id, finer, t, t + coarser_delta)?;
        if finer_rows.len() as i64 != finer_per_coarser {
            t += coarser_delta;
            continue;
        }

        let candle = aggregate(market_id, coarser, t, &finer_rows);
        queries::upsert_candle(conn, &candle)?;
        materialized += 1;
        t += coarser_delta;
    }
    Ok(materialized)
}

/// Runs materialization for every tier below `D1` over the same window,
/// finest-first, so a freshly closed `1m` run of candles can flow all
/// the way up to `1d` in one pass when the lookback window is wide
/// enough to cover it.
pub fn materialize_all_tiers(
    conn: &Connection,
    market_id: i64,
    window_start_ms: i64,
    window_end_ms: i64,
    now_ms: i64,
) -> rusqlite::Result<usize> {
    let mut total = 0usize;
    for tf in Timeframe::ALL {
        if tf.next_coarser().is_some() {
            total += materialize_coarser_tier(conn, market_id, tf, window_start_ms, window_end_ms, now_ms)?;
        }
    }
    Ok(total)
}

fn aggregate(market_id: i64, timeframe: Timeframe, open_time: i64, finer_rows: &[Candle]) -> Candle {
    let open = finer_rows.first().expect("non-empty by caller's count check").open;
    let close = finer_rows.last().expect("non-empty by caller's count check").close;
    let high = finer_rows.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = finer_rows.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let base_volume = finer_rows.iter().map(|c| c.base_volume).sum();
    let quote_volume = finer_rows.iter().map(|c| c.quote_volume).sum();
    let trade_count = finer_rows.iter().map(|c| c.trade_count).sum();

    Candle {
        market_id,
        timeframe,
        open_time,
        open,
        high,
        low,
        close,
        base_volume,
        quote_volume,
        trade_count,
    }
}

fn align_down(ms: i64, delta: i64) -> i64 {
    ms - ms.rem_euclid(delta)
}

fn is_closed(open_time: i64, delta: i64, now_ms: i64) -> bool {
    open_time + delta <= now_ms - delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::apply_migrations;

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

    fn minute_candle(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            market_id: 1,
            timeframe: Timeframe::M1,
            open_time,
            open,
            high,
            low,
            close,
            base_volume: volume,
            quote_volume: volume * close,
            trade_count: 1,
        }
    }

    #[test]
    fn full_five_minutes_materializes_one_5m_candle() {
        let conn = conn_with_market();
        let delta = Timeframe::M1.duration_ms();
        for i in 0..5 {
            let c = minute_candle(i * delta, 100.0 + i as f64, 105.0 + i as f64, 99.0, 101.0 + i as f64, 1.0);
            queries::upsert_candle(&conn, &c).unwrap();
        }
        let now_ms = 10 * delta;
        let written = materialize_coarser_tier(&conn, 1, Timeframe::M1, 0, 5 * delta, now_ms).unwrap();
        assert_eq!(written, 1);

        let agg = queries::candles_in_window(&conn, 1, Timeframe::M5, 0, 5 * delta).unwrap();
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].open, 100.0);
        assert_eq!(agg[0].close, 105.0);
        assert_eq!(agg[0].base_volume, 5.0);
    }

    #[test]
    fn partial_coverage_does_not_materialize() {
        let conn = conn_with_market();
        let delta = Timeframe::M1.duration_ms();
        for i in 0..3 {
            let c = minute_candle(i * delta, 100.0, 101.0, 99.0, 100.0, 1.0);
            queries::upsert_candle(&conn, &c).unwrap();
        }
        let now_ms = 10 * delta;
        let written = materialize_coarser_tier(&conn, 1, Timeframe::M1, 0, 5 * delta, now_ms).unwrap();
        assert_eq!(written, 0);
    }

    #[test]
    fn in_flight_window_is_skipped() {
        let conn = conn_with_market();
        let delta = Timeframe::M1.duration_ms();
        for i in 0..5 {
            let c = minute_candle(i * delta, 100.0, 101.0, 99.0, 100.0, 1.0);
            queries::upsert_candle(&conn, &c).unwrap();
        }
        // now_ms still inside the 5m window that just closed at the 1m
        // level: the 5m candle itself isn't closed yet.
        let now_ms = 5 * delta + 1;
        let written = materialize_coarser_tier(&conn, 1, Timeframe::M1, 0, 5 * delta, now_ms).unwrap();
        assert_eq!(written, 0);
    }
}
