//! Gap detection and quality scoring (spec §4.5).
//!
//! The scan window is open-right: it excludes the last `Δ` so the scanner
//! never races the candle that's still accumulating (spec §5 ordering
//! guarantee: "gap detection must treat the scan window as open-right").
//! Everything here is pure given a connection and a window — the caller
//! (the periodic scan task in `main.rs`) owns the schedule.

use rusqlite::Connection;
use tracing::info;

use crate::backfill;
use crate::config::QualityConfig;
use crate::db::queries;
use crate::model::{Candle, DataType, QualitySummary, Timeframe};

/// Result of one scan pass: the persisted summary plus the gaps it found,
/// for a caller that wants to log or assert on them directly (tests,
/// the end-to-end scenarios of spec §8).
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub summary: QualitySummary,
    pub gaps: Vec<(i64, i64)>,
    pub tasks_created: usize,
}

/// Computes the effective open-right window: `[window_end - window_ms,
/// now - Δ)`, aligned down to timeframe boundaries.
pub fn scan_window(timeframe: Timeframe, window_ms: i64, now_ms: i64) -> (i64, i64) {
    let delta = timeframe.duration_ms();
    let end = align_down(now_ms - delta, delta);
    let start = align_down(end - window_ms, delta);
    (start, end)
}

fn align_down(ms: i64, delta: i64) -> i64 {
    ms - ms.rem_euclid(delta)
}

/// Runs one full scan for `(market_id, timeframe)`: computes the quality
/// summary, persists it, detects gaps, and enqueues backfill tasks for
/// them (ignoring gaps that already have an active task, per the unique
/// constraint on `backfill_tasks`).
pub fn run_scan(
    conn: &Connection,
    market_id: i64,
    timeframe: Timeframe,
    config: &QualityConfig,
    now_ms: i64,
) -> rusqlite::Result<ScanOutcome> {
    let (start_ms, end_ms) = scan_window(timeframe, config.window_ms, now_ms);
    let candles = queries::candles_in_window(conn, market_id, timeframe, start_ms, end_ms)?;
    let delta = timeframe.duration_ms();

    let expected_count = ((end_ms - start_ms) / delta).max(0);
    let actual_count = candles.len() as i64;

    let gaps = detect_gaps(&candles, start_ms, end_ms, delta);
    let missing_count: i64 = gaps.iter().map(|(s, e)| (e - s) / delta).sum();

    // Candle-key uniqueness is enforced by the upsert PK, so a scan of
    // already-persisted rows can never itself observe a duplicate; this
    // field stays 0 here and is the hook the batch writer's dead-letter
    // audit would populate for candidates rejected *before* storage.
    let duplicate_count = 0i64;

    let insertion_order = queries::candle_open_times_by_insertion(conn, market_id, timeframe, start_ms, end_ms)?;
    let out_of_order_count = count_out_of_order(&insertion_order);

    let price_jump_count = count_price_jumps(&candles, config.price_jump_threshold);
    let volume_spike_count = count_volume_spikes(&candles, config.volume_spike_k);

    let score = quality_score(
        expected_count,
        missing_count,
        duplicate_count,
        out_of_order_count,
        price_jump_count,
        volume_spike_count,
    );

    let summary = QualitySummary {
        market_id,
        data_type: DataType::Ohlcv,
        timeframe,
        window_start_ms: start_ms,
        window_end_ms: end_ms,
        expected_count,
        actual_count,
        missing_count,
        duplicate_count,
        out_of_order_count,
        price_jump_count,
        volume_spike_count,
        score,
        validated: score >= 100.0,
        issues: issue_list(missing_count, duplicate_count, out_of_order_count, price_jump_count, volume_spike_count),
    };
    queries::upsert_quality_summary(conn, &summary)?;
    crate::metrics::QUALITY_SCORE
        .with_label_values(&[&market_id.to_string(), &timeframe.to_string()])
        .set(score);

    let tasks_created = backfill::create_tasks_for_gaps(conn, market_id, timeframe, &gaps, config, now_ms)?;
    if tasks_created > 0 {
        info!(market_id, %timeframe, tasks_created, "quality scan enqueued backfill tasks");
    }

    Ok(ScanOutcome { summary, gaps, tasks_created })
}

/// Walks the expected `open_time` grid and groups contiguous missing
/// timestamps into aligned half-open intervals (spec §4.5 "Gap
/// detection").
fn detect_gaps(candles: &[Candle], start_ms: i64, end_ms: i64, delta: i64) -> Vec<(i64, i64)> {
    let present: std::collections::HashSet<i64> = candles.iter().map(|c| c.open_time).collect();
    let mut gaps = Vec::new();
    let mut run_start: Option<i64> = None;

    let mut t = start_ms;
    while t < end_ms {
        if present.contains(&t) {
            if let Some(s) = run_start.take() {
                gaps.push((s, t));
            }
        } else if run_start.is_none() {
            run_start = Some(t);
        }
        t += delta;
    }
    if let Some(s) = run_start {
        gaps.push((s, end_ms));
    }
    gaps
}

/// Counts descents in the insertion-ordered `open_time` sequence.
fn count_out_of_order(open_times_by_insertion: &[i64]) -> i64 {
    open_times_by_insertion
        .windows(2)
        .filter(|w| w[1] < w[0])
        .count() as i64
}

fn count_price_jumps(candles: &[Candle], threshold: f64) -> i64 {
    candles
        .windows(2)
        .filter(|w| {
            let (prev, cur) = (&w[0], &w[1]);
            if prev.close <= 0.0 || cur.close <= 0.0 {
                return false;
            }
            (cur.close / prev.close).ln().abs() > threshold
        })
        .count() as i64
}

fn count_volume_spikes(candles: &[Candle], k: f64) -> i64 {
    if candles.len() < 2 {
        return 0;
    }
    let volumes: Vec<f64> = candles.iter().map(|c| c.base_volume).collect();
    let mean = volumes.iter().sum::<f64>() / volumes.len() as f64;
    let variance = volumes.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / volumes.len() as f64;
    let sigma = variance.sqrt();
    if sigma == 0.0 {
        return 0;
    }
    volumes.iter().filter(|&&v| v > mean + k * sigma).count() as i64
}

/// `score = max(0, 100 - 100*(missing+duplicate+oo)/expected -
/// 50*(jumps+spikes)/expected)`, clamped to `[0, 100]` (spec §4.5).
fn quality_score(
    expected: i64,
    missing: i64,
    duplicate: i64,
    out_of_order: i64,
    jumps: i64,
    spikes: i64,
) -> f64 {
    if expected <= 0 {
        return 100.0;
    }
    let exp = expected as f64;
    let completeness_penalty = 100.0 * (missing + duplicate + out_of_order) as f64 / exp;
    let regularity_penalty = 50.0 * (jumps + spikes) as f64 / exp;
    (100.0 - completeness_penalty - regularity_penalty).clamp(0.0, 100.0)
}

fn issue_list(
    missing: i64,
    duplicate: i64,
    out_of_order: i64,
    jumps: i64,
    spikes: i64,
) -> Vec<String> {
    let mut issues = Vec::new();
    if missing > 0 {
        issues.push(format!("{missing} missing candles"));
    }
    if duplicate > 0 {
        issues.push(format!("{duplicate} duplicate keys"));
    }
    if out_of_order > 0 {
        issues.push(format!("{out_of_order} out-of-order insertions"));
    }
    if jumps > 0 {
        issues.push(format!("{jumps} price jumps beyond threshold"));
    }
    if spikes > 0 {
        issues.push(format!("{spikes} volume spikes"));
    }
    issues
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

    fn insert_candle(conn: &Connection, open_time: i64) {
        queries::upsert_candle(
            conn,
            &Candle {
                market_id: 1,
                timeframe: Timeframe::M1,
                open_time,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                base_volume: 1.0,
                quote_volume: 100.0,
                trade_count: 1,
            },
        )
        .unwrap();
    }

    #[test]
    fn no_gaps_scores_100() {
        let conn = conn_with_market();
        let delta = Timeframe::M1.duration_ms();
        for i in 0..60 {
            insert_candle(&conn, i * delta);
        }
        let config = QualityConfig {
            window_ms: 60 * delta,
            scan_interval_ms: 1,
            price_jump_threshold: 0.2,
            volume_spike_k: 6.0,
        };
        // now_ms positioned so the window [0, 60*delta) is fully closed
        let now_ms = 61 * delta + delta;
        let outcome = run_scan(&conn, 1, Timeframe::M1, &config, now_ms).unwrap();
        assert_eq!(outcome.summary.missing_count, 0);
        assert_eq!(outcome.summary.score, 100.0);
        assert!(outcome.gaps.is_empty());
    }

    #[test]
    fn single_missing_interval_detected_as_one_gap() {
        let conn = conn_with_market();
        let delta = Timeframe::M1.duration_ms();
        // S5: {t0, t0+60s, t0+180s, t0+240s} with t0 = 0, missing t0+120s
        for t in [0, delta, 3 * delta, 4 * delta] {
            insert_candle(&conn, t);
        }
        let config = QualityConfig {
            window_ms: 5 * delta,
            scan_interval_ms: 1,
            price_jump_threshold: 0.2,
            volume_spike_k: 6.0,
        };
        let now_ms = 6 * delta;
        let outcome = run_scan(&conn, 1, Timeframe::M1, &config, now_ms).unwrap();
        assert_eq!(outcome.gaps, vec![(2 * delta, 3 * delta)]);
        assert_eq!(outcome.summary.missing_count, 1);
        assert_eq!(outcome.tasks_created, 1);
    }

    #[test]
    fn scan_window_excludes_in_flight_candle() {
        let delta = Timeframe::M1.duration_ms();
        // now_ms sits mid-candle; the window's end must not include the
        // timeframe that's still accumulating.
        let now_ms = 125_000; // in the middle of the candle starting at 120_000
        let (_, end) = scan_window(Timeframe::M1, 10 * delta, now_ms);
        assert!(end <= now_ms - delta);
        assert_eq!(end % delta, 0);
    }

    #[test]
    fn price_jump_beyond_threshold_is_counted() {
        let candles = vec![
            Candle {
                market_id: 1,
                timeframe: Timeframe::M1,
                open_time: 0,
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                base_volume: 1.0,
                quote_volume: 1.0,
                trade_count: 1,
            },
            Candle {
                market_id: 1,
                timeframe: Timeframe::M1,
                open_time: 60_000,
                open: 100.0,
                high: 140.0,
                low: 100.0,
                close: 140.0, // +40%, beyond default 20% threshold
                base_volume: 1.0,
                quote_volume: 1.0,
                trade_count: 1,
            },
        ];
        assert_eq!(count_price_jumps(&candles, 0.20), 1);
    }
}
