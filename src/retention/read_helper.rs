//! Tier selection for range reads (spec §4.6): rather than always reading
//! the finest-grained tier and paying its row-count cost, pick the
//! finest tier whose materialized rows still stay under a cardinality
//! budget for the requested interval — "≤ 12h → 1m, ≤ 3d → 5m, ≤ 30d →
//! 15m, ≤ 180d → 1h, else 1d".

use rusqlite::Connection;

use crate::db::queries;
use crate::model::{Candle, Timeframe};

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// The tier a read for `[start_ms, end_ms)` should be served from, based
/// purely on the span's width.
pub fn tier_for_span(start_ms: i64, end_ms: i64) -> Timeframe {
    let span_ms = (end_ms - start_ms).max(0);
    if span_ms <= 12 * HOUR_MS {
        Timeframe::M1
    } else if span_ms <= 3 * DAY_MS {
        Timeframe::M5
    } else if span_ms <= 30 * DAY_MS {
        Timeframe::M15
    } else if span_ms <= 180 * DAY_MS {
        Timeframe::H1
    } else {
        Timeframe::D1
    }
}

/// Reads the requested window from whichever tier `tier_for_span` picks.
/// Callers that need a specific timeframe regardless of span width
/// should call `queries::candles_in_window` directly instead.
pub fn read_range(
    conn: &Connection,
    market_id: i64,
    start_ms: i64,
    end_ms: i64,
) -> rusqlite::Result<Vec<Candle>> {
    let tier = tier_for_span(start_ms, end_ms);
    queries::candles_in_window(conn, market_id, tier, start_ms, end_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_span_uses_finest_tier() {
        assert_eq!(tier_for_span(0, 11 * HOUR_MS), Timeframe::M1);
    }

    #[test]
    fn boundary_at_twelve_hours_is_still_one_minute() {
        assert_eq!(tier_for_span(0, 12 * HOUR_MS), Timeframe::M1);
        assert_eq!(tier_for_span(0, 12 * HOUR_MS + 1), Timeframe::M5);
    }

    #[test]
    fn week_long_span_uses_fifteen_minute_tier() {
        assert_eq!(tier_for_span(0, 7 * DAY_MS), Timeframe::M15);
    }

    #[test]
    fn half_year_span_uses_hourly_tier() {
        assert_eq!(tier_for_span(0, 100 * DAY_MS), Timeframe::H1);
    }

    #[test]
    fn year_long_span_uses_daily_tier() {
        assert_eq!(tier_for_span(0, 400 * DAY_MS), Timeframe::D1);
    }
}
