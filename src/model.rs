//! Core domain types shared across every component of the pipeline.
//!
//! These mirror the data model: markets are identified by
//! `(exchange, symbol)`, candles by `(market, timeframe, open_time)`, and so
//! on. Nothing here talks to SQLite directly — `db::queries` owns the
//! row <-> struct mapping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the fixed timeframes the pipeline understands.
///
/// Kept as a closed enum rather than a free-form string: every caller that
/// needs the interval length (gap detection, aggregation, alignment checks)
/// gets it from `duration_ms()` instead of re-parsing `"5m"` by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::D1,
    ];

    /// Candle width in milliseconds (the spec's "Δ").
    pub fn duration_ms(self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M5 => 300_000,
            Timeframe::M15 => 900_000,
            Timeframe::H1 => 3_600_000,
            Timeframe::D1 => 86_400_000,
        }
    }

    /// The next coarser tier, if any — used by the aggregation pass.
    pub fn next_coarser(self) -> Option<Timeframe> {
        match self {
            Timeframe::M1 => Some(Timeframe::M5),
            Timeframe::M5 => Some(Timeframe::M15),
            Timeframe::M15 => Some(Timeframe::H1),
            Timeframe::H1 => Some(Timeframe::D1),
            Timeframe::D1 => None,
        }
    }

    /// True iff `open_time` is aligned to this timeframe's boundary (UTC).
    pub fn is_aligned(self, open_time_ms: i64) -> bool {
        open_time_ms % self.duration_ms() == 0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::D1 => "1d",
        };
        f.write_str(s)
    }
}

impl FromStr for Timeframe {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "1d" => Ok(Timeframe::D1),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketType {
    Spot,
    Perp,
    Future,
}

/// Identity of a venue. Created once at bootstrap, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    /// Stable lowercase slug, e.g. `"binance"`.
    pub name: String,
    pub display_name: String,
}

/// A trading pair at an exchange. `(exchange, symbol)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: i64,
    pub exchange: String,
    /// Native exchange form, no separator (e.g. `BTCUSDT`).
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub market_type: MarketType,
}

/// Aggregated price/volume over `[open_time, open_time+Δ)`.
///
/// Invariant: `low <= open,high,close <= high`, `base_volume >= 0`,
/// `open_time % Δ == 0`. Only closed candles are ever persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub market_id: i64,
    pub timeframe: Timeframe,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    pub trade_count: i64,
}

impl Candle {
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.low <= self.high
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.base_volume >= 0.0
            && self.timeframe.is_aligned(self.open_time)
    }

    pub fn close_time(&self) -> i64 {
        self.open_time + self.timeframe.duration_ms() - 1
    }

    /// A candle is closed iff its end is strictly behind `now - Δ` (the
    /// safety margin the REST collector applies before forwarding it).
    pub fn is_closed_at(&self, now_ms: i64) -> bool {
        self.open_time + self.timeframe.duration_ms() <= now_ms - self.timeframe.duration_ms()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakerSide {
    Buy,
    Sell,
}

/// A single execution. Keyed by `(market, id)` when the exchange supplies
/// one, else `(market, timestamp, price, quantity)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub market_id: i64,
    pub exchange_trade_id: Option<String>,
    pub timestamp_ms: i64,
    pub price: f64,
    pub quantity: f64,
    pub taker_side: TakerSide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Stored projection of an order book: top-N levels at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub market_id: i64,
    pub timestamp_ms: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub update_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Ohlcv,
    Trades,
    OrderBook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A unit of backfill work. Unique active task per
/// `(market, data_type, timeframe, start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillTask {
    pub id: i64,
    pub market_id: i64,
    pub data_type: DataType,
    pub timeframe: Timeframe,
    pub start_ms: i64,
    pub end_ms: i64,
    pub status: TaskStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub expected_count: i64,
    pub actual_count: i64,
    pub error_message: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Per-(market, data_type, timeframe, window) quality result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySummary {
    pub market_id: i64,
    pub data_type: DataType,
    pub timeframe: Timeframe,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub expected_count: i64,
    pub actual_count: i64,
    pub missing_count: i64,
    pub duplicate_count: i64,
    pub out_of_order_count: i64,
    pub price_jump_count: i64,
    pub volume_spike_count: i64,
    pub score: f64,
    pub validated: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    NetworkError,
    RateLimited,
    Timeout,
    ExchangeError,
    ParseError,
    ServerError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorLog {
    pub exchange: String,
    pub endpoint: String,
    pub error_class: ErrorClass,
    pub code: Option<i32>,
    pub message: String,
    pub parameters: serde_json::Value,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalEvent {
    pub name: String,
    pub kind: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub affected_markets: Vec<i64>,
    pub preserve_raw: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_alignment() {
        assert!(Timeframe::M5.is_aligned(300_000));
        assert!(!Timeframe::M5.is_aligned(300_001));
    }

    #[test]
    fn timeframe_roundtrip_string() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.to_string().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn candle_validity() {
        let c = Candle {
            market_id: 1,
            timeframe: Timeframe::M1,
            open_time: 60_000,
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            base_volume: 5.0,
            quote_volume: 50.0,
            trade_count: 3,
        };
        assert!(c.is_valid());

        let mut bad = c.clone();
        bad.low = 13.0;
        assert!(!bad.is_valid());
    }

    #[test]
    fn candle_closed_requires_safety_margin() {
        let c = Candle {
            market_id: 1,
            timeframe: Timeframe::M1,
            open_time: 60_000,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            base_volume: 0.0,
            quote_volume: 0.0,
            trade_count: 0,
        };
        // open_time + Δ = 120_000; needs now - Δ >= 120_000 => now >= 180_000
        assert!(!c.is_closed_at(120_000));
        assert!(c.is_closed_at(180_000));
    }
}
