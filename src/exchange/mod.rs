//! Unified exchange adapter surface (spec §4.1, §6): every venue-specific
//! detail — symbol/parameter naming, pagination, WS topic grammar, message
//! framing — lives behind one trait so the REST collector and the stream
//! session never branch on exchange name themselves. Concrete adapters are
//! selected by name at startup (design note §9: "variant set with the
//! unified operation surface").

pub mod binance;
pub mod bybit;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CollectorError;
use crate::model::{MarketType, TakerSide, Timeframe};

/// A candle as returned by an adapter, before market resolution. Timestamps
/// are already normalized to UTC milliseconds (spec §4.1 "Normalization
/// rules"); `market_id` is filled in later by whoever resolves
/// `(exchange, symbol)` through the market cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeCandle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    pub trade_count: i64,
    /// Only meaningful for kline stream messages; REST candles are always
    /// closed by construction (the adapter filters on `is_closed_at`).
    pub is_closed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeTrade {
    pub exchange_trade_id: Option<String>,
    pub timestamp_ms: i64,
    pub price: f64,
    pub quantity: f64,
    pub taker_side: TakerSide,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeLevel {
    pub price: f64,
    pub quantity: f64,
}

/// A REST order-book snapshot: full levels plus the update id a delta
/// stream can be spliced onto (spec §4.3 step 1).
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrderBookSnapshot {
    pub update_id: i64,
    pub bids: Vec<ExchangeLevel>,
    pub asks: Vec<ExchangeLevel>,
}

/// A WebSocket order-book delta (spec §4.3 step 3): `first_update_id` and
/// `last_update_id` bound the range of exchange sequence numbers this
/// message covers.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrderBookDelta {
    pub first_update_id: i64,
    pub last_update_id: i64,
    pub bids: Vec<ExchangeLevel>,
    pub asks: Vec<ExchangeLevel>,
}

/// Metadata used to resolve a native symbol into `(base_asset, quote_asset,
/// market_type)` without parsing the symbol string itself (spec §4.1:
/// "Base and quote are parsed from exchange metadata, never from the
/// symbol string").
#[derive(Debug, Clone, PartialEq)]
pub struct MarketMeta {
    pub base_asset: String,
    pub quote_asset: String,
    pub market_type: MarketType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Trade,
    OrderBook,
    Kline,
}

/// A decoded WebSocket frame. `topic`-bearing messages decode into one of
/// the data variants; frames without a topic (acks, pongs) are control
/// frames, per spec §6.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Trade { symbol: String, trade: ExchangeTrade },
    OrderBookDelta { symbol: String, delta: ExchangeOrderBookDelta },
    Kline { symbol: String, timeframe: Timeframe, candle: ExchangeCandle },
    SubscriptionAck,
    Pong,
    Unknown,
}

/// One subscription request: a stream kind for a symbol, with the
/// timeframe set only for `Kline`.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub kind: StreamKind,
    pub symbol: String,
    pub timeframe: Option<Timeframe>,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ExchangeCandle>, CollectorError>;

    async fn fetch_trades(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ExchangeTrade>, CollectorError>;

    async fn fetch_order_book(
        &self,
        symbol: &str,
        depth: u32,
    ) -> Result<ExchangeOrderBookSnapshot, CollectorError>;

    /// Exchange metadata used to resolve base/quote on first sight of a
    /// symbol; a stub adapter (tests) may return a fixed guess.
    async fn market_meta(&self, symbol: &str) -> Result<MarketMeta, CollectorError>;

    fn ws_url(&self) -> &'static str;

    /// Native topic grammar, e.g. `trade.<SYMBOL>` (spec §6).
    fn topic(&self, sub: &Subscription) -> String;

    /// Subscribe frames, already chunked below the per-message argument
    /// cap (spec §4.2, default 10 args/frame).
    fn subscribe_frames(&self, subs: &[Subscription]) -> Vec<String>;

    /// Application-level ping frame, if the protocol requires one over the
    /// transport-level ping (spec §4.2 "Heartbeats").
    fn ping_frame(&self) -> Option<String>;

    fn parse_ws_message(&self, text: &str) -> WsMessage;

    fn max_subscribe_args(&self) -> usize {
        10
    }
}

/// Selects the adapter for an exchange name (design note §9: "select by
/// exchange name at startup"). Unknown names are disabled per config
/// default, not an error.
pub fn adapter_for(name: &str, http: reqwest::Client) -> Option<Arc<dyn ExchangeAdapter>> {
    match name {
        "binance" => Some(Arc::new(binance::BinanceAdapter::new(http))),
        "bybit" => Some(Arc::new(bybit::BybitAdapter::new(http))),
        _ => None,
    }
}

/// Shared HTTP status -> error-class mapping (spec §4.1, §7): 429 is
/// `RateLimited` (honoring `Retry-After` if present), other 4xx are
/// terminal `ExchangeError`, 5xx is retryable `ServerError`.
pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    exchange: &str,
    endpoint: &str,
    retry_after_ms: Option<u64>,
    message: String,
) -> CollectorError {
    if status.as_u16() == 429 {
        CollectorError::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after_ms,
        }
    } else if status.is_server_error() {
        CollectorError::ServerError {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        }
    } else {
        CollectorError::ExchangeError {
            exchange: exchange.to_string(),
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message,
        }
    }
}

pub(crate) fn retry_after_ms(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs * 1_000)
}

pub(crate) fn map_transport_error(endpoint: &str, err: reqwest::Error) -> CollectorError {
    if err.is_timeout() {
        CollectorError::Timeout {
            endpoint: endpoint.to_string(),
        }
    } else {
        CollectorError::Network {
            endpoint: endpoint.to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_exchange_has_no_adapter() {
        assert!(adapter_for("dYdX", reqwest::Client::new()).is_none());
    }

    #[test]
    fn known_exchanges_resolve() {
        assert!(adapter_for("binance", reqwest::Client::new()).is_some());
        assert!(adapter_for("bybit", reqwest::Client::new()).is_some());
    }
}
