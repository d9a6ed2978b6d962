//! Binance REST/WS adapter. Generalizes the teacher's direct `binance`
//! crate usage (`retriever.rs`, `realtime.rs`) into the unified
//! `ExchangeAdapter` surface, using `reqwest` instead so status codes and
//! the `Retry-After` header are visible to the retry policy (the `binance`
//! crate's blocking client hides both — see DESIGN.md).

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::CollectorError;
use crate::model::{MarketType, TakerSide, Timeframe};

use super::{
    classify_status, map_transport_error, retry_after_ms, ExchangeAdapter, ExchangeCandle,
    ExchangeLevel, ExchangeOrderBookDelta, ExchangeOrderBookSnapshot, ExchangeTrade, MarketMeta,
    StreamKind, Subscription, WsMessage,
};

const BASE_URL: &str = "https://api.binance.com";
const WS_URL: &str = "wss://stream.binance.com:9443/ws";

pub struct BinanceAdapter {
    http: reqwest::Client,
}

impl BinanceAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn interval(tf: Timeframe) -> &'static str {
        // Binance's native interval strings happen to coincide with our
        // own `Timeframe::Display` (both use "1m", "5m", "15m", "1h", "1d").
        match tf {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::D1 => "1d",
        }
    }
}

#[derive(Deserialize)]
struct BinanceAggTrade {
    a: i64,
    p: String,
    q: String,
    #[serde(rename = "T")]
    timestamp_ms: i64,
    m: bool, // true if the buyer is the market maker -> taker sold
}

#[derive(Deserialize)]
struct BinanceDepth {
    #[serde(rename = "lastUpdateId")]
    last_update_id: i64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Deserialize)]
struct BinanceExchangeInfo {
    symbols: Vec<BinanceSymbolInfo>,
}

#[derive(Deserialize)]
struct BinanceSymbolInfo {
    symbol: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ExchangeCandle>, CollectorError> {
        let endpoint = "klines";
        let mut req = self.http.get(format!("{BASE_URL}/api/v3/klines")).query(&[
            ("symbol", symbol.to_string()),
            ("interval", Self::interval(timeframe).to_string()),
            ("limit", limit.to_string()),
        ]);
        if let Some(since) = since_ms {
            req = req.query(&[("startTime", since.to_string())]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| map_transport_error(endpoint, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let retry_after = retry_after_ms(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, self.name(), endpoint, retry_after, body));
        }

        let raw: Vec<[serde_json::Value; 11]> = resp.json().await.map_err(|e| {
            CollectorError::ParseError {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
        })?;

        raw.into_iter()
            .map(|row| parse_kline_row(endpoint, &row))
            .collect()
    }

    async fn fetch_trades(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ExchangeTrade>, CollectorError> {
        let endpoint = "aggTrades";
        let mut req = self
            .http
            .get(format!("{BASE_URL}/api/v3/aggTrades"))
            .query(&[("symbol", symbol.to_string()), ("limit", limit.to_string())]);
        if let Some(since) = since_ms {
            req = req.query(&[("startTime", since.to_string())]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| map_transport_error(endpoint, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let retry_after = retry_after_ms(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, self.name(), endpoint, retry_after, body));
        }

        let raw: Vec<BinanceAggTrade> = resp.json().await.map_err(|e| CollectorError::ParseError {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        raw.into_iter()
            .map(|t| {
                Ok(ExchangeTrade {
                    exchange_trade_id: Some(t.a.to_string()),
                    timestamp_ms: t.timestamp_ms,
                    price: parse_f64(endpoint, &t.p)?,
                    quantity: parse_f64(endpoint, &t.q)?,
                    // `m` = buyer is maker, i.e. the taker sold.
                    taker_side: if t.m { TakerSide::Sell } else { TakerSide::Buy },
                })
            })
            .collect()
    }

    async fn fetch_order_book(
        &self,
        symbol: &str,
        depth: u32,
    ) -> Result<ExchangeOrderBookSnapshot, CollectorError> {
        let endpoint = "depth";
        let resp = self
            .http
            .get(format!("{BASE_URL}/api/v3/depth"))
            .query(&[("symbol", symbol.to_string()), ("limit", depth.to_string())])
            .send()
            .await
            .map_err(|e| map_transport_error(endpoint, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let retry_after = retry_after_ms(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, self.name(), endpoint, retry_after, body));
        }

        let raw: BinanceDepth = resp.json().await.map_err(|e| CollectorError::ParseError {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        Ok(ExchangeOrderBookSnapshot {
            update_id: raw.last_update_id,
            bids: parse_levels(endpoint, &raw.bids)?,
            asks: parse_levels(endpoint, &raw.asks)?,
        })
    }

    async fn market_meta(&self, symbol: &str) -> Result<MarketMeta, CollectorError> {
        let endpoint = "exchangeInfo";
        let resp = self
            .http
            .get(format!("{BASE_URL}/api/v3/exchangeInfo"))
            .query(&[("symbol", symbol.to_string())])
            .send()
            .await
            .map_err(|e| map_transport_error(endpoint, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let retry_after = retry_after_ms(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, self.name(), endpoint, retry_after, body));
        }

        let info: BinanceExchangeInfo = resp.json().await.map_err(|e| CollectorError::ParseError {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        let found = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| CollectorError::ParseError {
                endpoint: endpoint.to_string(),
                message: format!("symbol {symbol} not present in exchangeInfo response"),
            })?;

        Ok(MarketMeta {
            base_asset: found.base_asset,
            quote_asset: found.quote_asset,
            market_type: MarketType::Spot,
        })
    }

    fn ws_url(&self) -> &'static str {
        WS_URL
    }

    fn topic(&self, sub: &Subscription) -> String {
        let symbol = sub.symbol.to_lowercase();
        match sub.kind {
            StreamKind::Trade => format!("{symbol}@trade"),
            StreamKind::OrderBook => format!("{symbol}@depth"),
            StreamKind::Kline => format!(
                "{symbol}@kline_{}",
                Self::interval(sub.timeframe.expect("kline subscription carries a timeframe"))
            ),
        }
    }

    fn subscribe_frames(&self, subs: &[Subscription]) -> Vec<String> {
        subs.chunks(self.max_subscribe_args())
            .enumerate()
            .map(|(i, chunk)| {
                let params: Vec<String> = chunk.iter().map(|s| self.topic(s)).collect();
                serde_json::json!({
                    "method": "SUBSCRIBE",
                    "params": params,
                    "id": i + 1,
                })
                .to_string()
            })
            .collect()
    }

    fn ping_frame(&self) -> Option<String> {
        // Binance answers transport-level pings automatically; no
        // application-level ping frame is required.
        None
    }

    fn parse_ws_message(&self, text: &str) -> WsMessage {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return WsMessage::Unknown;
        };

        if value.get("result").is_some() && value.get("id").is_some() {
            return WsMessage::SubscriptionAck;
        }

        let Some(event) = value.get("e").and_then(|v| v.as_str()) else {
            return WsMessage::Unknown;
        };

        match event {
            "trade" => parse_ws_trade(&value).unwrap_or(WsMessage::Unknown),
            "depthUpdate" => parse_ws_depth(&value).unwrap_or(WsMessage::Unknown),
            "kline" => parse_ws_kline(&value).unwrap_or(WsMessage::Unknown),
            _ => WsMessage::Unknown,
        }
    }
}

fn parse_kline_row(
    endpoint: &str,
    row: &[serde_json::Value; 11],
) -> Result<ExchangeCandle, CollectorError> {
    let err = |message: String| CollectorError::ParseError {
        endpoint: endpoint.to_string(),
        message,
    };
    let as_i64 = |v: &serde_json::Value| v.as_i64().ok_or_else(|| err("expected integer".into()));
    let as_str_f64 = |v: &serde_json::Value| -> Result<f64, CollectorError> {
        v.as_str()
            .ok_or_else(|| err("expected string".into()))?
            .parse::<f64>()
            .map_err(|e| err(e.to_string()))
    };

    Ok(ExchangeCandle {
        open_time_ms: as_i64(&row[0])?,
        open: as_str_f64(&row[1])?,
        high: as_str_f64(&row[2])?,
        low: as_str_f64(&row[3])?,
        close: as_str_f64(&row[4])?,
        base_volume: as_str_f64(&row[5])?,
        quote_volume: as_str_f64(&row[7])?,
        trade_count: as_i64(&row[8])?,
        is_closed: true,
    })
}

fn parse_ws_trade(value: &serde_json::Value) -> Option<WsMessage> {
    let symbol = value.get("s")?.as_str()?.to_string();
    let price: f64 = value.get("p")?.as_str()?.parse().ok()?;
    let quantity: f64 = value.get("q")?.as_str()?.parse().ok()?;
    let timestamp_ms = value.get("T")?.as_i64()?;
    let id = value.get("t")?.as_i64()?;
    let buyer_is_maker = value.get("m")?.as_bool()?;

    Some(WsMessage::Trade {
        symbol,
        trade: ExchangeTrade {
            exchange_trade_id: Some(id.to_string()),
            timestamp_ms,
            price,
            quantity,
            taker_side: if buyer_is_maker { TakerSide::Sell } else { TakerSide::Buy },
        },
    })
}

fn parse_ws_depth(value: &serde_json::Value) -> Option<WsMessage> {
    let symbol = value.get("s")?.as_str()?.to_string();
    let first_update_id = value.get("U")?.as_i64()?;
    let last_update_id = value.get("u")?.as_i64()?;
    let bids = ws_levels(value.get("b")?)?;
    let asks = ws_levels(value.get("a")?)?;

    Some(WsMessage::OrderBookDelta {
        symbol,
        delta: ExchangeOrderBookDelta {
            first_update_id,
            last_update_id,
            bids,
            asks,
        },
    })
}

fn parse_ws_kline(value: &serde_json::Value) -> Option<WsMessage> {
    let symbol = value.get("s")?.as_str()?.to_string();
    let k = value.get("k")?;
    let interval = k.get("i")?.as_str()?;
    let timeframe: Timeframe = interval.parse().ok()?;

    let candle = ExchangeCandle {
        open_time_ms: k.get("t")?.as_i64()?,
        open: k.get("o")?.as_str()?.parse().ok()?,
        high: k.get("h")?.as_str()?.parse().ok()?,
        low: k.get("l")?.as_str()?.parse().ok()?,
        close: k.get("c")?.as_str()?.parse().ok()?,
        base_volume: k.get("v")?.as_str()?.parse().ok()?,
        quote_volume: k.get("q")?.as_str()?.parse().ok()?,
        trade_count: k.get("n")?.as_i64()?,
        is_closed: k.get("x")?.as_bool()?,
    };

    Some(WsMessage::Kline { symbol, timeframe, candle })
}

fn ws_levels(value: &serde_json::Value) -> Option<Vec<ExchangeLevel>> {
    value
        .as_array()?
        .iter()
        .map(|pair| {
            let pair = pair.as_array()?;
            Some(ExchangeLevel {
                price: pair.first()?.as_str()?.parse().ok()?,
                quantity: pair.get(1)?.as_str()?.parse().ok()?,
            })
        })
        .collect()
}

fn parse_f64(endpoint: &str, s: &str) -> Result<f64, CollectorError> {
    s.parse().map_err(|_| CollectorError::ParseError {
        endpoint: endpoint.to_string(),
        message: format!("invalid decimal {s:?}"),
    })
}

fn parse_levels(endpoint: &str, raw: &[[String; 2]]) -> Result<Vec<ExchangeLevel>, CollectorError> {
    raw.iter()
        .map(|[p, q]| {
            Ok(ExchangeLevel {
                price: parse_f64(endpoint, p)?,
                quantity: parse_f64(endpoint, q)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new(reqwest::Client::new())
    }

    #[test]
    fn kline_topic_matches_native_grammar() {
        let a = adapter();
        let sub = Subscription {
            kind: StreamKind::Kline,
            symbol: "BTCUSDT".into(),
            timeframe: Some(Timeframe::M1),
        };
        assert_eq!(a.topic(&sub), "btcusdt@kline_1m");
    }

    #[test]
    fn subscribe_frames_chunk_below_cap() {
        let a = adapter();
        let subs: Vec<Subscription> = (0..25)
            .map(|i| Subscription {
                kind: StreamKind::Trade,
                symbol: format!("SYM{i}"),
                timeframe: None,
            })
            .collect();
        let frames = a.subscribe_frames(&subs);
        assert_eq!(frames.len(), 3); // 10 + 10 + 5
    }

    #[test]
    fn parses_trade_message() {
        let a = adapter();
        let text = r#"{"e":"trade","s":"BTCUSDT","t":12345,"p":"50000.00","q":"0.01","T":1700000000000,"m":false}"#;
        match a.parse_ws_message(text) {
            WsMessage::Trade { symbol, trade } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(trade.taker_side, TakerSide::Buy);
                assert_eq!(trade.price, 50000.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_depth_update_with_sequence_bounds() {
        let a = adapter();
        let text = r#"{"e":"depthUpdate","s":"BTCUSDT","U":100,"u":105,"b":[["49999.0","1.0"]],"a":[]}"#;
        match a.parse_ws_message(text) {
            WsMessage::OrderBookDelta { delta, .. } => {
                assert_eq!(delta.first_update_id, 100);
                assert_eq!(delta.last_update_id, 105);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_forwards_closed_klines() {
        let a = adapter();
        let open = r#"{"e":"kline","s":"BTCUSDT","k":{"t":60000,"i":"1m","o":"1","h":"2","l":"1","c":"1.5","v":"10","q":"15","n":4,"x":false}}"#;
        match a.parse_ws_message(open) {
            WsMessage::Kline { candle, .. } => assert!(!candle.is_closed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn subscription_ack_detected() {
        let a = adapter();
        assert_eq!(
            a.parse_ws_message(r#"{"result":null,"id":1}"#),
            WsMessage::SubscriptionAck
        );
    }
}
