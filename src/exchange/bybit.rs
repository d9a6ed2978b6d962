//! Bybit v5 unified REST/WS adapter. Bybit's own topic grammar
//! (`trade.<SYMBOL>`, `orderbook.N.<SYMBOL>`, `kline.<interval>.<SYMBOL>`)
//! is exactly the grammar named in spec §6, which is why this is the
//! pack's natural second adapter alongside Binance rather than an invented
//! one (see DESIGN.md).

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::CollectorError;
use crate::model::{MarketType, TakerSide, Timeframe};

use super::{
    classify_status, map_transport_error, retry_after_ms, ExchangeAdapter, ExchangeCandle,
    ExchangeLevel, ExchangeOrderBookDelta, ExchangeOrderBookSnapshot, ExchangeTrade, MarketMeta,
    StreamKind, Subscription, WsMessage,
};

const BASE_URL: &str = "https://api.bybit.com";
const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const CATEGORY: &str = "spot";

pub struct BybitAdapter {
    http: reqwest::Client,
}

impl BybitAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn interval(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "1",
            Timeframe::M5 => "5",
            Timeframe::M15 => "15",
            Timeframe::H1 => "60",
            Timeframe::D1 => "D",
        }
    }
}

#[derive(Deserialize)]
struct BybitEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i32,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Deserialize)]
struct BybitKlineResult {
    list: Vec<[String; 7]>,
}

#[derive(Deserialize)]
struct BybitTradeResult {
    list: Vec<BybitTrade>,
}

#[derive(Deserialize)]
struct BybitTrade {
    #[serde(rename = "execId")]
    exec_id: String,
    #[serde(rename = "time")]
    timestamp_ms: String,
    price: String,
    size: String,
    side: String,
}

#[derive(Deserialize)]
struct BybitOrderBookResult {
    u: i64,
    b: Vec<[String; 2]>,
    a: Vec<[String; 2]>,
}

#[derive(Deserialize)]
struct BybitInstrumentsResult {
    list: Vec<BybitInstrument>,
}

#[derive(Deserialize)]
struct BybitInstrument {
    #[serde(rename = "baseCoin")]
    base_coin: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
}

async fn get<T: for<'de> Deserialize<'de>>(
    http: &reqwest::Client,
    exchange: &str,
    endpoint: &str,
    url: &str,
    query: &[(&str, String)],
) -> Result<T, CollectorError> {
    let resp = http
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| map_transport_error(endpoint, e))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let retry_after = retry_after_ms(&resp);
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, exchange, endpoint, retry_after, body));
    }

    let envelope: BybitEnvelope<T> = resp.json().await.map_err(|e| CollectorError::ParseError {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;

    if envelope.ret_code != 0 {
        return Err(CollectorError::ExchangeError {
            exchange: exchange.to_string(),
            endpoint: endpoint.to_string(),
            status: envelope.ret_code.unsigned_abs() as u16,
            message: envelope.ret_msg,
        });
    }

    envelope.result.ok_or_else(|| CollectorError::ParseError {
        endpoint: endpoint.to_string(),
        message: "missing result payload".into(),
    })
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &'static str {
        "bybit"
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ExchangeCandle>, CollectorError> {
        let endpoint = "market/kline";
        let mut query = vec![
            ("category".to_string(), CATEGORY.to_string()),
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), Self::interval(timeframe).to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(since) = since_ms {
            query.push(("start".to_string(), since.to_string()));
        }
        let query_ref: Vec<(&str, String)> = query.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

        let result: BybitKlineResult = get(
            &self.http,
            self.name(),
            endpoint,
            &format!("{BASE_URL}/v5/market/kline"),
            &query_ref,
        )
        .await?;

        // Bybit returns newest-first; the adapter contract promises
        // ascending open_time order (spec §4.1).
        let mut candles: Vec<ExchangeCandle> = result
            .list
            .iter()
            .map(|row| parse_kline_row(endpoint, row))
            .collect::<Result<_, _>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn fetch_trades(
        &self,
        symbol: &str,
        _since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ExchangeTrade>, CollectorError> {
        let endpoint = "market/recent-trade";
        let result: BybitTradeResult = get(
            &self.http,
            self.name(),
            endpoint,
            &format!("{BASE_URL}/v5/market/recent-trade"),
            &[
                ("category".to_string(), CATEGORY.to_string()),
                ("symbol".to_string(), symbol.to_string()),
                ("limit".to_string(), limit.to_string()),
            ],
        )
        .await?;

        result
            .list
            .into_iter()
            .map(|t| {
                Ok(ExchangeTrade {
                    exchange_trade_id: Some(t.exec_id),
                    timestamp_ms: t.timestamp_ms.parse().map_err(|_| CollectorError::ParseError {
                        endpoint: endpoint.to_string(),
                        message: format!("invalid trade timestamp {:?}", t.timestamp_ms),
                    })?,
                    price: parse_f64(endpoint, &t.price)?,
                    quantity: parse_f64(endpoint, &t.size)?,
                    taker_side: if t.side.eq_ignore_ascii_case("buy") {
                        TakerSide::Buy
                    } else {
                        TakerSide::Sell
                    },
                })
            })
            .collect()
    }

    async fn fetch_order_book(
        &self,
        symbol: &str,
        depth: u32,
    ) -> Result<ExchangeOrderBookSnapshot, CollectorError> {
        let endpoint = "market/orderbook";
        let result: BybitOrderBookResult = get(
            &self.http,
            self.name(),
            endpoint,
            &format!("{BASE_URL}/v5/market/orderbook"),
            &[
                ("category".to_string(), CATEGORY.to_string()),
                ("symbol".to_string(), symbol.to_string()),
                ("limit".to_string(), depth.to_string()),
            ],
        )
        .await?;

        Ok(ExchangeOrderBookSnapshot {
            update_id: result.u,
            bids: parse_levels(endpoint, &result.b)?,
            asks: parse_levels(endpoint, &result.a)?,
        })
    }

    async fn market_meta(&self, symbol: &str) -> Result<MarketMeta, CollectorError> {
        let endpoint = "market/instruments-info";
        let result: BybitInstrumentsResult = get(
            &self.http,
            self.name(),
            endpoint,
            &format!("{BASE_URL}/v5/market/instruments-info"),
            &[
                ("category".to_string(), CATEGORY.to_string()),
                ("symbol".to_string(), symbol.to_string()),
            ],
        )
        .await?;

        let instrument = result.list.into_iter().next().ok_or_else(|| CollectorError::ParseError {
            endpoint: endpoint.to_string(),
            message: format!("symbol {symbol} not present in instruments-info response"),
        })?;

        Ok(MarketMeta {
            base_asset: instrument.base_coin,
            quote_asset: instrument.quote_coin,
            market_type: MarketType::Spot,
        })
    }

    fn ws_url(&self) -> &'static str {
        WS_URL
    }

    fn topic(&self, sub: &Subscription) -> String {
        match sub.kind {
            StreamKind::Trade => format!("trade.{}", sub.symbol),
            StreamKind::OrderBook => format!("orderbook.50.{}", sub.symbol),
            StreamKind::Kline => format!(
                "kline.{}.{}",
                Self::interval(sub.timeframe.expect("kline subscription carries a timeframe")),
                sub.symbol
            ),
        }
    }

    fn subscribe_frames(&self, subs: &[Subscription]) -> Vec<String> {
        subs.chunks(self.max_subscribe_args())
            .map(|chunk| {
                let args: Vec<String> = chunk.iter().map(|s| self.topic(s)).collect();
                serde_json::json!({ "op": "subscribe", "args": args }).to_string()
            })
            .collect()
    }

    fn ping_frame(&self) -> Option<String> {
        Some(serde_json::json!({ "op": "ping" }).to_string())
    }

    fn parse_ws_message(&self, text: &str) -> WsMessage {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return WsMessage::Unknown;
        };

        if let Some(op) = value.get("op").and_then(|v| v.as_str()) {
            return match op {
                "pong" => WsMessage::Pong,
                "subscribe" => WsMessage::SubscriptionAck,
                _ => WsMessage::Unknown,
            };
        }

        let Some(topic) = value.get("topic").and_then(|v| v.as_str()) else {
            return WsMessage::Unknown;
        };

        if let Some(symbol) = topic.strip_prefix("trade.") {
            return parse_ws_trade(symbol, &value).unwrap_or(WsMessage::Unknown);
        }
        if let Some(rest) = topic.strip_prefix("orderbook.") {
            let symbol = rest.split_once('.').map(|(_, s)| s).unwrap_or(rest);
            return parse_ws_depth(symbol, &value).unwrap_or(WsMessage::Unknown);
        }
        if let Some(rest) = topic.strip_prefix("kline.") {
            return parse_ws_kline(rest, &value).unwrap_or(WsMessage::Unknown);
        }
        WsMessage::Unknown
    }
}

fn parse_kline_row(endpoint: &str, row: &[String; 7]) -> Result<ExchangeCandle, CollectorError> {
    Ok(ExchangeCandle {
        open_time_ms: row[0].parse().map_err(|_| perr(endpoint, "open_time"))?,
        open: parse_f64(endpoint, &row[1])?,
        high: parse_f64(endpoint, &row[2])?,
        low: parse_f64(endpoint, &row[3])?,
        close: parse_f64(endpoint, &row[4])?,
        base_volume: parse_f64(endpoint, &row[5])?,
        quote_volume: parse_f64(endpoint, &row[6])?,
        trade_count: 0, // bybit's kline REST endpoint does not report trade count
        is_closed: true,
    })
}

fn parse_ws_trade(symbol: &str, value: &serde_json::Value) -> Option<WsMessage> {
    let data = value.get("data")?.as_array()?.first()?;
    let price: f64 = data.get("p")?.as_str()?.parse().ok()?;
    let quantity: f64 = data.get("v")?.as_str()?.parse().ok()?;
    let timestamp_ms = data.get("T")?.as_i64()?;
    let trade_id = data.get("i")?.as_str()?.to_string();
    let side = data.get("S")?.as_str()?;

    Some(WsMessage::Trade {
        symbol: symbol.to_string(),
        trade: ExchangeTrade {
            exchange_trade_id: Some(trade_id),
            timestamp_ms,
            price,
            quantity,
            taker_side: if side.eq_ignore_ascii_case("Buy") {
                TakerSide::Buy
            } else {
                TakerSide::Sell
            },
        },
    })
}

fn parse_ws_depth(symbol: &str, value: &serde_json::Value) -> Option<WsMessage> {
    let data = value.get("data")?;
    // Bybit's delta carries a single sequence number `u`; treat it as both
    // bounds of the covered range so the reconstructor's
    // `first_update_id > last_applied + 1` gap check still applies.
    let update_id = data.get("u")?.as_i64()?;
    let bids = super_levels(data.get("b")?)?;
    let asks = super_levels(data.get("a")?)?;

    Some(WsMessage::OrderBookDelta {
        symbol: symbol.to_string(),
        delta: ExchangeOrderBookDelta {
            first_update_id: update_id,
            last_update_id: update_id,
            bids,
            asks,
        },
    })
}

fn parse_ws_kline(rest: &str, value: &serde_json::Value) -> Option<WsMessage> {
    let (interval, symbol) = rest.split_once('.')?;
    let timeframe = match interval {
        "1" => Timeframe::M1,
        "5" => Timeframe::M5,
        "15" => Timeframe::M15,
        "60" => Timeframe::H1,
        "D" => Timeframe::D1,
        _ => return None,
    };
    let data = value.get("data")?.as_array()?.first()?;

    let candle = ExchangeCandle {
        open_time_ms: data.get("start")?.as_i64()?,
        open: data.get("open")?.as_str()?.parse().ok()?,
        high: data.get("high")?.as_str()?.parse().ok()?,
        low: data.get("low")?.as_str()?.parse().ok()?,
        close: data.get("close")?.as_str()?.parse().ok()?,
        base_volume: data.get("volume")?.as_str()?.parse().ok()?,
        quote_volume: data.get("turnover")?.as_str()?.parse().ok()?,
        trade_count: 0,
        is_closed: data.get("confirm")?.as_bool()?,
    };

    Some(WsMessage::Kline { symbol: symbol.to_string(), timeframe, candle })
}

fn super_levels(value: &serde_json::Value) -> Option<Vec<ExchangeLevel>> {
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
    s.parse().map_err(|_| perr(endpoint, s))
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

fn perr(endpoint: &str, detail: &str) -> CollectorError {
    CollectorError::ParseError {
        endpoint: endpoint.to_string(),
        message: format!("unparseable field {detail:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BybitAdapter {
        BybitAdapter::new(reqwest::Client::new())
    }

    #[test]
    fn topics_match_native_grammar() {
        let a = adapter();
        assert_eq!(
            a.topic(&Subscription { kind: StreamKind::Trade, symbol: "BTCUSDT".into(), timeframe: None }),
            "trade.BTCUSDT"
        );
        assert_eq!(
            a.topic(&Subscription {
                kind: StreamKind::Kline,
                symbol: "BTCUSDT".into(),
                timeframe: Some(Timeframe::M1)
            }),
            "kline.1.BTCUSDT"
        );
    }

    #[test]
    fn ping_frame_is_application_level() {
        let a = adapter();
        assert_eq!(a.ping_frame(), Some(r#"{"op":"ping"}"#.to_string()));
    }

    #[test]
    fn parses_trade_topic_message() {
        let a = adapter();
        let text = r#"{"topic":"trade.BTCUSDT","data":[{"p":"50000","v":"0.1","T":1700000000000,"i":"t1","S":"Buy"}]}"#;
        match a.parse_ws_message(text) {
            WsMessage::Trade { symbol, trade } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(trade.taker_side, TakerSide::Buy);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_orderbook_delta_topic() {
        let a = adapter();
        let text = r#"{"topic":"orderbook.50.BTCUSDT","data":{"u":42,"b":[["100","1"]],"a":[]}}"#;
        match a.parse_ws_message(text) {
            WsMessage::OrderBookDelta { symbol, delta } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(delta.first_update_id, 42);
                assert_eq!(delta.last_update_id, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pong_is_control_frame() {
        let a = adapter();
        assert_eq!(a.parse_ws_message(r#"{"op":"pong"}"#), WsMessage::Pong);
    }
}
