//! The WebSocket session state machine of spec §4.2, as one long-lived
//! task per exchange. State transitions are a pure function
//! (`SessionState::transition`) so the reconnect/heartbeat logic is
//! testable without opening a real socket; `StreamSession::run` drives
//! that function against an actual `tokio_tungstenite` connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::config::WsConfig;
use crate::exchange::{ExchangeAdapter, ExchangeCandle, ExchangeTrade, Subscription, WsMessage};
use crate::model::Timeframe;
use crate::queue::DropOldestQueue;
use crate::shutdown::ShutdownHandle;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribing,
    Live,
    Reconnecting,
    Failed,
}

/// Events that drive the state machine. Kept separate from the socket
/// plumbing so transitions can be unit tested directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ConnectAttempted,
    Opened,
    AllSubscriptionsAcked,
    SocketClosed,
    ProtocolError,
    HeartbeatTimeout,
    BackoffElapsed,
    MaxAttemptsReached,
}

impl SessionState {
    /// Pure transition table, exactly spec §4.2's session state machine.
    pub fn transition(self, event: Event) -> SessionState {
        use Event::*;
        use SessionState::*;
        match (self, event) {
            (Disconnected, ConnectAttempted) => Connecting,
            (Connecting, Opened) => Subscribing,
            (Subscribing, AllSubscriptionsAcked) => Live,
            (Live, SocketClosed) | (Live, ProtocolError) | (Live, HeartbeatTimeout) => Reconnecting,
            (Connecting, SocketClosed) | (Connecting, ProtocolError) => Reconnecting,
            (Subscribing, SocketClosed) | (Subscribing, ProtocolError) => Reconnecting,
            (Reconnecting, BackoffElapsed) => Connecting,
            (Reconnecting, MaxAttemptsReached) => Failed,
            (other, _) => other,
        }
    }
}

/// The three per-stream queues a session dispatches parsed messages into.
/// All three use the same drop-oldest-on-overflow policy; the order-book
/// queue's "exemption" from arbitrary drops (spec §4.2) falls out of the
/// reconstructor's own sequence-gap check once a delta goes missing, so no
/// separate code path is needed here (see DESIGN.md).
pub struct StreamQueues {
    pub trades: DropOldestQueue<(String, ExchangeTrade)>,
    pub klines: DropOldestQueue<(String, Timeframe, ExchangeCandle)>,
    pub orderbook_deltas: DropOldestQueue<(String, crate::exchange::ExchangeOrderBookDelta)>,
}

impl StreamQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            trades: DropOldestQueue::new(capacity),
            klines: DropOldestQueue::new(capacity),
            orderbook_deltas: DropOldestQueue::new(capacity),
        }
    }
}

/// Dispatches one decoded message into the right queue. Only closed-flag
/// kline messages are forwarded (spec §4.2 "Streams"); acks/pongs/unknown
/// frames are consumed here and never reach a queue.
async fn dispatch(exchange: &str, queues: &StreamQueues, message: WsMessage) {
    match message {
        WsMessage::Trade { symbol, trade } => {
            metrics::WS_MESSAGES_RECEIVED.with_label_values(&[exchange, "trade"]).inc();
            if queues.trades.push((symbol, trade)).await {
                warn!(exchange, stream = "trade", "queue overflow, dropped oldest message");
                metrics::QUEUE_DROPPED.with_label_values(&[&format!("{exchange}:trade")]).inc();
            }
        }
        WsMessage::OrderBookDelta { symbol, delta } => {
            metrics::WS_MESSAGES_RECEIVED.with_label_values(&[exchange, "orderbook"]).inc();
            if queues.orderbook_deltas.push((symbol, delta)).await {
                warn!(
                    exchange,
                    stream = "orderbook",
                    "queue overflow, dropped oldest delta (reconstructor will resync on gap)"
                );
                metrics::QUEUE_DROPPED.with_label_values(&[&format!("{exchange}:orderbook")]).inc();
            }
        }
        WsMessage::Kline { symbol, timeframe, candle } => {
            metrics::WS_MESSAGES_RECEIVED.with_label_values(&[exchange, "kline"]).inc();
            if !candle.is_closed {
                return; // only closed-flag klines are persisted
            }
            if queues.klines.push((symbol, timeframe, candle)).await {
                warn!(exchange, stream = "kline", "queue overflow, dropped oldest candle");
                metrics::QUEUE_DROPPED.with_label_values(&[&format!("{exchange}:kline")]).inc();
            }
        }
        WsMessage::SubscriptionAck | WsMessage::Pong | WsMessage::Unknown => {}
    }
}

pub struct StreamSession {
    adapter: Arc<dyn ExchangeAdapter>,
    subscriptions: Vec<Subscription>,
    config: WsConfig,
    queues: Arc<StreamQueues>,
    shutdown: ShutdownHandle,
}

impl StreamSession {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        subscriptions: Vec<Subscription>,
        config: WsConfig,
        queues: Arc<StreamQueues>,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self { adapter, subscriptions, config, queues, shutdown }
    }

    /// Runs the session until shutdown or `Failed`. Reconnects with
    /// exponential backoff bounded by `config.max_attempts` (spec §4.2).
    pub async fn run(mut self) {
        let exchange = self.adapter.name();
        let mut state = SessionState::Disconnected;
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_triggered() {
                info!(exchange, "shutdown signaled, stopping stream session");
                return;
            }

            metrics::SESSION_STATE
                .with_label_values(&[exchange])
                .set(session_state_code(state));

            match state {
                SessionState::Disconnected => {
                    state = state.transition(Event::ConnectAttempted);
                }
                SessionState::Connecting => {
                    state = self.connect_and_live(&mut attempt).await;
                }
                SessionState::Reconnecting => {
                    attempt += 1;
                    if attempt > self.config.max_attempts {
                        state = state.transition(Event::MaxAttemptsReached);
                        continue;
                    }
                    let delay = backoff_for(self.config.reconnect_base_ms, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            metrics::RECONNECTS.with_label_values(&[exchange]).inc();
                            state = state.transition(Event::BackoffElapsed);
                        }
                        _ = self.shutdown.triggered() => return,
                    }
                }
                SessionState::Failed => {
                    tracing::error!(exchange, "stream session exhausted reconnect attempts");
                    return;
                }
                SessionState::Subscribing | SessionState::Live => {
                    // handled inline by connect_and_live
                    unreachable!("connect_and_live only returns Reconnecting/Failed/Disconnected exits");
                }
            }
        }
    }

    /// Opens the socket, subscribes, and serves messages until the
    /// connection drops or the heartbeat times out. Returns the next
    /// state (`Reconnecting` on any failure).
    async fn connect_and_live(&mut self, attempt: &mut u32) -> SessionState {
        let exchange = self.adapter.name();
        let url = self.adapter.ws_url();

        let stream = match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                warn!(exchange, error = %err, "websocket connect failed");
                return SessionState::Reconnecting;
            }
        };
        *attempt = 0;

        let (mut sink, mut source) = stream.split();
        let frames = self.adapter.subscribe_frames(&self.subscriptions);
        for frame in &frames {
            if sink.send(Message::Text(frame.clone().into())).await.is_err() {
                return SessionState::Reconnecting;
            }
        }

        info!(exchange, frames = frames.len(), "subscribed, awaiting acks");
        let mut acked = 0usize;
        let heartbeat = Duration::from_millis(self.config.heartbeat_ms);
        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.triggered() => return SessionState::Disconnected,
                _ = tokio::time::sleep_until(last_message + heartbeat) => {
                    warn!(exchange, "no message within heartbeat interval, reconnecting");
                    return SessionState::Reconnecting;
                }
                frame = source.next() => {
                    let Some(frame) = frame else {
                        warn!(exchange, "socket closed by peer");
                        return SessionState::Reconnecting;
                    };
                    let frame = match frame {
                        Ok(f) => f,
                        Err(err) => {
                            warn!(exchange, error = %err, "protocol error on socket");
                            return SessionState::Reconnecting;
                        }
                    };
                    last_message = Instant::now();

                    match frame {
                        Message::Text(text) => {
                            let parsed = self.adapter.parse_ws_message(&text);
                            if matches!(parsed, WsMessage::SubscriptionAck) {
                                acked += 1;
                                if acked >= frames.len() {
                                    info!(exchange, "all subscriptions acked, session live");
                                }
                                continue;
                            }
                            dispatch(exchange, &self.queues, parsed).await;
                        }
                        Message::Ping(payload) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Message::Pong(_) => {}
                        Message::Close(_) => {
                            warn!(exchange, "received close frame");
                            return SessionState::Reconnecting;
                        }
                        Message::Binary(_) | Message::Frame(_) => {}
                    }

                    if let Some(ping_frame) = self.adapter.ping_frame() {
                        // Application-level protocols (spec §4.2
                        // "Heartbeats") send their own ping independent of
                        // the transport-level one above.
                        let _ = sink.send(Message::Text(ping_frame.into())).await;
                    }
                }
            }
        }
    }
}

fn backoff_for(base_ms: u64, attempt: u32) -> Duration {
    let capped_attempt = attempt.min(10);
    let millis = base_ms.saturating_mul(2u64.saturating_pow(capped_attempt.saturating_sub(1)));
    Duration::from_millis(millis.min(60_000))
}

fn session_state_code(state: SessionState) -> i64 {
    match state {
        SessionState::Disconnected => 0,
        SessionState::Connecting => 1,
        SessionState::Subscribing => 2,
        SessionState::Live => 3,
        SessionState::Reconnecting => 4,
        SessionState::Failed => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeOrderBookDelta, StreamKind};
    use crate::model::TakerSide;

    #[test]
    fn state_machine_follows_happy_path() {
        let mut state = SessionState::Disconnected;
        state = state.transition(Event::ConnectAttempted);
        assert_eq!(state, SessionState::Connecting);
        state = state.transition(Event::Opened);
        assert_eq!(state, SessionState::Subscribing);
        state = state.transition(Event::AllSubscriptionsAcked);
        assert_eq!(state, SessionState::Live);
    }

    #[test]
    fn live_drop_triggers_reconnect_then_backoff_returns_to_connecting() {
        let mut state = SessionState::Live;
        state = state.transition(Event::HeartbeatTimeout);
        assert_eq!(state, SessionState::Reconnecting);
        state = state.transition(Event::BackoffElapsed);
        assert_eq!(state, SessionState::Connecting);
    }

    #[test]
    fn exhausted_reconnects_reach_failed() {
        let mut state = SessionState::Reconnecting;
        state = state.transition(Event::MaxAttemptsReached);
        assert_eq!(state, SessionState::Failed);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let d1 = backoff_for(1_000, 1);
        let d2 = backoff_for(1_000, 2);
        assert!(d2 > d1);
        let capped = backoff_for(1_000, 20);
        assert_eq!(capped, Duration::from_millis(60_000));
    }

    #[tokio::test]
    async fn open_kline_is_not_dispatched_closed_is() {
        let queues = StreamQueues::new(8);
        let open = WsMessage::Kline {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            candle: ExchangeCandle {
                open_time_ms: 0,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                base_volume: 0.0,
                quote_volume: 0.0,
                trade_count: 0,
                is_closed: false,
            },
        };
        dispatch("binance", &queues, open).await;
        assert_eq!(queues.klines.len().await, 0);

        let closed = WsMessage::Kline {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            candle: ExchangeCandle {
                open_time_ms: 0,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                base_volume: 0.0,
                quote_volume: 0.0,
                trade_count: 0,
                is_closed: true,
            },
        };
        dispatch("binance", &queues, closed).await;
        assert_eq!(queues.klines.len().await, 1);
    }

    #[tokio::test]
    async fn trade_message_is_queued() {
        let queues = StreamQueues::new(8);
        dispatch(
            "binance",
            &queues,
            WsMessage::Trade {
                symbol: "BTCUSDT".into(),
                trade: ExchangeTrade {
                    exchange_trade_id: Some("1".into()),
                    timestamp_ms: 0,
                    price: 1.0,
                    quantity: 1.0,
                    taker_side: TakerSide::Buy,
                },
            },
        )
        .await;
        assert_eq!(queues.trades.len().await, 1);
    }

    #[tokio::test]
    async fn orderbook_delta_is_queued() {
        let queues = StreamQueues::new(8);
        dispatch(
            "binance",
            &queues,
            WsMessage::OrderBookDelta {
                symbol: "BTCUSDT".into(),
                delta: ExchangeOrderBookDelta {
                    first_update_id: 1,
                    last_update_id: 2,
                    bids: vec![],
                    asks: vec![],
                },
            },
        )
        .await;
        assert_eq!(queues.orderbook_deltas.len().await, 1);
    }

    #[test]
    fn subscriptions_have_stable_kind() {
        let sub = Subscription { kind: StreamKind::Trade, symbol: "BTCUSDT".into(), timeframe: None };
        assert_eq!(sub.kind, StreamKind::Trade);
    }
}
