//! Batch Writer (spec §4.4): one task per topic, draining a bounded
//! channel on a size or time trigger, each flush a single transaction.
//! Generalizes the teacher's single `INSERT OR IGNORE ... candlesticks`
//! statement into the full conflict policy per record kind.

use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::db::queries;
use crate::market_cache::MarketCache;
use crate::metrics;
use crate::model::{Candle, MarketType, OrderBookSnapshot, Trade};
use crate::shutdown::ShutdownHandle;

/// One unresolved record plus the `(exchange, symbol)` it needs resolved
/// to a `market_id` before it can be persisted.
pub enum WriteItem {
    Candle { exchange: String, symbol: String, base_asset: String, quote_asset: String, market_type: MarketType, candle: Candle },
    Trade { exchange: String, symbol: String, base_asset: String, quote_asset: String, market_type: MarketType, trade: Trade },
    OrderBookSnapshot { exchange: String, symbol: String, base_asset: String, quote_asset: String, market_type: MarketType, snapshot: OrderBookSnapshot },
}

impl WriteItem {
    fn topic(&self) -> &'static str {
        match self {
            WriteItem::Candle { .. } => "candles",
            WriteItem::Trade { .. } => "trades",
            WriteItem::OrderBookSnapshot { .. } => "orderbook",
        }
    }
}

/// A batch that failed to flush, kept around after `max_retries` for
/// operator inspection (spec §4.4: "move to an in-memory dead-letter
/// collection after the limit").
pub struct DeadLetter {
    pub topic: &'static str,
    pub size: usize,
    pub error: String,
}

pub struct BatchWriter {
    topic: &'static str,
    rx: mpsc::Receiver<WriteItem>,
    batch_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    market_cache: std::sync::Arc<MarketCache>,
    dead_letters: Vec<DeadLetter>,
}

impl BatchWriter {
    pub fn new(
        topic: &'static str,
        rx: mpsc::Receiver<WriteItem>,
        batch_size: usize,
        flush_interval: Duration,
        max_retries: u32,
        market_cache: std::sync::Arc<MarketCache>,
    ) -> Self {
        Self { topic, rx, batch_size, flush_interval, max_retries, market_cache, dead_letters: Vec::new() }
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    /// Runs until the channel closes (all senders dropped) or shutdown is
    /// signaled, flushing whatever is pending one final time before
    /// returning.
    pub async fn run(mut self, conn_mutex: std::sync::Arc<tokio::sync::Mutex<Connection>>, mut shutdown: ShutdownHandle) {
        let mut pending: Vec<WriteItem> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            metrics::QUEUE_DEPTH.with_label_values(&[self.topic]).set(pending.len() as i64);

            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    info!(topic = self.topic, "shutdown signaled, flushing and draining channel");
                    while let Ok(item) = self.rx.try_recv() {
                        pending.push(item);
                    }
                    if !pending.is_empty() {
                        self.flush(&conn_mutex, &mut pending).await;
                    }
                    return;
                }
                item = self.rx.recv() => {
                    match item {
                        Some(item) => {
                            pending.push(item);
                            if pending.len() >= self.batch_size {
                                self.flush(&conn_mutex, &mut pending).await;
                            }
                        }
                        None => {
                            if !pending.is_empty() {
                                self.flush(&conn_mutex, &mut pending).await;
                            }
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.flush(&conn_mutex, &mut pending).await;
                    }
                }
            }
        }
    }

    /// Flushes the current batch in one transaction. On failure, rolls
    /// back and retries the whole batch in place up to `max_retries`
    /// times before moving it to the dead letter collection (spec §4.4:
    /// "re-enqueue the batch at the head ... after limit, move to a
    /// dead-letter with the original error").
    async fn flush(&mut self, conn_mutex: &tokio::sync::Mutex<Connection>, pending: &mut Vec<WriteItem>) {
        let batch = std::mem::take(pending);
        let mut conn = conn_mutex.lock().await;

        let mut attempt = 0u32;
        let mut last_error = String::new();
        loop {
            match write_batch(&mut conn, &batch, &self.market_cache) {
                Ok(rows) => {
                    metrics::FLUSHES.with_label_values(&[self.topic]).inc();
                    metrics::ROWS_WRITTEN.with_label_values(&[self.topic]).inc_by(rows as u64);
                    return;
                }
                Err(err) => {
                    last_error = err.to_string();
                    attempt += 1;
                    warn!(topic = self.topic, attempt, error = %last_error, "flush failed, batch rolled back");
                    if attempt > self.max_retries {
                        break;
                    }
                }
            }
        }

        error!(topic = self.topic, size = batch.len(), error = %last_error, "batch moved to dead letter after exhausting retries");
        metrics::DEAD_LETTER.with_label_values(&[self.topic]).inc();
        self.dead_letters.push(DeadLetter { topic: self.topic, size: batch.len(), error: last_error });
    }
}

/// Resolves markets and persists every item in one transaction. Returns
/// the number of rows written.
fn write_batch(conn: &mut Connection, items: &[WriteItem], cache: &MarketCache) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    let mut written = 0usize;

    for item in items {
        match item {
            WriteItem::Candle { exchange, symbol, base_asset, quote_asset, market_type, candle } => {
                let market_id = cache.resolve(&tx, exchange, symbol, base_asset, quote_asset, *market_type)?;
                let mut candle = candle.clone();
                candle.market_id = market_id;
                queries::upsert_candle(&tx, &candle)?;
                written += 1;
            }
            WriteItem::Trade { exchange, symbol, base_asset, quote_asset, market_type, trade } => {
                let market_id = cache.resolve(&tx, exchange, symbol, base_asset, quote_asset, *market_type)?;
                let mut trade = trade.clone();
                trade.market_id = market_id;
                queries::insert_trade_ignore(&tx, &trade)?;
                written += 1;
            }
            WriteItem::OrderBookSnapshot { exchange, symbol, base_asset, quote_asset, market_type, snapshot } => {
                let market_id = cache.resolve(&tx, exchange, symbol, base_asset, quote_asset, *market_type)?;
                let mut snapshot = snapshot.clone();
                snapshot.market_id = market_id;
                queries::insert_orderbook_snapshot(&tx, &snapshot)?;
                written += 1;
            }
        }
    }

    tx.commit()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::apply_migrations;
    use crate::model::Timeframe;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn candle_item(open_time: i64) -> WriteItem {
        WriteItem::Candle {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            market_type: MarketType::Spot,
            candle: Candle {
                market_id: 0,
                timeframe: Timeframe::M1,
                open_time,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                base_volume: 1.0,
                quote_volume: 100.0,
                trade_count: 1,
            },
        }
    }

    #[tokio::test]
    async fn flush_writes_and_resolves_market() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));

        let batch = vec![candle_item(60_000), candle_item(120_000)];
        let cache = MarketCache::new();
        let mut locked = conn.lock().await;
        let written = write_batch(&mut locked, &batch, &cache).unwrap();
        drop(locked);
        assert_eq!(written, 2);

        let locked = conn.lock().await;
        let count: i64 = locked.query_row("SELECT COUNT(*) FROM ohlcv", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
        let markets: i64 = locked.query_row("SELECT COUNT(*) FROM markets", [], |r| r.get(0)).unwrap();
        assert_eq!(markets, 1);
    }

    #[tokio::test]
    async fn replaying_the_same_batch_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        let batch = vec![candle_item(60_000)];
        let cache = MarketCache::new();
        write_batch(&mut conn, &batch, &cache).unwrap();
        write_batch(&mut conn, &batch, &cache).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ohlcv", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
