//! REST Collector orchestration (spec §4.1): the periodic poll and the
//! backfill executor share this loop, both driven by `Job`s handed down
//! from one `Scheduler` per exchange. Kept out of `main.rs` so the
//! binary stays a thin assembly of these per-component loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::backfill::{self, TaskResult};
use crate::config::{BackfillConfig, ExchangeConfig, RetryConfig};
use crate::db::queries;
use crate::error::CollectorError;
use crate::exchange::{ExchangeAdapter, MarketMeta};
use crate::model::{ApiErrorLog, Candle, MarketType, Timeframe};
use crate::rate_limiter::RateLimiter;
use crate::retry::{self, RetryDecision};
use crate::scheduler::Job;
use crate::shutdown::ShutdownHandle;
use crate::util::now_ms;
use crate::writer::WriteItem;

/// Runs until `jobs_rx` closes (the scheduler stopped) or shutdown drains
/// it. Resolves `MarketMeta` once per symbol and keeps it in a local
/// cache for the life of the process — exchange metadata does not change
/// underneath a running collector.
pub async fn run(
    adapter: Arc<dyn ExchangeAdapter>,
    exchange_name: String,
    symbols: Vec<String>,
    timeframes: Vec<Timeframe>,
    retry_config: RetryConfig,
    backfill_config: BackfillConfig,
    rate_limiter: Arc<RateLimiter>,
    mut jobs_rx: mpsc::Receiver<Job>,
    candles_tx: mpsc::Sender<WriteItem>,
    db: Arc<Mutex<Connection>>,
    mut shutdown: ShutdownHandle,
) {
    let mut meta_cache: HashMap<String, MarketMeta> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => {
                return;
            }
            job = jobs_rx.recv() => {
                match job {
                    Some(Job::Poll) => {
                        poll_all(
                            &adapter,
                            &exchange_name,
                            &symbols,
                            &timeframes,
                            &retry_config,
                            &rate_limiter,
                            &candles_tx,
                            &db,
                            &mut meta_cache,
                        )
                        .await;
                    }
                    Some(Job::Backfill { task_id, .. }) => {
                        run_backfill(
                            &adapter,
                            &exchange_name,
                            task_id,
                            &retry_config,
                            &backfill_config,
                            &rate_limiter,
                            &candles_tx,
                            &db,
                            &mut meta_cache,
                        )
                        .await;
                    }
                    None => return,
                }
            }
        }
    }
}

async fn poll_all(
    adapter: &Arc<dyn ExchangeAdapter>,
    exchange_name: &str,
    symbols: &[String],
    timeframes: &[Timeframe],
    retry_config: &RetryConfig,
    rate_limiter: &RateLimiter,
    candles_tx: &mpsc::Sender<WriteItem>,
    db: &Arc<Mutex<Connection>>,
    meta_cache: &mut HashMap<String, MarketMeta>,
) {
    let now = now_ms();
    for symbol in symbols {
        let meta = match resolve_meta(adapter, symbol, meta_cache).await {
            Some(meta) => meta,
            None => continue,
        };

        for &timeframe in timeframes {
            let _permit = rate_limiter.acquire().await;
            let result = fetch_with_retry(
                adapter,
                exchange_name,
                symbol,
                timeframe,
                None,
                500,
                retry_config,
                db,
            )
            .await;

            let candles = match result {
                Ok(candles) => candles,
                Err(err) => {
                    warn!(exchange = exchange_name, %symbol, %timeframe, error = %err, "poll failed");
                    continue;
                }
            };

            for candle in candles {
                let domain = Candle {
                    market_id: 0,
                    timeframe,
                    open_time: candle.open_time_ms,
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    base_volume: candle.base_volume,
                    quote_volume: candle.quote_volume,
                    trade_count: candle.trade_count,
                };
                if !domain.is_closed_at(now) {
                    continue;
                }
                let item = WriteItem::Candle {
                    exchange: exchange_name.to_string(),
                    symbol: symbol.clone(),
                    base_asset: meta.base_asset.clone(),
                    quote_asset: meta.quote_asset.clone(),
                    market_type: meta.market_type,
                    candle: domain,
                };
                if candles_tx.send(item).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Executes a claimed backfill task: fetches the gap's full range from
/// the adapter (spec §4.5 "Task execution"), writes every candle, then
/// reports the written count to `backfill::finish_task` for the
/// completion-threshold decision.
async fn run_backfill(
    adapter: &Arc<dyn ExchangeAdapter>,
    exchange_name: &str,
    task_id: i64,
    retry_config: &RetryConfig,
    backfill_config: &BackfillConfig,
    rate_limiter: &RateLimiter,
    candles_tx: &mpsc::Sender<WriteItem>,
    db: &Arc<Mutex<Connection>>,
    meta_cache: &mut HashMap<String, MarketMeta>,
) {
    let task = {
        let conn = db.lock().await;
        match queries::get_task(&conn, task_id) {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(err) => {
                error!(task_id, error = %err, "failed to load backfill task");
                return;
            }
        }
    };

    let market = {
        let conn = db.lock().await;
        match queries::get_market(&conn, task.market_id) {
            Ok(Some(market)) => market,
            Ok(None) => {
                warn!(task_id, market_id = task.market_id, "backfill task references unknown market");
                return;
            }
            Err(err) => {
                error!(task_id, error = %err, "failed to load market for backfill task");
                return;
            }
        }
    };

    let meta = match resolve_meta(adapter, &market.symbol, meta_cache).await {
        Some(meta) => meta,
        None => {
            MarketMeta {
                base_asset: market.base_asset.clone(),
                quote_asset: market.quote_asset.clone(),
                market_type: market.market_type,
            }
        }
    };

    let limit = ((task.end_ms - task.start_ms) / task.timeframe.duration_ms()).max(1) as u32;

    let _permit = rate_limiter.acquire().await;
    let result = fetch_with_retry(
        adapter,
        exchange_name,
        &market.symbol,
        task.timeframe,
        Some(task.start_ms),
        limit,
        retry_config,
        db,
    )
    .await;

    let task_result = match result {
        Ok(candles) => {
            let written = candles.len() as i64;
            for candle in candles {
                if candle.open_time_ms < task.start_ms || candle.open_time_ms >= task.end_ms {
                    continue;
                }
                let domain = Candle {
                    market_id: market.id,
                    timeframe: task.timeframe,
                    open_time: candle.open_time_ms,
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    base_volume: candle.base_volume,
                    quote_volume: candle.quote_volume,
                    trade_count: candle.trade_count,
                };
                let item = WriteItem::Candle {
                    exchange: exchange_name.to_string(),
                    symbol: market.symbol.clone(),
                    base_asset: meta.base_asset.clone(),
                    quote_asset: meta.quote_asset.clone(),
                    market_type: meta.market_type,
                    candle: domain,
                };
                if candles_tx.send(item).await.is_err() {
                    return;
                }
            }
            TaskResult::Written(written)
        }
        Err(err) => TaskResult::Error(err.to_string()),
    };

    let conn = db.lock().await;
    if let Err(err) = backfill::finish_task(&conn, &task, task_result, backfill_config) {
        error!(task_id, error = %err, "failed to persist backfill task outcome");
    }
}

async fn resolve_meta(
    adapter: &Arc<dyn ExchangeAdapter>,
    symbol: &str,
    meta_cache: &mut HashMap<String, MarketMeta>,
) -> Option<MarketMeta> {
    if let Some(meta) = meta_cache.get(symbol) {
        return Some(meta.clone());
    }
    match adapter.market_meta(symbol).await {
        Ok(meta) => {
            meta_cache.insert(symbol.to_string(), meta.clone());
            Some(meta)
        }
        Err(err) => {
            warn!(%symbol, error = %err, "failed to resolve market metadata");
            None
        }
    }
}

/// Retries a single `fetch_candles` call per the configured retry
/// policy, logging every terminal or budget-exhausted failure to
/// `api_error_logs` (spec §7 "API error logging").
#[allow(clippy::too_many_arguments)]
async fn fetch_with_retry(
    adapter: &Arc<dyn ExchangeAdapter>,
    exchange_name: &str,
    symbol: &str,
    timeframe: Timeframe,
    since_ms: Option<i64>,
    limit: u32,
    retry_config: &RetryConfig,
    db: &Arc<Mutex<Connection>>,
) -> Result<Vec<crate::exchange::ExchangeCandle>, CollectorError> {
    let mut attempt = 0u32;
    loop {
        match adapter.fetch_candles(symbol, timeframe, since_ms, limit).await {
            Ok(candles) => return Ok(candles),
            Err(err) => {
                if retry::counts_against_budget(&err) {
                    attempt += 1;
                }
                match retry::classify(retry_config, &err, attempt) {
                    RetryDecision::Retry { delay } => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    RetryDecision::Abort => {
                        log_api_error(db, exchange_name, symbol, &err).await;
                        return Err(err);
                    }
                }
            }
        }
    }
}

async fn log_api_error(
    db: &Arc<Mutex<Connection>>,
    exchange_name: &str,
    endpoint: &str,
    err: &CollectorError,
) {
    let log = ApiErrorLog {
        exchange: exchange_name.to_string(),
        endpoint: endpoint.to_string(),
        error_class: err.class(),
        code: status_code(err),
        message: err.to_string(),
        parameters: serde_json::Value::Null,
        timestamp_ms: now_ms(),
    };
    let conn = db.lock().await;
    if let Err(e) = queries::insert_api_error_log(&conn, &log) {
        error!(error = %e, "failed to persist api error log");
    }
}

fn status_code(err: &CollectorError) -> Option<i32> {
    match err {
        CollectorError::ExchangeError { status, .. } => Some(*status as i32),
        CollectorError::ServerError { status, .. } => Some(*status as i32),
        _ => None,
    }
}

/// Filters a market's configured stream list into the enum forms the
/// collector and stream session both consume.
pub fn parse_timeframes(config: &ExchangeConfig) -> Vec<Timeframe> {
    config
        .timeframes
        .iter()
        .filter_map(|s| s.parse::<Timeframe>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::db::schema::apply_migrations;
    use crate::exchange::{ExchangeCandle, ExchangeLevel, ExchangeOrderBookSnapshot, ExchangeTrade, Subscription, WsMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAdapter {
        calls: AtomicUsize,
        fail_times: usize,
    }

    #[async_trait]
    impl ExchangeAdapter for StubAdapter {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn fetch_candles(
            &self,
            _symbol: &str,
            timeframe: Timeframe,
            since_ms: Option<i64>,
            _limit: u32,
        ) -> Result<Vec<ExchangeCandle>, CollectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                return Err(CollectorError::ServerError {
                    endpoint: "klines".into(),
                    status: 503,
                });
            }
            let _ = timeframe;
            let open_time = since_ms.unwrap_or(0);
            Ok(vec![ExchangeCandle {
                open_time_ms: open_time,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                base_volume: 10.0,
                quote_volume: 1000.0,
                trade_count: 5,
                is_closed: true,
            }])
        }

        async fn fetch_trades(
            &self,
            _symbol: &str,
            _since_ms: Option<i64>,
            _limit: u32,
        ) -> Result<Vec<ExchangeTrade>, CollectorError> {
            Ok(Vec::new())
        }

        async fn fetch_order_book(
            &self,
            _symbol: &str,
            _depth: u32,
        ) -> Result<ExchangeOrderBookSnapshot, CollectorError> {
            Ok(ExchangeOrderBookSnapshot {
                update_id: 0,
                bids: vec![ExchangeLevel { price: 1.0, quantity: 1.0 }],
                asks: vec![ExchangeLevel { price: 2.0, quantity: 1.0 }],
            })
        }

        async fn market_meta(&self, _symbol: &str) -> Result<MarketMeta, CollectorError> {
            Ok(MarketMeta {
                base_asset: "BTC".into(),
                quote_asset: "USDT".into(),
                market_type: MarketType::Spot,
            })
        }

        fn ws_url(&self) -> &'static str {
            "wss://stub"
        }

        fn topic(&self, _sub: &Subscription) -> String {
            String::new()
        }

        fn subscribe_frames(&self, _subs: &[Subscription]) -> Vec<String> {
            Vec::new()
        }

        fn ping_frame(&self) -> Option<String> {
            None
        }

        fn parse_ws_message(&self, _text: &str) -> WsMessage {
            WsMessage::Unknown
        }
    }

    fn retry_cfg() -> RetryConfig {
        RetryConfig {
            attempts: 3,
            base_ms: 1,
            max_ms: 10,
            multiplier: 2.0,
        }
    }

    fn rate_limiter() -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            min_interval_ms: 0,
            max_concurrent: 4,
        })
    }

    #[tokio::test]
    async fn fetch_with_retry_recovers_after_transient_failures() {
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter {
            calls: AtomicUsize::new(0),
            fail_times: 2,
        });
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        let db = Arc::new(Mutex::new(conn));

        let result = fetch_with_retry(
            &adapter,
            "stub",
            "BTCUSDT",
            Timeframe::M1,
            None,
            10,
            &retry_cfg(),
            &db,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(result.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backfill_task_completes_and_writes_candles() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO markets (exchange, symbol, base_asset, quote_asset, market_type)
             VALUES ('stub', 'BTCUSDT', 'BTC', 'USDT', 'spot')",
            [],
        )
        .unwrap();
        let task = crate::model::BackfillTask {
            id: 0,
            market_id: 1,
            data_type: crate::model::DataType::Ohlcv,
            timeframe: Timeframe::M1,
            start_ms: 0,
            end_ms: 60_000,
            status: crate::model::TaskStatus::Running,
            priority: 10,
            retry_count: 0,
            expected_count: 1,
            actual_count: 0,
            error_message: None,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        queries::insert_backfill_task(&conn, &task).unwrap();
        let db = Arc::new(Mutex::new(conn));

        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter {
            calls: AtomicUsize::new(0),
            fail_times: 0,
        });
        let (candles_tx, mut candles_rx) = mpsc::channel(8);
        let rl = rate_limiter();
        let mut meta_cache = HashMap::new();

        run_backfill(
            &adapter,
            "stub",
            1,
            &retry_cfg(),
            &BackfillConfig {
                priority_floor: 10,
                max_retries: 2,
                concurrency: 1,
                completion_threshold: 0.8,
                retry_cooldown_ms: 1_000,
            },
            &rl,
            &candles_tx,
            &db,
            &mut meta_cache,
        )
        .await;
        drop(candles_tx);

        let mut received = 0;
        while candles_rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 1);

        let conn = db.lock().await;
        let status: String = conn
            .query_row("SELECT status FROM backfill_tasks WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "completed");
    }
}
