//! Process entrypoint: reads `AppConfig`, opens the SQLite store, and
//! spawns one pipeline per enabled exchange (scheduler, REST collector,
//! stream session, per-topic batch writers, order-book reconstruction,
//! quality scanner, backfill sweeper) plus the two cross-exchange loops
//! (backfill task claiming, retention/aggregation). Everything here is
//! thin assembly over the components in `ingest_core`; the policy lives
//! in those modules, not in this file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rusqlite::Connection;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ingest_core::backfill;
use ingest_core::collector;
use ingest_core::config::{AppConfig, BackfillConfig, ExchangeConfig, QualityConfig};
use ingest_core::db::queries;
use ingest_core::db::schema::apply_migrations;
use ingest_core::exchange::{self, ExchangeAdapter, MarketMeta, StreamKind, Subscription};
use ingest_core::market_cache::MarketCache;
use ingest_core::metrics;
use ingest_core::model::{Candle, Timeframe, Trade};
use ingest_core::orderbook::reconstructor::Reconstructor;
use ingest_core::quality;
use ingest_core::rate_limiter::RateLimiter;
use ingest_core::retention::{aggregation, pruning};
use ingest_core::scheduler::Scheduler;
use ingest_core::shutdown::{Coordinator, ShutdownHandle};
use ingest_core::stream::{StreamQueues, StreamSession};
use ingest_core::util::now_ms;
use ingest_core::writer::{BatchWriter, WriteItem};

/// Order book levels kept per side of a reconstructed snapshot.
const ORDERBOOK_DEPTH: u32 = 50;
const BACKFILL_CLAIM_INTERVAL: Duration = Duration::from_secs(5);
const RETENTION_INTERVAL: Duration = Duration::from_secs(300);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-exchange crypto market-data ingestion pipeline", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Tracing filter directive, e.g. "ingest_core=debug,warn". Overrides
    /// RUST_LOG when set.
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref());
    metrics::init();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    let mut conn = Connection::open(&config.db_path)
        .with_context(|| format!("opening database at {}", config.db_path))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    apply_migrations(&mut conn).context("applying database migrations")?;

    let recovered = queries::reset_running_tasks_to_pending(&conn)?;
    if recovered > 0 {
        info!(recovered, "rolled back in-flight backfill tasks to pending on startup");
    }

    let market_cache = Arc::new(MarketCache::new());
    for market in queries::list_markets(&conn)? {
        market_cache.load_row(&market);
    }

    let db = Arc::new(Mutex::new(conn));
    let coordinator = Coordinator::new(SHUTDOWN_GRACE_PERIOD);
    let poll_interval = Duration::from_millis(config.poll_interval_ms.unwrap_or(60_000));

    let enabled: Vec<(String, ExchangeConfig)> = config
        .enabled_exchanges()
        .into_iter()
        .map(|(name, cfg)| (name.to_string(), cfg.clone()))
        .collect();
    if enabled.is_empty() {
        warn!("no exchanges enabled in config, nothing to do");
    }

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let mut backfill_senders: HashMap<String, mpsc::Sender<(i64, i32)>> = HashMap::new();

    for (name, cfg) in enabled {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("building HTTP client")?;
        let Some(adapter) = exchange::adapter_for(&name, http) else {
            warn!(exchange = %name, "no adapter available for configured exchange, skipping");
            continue;
        };

        let (backfill_tx, backfill_rx) = mpsc::channel(32);
        backfill_senders.insert(name.clone(), backfill_tx);

        handles.extend(spawn_exchange_pipeline(
            adapter,
            name,
            cfg,
            poll_interval,
            market_cache.clone(),
            db.clone(),
            backfill_rx,
            &coordinator,
        ));
    }

    handles.push(tokio::spawn(run_backfill_claimer(
        db.clone(),
        backfill_senders,
        coordinator.handle(),
    )));
    handles.push(tokio::spawn(run_retention_loop(db.clone(), coordinator.handle())));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("received shutdown signal, draining in-flight work");
    coordinator.shutdown().await;

    for handle in handles {
        let _ = handle.await;
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wires up everything one exchange needs: scheduler, REST collector,
/// WS session plus its queue-drain feeds, per-topic writers, the
/// order-book reconstructor, the quality scanner, and the backfill
/// sweeper. Returns every spawned task's handle so `main` can join them
/// after shutdown.
fn spawn_exchange_pipeline(
    adapter: Arc<dyn ExchangeAdapter>,
    exchange_name: String,
    cfg: ExchangeConfig,
    poll_interval: Duration,
    market_cache: Arc<MarketCache>,
    db: Arc<Mutex<Connection>>,
    backfill_rx: mpsc::Receiver<(i64, i32)>,
    coordinator: &Coordinator,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let rate_limiter = Arc::new(RateLimiter::new(&cfg.rate_limit));
    let timeframes = collector::parse_timeframes(&cfg);

    let (candles_tx, candles_rx) = mpsc::channel::<WriteItem>(cfg.writer.queue_capacity);
    let (trades_tx, trades_rx) = mpsc::channel::<WriteItem>(cfg.writer.queue_capacity);
    let (orderbook_tx, orderbook_rx) = mpsc::channel::<WriteItem>(cfg.writer.queue_capacity);

    for (topic, rx) in [("candles", candles_rx), ("trades", trades_rx), ("orderbook", orderbook_rx)] {
        let writer = BatchWriter::new(
            topic,
            rx,
            cfg.writer.batch_size,
            Duration::from_millis(cfg.writer.flush_interval_ms),
            cfg.writer.max_batch_retries,
            market_cache.clone(),
        );
        let token = coordinator.drain_token();
        let db_clone = db.clone();
        let shutdown = coordinator.handle();
        handles.push(tokio::spawn(async move {
            writer.run(db_clone, shutdown).await;
            drop(token);
        }));
    }

    let (jobs_tx, jobs_rx) = mpsc::channel(64);
    handles.push(tokio::spawn(collector::run(
        adapter.clone(),
        exchange_name.clone(),
        cfg.symbols.clone(),
        timeframes.clone(),
        cfg.retry.clone(),
        cfg.backfill.clone(),
        rate_limiter.clone(),
        jobs_rx,
        candles_tx.clone(),
        db.clone(),
        coordinator.handle(),
    )));

    let scheduler = Scheduler::new(poll_interval, cfg.backfill.priority_floor);
    let scheduler_shutdown = coordinator.handle();
    handles.push(tokio::spawn(async move {
        scheduler.run(jobs_tx, backfill_rx, scheduler_shutdown).await;
    }));

    let queues = Arc::new(StreamQueues::new(cfg.writer.queue_capacity));
    let subscriptions = build_subscriptions(&cfg.symbols, &cfg.streams, &timeframes);
    let session = StreamSession::new(adapter.clone(), subscriptions, cfg.ws.clone(), queues.clone(), coordinator.handle());
    handles.push(tokio::spawn(session.run()));

    handles.push(tokio::spawn(run_trade_feed(
        adapter.clone(),
        exchange_name.clone(),
        queues.clone(),
        trades_tx,
        coordinator.handle(),
    )));
    handles.push(tokio::spawn(run_kline_feed(
        adapter.clone(),
        exchange_name.clone(),
        queues.clone(),
        candles_tx,
        coordinator.handle(),
    )));
    handles.push(tokio::spawn(run_orderbook_feed(
        adapter.clone(),
        exchange_name.clone(),
        rate_limiter,
        queues,
        orderbook_tx,
        coordinator.handle(),
    )));

    handles.push(tokio::spawn(run_quality_scan_loop(
        exchange_name.clone(),
        timeframes,
        cfg.quality,
        db.clone(),
        coordinator.handle(),
    )));
    handles.push(tokio::spawn(run_backfill_sweeper_loop(exchange_name, cfg.backfill, db, coordinator.handle())));

    handles
}

/// Expands `symbols x streams` into subscriptions, fanning `kline` out
/// over every configured timeframe.
fn build_subscriptions(symbols: &[String], streams: &[String], timeframes: &[Timeframe]) -> Vec<Subscription> {
    let mut subs = Vec::new();
    for symbol in symbols {
        for stream in streams {
            match stream.as_str() {
                "trade" => subs.push(Subscription { kind: StreamKind::Trade, symbol: symbol.clone(), timeframe: None }),
                "orderbook" => subs.push(Subscription { kind: StreamKind::OrderBook, symbol: symbol.clone(), timeframe: None }),
                "kline" => {
                    for &tf in timeframes {
                        subs.push(Subscription { kind: StreamKind::Kline, symbol: symbol.clone(), timeframe: Some(tf) });
                    }
                }
                other => warn!(stream = other, "unknown stream kind in config, ignoring"),
            }
        }
    }
    subs
}

async fn resolve_market_meta(
    adapter: &Arc<dyn ExchangeAdapter>,
    symbol: &str,
    cache: &mut HashMap<String, MarketMeta>,
) -> Option<MarketMeta> {
    if let Some(meta) = cache.get(symbol) {
        return Some(meta.clone());
    }
    match adapter.market_meta(symbol).await {
        Ok(meta) => {
            cache.insert(symbol.to_string(), meta.clone());
            Some(meta)
        }
        Err(err) => {
            warn!(%symbol, error = %err, "failed to resolve market metadata");
            None
        }
    }
}

/// Drains `queues.trades` into the trades writer channel, resolving each
/// symbol's market metadata on first sight.
async fn run_trade_feed(
    adapter: Arc<dyn ExchangeAdapter>,
    exchange_name: String,
    queues: Arc<StreamQueues>,
    trades_tx: mpsc::Sender<WriteItem>,
    mut shutdown: ShutdownHandle,
) {
    let mut meta_cache: HashMap<String, MarketMeta> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => return,
            (symbol, trade) = queues.trades.pop() => {
                let Some(meta) = resolve_market_meta(&adapter, &symbol, &mut meta_cache).await else { continue };
                let item = WriteItem::Trade {
                    exchange: exchange_name.clone(),
                    symbol: symbol.clone(),
                    base_asset: meta.base_asset,
                    quote_asset: meta.quote_asset,
                    market_type: meta.market_type,
                    trade: Trade {
                        market_id: 0,
                        exchange_trade_id: trade.exchange_trade_id,
                        timestamp_ms: trade.timestamp_ms,
                        price: trade.price,
                        quantity: trade.quantity,
                        taker_side: trade.taker_side,
                    },
                };
                if trades_tx.send(item).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Drains `queues.klines` (closed candles only, per `dispatch`) into the
/// same candles writer channel the REST collector feeds — kline stream
/// rows and REST rows share one `ohlcv` primary key, so this is an
/// upsert onto whatever the collector already wrote (see DESIGN.md).
async fn run_kline_feed(
    adapter: Arc<dyn ExchangeAdapter>,
    exchange_name: String,
    queues: Arc<StreamQueues>,
    candles_tx: mpsc::Sender<WriteItem>,
    mut shutdown: ShutdownHandle,
) {
    let mut meta_cache: HashMap<String, MarketMeta> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => return,
            (symbol, timeframe, candle) = queues.klines.pop() => {
                let Some(meta) = resolve_market_meta(&adapter, &symbol, &mut meta_cache).await else { continue };
                let item = WriteItem::Candle {
                    exchange: exchange_name.clone(),
                    symbol: symbol.clone(),
                    base_asset: meta.base_asset,
                    quote_asset: meta.quote_asset,
                    market_type: meta.market_type,
                    candle: Candle {
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
                    },
                };
                if candles_tx.send(item).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Drains `queues.orderbook_deltas`, keeping one `Reconstructor` per
/// symbol. A sequence gap (or the very first delta) triggers a fresh
/// REST snapshot through the same rate limiter the collector uses; every
/// successfully-applied delta re-publishes the top-of-book for the
/// writer to persist.
async fn run_orderbook_feed(
    adapter: Arc<dyn ExchangeAdapter>,
    exchange_name: String,
    rate_limiter: Arc<RateLimiter>,
    queues: Arc<StreamQueues>,
    orderbook_tx: mpsc::Sender<WriteItem>,
    mut shutdown: ShutdownHandle,
) {
    let mut meta_cache: HashMap<String, MarketMeta> = HashMap::new();
    let mut reconstructors: HashMap<String, Reconstructor> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => return,
            (symbol, delta) = queues.orderbook_deltas.pop() => {
                let reconstructor = reconstructors.entry(symbol.clone()).or_insert_with(|| Reconstructor::new(0));
                reconstructor.on_delta(delta);

                if reconstructor.needs_snapshot() {
                    let _permit = rate_limiter.acquire().await;
                    match adapter.fetch_order_book(&symbol, ORDERBOOK_DEPTH).await {
                        Ok(snapshot) => reconstructor.on_snapshot(snapshot),
                        Err(err) => {
                            warn!(exchange = %exchange_name, %symbol, error = %err, "order book snapshot fetch failed");
                            continue;
                        }
                    }
                }

                let Some(book) = reconstructor.book() else { continue };
                let Some(meta) = resolve_market_meta(&adapter, &symbol, &mut meta_cache).await else { continue };
                let item = WriteItem::OrderBookSnapshot {
                    exchange: exchange_name.clone(),
                    symbol: symbol.clone(),
                    base_asset: meta.base_asset,
                    quote_asset: meta.quote_asset,
                    market_type: meta.market_type,
                    snapshot: book.top_n(ORDERBOOK_DEPTH as usize, now_ms()),
                };
                if orderbook_tx.send(item).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Periodically scans every market this exchange owns across its
/// configured timeframes, persisting a quality summary and enqueuing
/// backfill tasks for any gap found.
async fn run_quality_scan_loop(
    exchange_name: String,
    timeframes: Vec<Timeframe>,
    quality_config: QualityConfig,
    db: Arc<Mutex<Connection>>,
    mut shutdown: ShutdownHandle,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(quality_config.scan_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => return,
            _ = ticker.tick() => {
                let conn = db.lock().await;
                let markets = match queries::list_markets(&conn) {
                    Ok(markets) => markets,
                    Err(err) => {
                        error!(exchange = %exchange_name, error = %err, "failed to list markets for quality scan");
                        continue;
                    }
                };
                for market in markets.iter().filter(|m| m.exchange == exchange_name) {
                    for &timeframe in &timeframes {
                        if let Err(err) = quality::run_scan(&conn, market.id, timeframe, &quality_config, now_ms()) {
                            error!(market_id = market.id, %timeframe, error = %err, "quality scan failed");
                        }
                    }
                }
            }
        }
    }
}

/// Requeues cooled-down failed tasks back to `pending` on a cadence tied
/// to this exchange's own `retry_cooldown_ms`.
async fn run_backfill_sweeper_loop(
    exchange_name: String,
    config: BackfillConfig,
    db: Arc<Mutex<Connection>>,
    mut shutdown: ShutdownHandle,
) {
    let period = Duration::from_millis(config.retry_cooldown_ms.max(1_000) as u64);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => return,
            _ = ticker.tick() => {
                let conn = db.lock().await;
                if let Err(err) = backfill::sweep_failed_tasks(&conn, &config, now_ms()) {
                    error!(exchange = %exchange_name, error = %err, "backfill sweep failed");
                }
            }
        }
    }
}

/// The one cross-exchange claimer: pops the next highest-priority
/// `pending` backfill task, resolves which exchange owns its market, and
/// forwards it to that exchange's scheduler. A task for an exchange with
/// no running pipeline is left `running`; a fresh process restart will
/// roll it back to `pending` via `reset_running_tasks_to_pending`.
async fn run_backfill_claimer(
    db: Arc<Mutex<Connection>>,
    senders: HashMap<String, mpsc::Sender<(i64, i32)>>,
    mut shutdown: ShutdownHandle,
) {
    let mut ticker = tokio::time::interval(BACKFILL_CLAIM_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => return,
            _ = ticker.tick() => {
                let claimed = {
                    let conn = db.lock().await;
                    let task = match queries::claim_next_pending_task(&conn, now_ms()) {
                        Ok(Some(task)) => task,
                        Ok(None) => continue,
                        Err(err) => {
                            error!(error = %err, "failed to claim backfill task");
                            continue;
                        }
                    };
                    // `claim_next_pending_task` just flipped this row pending -> running;
                    // mirror that edge in the gauge here so it stays in sync with the
                    // decrements in `backfill::finish_task`.
                    metrics::TASKS_BY_STATE.with_label_values(&["pending"]).dec();
                    metrics::TASKS_BY_STATE.with_label_values(&["running"]).inc();
                    match queries::get_market(&conn, task.market_id) {
                        Ok(Some(market)) => Some((task, market)),
                        Ok(None) => {
                            warn!(task_id = task.id, "claimed backfill task references an unknown market");
                            None
                        }
                        Err(err) => {
                            error!(task_id = task.id, error = %err, "failed to load market for claimed task");
                            None
                        }
                    }
                };

                let Some((task, market)) = claimed else { continue };
                match senders.get(&market.exchange) {
                    Some(sender) if sender.send((task.id, task.priority)).await.is_ok() => {}
                    _ => warn!(task_id = task.id, exchange = %market.exchange, "no running pipeline to dispatch claimed task to"),
                }
            }
        }
    }
}

/// Rolls up closed finer-tier candles into every coarser timeframe, then
/// prunes aged-out rows per tier. Runs once for the whole store rather
/// than per exchange since tiering and retention are exchange-agnostic.
async fn run_retention_loop(db: Arc<Mutex<Connection>>, mut shutdown: ShutdownHandle) {
    let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => return,
            _ = ticker.tick() => {
                let now = now_ms();
                let conn = db.lock().await;
                let markets = match queries::list_markets(&conn) {
                    Ok(markets) => markets,
                    Err(err) => {
                        error!(error = %err, "failed to list markets for retention");
                        continue;
                    }
                };

                let lookback = Timeframe::D1.duration_ms() * 2;
                for market in &markets {
                    if let Err(err) = aggregation::materialize_all_tiers(&conn, market.id, now - lookback, now, now) {
                        error!(market_id = market.id, error = %err, "tier materialization failed");
                    }
                }

                for &timeframe in &Timeframe::ALL {
                    if let Err(err) = pruning::prune_candles(&conn, timeframe, now) {
                        error!(%timeframe, error = %err, "candle pruning failed");
                    }
                }
                if let Err(err) = pruning::prune_trades(&conn, now) {
                    error!(error = %err, "trade pruning failed");
                }
                if let Err(err) = pruning::prune_snapshots(&conn, now) {
                    error!(error = %err, "order book snapshot pruning failed");
                }
            }
        }
    }
}
