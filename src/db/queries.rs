//! Row <-> struct mapping and the conflict policy from spec §4.4: candles
//! upsert, trades insert-ignore, order-book snapshots insert-tolerant.
//! Every function here takes `&Connection` or `&Transaction` (anything
//! implementing `rusqlite`'s `Deref<Target = Connection>` via the
//! underlying trait) so the batch writer can run a whole flush inside one
//! transaction.

use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{
    ApiErrorLog, BackfillTask, Candle, DataType, ErrorClass, Market, MarketType, OrderBookSnapshot,
    PriceLevel, QualitySummary, TakerSide, TaskStatus, Timeframe, Trade,
};

/// Looks up a market row by id, for callers (the backfill executor) that
/// only hold a `market_id` and need the `(exchange, symbol)` pair back.
pub fn get_market(conn: &Connection, market_id: i64) -> rusqlite::Result<Option<Market>> {
    conn.query_row(
        "SELECT id, exchange, symbol, base_asset, quote_asset, market_type FROM markets WHERE id = ?1",
        params![market_id],
        |row| {
            let market_type: String = row.get(5)?;
            Ok(Market {
                id: row.get(0)?,
                exchange: row.get(1)?,
                symbol: row.get(2)?,
                base_asset: row.get(3)?,
                quote_asset: row.get(4)?,
                market_type: parse_market_type(&market_type),
            })
        },
    )
    .optional()
}

/// Every market row, used to preload the in-process cache at startup.
pub fn list_markets(conn: &Connection) -> rusqlite::Result<Vec<Market>> {
    let mut stmt = conn.prepare(
        "SELECT id, exchange, symbol, base_asset, quote_asset, market_type FROM markets",
    )?;
    let rows = stmt.query_map([], |row| {
        let market_type: String = row.get(5)?;
        Ok(Market {
            id: row.get(0)?,
            exchange: row.get(1)?,
            symbol: row.get(2)?,
            base_asset: row.get(3)?,
            quote_asset: row.get(4)?,
            market_type: parse_market_type(&market_type),
        })
    })?;
    rows.collect()
}

fn parse_market_type(s: &str) -> MarketType {
    match s {
        "perp" => MarketType::Perp,
        "future" => MarketType::Future,
        _ => MarketType::Spot,
    }
}

/// Looks up a single backfill task by id, for the executor that just
/// received `Job::Backfill { task_id, .. }` from the scheduler.
pub fn get_task(conn: &Connection, task_id: i64) -> rusqlite::Result<Option<BackfillTask>> {
    conn.query_row(
        "SELECT id, market_id, data_type, timeframe, start_ms, end_ms, status, priority,
                retry_count, expected_count, actual_count, error_message,
                created_at_ms, updated_at_ms
         FROM backfill_tasks WHERE id = ?1",
        params![task_id],
        row_to_task,
    )
    .optional()
}

pub fn upsert_candle(conn: &Connection, candle: &Candle) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ohlcv
            (market_id, timeframe, open_time, open, high, low, close,
             base_volume, quote_volume, trade_count, inserted_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(market_id, timeframe, open_time) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            base_volume = excluded.base_volume,
            quote_volume = excluded.quote_volume,
            trade_count = excluded.trade_count",
        params![
            candle.market_id,
            candle.timeframe.to_string(),
            candle.open_time,
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.base_volume,
            candle.quote_volume,
            candle.trade_count,
            crate::util::now_ms(),
        ],
    )?;
    Ok(())
}

pub fn insert_trade_ignore(conn: &Connection, trade: &Trade) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO trades
            (market_id, exchange_trade_id, timestamp_ms, price, quantity, taker_side)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            trade.market_id,
            trade.exchange_trade_id,
            trade.timestamp_ms,
            trade.price,
            trade.quantity,
            taker_side_str(trade.taker_side),
        ],
    )?;
    Ok(())
}

pub fn insert_orderbook_snapshot(
    conn: &Connection,
    snapshot: &OrderBookSnapshot,
) -> rusqlite::Result<()> {
    let bids_json = serde_json::to_string(&snapshot.bids).expect("price levels always serialize");
    let asks_json = serde_json::to_string(&snapshot.asks).expect("price levels always serialize");
    conn.execute(
        "INSERT OR IGNORE INTO orderbook_snapshots
            (market_id, timestamp_ms, update_id, bids_json, asks_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            snapshot.market_id,
            snapshot.timestamp_ms,
            snapshot.update_id,
            bids_json,
            asks_json,
        ],
    )?;
    Ok(())
}

pub fn candles_in_window(
    conn: &Connection,
    market_id: i64,
    timeframe: Timeframe,
    start_ms: i64,
    end_ms: i64,
) -> rusqlite::Result<Vec<Candle>> {
    let mut stmt = conn.prepare(
        "SELECT market_id, timeframe, open_time, open, high, low, close,
                base_volume, quote_volume, trade_count
         FROM ohlcv
         WHERE market_id = ?1 AND timeframe = ?2 AND open_time >= ?3 AND open_time < ?4
         ORDER BY open_time ASC",
    )?;
    let rows = stmt.query_map(
        params![market_id, timeframe.to_string(), start_ms, end_ms],
        |row| {
            let tf_str: String = row.get(1)?;
            Ok(Candle {
                market_id: row.get(0)?,
                timeframe: tf_str.parse().unwrap_or(Timeframe::M1),
                open_time: row.get(2)?,
                open: row.get(3)?,
                high: row.get(4)?,
                low: row.get(5)?,
                close: row.get(6)?,
                base_volume: row.get(7)?,
                quote_volume: row.get(8)?,
                trade_count: row.get(9)?,
            })
        },
    )?;
    rows.collect()
}

/// Open times in the order rows were inserted, for the quality scanner's
/// out-of-order check (spec §4.5: "non-monotonic open_time when ordered
/// by insertion").
pub fn candle_open_times_by_insertion(
    conn: &Connection,
    market_id: i64,
    timeframe: Timeframe,
    start_ms: i64,
    end_ms: i64,
) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT open_time FROM ohlcv
         WHERE market_id = ?1 AND timeframe = ?2 AND open_time >= ?3 AND open_time < ?4
         ORDER BY inserted_at_ms ASC, rowid ASC",
    )?;
    let rows = stmt.query_map(
        params![market_id, timeframe.to_string(), start_ms, end_ms],
        |row| row.get(0),
    )?;
    rows.collect()
}

pub fn insert_backfill_task(conn: &Connection, task: &BackfillTask) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO backfill_tasks
            (market_id, data_type, timeframe, start_ms, end_ms, status, priority,
             retry_count, expected_count, actual_count, error_message,
             created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            task.market_id,
            data_type_str(task.data_type),
            task.timeframe.to_string(),
            task.start_ms,
            task.end_ms,
            task_status_str(task.status),
            task.priority,
            task.retry_count,
            task.expected_count,
            task.actual_count,
            task.error_message,
            task.created_at_ms,
            task.updated_at_ms,
        ],
    )?;
    Ok(())
}

pub fn claim_next_pending_task(
    conn: &Connection,
    now_ms: i64,
) -> rusqlite::Result<Option<BackfillTask>> {
    let task: Option<BackfillTask> = conn
        .query_row(
            "SELECT id, market_id, data_type, timeframe, start_ms, end_ms, status, priority,
                    retry_count, expected_count, actual_count, error_message,
                    created_at_ms, updated_at_ms
             FROM backfill_tasks
             WHERE status = 'pending'
             ORDER BY priority DESC, created_at_ms ASC
             LIMIT 1",
            [],
            row_to_task,
        )
        .optional()?;

    if let Some(ref t) = task {
        conn.execute(
            "UPDATE backfill_tasks SET status = 'running', updated_at_ms = ?1 WHERE id = ?2",
            params![now_ms, t.id],
        )?;
    }
    Ok(task)
}

pub fn complete_task(conn: &Connection, task_id: i64, actual_count: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE backfill_tasks
         SET status = 'completed', actual_count = ?1, updated_at_ms = ?2
         WHERE id = ?3",
        params![actual_count, crate::util::now_ms(), task_id],
    )?;
    Ok(())
}

/// Marks a task `failed`, bumping `retry_count`; the caller (the backfill
/// sweeper) decides whether to requeue based on `max_retries`.
pub fn fail_task(conn: &Connection, task_id: i64, error_message: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE backfill_tasks
         SET status = 'failed', retry_count = retry_count + 1,
             error_message = ?1, updated_at_ms = ?2
         WHERE id = ?3",
        params![error_message, crate::util::now_ms(), task_id],
    )?;
    Ok(())
}

pub fn requeue_task(conn: &Connection, task_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE backfill_tasks SET status = 'pending', updated_at_ms = ?1 WHERE id = ?2",
        params![crate::util::now_ms(), task_id],
    )?;
    Ok(())
}

/// Rolls every `running` task back to `pending` on shutdown, per spec §5
/// ("persist task states: running -> pending with rollback of partial
/// progress").
pub fn reset_running_tasks_to_pending(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE backfill_tasks SET status = 'pending', updated_at_ms = ?1 WHERE status = 'running'",
        params![crate::util::now_ms()],
    )
}

pub fn cooled_down_failed_tasks(
    conn: &Connection,
    max_retries: i32,
    cooldown_ms: i64,
    now_ms: i64,
) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM backfill_tasks
         WHERE status = 'failed' AND retry_count < ?1 AND updated_at_ms <= ?2",
    )?;
    let rows = stmt.query_map(params![max_retries, now_ms - cooldown_ms], |row| row.get(0))?;
    rows.collect()
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<BackfillTask> {
    let data_type: String = row.get(2)?;
    let timeframe: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(BackfillTask {
        id: row.get(0)?,
        market_id: row.get(1)?,
        data_type: parse_data_type(&data_type),
        timeframe: timeframe.parse().unwrap_or(Timeframe::M1),
        start_ms: row.get(4)?,
        end_ms: row.get(5)?,
        status: parse_task_status(&status),
        priority: row.get(7)?,
        retry_count: row.get(8)?,
        expected_count: row.get(9)?,
        actual_count: row.get(10)?,
        error_message: row.get(11)?,
        created_at_ms: row.get(12)?,
        updated_at_ms: row.get(13)?,
    })
}

pub fn upsert_quality_summary(
    conn: &Connection,
    summary: &QualitySummary,
) -> rusqlite::Result<()> {
    let issues_json = serde_json::to_string(&summary.issues).expect("strings always serialize");
    conn.execute(
        "INSERT INTO data_quality_summary
            (market_id, data_type, timeframe, window_start_ms, window_end_ms,
             expected_count, actual_count, missing_count, duplicate_count,
             out_of_order_count, price_jump_count, volume_spike_count, score,
             validated, issues_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(market_id, data_type, timeframe, window_start_ms) DO UPDATE SET
            window_end_ms = excluded.window_end_ms,
            expected_count = excluded.expected_count,
            actual_count = excluded.actual_count,
            missing_count = excluded.missing_count,
            duplicate_count = excluded.duplicate_count,
            out_of_order_count = excluded.out_of_order_count,
            price_jump_count = excluded.price_jump_count,
            volume_spike_count = excluded.volume_spike_count,
            score = excluded.score,
            validated = excluded.validated,
            issues_json = excluded.issues_json",
        params![
            summary.market_id,
            data_type_str(summary.data_type),
            summary.timeframe.to_string(),
            summary.window_start_ms,
            summary.window_end_ms,
            summary.expected_count,
            summary.actual_count,
            summary.missing_count,
            summary.duplicate_count,
            summary.out_of_order_count,
            summary.price_jump_count,
            summary.volume_spike_count,
            summary.score,
            summary.validated,
            issues_json,
        ],
    )?;
    Ok(())
}

/// Every recorded critical event, consulted by retention to suppress
/// pruning within flagged intervals (spec §3 "Critical Event").
pub fn list_critical_events(conn: &Connection) -> rusqlite::Result<Vec<crate::model::CriticalEvent>> {
    let mut stmt = conn.prepare(
        "SELECT name, kind, start_ms, end_ms, affected_markets_json, preserve_raw FROM critical_events",
    )?;
    let rows = stmt.query_map([], |row| {
        let affected_json: String = row.get(4)?;
        let preserve_raw: i64 = row.get(5)?;
        Ok(crate::model::CriticalEvent {
            name: row.get(0)?,
            kind: row.get(1)?,
            start_ms: row.get(2)?,
            end_ms: row.get(3)?,
            affected_markets: serde_json::from_str(&affected_json).unwrap_or_default(),
            preserve_raw: preserve_raw != 0,
        })
    })?;
    rows.collect()
}

pub fn insert_api_error_log(conn: &Connection, log: &ApiErrorLog) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO api_error_logs
            (exchange, endpoint, error_class, code, message, parameters_json, timestamp_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            log.exchange,
            log.endpoint,
            error_class_str(log.error_class),
            log.code,
            log.message,
            log.parameters.to_string(),
            log.timestamp_ms,
        ],
    )?;
    Ok(())
}

pub fn taker_side_str(side: TakerSide) -> &'static str {
    match side {
        TakerSide::Buy => "buy",
        TakerSide::Sell => "sell",
    }
}

pub fn data_type_str(t: DataType) -> &'static str {
    match t {
        DataType::Ohlcv => "ohlcv",
        DataType::Trades => "trades",
        DataType::OrderBook => "orderbook",
    }
}

fn parse_data_type(s: &str) -> DataType {
    match s {
        "trades" => DataType::Trades,
        "orderbook" => DataType::OrderBook,
        _ => DataType::Ohlcv,
    }
}

pub fn task_status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Pending,
    }
}

fn error_class_str(c: ErrorClass) -> &'static str {
    match c {
        ErrorClass::NetworkError => "network_error",
        ErrorClass::RateLimited => "rate_limited",
        ErrorClass::Timeout => "timeout",
        ErrorClass::ExchangeError => "exchange_error",
        ErrorClass::ParseError => "parse_error",
        ErrorClass::ServerError => "server_error",
    }
}

#[allow(dead_code)]
pub(crate) fn price_levels_from_json(s: &str) -> Vec<PriceLevel> {
    serde_json::from_str(s).unwrap_or_default()
}
