//! Backfill task lifecycle (spec §4.5 "Task lifecycle"):
//! `pending -> running -> completed|failed`, with failed tasks requeued
//! as `pending` until `max_retries` is exhausted. Row-level CRUD lives in
//! `crate::db::queries`; this module is the state-machine policy on top
//! of it — gap-to-task creation, the completion-threshold decision, and
//! the periodic sweep that resurrects cooled-down failures.

pub mod sweeper;

use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::BackfillConfig;
use crate::db::queries;
use crate::metrics;
use crate::model::{BackfillTask, DataType, TaskStatus, Timeframe};

pub use sweeper::sweep_failed_tasks;

/// Tunable priority-by-age window: a gap discovered `RECENCY_WINDOW_MS`
/// or longer in the past gets no age bonus; a gap at the live edge gets
/// the full bonus on top of `priority_floor`.
const RECENCY_WINDOW_MS: i64 = 30 * 24 * 60 * 60 * 1000;
const MAX_AGE_BONUS: i32 = 20;

/// Inserts one `pending` task per gap (spec §4.5 "Backfill task
/// creation"). Conflicting `(market, data_type, timeframe, start, end)`
/// rows are ignored by the unique constraint, so a re-scan of the same
/// gap is a no-op. Returns how many tasks were newly created.
pub fn create_tasks_for_gaps(
    conn: &Connection,
    market_id: i64,
    timeframe: Timeframe,
    gaps: &[(i64, i64)],
    config: &BackfillConfig,
    now_ms: i64,
) -> rusqlite::Result<usize> {
    let mut created = 0usize;
    for &(start_ms, end_ms) in gaps {
        let priority = priority_for_gap(config.priority_floor, end_ms, now_ms);
        let expected_count = (end_ms - start_ms) / timeframe.duration_ms();

        let before = count_tasks(conn, market_id, timeframe, start_ms, end_ms)?;
        queries::insert_backfill_task(
            conn,
            &BackfillTask {
                id: 0,
                market_id,
                data_type: DataType::Ohlcv,
                timeframe,
                start_ms,
                end_ms,
                status: TaskStatus::Pending,
                priority,
                retry_count: 0,
                expected_count,
                actual_count: 0,
                error_message: None,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        )?;
        let after = count_tasks(conn, market_id, timeframe, start_ms, end_ms)?;
        if after > before {
            created += 1;
        }
    }
    if created > 0 {
        metrics::TASKS_BY_STATE.with_label_values(&["pending"]).add(created as i64);
    }
    Ok(created)
}

fn count_tasks(
    conn: &Connection,
    market_id: i64,
    timeframe: Timeframe,
    start_ms: i64,
    end_ms: i64,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM backfill_tasks
         WHERE market_id = ?1 AND timeframe = ?2 AND start_ms = ?3 AND end_ms = ?4",
        rusqlite::params![market_id, timeframe.to_string(), start_ms, end_ms],
        |row| row.get(0),
    )
}

/// More recent gaps get a higher priority, decaying linearly to zero
/// bonus at `RECENCY_WINDOW_MS` old (spec §4.5: "priority = 10 (tunable
/// by age: more recent gaps get higher priority)").
fn priority_for_gap(priority_floor: i32, gap_end_ms: i64, now_ms: i64) -> i32 {
    let age_ms = (now_ms - gap_end_ms).max(0);
    if age_ms >= RECENCY_WINDOW_MS {
        return priority_floor;
    }
    let fraction = 1.0 - (age_ms as f64 / RECENCY_WINDOW_MS as f64);
    priority_floor + (fraction * MAX_AGE_BONUS as f64).round() as i32
}

/// The REST collector's outcome for a `running` task: how many rows it
/// actually wrote, or that the call itself failed outright.
pub enum TaskResult {
    Written(i64),
    Error(String),
}

/// Applies spec §4.5's completion rule: a successful write of at least
/// `completion_threshold * expected_count` rows completes the task;
/// anything else (fetch error or insufficient rows) fails it and, if the
/// retry budget remains, leaves it eligible for the sweeper to requeue.
pub fn finish_task(
    conn: &Connection,
    task: &BackfillTask,
    result: TaskResult,
    config: &BackfillConfig,
) -> rusqlite::Result<TaskStatus> {
    match result {
        TaskResult::Written(actual) => {
            let required = (task.expected_count as f64 * config.completion_threshold).ceil() as i64;
            if actual >= required {
                queries::complete_task(conn, task.id, actual)?;
                metrics::TASKS_BY_STATE.with_label_values(&["running"]).dec();
                metrics::TASKS_BY_STATE.with_label_values(&["completed"]).inc();
                info!(task_id = task.id, actual, required, "backfill task completed");
                Ok(TaskStatus::Completed)
            } else {
                fail_and_maybe_requeue(
                    conn,
                    task,
                    &format!("insufficient rows: {actual}/{required} expected"),
                    config,
                )
            }
        }
        TaskResult::Error(message) => fail_and_maybe_requeue(conn, task, &message, config),
    }
}

/// Marks the task `failed` (spec §4.5: `running -> failed`). Whether it's
/// still eligible for the sweeper's requeue (`retry_count < max_retries`)
/// is entirely the sweeper's own cooled-down-tasks query
/// (`queries::cooled_down_failed_tasks`) — both retryable and terminal
/// failures land in the same `failed` state the data model defines, so
/// there's nothing further to branch on here, only to log.
fn fail_and_maybe_requeue(
    conn: &Connection,
    task: &BackfillTask,
    message: &str,
    config: &BackfillConfig,
) -> rusqlite::Result<TaskStatus> {
    queries::fail_task(conn, task.id, message)?;
    metrics::TASKS_BY_STATE.with_label_values(&["running"]).dec();
    metrics::TASKS_BY_STATE.with_label_values(&["failed"]).inc();

    let retry_count = task.retry_count + 1;
    if retry_count < config.max_retries {
        warn!(task_id = task.id, retry_count, error = message, "backfill task failed, eligible for retry");
    } else {
        warn!(task_id = task.id, retry_count, error = message, "backfill task failed terminally");
    }
    Ok(TaskStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::apply_migrations;
    use rusqlite::Connection;

    fn conn_with_market() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO markets (exchange, symbol, base_asset, quote_asset, market_type)
             VALUES ('binance', 'BTCUSDT', 'BTC', 'USDT', 'spot')",
            [],
        )
        .unwrap();
        conn
    }

    fn config() -> BackfillConfig {
        BackfillConfig {
            priority_floor: 10,
            max_retries: 2,
            concurrency: 1,
            completion_threshold: 0.8,
            retry_cooldown_ms: 1_000,
        }
    }

    #[test]
    fn recent_gap_outranks_old_gap() {
        let recent = priority_for_gap(10, 0, 0);
        let old = priority_for_gap(10, 0, RECENCY_WINDOW_MS * 2);
        assert!(recent > old);
        assert_eq!(old, 10);
    }

    #[test]
    fn gap_creates_single_pending_task_and_is_idempotent_on_rescan() {
        let conn = conn_with_market();
        let delta = Timeframe::M1.duration_ms();
        let gaps = vec![(0, 5 * delta)];
        let created = create_tasks_for_gaps(&conn, 1, Timeframe::M1, &gaps, &config(), 100 * delta).unwrap();
        assert_eq!(created, 1);
        // rescanning the same gap does not duplicate the task
        let created_again = create_tasks_for_gaps(&conn, 1, Timeframe::M1, &gaps, &config(), 100 * delta).unwrap();
        assert_eq!(created_again, 0);

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM backfill_tasks", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn sufficient_rows_completes_task() {
        let conn = conn_with_market();
        let task = BackfillTask {
            id: 1,
            market_id: 1,
            data_type: DataType::Ohlcv,
            timeframe: Timeframe::M1,
            start_ms: 0,
            end_ms: 60_000,
            status: TaskStatus::Running,
            priority: 10,
            retry_count: 0,
            expected_count: 10,
            actual_count: 0,
            error_message: None,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        queries::insert_backfill_task(&conn, &task).unwrap();
        let status = finish_task(&conn, &task, TaskResult::Written(9), &config()).unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }

    #[test]
    fn insufficient_rows_fails_under_threshold() {
        let conn = conn_with_market();
        let task = BackfillTask {
            id: 1,
            market_id: 1,
            data_type: DataType::Ohlcv,
            timeframe: Timeframe::M1,
            start_ms: 0,
            end_ms: 60_000,
            status: TaskStatus::Running,
            priority: 10,
            retry_count: 0,
            expected_count: 10,
            actual_count: 0,
            error_message: None,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        queries::insert_backfill_task(&conn, &task).unwrap();
        let status = finish_task(&conn, &task, TaskResult::Written(5), &config()).unwrap();
        assert_eq!(status, TaskStatus::Failed);
    }
}
