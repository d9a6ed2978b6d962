//! Periodic retry sweep (spec §4.5 "Retry of failed tasks"): requeues
//! `failed` tasks under the retry budget whose cooldown has elapsed.
//! Split out from the rest of the task lifecycle so it can run as its
//! own scheduled task in `main.rs`, independent of the REST collector's
//! scheduler cadence.

use rusqlite::Connection;
use tracing::info;

use crate::config::BackfillConfig;
use crate::db::queries;
use crate::metrics;

/// Requeues every cooled-down failure back to `pending`. Returns how
/// many were requeued.
pub fn sweep_failed_tasks(
    conn: &Connection,
    config: &BackfillConfig,
    now_ms: i64,
) -> rusqlite::Result<usize> {
    let ids = queries::cooled_down_failed_tasks(conn, config.max_retries, config.retry_cooldown_ms, now_ms)?;
    for &id in &ids {
        queries::requeue_task(conn, id)?;
    }
    if !ids.is_empty() {
        metrics::TASKS_BY_STATE.with_label_values(&["failed"]).sub(ids.len() as i64);
        metrics::TASKS_BY_STATE.with_label_values(&["pending"]).add(ids.len() as i64);
        info!(count = ids.len(), "requeued cooled-down failed backfill tasks");
    }
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::{finish_task, TaskResult};
    use crate::db::schema::apply_migrations;
    use crate::model::{BackfillTask, DataType, TaskStatus, Timeframe};

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
    fn sweep_requeues_after_cooldown_not_before() {
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
        finish_task(&conn, &task, TaskResult::Error("boom".into()), &config()).unwrap();

        let swept_early = sweep_failed_tasks(&conn, &config(), 500).unwrap();
        assert_eq!(swept_early, 0);

        let swept = sweep_failed_tasks(&conn, &config(), 10_000).unwrap();
        assert_eq!(swept, 1);
    }
}
