//! SQLite implementation of RunStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::time::Duration;

use super::store::{RunStore, StoreError};
use crate::cursor::Cursor;
use crate::run::{Progress, Run, RunId, RunStatus, StopRequests, Transition};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS maintflow_runs (
    id INTEGER PRIMARY KEY,
    task_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'enqueued',
    cursor TEXT,
    tick_count INTEGER NOT NULL DEFAULT 0,
    tick_total INTEGER,
    time_running_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    error_kind TEXT,
    error_message TEXT,
    backtrace TEXT,
    pause_requested INTEGER NOT NULL DEFAULT 0,
    cancel_requested INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_maintflow_runs_status ON maintflow_runs(status, id);
CREATE INDEX IF NOT EXISTS idx_maintflow_runs_task ON maintflow_runs(task_name, created_at)
"#;

const SELECT_RUN: &str = r#"
SELECT id, task_name, status, cursor, tick_count, tick_total, time_running_ms,
       created_at, started_at, ended_at, error_kind, error_message, backtrace,
       pause_requested, cancel_requested
FROM maintflow_runs
"#;

/// SQLite-backed run store.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

fn storage_err(e: sqlx::Error) -> StoreError {
    StoreError::StorageError(e.to_string())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRecord(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_time).transpose()
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status").map_err(storage_err)?;
    let status = status.parse::<RunStatus>().map_err(StoreError::CorruptRecord)?;
    let created_at: String = row.try_get("created_at").map_err(storage_err)?;
    let tick_count: i64 = row.try_get("tick_count").map_err(storage_err)?;
    let tick_total: Option<i64> = row.try_get("tick_total").map_err(storage_err)?;
    let time_running_ms: i64 = row.try_get("time_running_ms").map_err(storage_err)?;
    let cursor: Option<String> = row.try_get("cursor").map_err(storage_err)?;

    Ok(Run {
        id: RunId(row.try_get("id").map_err(storage_err)?),
        task_name: row.try_get("task_name").map_err(storage_err)?,
        status,
        cursor: cursor.map(Cursor::from_raw),
        tick_count: tick_count.max(0) as u64,
        tick_total: tick_total.map(|t| t.max(0) as u64),
        time_running: Duration::from_millis(time_running_ms.max(0) as u64),
        created_at: parse_time(&created_at)?,
        started_at: parse_opt_time(row.try_get("started_at").map_err(storage_err)?)?,
        ended_at: parse_opt_time(row.try_get("ended_at").map_err(storage_err)?)?,
        error_kind: row.try_get("error_kind").map_err(storage_err)?,
        error_message: row.try_get("error_message").map_err(storage_err)?,
        backtrace: row.try_get("backtrace").map_err(storage_err)?,
        pause_requested: row.try_get("pause_requested").map_err(storage_err)?,
        cancel_requested: row.try_get("cancel_requested").map_err(storage_err)?,
    })
}

async fn load(conn: &mut SqliteConnection, id: RunId) -> Result<Run, StoreError> {
    let query = format!("{SELECT_RUN} WHERE id = ?");
    let row = sqlx::query(&query)
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .map_err(storage_err)?
        .ok_or(StoreError::NotFound(id))?;
    run_from_row(&row)
}

/// Request flags a status change consumes. Flags are otherwise only set by
/// the request statements, so a write never clobbers a concurrent request.
fn cleared_requests(run: &Run, expected: RunStatus) -> (bool, bool) {
    let clear_pause = match run.status {
        RunStatus::Paused | RunStatus::Cancelled => true,
        RunStatus::Running => expected == RunStatus::Paused,
        _ => false,
    };
    (clear_pause, run.status == RunStatus::Cancelled)
}

/// Write the status, progress and failure columns of `run`, provided the
/// stored status is still `expected`. Status and cursor change in the same
/// statement.
async fn write(conn: &mut SqliteConnection, run: &Run, expected: RunStatus) -> Result<(), StoreError> {
    let (clear_pause, clear_cancel) = cleared_requests(run, expected);
    let result = sqlx::query(
        r#"
        UPDATE maintflow_runs
        SET status = ?, cursor = ?, tick_count = MAX(tick_count, ?), tick_total = ?,
            time_running_ms = ?, started_at = ?, ended_at = ?, error_kind = ?,
            error_message = ?, backtrace = ?,
            pause_requested = CASE WHEN ? THEN 0 ELSE pause_requested END,
            cancel_requested = CASE WHEN ? THEN 0 ELSE cancel_requested END
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(run.status.as_str())
    .bind(run.cursor.as_ref().map(Cursor::as_str))
    .bind(run.tick_count as i64)
    .bind(run.tick_total.map(|t| t as i64))
    .bind(run.time_running.as_millis() as i64)
    .bind(run.started_at.map(|t| t.to_rfc3339()))
    .bind(run.ended_at.map(|t| t.to_rfc3339()))
    .bind(run.error_kind.as_deref())
    .bind(run.error_message.as_deref())
    .bind(run.backtrace.as_deref())
    .bind(clear_pause)
    .bind(clear_cancel)
    .bind(run.id.0)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;

    if result.rows_affected() == 0 {
        // Someone else moved the run between our read and write.
        let actual = load(conn, run.id).await?.status;
        return Err(StoreError::Conflict {
            id: run.id,
            expected,
            actual,
        });
    }
    Ok(())
}

impl SqliteRunStore {
    /// Create a new SqliteRunStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the runs table.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(storage_err)?;
            }
        }
        Ok(())
    }

    /// Load, modify and conditionally write back a run.
    async fn update<F>(&self, id: RunId, f: F) -> Result<Run, StoreError>
    where
        F: FnOnce(&mut Run) -> Result<(), StoreError> + Send,
    {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        let mut run = load(&mut conn, id).await?;
        let expected = run.status;
        f(&mut run)?;
        write(&mut conn, &run, expected).await?;
        load(&mut conn, id).await
    }

    /// Set a request flag if the run's status accepts it.
    async fn flag_request(
        &self,
        id: RunId,
        request: &'static str,
        column: &'static str,
        accepted: &[RunStatus],
    ) -> Result<Run, StoreError> {
        let placeholders = vec!["?"; accepted.len()].join(", ");
        let statement = format!(
            "UPDATE maintflow_runs SET {column} = 1 WHERE id = ? AND status IN ({placeholders})"
        );

        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        let mut query = sqlx::query(&statement).bind(id.0);
        for status in accepted {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&mut *conn).await.map_err(storage_err)?;

        let run = load(&mut conn, id).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RequestRejected {
                id,
                status: run.status,
                request,
            });
        }
        Ok(run)
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create(&self, task_name: &str) -> Result<Run, StoreError> {
        let created_at = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO maintflow_runs (task_name, status, created_at)
            VALUES (?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(task_name)
        .bind(RunStatus::Enqueued.as_str())
        .bind(created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        self.get(RunId(id)).await
    }

    async fn get(&self, id: RunId) -> Result<Run, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        load(&mut conn, id).await
    }

    async fn claim(&self, id: RunId) -> Result<Run, StoreError> {
        self.update(id, |run| {
            if !run.status.is_claimable() {
                return Err(StoreError::InvalidTransition {
                    id: run.id,
                    from: run.status,
                    to: RunStatus::Running,
                });
            }
            let status = run.status;
            run.apply(status, Transition::to(RunStatus::Running), Utc::now())
        })
        .await
    }

    async fn claim_runnable(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let query = format!("{SELECT_RUN} WHERE status IN (?, ?) ORDER BY id LIMIT ?");
        let rows = sqlx::query(&query)
            .bind(RunStatus::Enqueued.as_str())
            .bind(RunStatus::Interrupted.as_str())
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_err)?;

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut run = run_from_row(row)?;
            let expected = run.status;
            run.apply(expected, Transition::to(RunStatus::Running), now)?;
            write(&mut *tx, &run, expected).await?;
            claimed.push(run);
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(claimed)
    }

    async fn set_tick_total(&self, id: RunId, tick_total: u64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE maintflow_runs SET tick_total = ? WHERE id = ?")
            .bind(tick_total as i64)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn persist_progress(&self, id: RunId, progress: Progress) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE maintflow_runs
            SET cursor = ?, tick_count = MAX(tick_count, ?),
                time_running_ms = MAX(time_running_ms, ?)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(progress.cursor.as_ref().map(Cursor::as_str))
        .bind(progress.tick_count as i64)
        .bind(progress.time_running.as_millis() as i64)
        .bind(id.0)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            let run = self.get(id).await?;
            return Err(StoreError::NotRunning {
                id,
                status: run.status,
            });
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: RunId,
        expected: RunStatus,
        transition: Transition,
    ) -> Result<Run, StoreError> {
        self.update(id, |run| run.apply(expected, transition, Utc::now()))
            .await
    }

    async fn request_pause(&self, id: RunId) -> Result<Run, StoreError> {
        let accepted: Vec<RunStatus> = RunStatus::ALL
            .into_iter()
            .filter(RunStatus::accepts_pause_request)
            .collect();
        self.flag_request(id, "pause", "pause_requested", &accepted).await
    }

    async fn request_cancel(&self, id: RunId) -> Result<Run, StoreError> {
        let accepted: Vec<RunStatus> = RunStatus::ALL
            .into_iter()
            .filter(RunStatus::accepts_cancel_request)
            .collect();
        self.flag_request(id, "cancel", "cancel_requested", &accepted).await
    }

    async fn requests(&self, id: RunId) -> Result<StopRequests, StoreError> {
        let row: Option<(bool, bool)> = sqlx::query_as(
            "SELECT pause_requested, cancel_requested FROM maintflow_runs WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|(pause, cancel)| StopRequests { pause, cancel })
            .ok_or(StoreError::NotFound(id))
    }

    async fn recover_orphans(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE maintflow_runs
            SET status = ?
            WHERE status = ?
            "#,
        )
        .bind(RunStatus::Interrupted.as_str())
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() as usize)
    }
}
