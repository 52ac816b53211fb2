//! Durable CRUD over execution records.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{params, Connection, ErrorCode, Row};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{open_pool, with_conn, Pool, StoreError};
use crate::execution::{Execution, JobLog};
use crate::status::ExecutionStatus;

const SELECT_COLUMNS: &str =
    "SELECT id, target_name, job_id, created_at, status, job_logs_json FROM executions";

/// Execution records keyed by id, with a secondary index on target name.
///
/// Cloning is cheap; clones share the same underlying pool.
#[derive(Clone)]
pub struct ExecutionStore {
    path: PathBuf,
    pool: Arc<OnceCell<Pool>>,
}

impl ExecutionStore {
    /// A store backed by the SQLite file at `path`. Call [`init`](Self::init)
    /// before use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Arc::new(OnceCell::new()),
        }
    }

    /// A store over an already-open pool; no `init` needed.
    pub fn with_pool(pool: Pool) -> Self {
        Self {
            path: PathBuf::new(),
            pool: Arc::new(OnceCell::new_with(Some(pool))),
        }
    }

    /// Open the database. Safe to call repeatedly and concurrently: only the
    /// first caller opens a pool, the others wait for it.
    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        self.pool
            .get_or_try_init(|| async move {
                debug!(path = %path.display(), "Opening execution store");
                tokio::task::spawn_blocking(move || open_pool(&path)).await?
            })
            .await?;
        Ok(())
    }

    fn pool(&self) -> Result<&Pool, StoreError> {
        self.pool.get().ok_or(StoreError::NotInitialized)
    }

    /// Insert a new record. Fails with [`StoreError::Duplicate`] if the id exists.
    pub async fn add(&self, execution: &Execution) -> Result<(), StoreError> {
        let execution = execution.clone();
        with_conn(self.pool()?, move |conn| {
            let job_id = sql_job_id(execution.job_id)?;
            let logs = serde_json::to_string(&execution.job_logs)?;
            let res = conn.execute(
                "INSERT INTO executions (id, target_name, job_id, created_at, status, job_logs_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    execution.id,
                    execution.target_name,
                    job_id,
                    execution.created_at,
                    execution.status.as_str(),
                    logs
                ],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Duplicate(execution.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Insert or replace the record with the same id.
    pub async fn update(&self, execution: &Execution) -> Result<(), StoreError> {
        let execution = execution.clone();
        with_conn(self.pool()?, move |conn| {
            let job_id = sql_job_id(execution.job_id)?;
            let logs = serde_json::to_string(&execution.job_logs)?;
            conn.execute(
                "INSERT INTO executions (id, target_name, job_id, created_at, status, job_logs_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    target_name = excluded.target_name,
                    job_id = excluded.job_id,
                    created_at = excluded.created_at,
                    status = excluded.status,
                    job_logs_json = excluded.job_logs_json",
                params![
                    execution.id,
                    execution.target_name,
                    job_id,
                    execution.created_at,
                    execution.status.as_str(),
                    logs
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        let id = id.to_string();
        with_conn(self.pool()?, move |conn| {
            let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
            Ok(query(conn, &sql, params![id])?.into_iter().next())
        })
        .await
    }

    /// All executions of one target, newest first.
    pub async fn get_by_target_name(&self, target: &str) -> Result<Vec<Execution>, StoreError> {
        let target = target.to_string();
        with_conn(self.pool()?, move |conn| {
            let sql = format!(
                "{} WHERE target_name = ?1 ORDER BY created_at DESC",
                SELECT_COLUMNS
            );
            query(conn, &sql, params![target])
        })
        .await
    }

    /// Every execution, newest first.
    pub async fn get_all(&self) -> Result<Vec<Execution>, StoreError> {
        with_conn(self.pool()?, move |conn| {
            let sql = format!("{} ORDER BY created_at DESC", SELECT_COLUMNS);
            query(conn, &sql, [])
        })
        .await
    }

    /// Executions that never reached a terminal status.
    pub async fn get_running(&self) -> Result<Vec<Execution>, StoreError> {
        with_conn(self.pool()?, move |conn| {
            let sql = format!("{} WHERE status = ?1 ORDER BY created_at ASC", SELECT_COLUMNS);
            query(conn, &sql, params![ExecutionStatus::Running.as_str()])
        })
        .await
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        with_conn(self.pool()?, move |conn| {
            let changed = conn.execute("DELETE FROM executions WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    /// Remove all records of one target. Returns the number removed.
    pub async fn delete_by_target_name(&self, target: &str) -> Result<usize, StoreError> {
        let target = target.to_string();
        with_conn(self.pool()?, move |conn| {
            let changed = conn.execute(
                "DELETE FROM executions WHERE target_name = ?1",
                params![target],
            )?;
            Ok(changed)
        })
        .await
    }
}

type RawRow = (String, String, i64, i64, String, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn query<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Execution>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, read_row)?;

    let mut list = Vec::new();
    for r in rows {
        list.push(decode(r?)?);
    }
    Ok(list)
}

fn sql_job_id(job_id: u64) -> Result<i64, StoreError> {
    i64::try_from(job_id).map_err(|_| StoreError::Corrupt(format!("job id {job_id} out of range")))
}

fn decode((id, target_name, job_id, created_at, status, logs): RawRow) -> Result<Execution, StoreError> {
    let job_id = u64::try_from(job_id)
        .map_err(|_| StoreError::Corrupt(format!("negative job id {job_id}")))?;
    let status: ExecutionStatus = status.parse().map_err(StoreError::Corrupt)?;
    let job_logs: Vec<JobLog> = serde_json::from_str(&logs)?;
    Ok(Execution {
        id,
        target_name,
        job_id,
        created_at,
        status,
        job_logs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, ExecutionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutionStore::new(dir.path().join("exec.db"));
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_operations_fail_before_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutionStore::new(dir.path().join("exec.db"));
        let err = store.get_all().await.unwrap_err();
        assert!(matches!(err, StoreError::NotInitialized));
        let err = store.add(&Execution::new("t", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotInitialized));
    }

    #[tokio::test]
    async fn test_concurrent_init_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutionStore::new(dir.path().join("exec.db"));
        let (a, b, c) = tokio::join!(store.init(), store.init(), store.init());
        a.unwrap();
        b.unwrap();
        c.unwrap();
        store.init().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_id() {
        let (_dir, store) = store().await;
        let e = Execution::new("hello-world", 10);
        store.add(&e).await.unwrap();
        let err = store.add(&e).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == e.id));
    }

    #[tokio::test]
    async fn test_job_id_beyond_sqlite_range_is_rejected() {
        let (_dir, store) = store().await;
        let e = Execution::new("hello-world", u64::MAX);
        assert!(matches!(store.add(&e).await, Err(StoreError::Corrupt(_))));
        assert!(matches!(store.update(&e).await, Err(StoreError::Corrupt(_))));
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_upserts_and_roundtrips_logs() {
        let (_dir, store) = store().await;
        let mut e = Execution::new("hello-world", 10);
        store.update(&e).await.unwrap();

        e.status = ExecutionStatus::Completed;
        e.job_logs = vec![JobLog {
            job_name: "build".to_string(),
            log: "ok\n".to_string(),
        }];
        store.update(&e).await.unwrap();

        let loaded = store.get_by_id(&e.id).await.unwrap().unwrap();
        assert_eq!(loaded, e);
        assert!(store.get_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_by_target_and_running() {
        let (_dir, store) = store().await;
        let a = Execution::new("dt-a", 1);
        let mut b = Execution::new("dt-b", 3);
        b.status = ExecutionStatus::Failed;
        store.add(&a).await.unwrap();
        store.add(&b).await.unwrap();

        let only_a = store.get_by_target_name("dt-a").await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].id, a.id);

        let running = store.get_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
        assert_eq!(store.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_by_target_leaves_other_targets() {
        let (_dir, store) = store().await;
        for job in 0..3 {
            store.add(&Execution::new("dt-a", job)).await.unwrap();
        }
        let keep = Execution::new("dt-b", 99);
        store.add(&keep).await.unwrap();

        assert_eq!(store.delete_by_target_name("dt-a").await.unwrap(), 3);
        assert!(store.get_by_target_name("dt-a").await.unwrap().is_empty());
        let rest = store.get_all().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, keep.id);
    }

    #[tokio::test]
    async fn test_delete_single() {
        let (_dir, store) = store().await;
        let e = Execution::new("dt-a", 1);
        store.add(&e).await.unwrap();
        assert!(store.delete(&e.id).await.unwrap());
        assert!(!store.delete(&e.id).await.unwrap());
    }
}
