//! Append-only archive of completed benchmark task reports.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{open_pool, with_conn, Pool, StoreError};
use crate::bench::TaskReport;
use crate::status::now_millis;

/// One archived task snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub id: String,
    /// Epoch milliseconds.
    pub stored_at: i64,
    pub task: TaskReport,
}

/// Archive of completed task reports. Same init contract as
/// [`ExecutionStore`](super::ExecutionStore).
#[derive(Clone)]
pub struct MeasurementStore {
    path: PathBuf,
    pool: Arc<OnceCell<Pool>>,
}

impl MeasurementStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_pool(pool: Pool) -> Self {
        Self {
            path: PathBuf::new(),
            pool: Arc::new(OnceCell::new_with(Some(pool))),
        }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        self.pool
            .get_or_try_init(|| async move {
                debug!(path = %path.display(), "Opening measurement store");
                tokio::task::spawn_blocking(move || open_pool(&path)).await?
            })
            .await?;
        Ok(())
    }

    fn pool(&self) -> Result<&Pool, StoreError> {
        self.pool.get().ok_or(StoreError::NotInitialized)
    }

    /// Archive a task and return its generated id.
    ///
    /// The id combines the task name, the storage time and an insertion
    /// sequence number, so repeated identical names never collide.
    pub async fn add(&self, task: &TaskReport) -> Result<String, StoreError> {
        let task = task.clone();
        with_conn(self.pool()?, move |conn| {
            let tx = conn.transaction()?;
            let seq: i64 =
                tx.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM measurements", [], |r| {
                    r.get(0)
                })?;
            let stored_at = now_millis();
            let id = format!("{}_{}_{}", slug(&task.name), stored_at, seq);
            let json = serde_json::to_string(&task)?;
            tx.execute(
                "INSERT INTO measurements (id, seq, task_name, stored_at, task_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, seq, task.name, stored_at, json],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    /// Every record in insertion order.
    pub async fn get_all(&self) -> Result<Vec<MeasurementRecord>, StoreError> {
        with_conn(self.pool()?, |conn| {
            query(
                conn,
                "SELECT id, stored_at, task_json FROM measurements ORDER BY seq ASC",
                [],
            )
        })
        .await
    }

    pub async fn get_by_task_name(&self, name: &str) -> Result<Vec<MeasurementRecord>, StoreError> {
        let name = name.to_string();
        with_conn(self.pool()?, move |conn| {
            query(
                conn,
                "SELECT id, stored_at, task_json FROM measurements
                 WHERE task_name = ?1 ORDER BY seq ASC",
                params![name],
            )
        })
        .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<MeasurementRecord>, StoreError> {
        let id = id.to_string();
        with_conn(self.pool()?, move |conn| {
            let raw: Option<(String, i64, String)> = conn
                .query_row(
                    "SELECT id, stored_at, task_json FROM measurements WHERE id = ?1",
                    params![id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            raw.map(decode).transpose()
        })
        .await
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        with_conn(self.pool()?, move |conn| {
            Ok(conn.execute("DELETE FROM measurements WHERE id = ?1", params![id])? > 0)
        })
        .await
    }

    /// Delete every record. Returns the number removed.
    pub async fn purge(&self) -> Result<usize, StoreError> {
        with_conn(self.pool()?, |conn| {
            Ok(conn.execute("DELETE FROM measurements", [])?)
        })
        .await
    }
}

fn query<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<MeasurementRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?))
    })?;

    let mut list = Vec::new();
    for r in rows {
        list.push(decode(r?)?);
    }
    Ok(list)
}

fn decode((id, stored_at, json): (String, i64, String)) -> Result<MeasurementRecord, StoreError> {
    Ok(MeasurementRecord {
        id,
        stored_at,
        task: serde_json::from_str(&json)?,
    })
}

fn slug(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    s.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::TaskStatus;

    fn report(name: &str) -> TaskReport {
        let mut r = TaskReport::new(name, "test task");
        r.status = TaskStatus::Success;
        r
    }

    #[tokio::test]
    async fn test_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = MeasurementStore::new(dir.path().join("m.db"));
        assert!(matches!(store.purge().await, Err(StoreError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_repeated_names_get_unique_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = MeasurementStore::new(dir.path().join("m.db"));
        store.init().await.unwrap();

        let a = store.add(&report("Single Run")).await.unwrap();
        let b = store.add(&report("Single Run")).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("single-run_"));

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, a);
        assert_eq!(all[1].task.name, "Single Run");
    }

    #[tokio::test]
    async fn test_lookup_delete_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = MeasurementStore::new(dir.path().join("m.db"));
        store.init().await.unwrap();

        let a = store.add(&report("A")).await.unwrap();
        store.add(&report("B")).await.unwrap();
        store.add(&report("B")).await.unwrap();

        assert_eq!(store.get_by_task_name("B").await.unwrap().len(), 2);
        assert_eq!(store.get_by_id(&a).await.unwrap().unwrap().task.name, "A");

        assert!(store.delete(&a).await.unwrap());
        assert!(store.get_by_id(&a).await.unwrap().is_none());

        assert_eq!(store.purge().await.unwrap(), 2);
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Two Concurrent Runs (x2)"), "two-concurrent-runs--x2");
    }
}
