//! SQLite instance store implementation.
//!
//! Implements `InstanceStore` from `canopy-core`. Each snapshot is stored as
//! a JSON blob next to the columns it is queried by, and upserted on
//! `instance_id` so an instance persisted at several idle points keeps one row.

use canopy_core::repository::InstanceStore;
use canopy_types::error::RepositoryError;
use canopy_types::instance::{InstanceSnapshot, InstanceStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `InstanceStore`.
pub struct SqliteInstanceStore {
    pool: DatabasePool,
}

impl SqliteInstanceStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct SnapshotRow {
    instance_id: String,
    snapshot: String,
}

impl SnapshotRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            snapshot: row.try_get("snapshot")?,
        })
    }

    fn into_snapshot(self) -> Result<InstanceSnapshot, RepositoryError> {
        serde_json::from_str(&self.snapshot).map_err(|e| {
            RepositoryError::Query(format!(
                "invalid snapshot JSON for instance {}: {e}",
                self.instance_id
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamps so `ORDER BY saved_at` sorts chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            tracing::warn!(error = %e, "instance store connection failed");
            RepositoryError::Connection
        }
        e => RepositoryError::Query(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// InstanceStore impl
// ---------------------------------------------------------------------------

impl InstanceStore for SqliteInstanceStore {
    async fn save(&self, snapshot: &InstanceSnapshot) -> Result<(), RepositoryError> {
        let snapshot_json = serde_json::to_string(snapshot)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_instances (instance_id, workflow_name, status, snapshot, saved_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 workflow_name = excluded.workflow_name,
                 status = excluded.status,
                 snapshot = excluded.snapshot,
                 saved_at = excluded.saved_at"#,
        )
        .bind(snapshot.instance_id.to_string())
        .bind(&snapshot.workflow_name)
        .bind(snapshot.status.to_string())
        .bind(&snapshot_json)
        .bind(format_datetime(&snapshot.saved_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        tracing::debug!(
            instance_id = %snapshot.instance_id,
            status = %snapshot.status,
            "instance snapshot saved"
        );
        Ok(())
    }

    async fn load(&self, instance_id: &Uuid) -> Result<Option<InstanceSnapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT instance_id, snapshot FROM workflow_instances WHERE instance_id = ?",
        )
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = SnapshotRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_snapshot()?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, instance_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_instances WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<InstanceSnapshot>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT instance_id, snapshot FROM workflow_instances WHERE status = ? ORDER BY saved_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                SnapshotRow::from_row(row)
                    .map_err(query_error)
                    .and_then(SnapshotRow::into_snapshot)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use canopy_types::activity::ActivityInstanceId;
    use canopy_types::bookmark::{BookmarkInfo, BookmarkScope};
    use chrono::Duration;
    use serde_json::json;

    async fn test_store() -> SqliteInstanceStore {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteInstanceStore::new(DatabasePool::new(&url).await.unwrap())
    }

    fn sample_snapshot(status: InstanceStatus) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: Uuid::now_v7(),
            workflow_name: "expense-approval".to_string(),
            status,
            bookmarks: vec![BookmarkInfo {
                name: "approve".to_string(),
                scope: Some(BookmarkScope::from("manager")),
                owner: ActivityInstanceId(3),
                owner_display_name: "await manager".to_string(),
                suppresses_persistable_idle: false,
            }],
            variables: BTreeMap::from([("amount".to_string(), json!(420))]),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_snapshot() {
        let store = test_store().await;
        let snapshot = sample_snapshot(InstanceStatus::PersistableIdle);

        store.save(&snapshot).await.unwrap();
        let loaded = store.load(&snapshot.instance_id).await.unwrap().unwrap();

        assert_eq!(loaded, snapshot);
        assert!(store.load(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_upserts_on_instance_id() {
        let store = test_store().await;
        let mut snapshot = sample_snapshot(InstanceStatus::PersistableIdle);
        store.save(&snapshot).await.unwrap();

        snapshot.status = InstanceStatus::Unloaded;
        snapshot.bookmarks.clear();
        store.save(&snapshot).await.unwrap();

        let loaded = store.load(&snapshot.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Unloaded);
        assert!(loaded.bookmarks.is_empty());

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workflow_instances")
            .fetch_one(&store.pool.reader)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_delete_snapshot() {
        let store = test_store().await;
        let snapshot = sample_snapshot(InstanceStatus::Unloaded);
        store.save(&snapshot).await.unwrap();

        assert!(store.delete(&snapshot.instance_id).await.unwrap());
        assert!(!store.delete(&snapshot.instance_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_status_oldest_first() {
        let store = test_store().await;

        let mut older = sample_snapshot(InstanceStatus::Unloaded);
        older.saved_at = Utc::now() - Duration::minutes(5);
        let newer = sample_snapshot(InstanceStatus::Unloaded);
        let idle = sample_snapshot(InstanceStatus::PersistableIdle);
        for s in [&newer, &idle, &older] {
            store.save(s).await.unwrap();
        }

        let unloaded = store.list_by_status(InstanceStatus::Unloaded).await.unwrap();
        let ids: Vec<Uuid> = unloaded.iter().map(|s| s.instance_id).collect();
        assert_eq!(ids, vec![older.instance_id, newer.instance_id]);

        let completed = store.list_by_status(InstanceStatus::Completed).await.unwrap();
        assert!(completed.is_empty());
    }

    #[tokio::test]
    async fn test_closed_pool_reports_connection_error() {
        let store = test_store().await;
        store.pool.writer.close().await;
        store.pool.reader.close().await;

        let err = store
            .save(&sample_snapshot(InstanceStatus::Unloaded))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Connection));
        let err = store.load(&Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Connection));
    }
}
