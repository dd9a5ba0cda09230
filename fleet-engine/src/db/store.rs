use crate::db::connection::{close_pool, create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::models::{host, host_flag, HostRecord, NewHost};
use std::path::Path;

/// Async facade over the host tables. Each call checks out a pooled
/// connection on the blocking thread pool.
#[derive(Clone)]
pub struct HostStore {
    db: DbPool,
}

impl HostStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = create_pool(path)?;
        migrate(&db)?;
        Ok(Self { db })
    }

    pub fn pool(&self) -> &DbPool {
        &self.db
    }

    pub async fn list(&self) -> anyhow::Result<Vec<HostRecord>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            host::find_all(&conn)
        })
        .await?
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<HostRecord>> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            host::find_by_id(&conn, &id)
        })
        .await?
    }

    pub async fn below_version(&self, target: i64) -> anyhow::Result<Vec<HostRecord>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            host::find_below_version(&conn, target)
        })
        .await?
    }

    pub async fn create(&self, data: NewHost) -> anyhow::Result<HostRecord> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            host::create(&conn, &data)
        })
        .await?
    }

    pub async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            host::delete(&conn, &id)
        })
        .await?
    }

    /// Persist that `id` now runs manifest `version`. Writes touch only that
    /// host's row, so concurrent workers never contend on the same record.
    pub async fn advance_version(&self, id: &str, version: i64) -> anyhow::Result<bool> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            host::advance_version(&conn, &id, version)
        })
        .await?
    }

    /// See [`host_flag::mark_once_per_day`].
    pub async fn mark_once_per_day(&self, id: &str, flag: &str) -> anyhow::Result<bool> {
        let db = self.db.clone();
        let id = id.to_string();
        let flag = flag.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            host_flag::mark_once_per_day(&conn, &id, &flag, chrono::Utc::now())
        })
        .await?
    }

    pub async fn clear_flag(&self, id: &str, flag: &str) -> anyhow::Result<()> {
        let db = self.db.clone();
        let id = id.to_string();
        let flag = flag.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            host_flag::clear(&conn, &id, &flag)
        })
        .await?
    }

    pub fn close(&self) {
        close_pool(&self.db);
    }
}
