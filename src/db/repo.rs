use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::instrument;

use super::Store;
use crate::config::expand_home;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url)?;
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Normalise a file-backed SQLite URL: expand `~/`, create the parent
/// directory and ask sqlx to create the file (`mode=rwc`) unless a mode is
/// already given. In-memory and non-SQLite URLs pass through.
fn prepare_sqlite_url(url: &str) -> Result<String> {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return Ok(url.to_string());
    };
    if rest.starts_with(":memory") {
        return Ok(url.to_string());
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return Ok(url.to_string());
    }

    let path = expand_home(path);
    if let Some(parent) = Path::new(&path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create database directory {}", parent.display())
        })?;
    }

    let query = match query {
        Some(q) if q.split('&').any(|kv| kv.starts_with("mode=")) => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    Ok(format!("sqlite://{}?{}", path, query))
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Map an inclusive, possibly negative `start..=stop` onto `(offset, limit)`.
fn normalize_range(len: i64, start: i64, stop: i64) -> Option<(i64, i64)> {
    if len <= 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start >= len || stop < start {
        return None;
    }
    Some((start, stop - start + 1))
}

/// `Store` backed by the SQLite tables created in `migrations/`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip_all)]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    #[instrument(skip_all)]
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to set {}", key))?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn del(&self, key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM kv WHERE key = ?",
            "DELETE FROM list_items WHERE key = ?",
            "DELETE FROM set_members WHERE key = ?",
            "DELETE FROM hash_fields WHERE key = ?",
        ] {
            sqlx::query(sql).bind(key).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let len = self.list_len(key).await?;
        let Some((offset, limit)) = normalize_range(len, start, stop) else {
            return Ok(Vec::new());
        };
        let values = sqlx::query_scalar::<_, String>(
            "SELECT value FROM list_items WHERE key = ? ORDER BY id ASC LIMIT ? OFFSET ?",
        )
        .bind(key)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(values)
    }

    #[instrument(skip_all)]
    async fn list_len(&self, key: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM list_items WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip_all)]
    async fn is_member(&self, key: &str, member: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM set_members WHERE key = ? AND member = ?",
        )
        .bind(key)
        .bind(member)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    #[instrument(skip_all)]
    async fn add_member(&self, key: &str, member: &str) -> Result<bool> {
        let res = sqlx::query("INSERT OR IGNORE INTO set_members (key, member) VALUES (?, ?)")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to add member to {}", key))?;
        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip_all)]
    async fn set_size(&self, key: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM set_members WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip_all)]
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT field, value FROM hash_fields WHERE key = ? ORDER BY field ASC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip_all)]
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO hash_fields (key, field, value) VALUES (?, ?, ?) \
             ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn hash_del(&self, key: &str, field: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM hash_fields WHERE key = ? AND field = ?")
            .bind(key)
            .bind(field)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip_all)]
    async fn push_with_member(
        &self,
        list_key: &str,
        value: &str,
        set_key: &str,
        member: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO list_items (key, value) VALUES (?, ?)")
            .bind(list_key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO set_members (key, member) VALUES (?, ?)")
            .bind(set_key)
            .bind(member)
            .execute(&mut *tx)
            .await?;
        tx.commit()
            .await
            .with_context(|| format!("failed to commit append to {}", list_key))?;
        Ok(())
    }
}
