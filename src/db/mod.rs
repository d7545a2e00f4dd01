//! Storage layer: the `Store` primitives and their SQLite implementation.
//!
//! - `repo`: SQL-only `SqliteStore` plus pool setup and migrations.
//! - `keys`: the key layout shared with read-side consumers.
//! - `filters` / `records`: typed helpers built on the primitives.
//!
//! Everything above this module talks to `dyn Store`, never to SQL.

use anyhow::Result;
use async_trait::async_trait;

pub mod filters;
pub mod keys;
pub mod records;
pub mod repo;

pub use filters::{bind_filter, load_filters, unbind_filter};
pub use records::read_records;
pub use repo::{init_pool, run_migrations, Pool, SqliteStore};

/// Key/value, ordered-list, set and hash primitives.
///
/// List indices follow the usual inclusive `start..=stop` convention where
/// negative values count from the tail (`-1` is the last element).
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn list_len(&self, key: &str) -> Result<i64>;

    async fn is_member(&self, key: &str, member: &str) -> Result<bool>;
    /// Returns `true` if `member` was newly added.
    async fn add_member(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_size(&self, key: &str) -> Result<i64>;

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    /// Returns `true` if the field existed.
    async fn hash_del(&self, key: &str, field: &str) -> Result<bool>;

    /// Append `value` to `list_key` and add `member` to `set_key` atomically.
    async fn push_with_member(
        &self,
        list_key: &str,
        value: &str,
        set_key: &str,
        member: &str,
    ) -> Result<()>;
}
