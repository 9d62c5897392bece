use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::defaults::FlagCategory;

/// Errors for operations against the flag store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    Connection(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    Query {
        command: String,
        error: sqlx::Error,
    },
    #[error("stored override is malformed: {0}")]
    Data(String),
    #[error("store is unavailable")]
    Unavailable,
}

/// The one durable record this engine owns: at most one override per key,
/// deleting it reverts the flag to its static default.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlagOverride {
    pub key: String,
    pub enabled: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: FlagCategory,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlagUpdate {
    pub key: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct OverrideWrite {
    pub key: String,
    pub enabled: bool,
    pub category: FlagCategory,
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    /// One batched read for all requested keys.
    async fn find_overrides(&self, keys: &[String]) -> Result<Vec<FlagOverride>, StoreError>;

    /// Unconditional upsert, last write wins.
    async fn upsert(&self, write: &OverrideWrite) -> Result<FlagOverride, StoreError>;

    /// Atomic negate-in-place: flips the stored value, or inserts
    /// `write.enabled` when no override exists yet. Doing the negation at the
    /// store closes the read-then-write window between concurrent toggles.
    async fn toggle_or_insert(&self, write: &OverrideWrite) -> Result<FlagOverride, StoreError>;

    /// All-or-nothing batch of upserts.
    async fn upsert_many(&self, writes: &[OverrideWrite]) -> Result<u64, StoreError>;

    /// Removes the override entirely. Returns whether a record existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

#[derive(sqlx::FromRow)]
struct OverrideRow {
    key: String,
    enabled: bool,
    name: Option<String>,
    description: Option<String>,
    category: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OverrideRow> for FlagOverride {
    type Error = StoreError;

    fn try_from(row: OverrideRow) -> Result<Self, Self::Error> {
        let category = row.category.parse().map_err(|_| {
            StoreError::Data(format!(
                "unknown category {:?} on flag {}",
                row.category, row.key
            ))
        })?;
        Ok(FlagOverride {
            key: row.key,
            enabled: row.enabled,
            name: row.name,
            description: row.description,
            category,
            updated_at: row.updated_at,
        })
    }
}

const FIND_OVERRIDES: &str = r#"
SELECT key, enabled, name, description, category, updated_at
FROM flag_overrides
WHERE key = ANY($1)
"#;

const UPSERT: &str = r#"
INSERT INTO flag_overrides (key, enabled, name, description, category, updated_at)
VALUES ($1, $2, NULL, NULL, $3, now())
ON CONFLICT (key) DO UPDATE
SET enabled = EXCLUDED.enabled, updated_at = now()
RETURNING key, enabled, name, description, category, updated_at
"#;

const TOGGLE: &str = r#"
INSERT INTO flag_overrides (key, enabled, name, description, category, updated_at)
VALUES ($1, $2, NULL, NULL, $3, now())
ON CONFLICT (key) DO UPDATE
SET enabled = NOT flag_overrides.enabled, updated_at = now()
RETURNING key, enabled, name, description, category, updated_at
"#;

const DELETE: &str = "DELETE FROM flag_overrides WHERE key = $1";

pub struct PostgresFlagStore {
    pool: PgPool,
}

impl PostgresFlagStore {
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlagStore for PostgresFlagStore {
    async fn find_overrides(&self, keys: &[String]) -> Result<Vec<FlagOverride>, StoreError> {
        let rows: Vec<OverrideRow> = sqlx::query_as(FIND_OVERRIDES)
            .bind(keys)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "find_overrides".to_string(),
                error,
            })?;

        rows.into_iter().map(FlagOverride::try_from).collect()
    }

    async fn upsert(&self, write: &OverrideWrite) -> Result<FlagOverride, StoreError> {
        let row: OverrideRow = sqlx::query_as(UPSERT)
            .bind(&write.key)
            .bind(write.enabled)
            .bind(write.category.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "upsert".to_string(),
                error,
            })?;

        row.try_into()
    }

    async fn toggle_or_insert(&self, write: &OverrideWrite) -> Result<FlagOverride, StoreError> {
        let row: OverrideRow = sqlx::query_as(TOGGLE)
            .bind(&write.key)
            .bind(write.enabled)
            .bind(write.category.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "toggle_or_insert".to_string(),
                error,
            })?;

        row.try_into()
    }

    async fn upsert_many(&self, writes: &[OverrideWrite]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Connection)?;

        let mut updated = 0u64;
        for write in writes {
            sqlx::query(UPSERT)
                .bind(&write.key)
                .bind(write.enabled)
                .bind(write.category.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::Query {
                    command: "upsert_many".to_string(),
                    error,
                })?;
            updated += 1;
        }

        tx.commit().await.map_err(|error| StoreError::Query {
            command: "upsert_many commit".to_string(),
            error,
        })?;

        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(DELETE)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "delete".to_string(),
                error,
            })?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Default)]
struct MemoryInner {
    overrides: HashMap<String, FlagOverride>,
    find_calls: usize,
    unavailable: bool,
    /// Writes left before the store starts failing, when set.
    write_budget: Option<usize>,
}

impl MemoryInner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn consume_write_budget(&mut self) -> Result<(), StoreError> {
        match self.write_budget {
            Some(0) => Err(StoreError::Unavailable),
            Some(ref mut left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn upserted(write: &OverrideWrite, existing: Option<&FlagOverride>) -> FlagOverride {
    FlagOverride {
        key: write.key.clone(),
        enabled: write.enabled,
        name: existing.and_then(|o| o.name.clone()),
        description: existing.and_then(|o| o.description.clone()),
        category: existing.map(|o| o.category).unwrap_or(write.category),
        updated_at: Utc::now(),
    }
}

/// In-memory store for local development and tests, mirroring the Postgres
/// semantics. The mutex makes every operation atomic, including batches.
#[derive(Default)]
pub struct MemoryFlagStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().expect("memory store lock poisoned").unavailable = unavailable;
    }

    /// Fail every write after the next `n`, for exercising mid-batch failures.
    pub fn fail_after_writes(&self, n: usize) {
        self.inner.lock().expect("memory store lock poisoned").write_budget = Some(n);
    }

    pub fn find_override_calls(&self) -> usize {
        self.inner.lock().expect("memory store lock poisoned").find_calls
    }

    pub fn override_count(&self) -> usize {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .overrides
            .len()
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn find_overrides(&self, keys: &[String]) -> Result<Vec<FlagOverride>, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.find_calls += 1;
        inner.check_available()?;

        Ok(keys
            .iter()
            .filter_map(|key| inner.overrides.get(key).cloned())
            .collect())
    }

    async fn upsert(&self, write: &OverrideWrite) -> Result<FlagOverride, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.check_available()?;
        inner.consume_write_budget()?;

        let saved = upserted(write, inner.overrides.get(&write.key));
        inner.overrides.insert(write.key.clone(), saved.clone());
        Ok(saved)
    }

    async fn toggle_or_insert(&self, write: &OverrideWrite) -> Result<FlagOverride, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.check_available()?;
        inner.consume_write_budget()?;

        let flipped = OverrideWrite {
            key: write.key.clone(),
            enabled: inner
                .overrides
                .get(&write.key)
                .map(|o| !o.enabled)
                .unwrap_or(write.enabled),
            category: write.category,
        };
        let saved = upserted(&flipped, inner.overrides.get(&write.key));
        inner.overrides.insert(write.key.clone(), saved.clone());
        Ok(saved)
    }

    async fn upsert_many(&self, writes: &[OverrideWrite]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.check_available()?;

        // Stage on a copy so a mid-batch failure leaves nothing applied
        let mut staged = inner.overrides.clone();
        let mut updated = 0u64;
        for write in writes {
            inner.consume_write_budget()?;
            let saved = upserted(write, staged.get(&write.key));
            staged.insert(write.key.clone(), saved);
            updated += 1;
        }

        inner.overrides = staged;
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.check_available()?;
        inner.consume_write_budget()?;

        Ok(inner.overrides.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(key: &str, enabled: bool) -> OverrideWrite {
        OverrideWrite {
            key: key.to_string(),
            enabled,
            category: FlagCategory::Ui,
        }
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_a_single_record() {
        let store = MemoryFlagStore::new();

        let first = store.upsert(&write("dark-mode", true)).await.unwrap();
        assert!(first.enabled);

        let second = store.upsert(&write("dark-mode", false)).await.unwrap();
        assert!(!second.enabled);
        assert_eq!(store.override_count(), 1);
    }

    #[tokio::test]
    async fn find_overrides_returns_only_requested_keys() {
        let store = MemoryFlagStore::new();
        store.upsert(&write("dark-mode", true)).await.unwrap();
        store.upsert(&write("new-checkout", false)).await.unwrap();

        let found = store
            .find_overrides(&keys(&["dark-mode", "missing"]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "dark-mode");
    }

    #[tokio::test]
    async fn toggle_or_insert_flips_in_place() {
        let store = MemoryFlagStore::new();

        let first = store.toggle_or_insert(&write("dark-mode", true)).await.unwrap();
        assert!(first.enabled);

        let second = store.toggle_or_insert(&write("dark-mode", true)).await.unwrap();
        assert!(!second.enabled);
    }

    #[tokio::test]
    async fn delete_removes_the_record_entirely() {
        let store = MemoryFlagStore::new();
        store.upsert(&write("dark-mode", true)).await.unwrap();

        assert!(store.delete("dark-mode").await.unwrap());
        assert!(!store.delete("dark-mode").await.unwrap());
        assert!(store
            .find_overrides(&keys(&["dark-mode"]))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn batch_applies_nothing_when_a_write_fails_mid_batch() {
        let store = MemoryFlagStore::new();
        store.fail_after_writes(1);

        let result = store
            .upsert_many(&[write("dark-mode", true), write("new-checkout", false)])
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable)));
        assert_eq!(store.override_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = MemoryFlagStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.find_overrides(&keys(&["dark-mode"])).await,
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.upsert(&write("dark-mode", true)).await,
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.delete("dark-mode").await,
            Err(StoreError::Unavailable)
        ));
    }
}
