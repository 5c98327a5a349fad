use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::{TransactionError, TransactionManager};

type Table = BTreeMap<String, Value>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryStoreError {
    #[error("duplicate key `{key}` in table `{table}`")]
    DuplicateKey { table: String, key: String },

    #[error("row `{key}` in table `{table}` is at {field} {actual:?}, expected {expected}")]
    VersionMismatch {
        table: String,
        key: String,
        field: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("row codec error: {0}")]
    Codec(String),
}

fn encode<T: Serialize>(value: &T) -> Result<Value, InMemoryStoreError> {
    serde_json::to_value(value).map_err(|e| InMemoryStoreError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, InMemoryStoreError> {
    serde_json::from_value(value.clone()).map_err(|e| InMemoryStoreError::Codec(e.to_string()))
}

/// Committed state: named tables of JSON rows keyed by string.
///
/// Cloning shares the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    tables: Arc<RwLock<BTreeMap<String, Table>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>, InMemoryStoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(decode)
            .transpose()
    }

    fn row(&self, table: &str, key: &str) -> Option<Value> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    pub fn contains(&self, table: &str, key: &str) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .is_some_and(|rows| rows.contains_key(key))
    }

    /// Every row of `table`, in key order.
    pub fn scan<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, InMemoryStoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(table)
            .map(|rows| rows.values().map(decode).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Run `f` over `table` under the write lock. Used for non-transactional
    /// updates that must be atomic (status transitions, leasing).
    pub fn with_table_mut<R>(&self, table: &str, f: impl FnOnce(&mut Table) -> R) -> R {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        f(tables.entry(table.to_string()).or_default())
    }

    /// Decode the row at `key`, let `f` change it and store it back.
    /// `Ok(None)` when there is no such row.
    pub fn modify<T, R, E>(
        &self,
        table: &str,
        key: &str,
        f: impl FnOnce(&mut T) -> Result<R, E>,
    ) -> Result<Option<R>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<InMemoryStoreError>,
    {
        self.with_table_mut(table, |rows| {
            let Some(slot) = rows.get_mut(key) else {
                return Ok(None);
            };
            let mut row: T = decode(slot)?;
            let out = f(&mut row)?;
            *slot = encode(&row)?;
            Ok(Some(out))
        })
    }

    /// Apply `writes` under one lock. Nothing is applied if any write's
    /// guard no longer holds against committed state.
    fn apply(&self, writes: Vec<Write>) -> Result<(), InMemoryStoreError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        for write in &writes {
            let committed = tables.get(&write.table).and_then(|rows| rows.get(&write.key));
            write.guard.check(&write.table, &write.key, committed)?;
        }
        for write in writes {
            tables
                .entry(write.table)
                .or_default()
                .insert(write.key, write.value);
        }
        Ok(())
    }
}

/// Condition a staged write re-checks against committed state at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Guard {
    None,
    /// The key must still be free.
    Absent,
    /// The committed row's `field` must still equal `expected`.
    Version { field: String, expected: u64 },
}

impl Guard {
    fn check(&self, table: &str, key: &str, committed: Option<&Value>) -> Result<(), InMemoryStoreError> {
        match self {
            Guard::None => Ok(()),
            Guard::Absent if committed.is_some() => Err(InMemoryStoreError::DuplicateKey {
                table: table.to_string(),
                key: key.to_string(),
            }),
            Guard::Absent => Ok(()),
            Guard::Version { field, expected } => {
                let actual = committed.and_then(|row| row.get(field)).and_then(Value::as_u64);
                if actual == Some(*expected) {
                    Ok(())
                } else {
                    Err(InMemoryStoreError::VersionMismatch {
                        table: table.to_string(),
                        key: key.to_string(),
                        field: field.clone(),
                        expected: *expected,
                        actual,
                    })
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Write {
    table: String,
    key: String,
    value: Value,
    guard: Guard,
}

/// Writes staged against an [`InMemoryDatabase`], applied together on commit.
///
/// Reads see the transaction's own staged writes first, then committed state.
#[derive(Debug)]
pub struct InMemoryTransaction {
    db: InMemoryDatabase,
    writes: Vec<Write>,
}

impl InMemoryTransaction {
    fn staged(&self, table: &str, key: &str) -> Option<&Value> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.table == table && w.key == key)
            .map(|w| &w.value)
    }

    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>, InMemoryStoreError> {
        match self.staged(table, key) {
            Some(value) => decode(value).map(Some),
            None => self.db.get(table, key),
        }
    }

    /// Insert a new row; fails if `key` exists either committed or staged.
    pub fn insert<T: Serialize>(&mut self, table: &str, key: &str, row: &T) -> Result<(), InMemoryStoreError> {
        if self.staged(table, key).is_some() || self.db.contains(table, key) {
            return Err(InMemoryStoreError::DuplicateKey {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        self.stage(table, key, row, Guard::Absent)
    }

    /// Insert or overwrite a row.
    pub fn put<T: Serialize>(&mut self, table: &str, key: &str, row: &T) -> Result<(), InMemoryStoreError> {
        self.stage(table, key, row, Guard::None)
    }

    /// Overwrite a row whose committed `field` is `expected`, checked again
    /// at commit. Fails now if the row is already past `expected`.
    pub fn put_versioned<T: Serialize>(
        &mut self,
        table: &str,
        key: &str,
        row: &T,
        field: &str,
        expected: u64,
    ) -> Result<(), InMemoryStoreError> {
        let guard = Guard::Version {
            field: field.to_string(),
            expected,
        };
        guard.check(table, key, self.db.row(table, key).as_ref())?;
        self.stage(table, key, row, guard)
    }

    fn stage<T: Serialize>(&mut self, table: &str, key: &str, row: &T, guard: Guard) -> Result<(), InMemoryStoreError> {
        self.writes.push(Write {
            table: table.to_string(),
            key: key.to_string(),
            value: encode(row)?,
            guard,
        });
        Ok(())
    }

    pub fn staged_writes(&self) -> usize {
        self.writes.len()
    }
}

/// Transaction manager over an [`InMemoryDatabase`].
///
/// Commit applies every staged write under one lock, so readers see all of a
/// transaction's rows or none of them.
#[derive(Debug, Default)]
pub struct InMemoryTransactionManager {
    db: InMemoryDatabase,
    fail_next_commit: AtomicBool,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl InMemoryTransactionManager {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self {
            db,
            ..Self::default()
        }
    }

    pub fn database(&self) -> &InMemoryDatabase {
        &self.db
    }

    /// Make the next commit fail without applying its writes.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionManager for InMemoryTransactionManager {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, TransactionError> {
        Ok(InMemoryTransaction {
            db: self.db.clone(),
            writes: Vec::new(),
        })
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), TransactionError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(TransactionError::Commit("injected commit failure".to_string()));
        }
        self.db.apply(tx.writes).map_err(|e| match e {
            InMemoryStoreError::VersionMismatch { .. } => TransactionError::Conflict(e.to_string()),
            _ => TransactionError::Commit(e.to_string()),
        })?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), TransactionError> {
        drop(tx);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let manager = InMemoryTransactionManager::new(InMemoryDatabase::new());
        let mut tx = manager.begin().await.unwrap();
        tx.insert("users", "u1", &"ada").unwrap();

        assert_eq!(tx.get::<String>("users", "u1").unwrap().as_deref(), Some("ada"));
        assert!(manager.database().is_empty("users"));

        manager.commit(tx).await.unwrap();
        assert_eq!(
            manager.database().get::<String>("users", "u1").unwrap().as_deref(),
            Some("ada")
        );
    }

    #[tokio::test]
    async fn insert_rejects_existing_keys() {
        let manager = InMemoryTransactionManager::new(InMemoryDatabase::new());
        let mut tx = manager.begin().await.unwrap();
        tx.insert("users", "u1", &1).unwrap();
        manager.commit(tx).await.unwrap();

        let mut tx = manager.begin().await.unwrap();
        assert!(matches!(
            tx.insert("users", "u1", &2),
            Err(InMemoryStoreError::DuplicateKey { .. })
        ));
        tx.put("users", "u1", &2).unwrap();
        assert!(tx.insert("users", "u1", &3).is_err());
    }

    #[tokio::test]
    async fn racing_inserts_commit_once() {
        let manager = InMemoryTransactionManager::new(InMemoryDatabase::new());
        let mut first = manager.begin().await.unwrap();
        let mut second = manager.begin().await.unwrap();
        first.insert("users_by_email", "ada@example.com", &"u1").unwrap();
        second.put("users", "u2", &"grace").unwrap();
        second.insert("users_by_email", "ada@example.com", &"u2").unwrap();

        manager.commit(first).await.unwrap();
        assert!(matches!(manager.commit(second).await, Err(TransactionError::Commit(_))));
        assert!(!manager.database().contains("users", "u2"));
        assert_eq!(
            manager.database().get::<String>("users_by_email", "ada@example.com").unwrap().as_deref(),
            Some("u1")
        );
    }

    #[tokio::test]
    async fn racing_versioned_puts_commit_once() {
        let manager = InMemoryTransactionManager::new(InMemoryDatabase::new());
        let mut seed = manager.begin().await.unwrap();
        seed.insert("users", "u1", &serde_json::json!({ "name": "ada", "version": 1 }))
            .unwrap();
        manager.commit(seed).await.unwrap();

        let mut first = manager.begin().await.unwrap();
        let mut second = manager.begin().await.unwrap();
        let renamed = serde_json::json!({ "name": "ada lovelace", "version": 2 });
        let relabelled = serde_json::json!({ "name": "countess", "version": 2 });
        first.put_versioned("users", "u1", &renamed, "version", 1).unwrap();
        second.put_versioned("users", "u1", &relabelled, "version", 1).unwrap();
        second.put("audit", "a1", &"relabelled").unwrap();

        manager.commit(first).await.unwrap();
        assert!(matches!(manager.commit(second).await, Err(TransactionError::Conflict(_))));
        assert_eq!(manager.database().get::<Value>("users", "u1").unwrap(), Some(renamed));
        assert!(manager.database().is_empty("audit"));

        let mut stale = manager.begin().await.unwrap();
        assert!(matches!(
            stale.put_versioned("users", "u1", &relabelled, "version", 1),
            Err(InMemoryStoreError::VersionMismatch { actual: Some(2), .. })
        ));
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let manager = InMemoryTransactionManager::new(InMemoryDatabase::new());
        manager.fail_next_commit();

        let mut tx = manager.begin().await.unwrap();
        tx.put("users", "u1", &1).unwrap();
        assert!(matches!(manager.commit(tx).await, Err(TransactionError::Commit(_))));
        assert!(manager.database().is_empty("users"));
        assert_eq!(manager.commits(), 0);
    }

    #[test]
    fn modify_reports_missing_rows() {
        let db = InMemoryDatabase::new();
        let missing: Result<Option<()>, InMemoryStoreError> =
            db.modify::<u32, _, _>("counters", "c", |n| {
                *n += 1;
                Ok(())
            });
        assert_eq!(missing, Ok(None));

        db.with_table_mut("counters", |rows| rows.insert("c".to_string(), Value::from(1)));
        db.modify::<u32, _, InMemoryStoreError>("counters", "c", |n| {
            *n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.get::<u32>("counters", "c").unwrap(), Some(2));
    }
}
