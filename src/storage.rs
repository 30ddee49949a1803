//! Key-value storage backends shared by every repository.
//!
//! A backend buffers writes made while a transaction is open and applies them
//! all at once on commit. Reads inside an open transaction see the buffered
//! writes. Transactions do not nest.

use crate::error::{ChainError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Abstraction for storage backends. All repositories of a node share one
/// instance so a single transaction spans accounts, tokens, blocks and tip.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// All entries whose key starts with `prefix`, in ascending key order.
    fn iterate(&self, prefix: &[u8]) -> Result<Vec<KeyValue>>;

    fn open_transaction(&self) -> Result<()>;
    fn commit_transaction(&self) -> Result<()>;
    fn discard_transaction(&self);
    fn in_transaction(&self) -> bool;
}

/// Pending writes of an open transaction; `None` marks a delete.
#[derive(Debug, Default)]
struct Overlay {
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Overlay {
    fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.writes.get(key).cloned()
    }

    /// Merges buffered writes over `base`, keeping ascending key order.
    fn merge(&self, prefix: &[u8], base: Vec<KeyValue>) -> Vec<KeyValue> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = base.into_iter().collect();
        for (key, value) in self.writes.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

fn already_open() -> ChainError {
    ChainError::DatabaseError("A storage transaction is already open".to_string())
}

fn not_open() -> ChainError {
    ChainError::DatabaseError("No storage transaction is open".to_string())
}

#[derive(Default)]
struct MemoryInner {
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: Option<Overlay>,
}

/// Volatile backend used by tests and `database.path = ":memory:"`.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        if let Some(hit) = inner.pending.as_ref().and_then(|o| o.get(key)) {
            return Ok(hit);
        }
        Ok(inner.committed.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.pending.as_mut() {
            Some(overlay) => {
                overlay.writes.insert(key.to_vec(), Some(value.to_vec()));
            }
            None => {
                inner.committed.insert(key.to_vec(), value.to_vec());
            }
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.pending.as_mut() {
            Some(overlay) => {
                overlay.writes.insert(key.to_vec(), None);
            }
            None => {
                inner.committed.remove(key);
            }
        }
        Ok(())
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<KeyValue>> {
        let inner = self.inner.lock();
        let base: Vec<KeyValue> = inner
            .committed
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(match inner.pending.as_ref() {
            Some(overlay) => overlay.merge(prefix, base),
            None => base,
        })
    }

    fn open_transaction(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pending.is_some() {
            return Err(already_open());
        }
        inner.pending = Some(Overlay::default());
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let overlay = inner.pending.take().ok_or_else(not_open)?;
        for (key, value) in overlay.writes {
            match value {
                Some(v) => {
                    inner.committed.insert(key, v);
                }
                None => {
                    inner.committed.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn discard_transaction(&self) {
        self.inner.lock().pending = None;
    }

    fn in_transaction(&self) -> bool {
        self.inner.lock().pending.is_some()
    }
}

/// SQLite backend: a single `kv` table of blob keys and values.
pub struct SqliteStorage {
    conn: std::sync::Mutex<Connection>,
    pending: Mutex<Option<Overlay>>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create kv table: {}", e)))?;

        Ok(SqliteStorage {
            conn: std::sync::Mutex::new(conn),
            pending: Mutex::new(None),
        })
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.connection()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| ChainError::DatabaseError(format!("Failed to read key: {}", e)))
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let conn = self.connection()?;
        match value {
            Some(v) => conn.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, v],
            ),
            None => conn.execute("DELETE FROM kv WHERE key = ?1", params![key]),
        }
        .map_err(|e| ChainError::DatabaseError(format!("Failed to write key: {}", e)))?;
        Ok(())
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<KeyValue>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![prefix], |row| {
                let key: Vec<u8> = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                Ok((key, value))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query keys: {}", e)))?;

        let mut entries = Vec::new();
        for row_result in rows {
            let (key, value) = row_result
                .map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(hit) = self.pending.lock().as_ref().and_then(|o| o.get(key)) {
            return Ok(hit);
        }
        self.read(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(overlay) = self.pending.lock().as_mut() {
            overlay.writes.insert(key.to_vec(), Some(value.to_vec()));
            return Ok(());
        }
        self.write(key, Some(value))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        if let Some(overlay) = self.pending.lock().as_mut() {
            overlay.writes.insert(key.to_vec(), None);
            return Ok(());
        }
        self.write(key, None)
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<KeyValue>> {
        let base = self.scan(prefix)?;
        Ok(match self.pending.lock().as_ref() {
            Some(overlay) => overlay.merge(prefix, base),
            None => base,
        })
    }

    fn open_transaction(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return Err(already_open());
        }
        *pending = Some(Overlay::default());
        Ok(())
    }

    /// Applies every buffered write inside one SQLite transaction.
    fn commit_transaction(&self) -> Result<()> {
        let overlay = self.pending.lock().take().ok_or_else(not_open)?;

        let conn_guard = self.connection()?;
        let tx = conn_guard.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;
        for (key, value) in &overlay.writes {
            match value {
                Some(v) => tx.execute(
                    "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                    params![key, v],
                ),
                None => tx.execute("DELETE FROM kv WHERE key = ?1", params![key]),
            }
            .map_err(|e| ChainError::DatabaseError(format!("Failed to apply write: {}", e)))?;
        }
        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }

    fn discard_transaction(&self) {
        *self.pending.lock() = None;
    }

    fn in_transaction(&self) -> bool {
        self.pending.lock().is_some()
    }
}

/// Opens a storage transaction and discards it on drop unless committed,
/// so every early return through `?` rolls back.
pub struct StorageTransaction {
    storage: Arc<dyn Storage>,
    finished: bool,
}

impl StorageTransaction {
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        storage.open_transaction()?;
        Ok(StorageTransaction {
            storage,
            finished: false,
        })
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.storage.commit_transaction()
    }

    pub fn discard(mut self) {
        self.finished = true;
        self.storage.discard_transaction();
    }
}

impl Drop for StorageTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.storage.discard_transaction();
        }
    }
}

/// `":memory:"` selects the volatile backend, anything else is a SQLite path.
pub fn open_storage(path: &str) -> Result<Arc<dyn Storage>> {
    if path == ":memory:" {
        Ok(Arc::new(MemoryStorage::new()))
    } else {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Arc::new(SqliteStorage::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise_backend(storage: Arc<dyn Storage>) {
        storage.set(b"account/a", b"1").unwrap();
        storage.set(b"account/b", b"2").unwrap();
        storage.set(b"token/0", b"t").unwrap();

        assert_eq!(storage.get(b"account/a").unwrap(), Some(b"1".to_vec()));
        let accounts = storage.iterate(b"account/").unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].0, b"account/a".to_vec());

        {
            let txn = StorageTransaction::open(storage.clone()).unwrap();
            storage.set(b"account/c", b"3").unwrap();
            storage.delete(b"account/a").unwrap();
            assert_eq!(storage.get(b"account/a").unwrap(), None);
            assert_eq!(storage.iterate(b"account/").unwrap().len(), 2);
            assert!(StorageTransaction::open(storage.clone()).is_err());
            drop(txn);
        }
        assert!(!storage.in_transaction());
        assert_eq!(storage.get(b"account/a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.get(b"account/c").unwrap(), None);

        let txn = StorageTransaction::open(storage.clone()).unwrap();
        storage.set(b"account/c", b"3").unwrap();
        storage.delete(b"account/b").unwrap();
        txn.commit().unwrap();

        let keys: Vec<Vec<u8>> = storage
            .iterate(b"account/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"account/a".to_vec(), b"account/c".to_vec()]);
    }

    #[test]
    fn test_memory_storage_transactions() {
        exercise_backend(Arc::new(MemoryStorage::new()));
    }

    #[test]
    fn test_sqlite_storage_transactions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.db");
        exercise_backend(Arc::new(SqliteStorage::open(path.to_str().unwrap()).unwrap()));
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.db");
        let path = path.to_str().unwrap();
        {
            let storage = SqliteStorage::open(path).unwrap();
            storage.set(b"chainstate/1", b"tip").unwrap();
        }
        let reopened = open_storage(path).unwrap();
        assert_eq!(reopened.get(b"chainstate/1").unwrap(), Some(b"tip".to_vec()));
    }

    #[test]
    fn test_commit_without_open_fails() {
        let storage = MemoryStorage::new();
        assert!(storage.commit_transaction().is_err());
    }
}
