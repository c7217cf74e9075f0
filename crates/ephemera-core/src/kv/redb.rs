//! Redb-backed durable KV store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety, so keys
//! survive restarts of the process.

use std::{path::Path, sync::Arc};

use redb::{Database, TableDefinition};

use super::{KvError, KvStore};

/// Table: `ephemeral_keys`
/// Key: storage key string (`<kind>/<principal>/<generation>`)
/// Value: encoded record bytes
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("ephemeral_keys");

fn io(err: impl std::fmt::Display) -> KvError {
    KvError::Io(err.to_string())
}

/// Durable KV store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbKv {
    db: Arc<Database>,
}

impl RedbKv {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(RECORDS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KvStore for RedbKv {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(RECORDS).map_err(io)?;
            table.insert(key, value).map_err(io)?;
        }
        txn.commit().map_err(io)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(RECORDS).map_err(io)?;

        Ok(table.get(key).map_err(io)?.map(|value| value.value().to_vec()))
    }

    fn erase(&self, key: &str) -> Result<(), KvError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(RECORDS).map_err(io)?;
            table.remove(key).map_err(io)?;
        }
        txn.commit().map_err(io)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(RECORDS).map_err(io)?;

        let mut keys = Vec::new();
        for result in table.range(prefix..).map_err(io)? {
            let (key, _) = result.map_err(io)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}
