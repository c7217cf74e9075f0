use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use super::{KvError, KvStore};

/// In-memory KV store for tests and simulation.
///
/// Clones share the same map, so a test can keep a handle while the engine
/// owns another (for example to tamper with a stored record).
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Rewrite the raw bytes under `key` in place. Returns false if absent.
    ///
    /// Test hook for corruption scenarios.
    pub fn tamper(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.inner.lock().get_mut(key) {
            Some(value) => {
                f(value);
                true
            },
            None => false,
        }
    }
}

impl KvStore for MemoryKv {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.inner.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn erase(&self, key: &str) -> Result<(), KvError> {
        self.inner.lock().remove(key);
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let inner = self.inner.lock();
        Ok(inner
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
