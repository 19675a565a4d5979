use {
    super::{KeyValueStore, KvError},
    async_trait::async_trait,
    std::{
        collections::BTreeMap,
        sync::{Arc, RwLock},
    },
};

/// Process-local store backed by an ordered map.
///
/// Clones share the same underlying map, so a test can keep a handle on the
/// data a [`crate::key_manager::KeyManager`] writes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let entries = self.entries.read().map_err(|_| KvError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut entries = self.entries.write().map_err(|_| KvError::Poisoned)?;
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.write().map_err(|_| KvError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let entries = self.entries.read().map_err(|_| KvError::Poisoned)?;
        Ok(entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
