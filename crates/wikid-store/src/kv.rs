//! Ordered key-value primitive consumed by [`KvTiddlerStore`](crate::KvTiddlerStore).
//!
//! The engine is a black box with four operations. `sled` trees are the
//! on-disk implementation; [`MemoryKv`] backs tests and ephemeral stores.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{poisoned, StoreError, StoreResult};

/// Iterator over the keys of a keyspace in ascending byte order.
pub type KeyIter<'a> = Box<dyn Iterator<Item = StoreResult<Vec<u8>>> + 'a>;

/// An ordered byte-keyed keyspace.
///
/// Implementations must be thread-safe and apply each single-key operation
/// atomically. Multi-key atomicity is the caller's responsibility.
pub trait OrderedKv: Send + Sync {
    /// Read a value. Returns `Ok(None)` if the key is absent.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Insert or overwrite a value.
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Remove a key. Returns `true` if it existed.
    fn delete(&self, key: &[u8]) -> StoreResult<bool>;

    /// Iterate keys in order.
    fn keys(&self) -> KeyIter<'_>;

    /// Number of keys.
    fn len(&self) -> StoreResult<usize> {
        let mut n = 0;
        for key in self.keys() {
            key?;
            n += 1;
        }
        Ok(n)
    }

    /// Make prior writes durable.
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl OrderedKv for sled::Tree {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(sled::Tree::get(self, key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        sled::Tree::insert(self, key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(sled::Tree::remove(self, key)?.is_some())
    }

    fn keys(&self) -> KeyIter<'_> {
        Box::new(
            sled::Tree::iter(self)
                .keys()
                .map(|k| k.map(|k| k.to_vec()).map_err(StoreError::from)),
        )
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(sled::Tree::len(self))
    }

    fn flush(&self) -> StoreResult<()> {
        sled::Tree::flush(self)?;
        Ok(())
    }
}

/// In-memory [`OrderedKv`] over a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderedKv for MemoryKv {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let map = self.map.read().map_err(poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut map = self.map.write().map_err(poisoned)?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<bool> {
        let mut map = self.map.write().map_err(poisoned)?;
        Ok(map.remove(key).is_some())
    }

    fn keys(&self) -> KeyIter<'_> {
        match self.map.read() {
            Ok(map) => {
                let keys: Vec<Vec<u8>> = map.keys().cloned().collect();
                Box::new(keys.into_iter().map(Ok))
            }
            Err(e) => Box::new(std::iter::once(Err(poisoned(e)))),
        }
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.map.read().map_err(poisoned)?.len())
    }
}
