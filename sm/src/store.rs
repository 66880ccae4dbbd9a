//! StatusStore - the merged snapshot of every status value seen so far
//!
//! Batches are merged whole under a single map-wide write lock, and
//! projections are taken under the read lock, so a reader never observes a
//! partially applied batch.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::value::{StatusBatch, StatusKey, StatusMap, StatusValue};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Status store lock poisoned")]
    Poisoned,
}

/// Shared, cloneable handle to the status snapshot
#[derive(Debug, Clone, Default)]
pub struct StatusStore {
    inner: Arc<RwLock<HashMap<StatusKey, StatusValue>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite or add every key of `batch`
    pub fn merge(&self, batch: &StatusBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        for (key, value) in batch {
            map.insert(key.clone(), value.clone());
        }
        debug!(keys = batch.len(), total = map.len(), "StatusStore::merge: applied");
        Ok(())
    }

    /// Value of every requested key, `NoData` for keys never stored
    pub fn project<I>(&self, keys: I) -> Result<StatusMap, StoreError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(keys
            .into_iter()
            .map(|k| {
                let k = k.as_ref();
                let value = map.get(k).cloned().unwrap_or(StatusValue::NoData);
                (k.to_string(), value)
            })
            .collect())
    }

    /// Requested keys for which nothing has ever been stored
    pub fn missing<I>(&self, keys: I) -> Result<BTreeSet<StatusKey>, StoreError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(keys
            .into_iter()
            .filter(|k| !map.contains_key(k.as_ref()))
            .map(|k| k.as_ref().to_string())
            .collect())
    }

    /// Single-key lookup
    pub fn get(&self, key: &str) -> Result<StatusValue, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(key).cloned().unwrap_or(StatusValue::NoData))
    }

    /// Copy of the whole snapshot
    pub fn snapshot(&self) -> Result<StatusMap, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().map_err(|_| StoreError::Poisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Poison the lock the way a panicking writer would
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let inner = self.inner.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.write();
            panic!("writer panicked while holding the store lock");
        })
        .join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn batch(items: &[(&str, StatusValue)]) -> StatusBatch {
        items.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_merge_and_get() {
        let store = StatusStore::new();
        store.merge(&batch(&[("TSC.AZ", StatusValue::Float(120.5))])).unwrap();

        assert_eq!(store.get("TSC.AZ").unwrap(), StatusValue::Float(120.5));
        assert_eq!(store.get("TSC.EL").unwrap(), StatusValue::NoData);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_merge_empty_is_noop() {
        let store = StatusStore::new();
        store.merge(&StatusBatch::new()).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_later_batch_overwrites() {
        let store = StatusStore::new();
        store.merge(&batch(&[("A.X", StatusValue::Int(1))])).unwrap();
        store.merge(&batch(&[("A.X", StatusValue::Int(2))])).unwrap();
        assert_eq!(store.get("A.X").unwrap(), StatusValue::Int(2));
    }

    #[test]
    fn test_project_substitutes_no_data() {
        let store = StatusStore::new();
        store.merge(&batch(&[("A.X", StatusValue::Int(1))])).unwrap();

        let proj = store.project(["A.X", "A.Y"]).unwrap();
        assert_eq!(proj.len(), 2);
        assert_eq!(proj["A.X"], StatusValue::Int(1));
        assert_eq!(proj["A.Y"], StatusValue::NoData);
    }

    #[test]
    fn test_missing() {
        let store = StatusStore::new();
        store.merge(&batch(&[("A.X", StatusValue::Int(1))])).unwrap();

        let missing = store.missing(["A.X", "A.Y", "B.Z"]).unwrap();
        assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec!["A.Y", "B.Z"]);
    }

    #[test]
    fn test_stored_sentinel_is_not_missing() {
        let store = StatusStore::new();
        store.merge(&batch(&[("A.X", StatusValue::Error)])).unwrap();
        assert!(store.missing(["A.X"]).unwrap().is_empty());
        assert_eq!(store.get("A.X").unwrap(), StatusValue::Error);
    }

    #[test]
    fn test_poisoned_lock_is_reported() {
        let store = StatusStore::new();
        store.merge(&batch(&[("A.X", StatusValue::Int(1))])).unwrap();
        store.poison();

        assert!(matches!(store.merge(&batch(&[("A.X", StatusValue::Int(2))])), Err(StoreError::Poisoned)));
        assert!(matches!(store.project(["A.X"]), Err(StoreError::Poisoned)));
        assert!(matches!(store.len(), Err(StoreError::Poisoned)));
        assert!(store.is_empty().is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let store = StatusStore::new();
        let other = store.clone();
        store.merge(&batch(&[("A.X", StatusValue::Int(7))])).unwrap();
        assert_eq!(other.get("A.X").unwrap(), StatusValue::Int(7));
    }

    #[test]
    fn test_projection_sees_whole_batches() {
        let store = StatusStore::new();
        let writer = store.clone();

        let handle = std::thread::spawn(move || {
            for i in 0..500i64 {
                writer
                    .merge(&batch(&[("A.X", StatusValue::Int(i)), ("A.Y", StatusValue::Int(i))]))
                    .unwrap();
            }
        });

        for _ in 0..500 {
            let proj = store.project(["A.X", "A.Y"]).unwrap();
            assert_eq!(proj["A.X"], proj["A.Y"]);
        }
        handle.join().unwrap();
    }

    proptest! {
        #[test]
        fn test_last_write_wins(
            batches in proptest::collection::vec(
                proptest::collection::hash_map("[A-C]\\.[XY]", any::<i64>(), 0..5),
                1..10,
            )
        ) {
            let store = StatusStore::new();
            for b in &batches {
                let b: StatusBatch = b.iter().map(|(k, v)| (k.clone(), StatusValue::Int(*v))).collect();
                store.merge(&b).unwrap();
            }

            for key in ["A.X", "A.Y", "B.X", "B.Y", "C.X", "C.Y"] {
                let expected = batches
                    .iter()
                    .rev()
                    .find_map(|b| b.get(key))
                    .map(|v| StatusValue::Int(*v))
                    .unwrap_or(StatusValue::NoData);
                prop_assert_eq!(store.get(key).unwrap(), expected);
            }
        }

        #[test]
        fn test_projection_complete(
            stored in proptest::collection::hash_map("[a-d]", any::<i64>(), 0..4),
            keys in proptest::collection::btree_set("[a-f]", 0..6),
        ) {
            let store = StatusStore::new();
            let b: StatusBatch = stored.iter().map(|(k, v)| (k.clone(), StatusValue::Int(*v))).collect();
            store.merge(&b).unwrap();

            let proj = store.project(&keys).unwrap();
            prop_assert_eq!(proj.len(), keys.len());
            for key in &keys {
                let expected = stored.get(key).map(|v| StatusValue::Int(*v)).unwrap_or(StatusValue::NoData);
                prop_assert_eq!(&proj[key], &expected);
            }
        }
    }
}
