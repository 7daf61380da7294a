//! A thread-safe in-memory storage for the latest environment documents. [`CacheStore`] provides
//! concurrent access for readers (request handlers) and the single writer (the refresher).
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::{EnvironmentDocument, EnvironmentKey, Error, Fingerprint, Result};

/// `CacheStore` holds at most one document per allowlisted environment key.
///
/// Each key owns its own slot, so replacing the document of one environment never blocks readers
/// of another. Documents are immutable and only ever replaced completely: the write lock is held
/// only for the duration of an `Arc` swap.
#[derive(Debug)]
pub struct CacheStore {
    // The key set is fixed at construction, only slot contents change.
    slots: HashMap<EnvironmentKey, RwLock<Option<Arc<EnvironmentDocument>>>>,
}

impl CacheStore {
    /// Create an empty store accepting documents for `keys` only.
    pub fn new(keys: impl IntoIterator<Item = EnvironmentKey>) -> CacheStore {
        CacheStore {
            slots: keys
                .into_iter()
                .map(|key| (key, RwLock::new(None)))
                .collect(),
        }
    }

    /// Get the current document for `key`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownKey`] if `key` is not allowlisted.
    /// - [`Error::NotYetFetched`] if no document has been stored for `key` yet.
    pub fn get(&self, key: &str) -> Result<Arc<EnvironmentDocument>> {
        let (key, slot) = self.slot(key)?;
        // A poisoned lock still holds a whole `Arc`, there is no partial state to guard against.
        let document = slot.read().unwrap_or_else(PoisonError::into_inner);
        document
            .clone()
            .ok_or_else(|| Error::NotYetFetched(key.clone()))
    }

    /// Replace the document for `key` and return the stored entry.
    ///
    /// The new document always wins. Its `fetched_at` is clamped to the stored one, so readers
    /// never see timestamps go back even if the system clock does.
    pub fn set(
        &self,
        key: &str,
        mut document: EnvironmentDocument,
    ) -> Result<Arc<EnvironmentDocument>> {
        let (_, slot) = self.slot(key)?;

        let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = current.as_ref() {
            document.fetched_at = document.fetched_at.max(existing.fetched_at);
        }
        let document = Arc::new(document);
        *current = Some(document.clone());
        Ok(document)
    }

    /// Fingerprint of the current document for `key`, if any.
    pub fn snapshot_fingerprint(&self, key: &str) -> Option<Fingerprint> {
        let (_, slot) = self.slot(key).ok()?;
        let document = slot.read().unwrap_or_else(PoisonError::into_inner);
        document.as_ref().map(|document| document.fingerprint.clone())
    }

    /// Whether `key` is allowlisted.
    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// All allowlisted keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &EnvironmentKey> {
        self.slots.keys()
    }

    /// Number of keys that hold a document.
    pub fn fetched_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).is_some())
            .count()
    }

    fn slot(
        &self,
        key: &str,
    ) -> Result<(&EnvironmentKey, &RwLock<Option<Arc<EnvironmentDocument>>>)> {
        self.slots
            .get_key_value(key)
            .ok_or_else(|| Error::UnknownKey(key.into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::CacheStore;
    use crate::{EnvironmentDocument, Error, Fingerprint};

    fn document(version: u64) -> EnvironmentDocument {
        let contents = json!({ "version": version, "flags": [version, version] });
        EnvironmentDocument {
            fingerprint: Fingerprint::of_bytes(contents.to_string()),
            contents,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        let store = CacheStore::new(["envA".into()]);

        assert!(matches!(store.get("unknownKey"), Err(Error::UnknownKey(_))));
        assert!(matches!(
            store.set("unknownKey", document(1)),
            Err(Error::UnknownKey(_))
        ));
        assert_eq!(store.snapshot_fingerprint("unknownKey"), None);
    }

    #[test]
    fn valid_key_is_not_yet_fetched() {
        let store = CacheStore::new(["envA".into()]);

        assert!(matches!(store.get("envA"), Err(Error::NotYetFetched(_))));
        assert_eq!(store.snapshot_fingerprint("envA"), None);
        assert_eq!(store.fetched_count(), 0);
    }

    #[test]
    fn set_replaces_entry() {
        let store = CacheStore::new(["envA".into(), "envB".into()]);
        let v1 = store.set("envA", document(1)).unwrap();
        assert_eq!(store.get("envA").unwrap(), v1);
        assert_eq!(store.snapshot_fingerprint("envA"), Some(v1.fingerprint.clone()));

        let v2 = store.set("envA", document(2)).unwrap();
        assert_eq!(store.get("envA").unwrap(), v2);
        assert_eq!(v2.contents["version"], 2);
        assert_eq!(store.fetched_count(), 1);
        assert!(matches!(store.get("envB"), Err(Error::NotYetFetched(_))));
    }

    #[test]
    fn new_content_wins_when_clock_goes_back() {
        let store = CacheStore::new(["envA".into()]);
        let mut first = document(1);
        first.fetched_at = Utc::now() + Duration::hours(1);
        let first = store.set("envA", first).unwrap();

        let second = document(2);
        assert!(second.fetched_at < first.fetched_at);
        store.set("envA", second).unwrap();

        let served = store.get("envA").unwrap();
        assert_eq!(served.contents["version"], 2);
        assert_eq!(served.fingerprint, document(2).fingerprint);
        assert_eq!(served.fetched_at, first.fetched_at);
    }

    #[test]
    fn can_set_document_from_another_thread() {
        let store = Arc::new(CacheStore::new(["envA".into()]));

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set("envA", document(1)).unwrap();
            })
            .join();
        }

        assert!(store.get("envA").is_ok());
    }

    #[test]
    fn concurrent_readers_never_observe_mixed_documents() {
        let store = Arc::new(CacheStore::new(["envA".into()]));
        store.set("envA", document(0)).unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for version in 1..500 {
                    store.set("envA", document(version)).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut last_fetched_at = None;
                    for _ in 0..1000 {
                        let doc = store.get("envA").unwrap();
                        let version = &doc.contents["version"];
                        assert_eq!(doc.contents["flags"], json!([version, version]));
                        assert_eq!(doc.fingerprint, Fingerprint::of_bytes(doc.contents.to_string()));
                        if let Some(last) = last_fetched_at {
                            assert!(doc.fetched_at >= last);
                        }
                        last_fetched_at = Some(doc.fetched_at);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
