use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use super::store::{Document, Revision, StateStore, StoreError, StoreResult, encode, validate_key};

/// In-process [`StateStore`] with the same revision semantics as [`super::FileStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .docs
            .lock()
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl StateStore for MemoryStore {
    fn load(&self, key: &str) -> StoreResult<Option<Document>> {
        validate_key(key)?;
        let docs = self.docs.lock().map_err(|_| StoreError::LockPoisoned)?;
        match docs.get(key) {
            Some(bytes) => {
                let body = serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                })?;
                Ok(Some(Document {
                    body,
                    revision: Revision::of(bytes),
                }))
            }
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, body: &Value) -> StoreResult<Revision> {
        validate_key(key)?;
        let bytes = encode(key, body)?;
        let revision = Revision::of(&bytes);
        let mut docs = self.docs.lock().map_err(|_| StoreError::LockPoisoned)?;
        docs.insert(key.to_string(), bytes);
        Ok(revision)
    }

    fn save_if(
        &self,
        key: &str,
        body: &Value,
        expected: Option<&Revision>,
    ) -> StoreResult<Option<Revision>> {
        validate_key(key)?;
        let bytes = encode(key, body)?;
        let mut docs = self.docs.lock().map_err(|_| StoreError::LockPoisoned)?;
        let current = docs.get(key).map(|b| Revision::of(b));
        if current.as_ref() != expected {
            return Ok(None);
        }
        let revision = Revision::of(&bytes);
        docs.insert(key.to_string(), bytes);
        Ok(Some(revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_missing_is_none() {
        let store = MemoryStore::new();
        assert!(store.load("ralph").unwrap().is_none());
    }

    #[test]
    fn save_if_requires_matching_revision() {
        let store = MemoryStore::new();
        let first = store.save_if("trust", &json!({"level": 0}), None).unwrap();
        assert!(first.is_some());

        // Creating again with "expect missing" conflicts.
        assert!(store.save_if("trust", &json!({"level": 1}), None).unwrap().is_none());

        let stale = first.unwrap();
        let second = store
            .save_if("trust", &json!({"level": 1}), Some(&stale))
            .unwrap();
        assert!(second.is_some());
        assert!(store
            .save_if("trust", &json!({"level": 2}), Some(&stale))
            .unwrap()
            .is_none());

        let doc = store.load("trust").unwrap().unwrap();
        assert_eq!(doc.body["level"], 1);
        assert_eq!(store.keys(), vec!["trust"]);
    }
}
