use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("document {key} is not valid JSON: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("document {key} has an unexpected shape: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("{key} kept changing underneath us ({attempts} attempts)")]
    Contended { key: String, attempts: u32 },

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Content hash of a stored document, used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// SHA-256 of the stored bytes, hex encoded.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut hex = String::with_capacity(digest.len() * 2);
        for b in digest {
            hex.push_str(&format!("{b:02x}"));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A loaded document and the revision it was read at.
#[derive(Debug, Clone)]
pub struct Document {
    pub body: Value,
    pub revision: Revision,
}

/// Durable key → document storage.
///
/// Implementations must make `save` and `save_if` atomic: a reader never
/// observes a partially written document.
pub trait StateStore {
    /// Load a document, or `None` if it has never been written.
    fn load(&self, key: &str) -> StoreResult<Option<Document>>;

    /// Unconditionally replace a document.
    fn save(&self, key: &str, body: &Value) -> StoreResult<Revision>;

    /// Replace a document only if its current revision is `expected`
    /// (`None` meaning "does not exist yet"). Returns `Ok(None)` on conflict.
    fn save_if(
        &self,
        key: &str,
        body: &Value,
        expected: Option<&Revision>,
    ) -> StoreResult<Option<Revision>>;
}

/// Serialize a document the same way every store does, so revisions agree.
pub(crate) fn encode(key: &str, body: &Value) -> StoreResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(body).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Keys become file names, so keep them to a safe alphabet.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let ok = !key.is_empty()
        && key.len() <= 64
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        && !key.starts_with('-');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Load and decode a typed document, `None` when it does not exist.
pub fn load_typed<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.load(key)? {
        Some(doc) => serde_json::from_value(doc.body)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Apply one transition to a typed document with compare-and-swap.
///
/// The document is loaded (or defaulted when missing), `apply` mutates it and
/// produces the caller's result, and the new value is saved only if nobody
/// else wrote in between; otherwise the whole cycle is retried. When `apply`
/// returns `Err`, nothing is written.
pub fn update_document<T, R, E, F>(
    store: &dyn StateStore,
    key: &str,
    mut apply: F,
) -> anyhow::Result<Result<R, E>>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnMut(&mut T) -> Result<R, E>,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let loaded = store.load(key)?;
        let (mut doc, expected): (T, Option<Revision>) = match loaded {
            Some(d) => {
                let typed = serde_json::from_value(d.body).map_err(|source| {
                    StoreError::Decode {
                        key: key.to_string(),
                        source,
                    }
                })?;
                (typed, Some(d.revision))
            }
            None => (T::default(), None),
        };

        let outcome = match apply(&mut doc) {
            Ok(r) => r,
            Err(e) => return Ok(Err(e)),
        };

        let body = serde_json::to_value(&doc).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        if store.save_if(key, &body, expected.as_ref())?.is_some() {
            return Ok(Ok(outcome));
        }
        tracing::debug!(key, attempt, "revision conflict, retrying transition");
    }
    Err(StoreError::Contended {
        key: key.to_string(),
        attempts: MAX_UPDATE_ATTEMPTS,
    }
    .into())
}

/// [`update_document`] for transitions that cannot be rejected.
pub fn modify_document<T, R, F>(store: &dyn StateStore, key: &str, mut apply: F) -> anyhow::Result<R>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnMut(&mut T) -> R,
{
    match update_document(store, key, |doc: &mut T| {
        Ok::<R, std::convert::Infallible>(apply(doc))
    })? {
        Ok(r) => Ok(r),
        Err(never) => match never {},
    }
}
