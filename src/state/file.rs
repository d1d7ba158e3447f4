use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde_json::Value;
use tracing::debug;

use super::store::{Document, Revision, StateStore, StoreError, StoreResult, encode, validate_key};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const STALE_LOCK_AGE: Duration = Duration::from_secs(10);

/// [`StateStore`] keeping one pretty-printed JSON file per key.
///
/// Writes go to a temp file in the same directory and are renamed over the
/// target, so readers see either the old or the new document. Conditional
/// writes hold `<key>.lock` (created exclusively) while they compare and swap.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            key: key.to_string(),
            source,
        }
    }

    fn read_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(key)(e)),
        }
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        fs::create_dir_all(&self.dir).map_err(Self::io_err(key))?;
        let target = self.path(key);
        let tmp = self
            .dir
            .join(format!(".{key}.json.{}.tmp", std::process::id()));
        debug!(path = %target.display(), "writing state document");
        fs::write(&tmp, bytes).map_err(Self::io_err(key))?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(Self::io_err(key)(e));
        }
        Ok(())
    }

    fn lock(&self, key: &str) -> StoreResult<LockGuard> {
        fs::create_dir_all(&self.dir).map_err(Self::io_err(key))?;
        let path = self.dir.join(format!("{key}.lock"));
        let start = Instant::now();
        let mut delay = Duration::from_millis(10);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        debug!(path = %path.display(), "breaking stale state lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if start.elapsed() >= LOCK_TIMEOUT {
                        return Err(StoreError::LockTimeout(key.to_string()));
                    }
                    thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(200));
                }
                Err(e) => return Err(Self::io_err(key)(e)),
            }
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl StateStore for FileStore {
    fn load(&self, key: &str) -> StoreResult<Option<Document>> {
        validate_key(key)?;
        let Some(bytes) = self.read_bytes(key)? else {
            return Ok(None);
        };
        let body = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(Document {
            body,
            revision: Revision::of(&bytes),
        }))
    }

    fn save(&self, key: &str, body: &Value) -> StoreResult<Revision> {
        validate_key(key)?;
        let bytes = encode(key, body)?;
        self.write_atomic(key, &bytes)?;
        Ok(Revision::of(&bytes))
    }

    fn save_if(
        &self,
        key: &str,
        body: &Value,
        expected: Option<&Revision>,
    ) -> StoreResult<Option<Revision>> {
        validate_key(key)?;
        let bytes = encode(key, body)?;
        let _guard = self.lock(key)?;
        let current = self.read_bytes(key)?.map(|b| Revision::of(&b));
        if current.as_ref() != expected {
            debug!(key, "conditional save rejected, revision moved");
            return Ok(None);
        }
        self.write_atomic(key, &bytes)?;
        Ok(Some(Revision::of(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_and_load_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state"));
        let rev = store.save("ralph", &json!({"active": true})).unwrap();
        let doc = store.load("ralph").unwrap().unwrap();
        assert_eq!(doc.body["active"], true);
        assert_eq!(doc.revision, rev);
        assert!(dir.path().join("state/ralph.json").exists());
    }

    #[test]
    fn no_temp_or_lock_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.save_if("team", &json!({"n": 1}), None).unwrap().unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["team.json"]);
    }

    #[test]
    fn save_if_detects_concurrent_write() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileStore::new(dir.path());
        let b = FileStore::new(dir.path());
        let rev = a.save("swarm", &json!({"v": 1})).unwrap();
        b.save("swarm", &json!({"v": 2})).unwrap();
        assert!(a.save_if("swarm", &json!({"v": 3}), Some(&rev)).unwrap().is_none());
        assert_eq!(a.load("swarm").unwrap().unwrap().body["v"], 2);
    }

    #[test]
    fn corrupt_document_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("trust.json"), "{not json").unwrap();
        let store = FileStore::new(dir.path());
        assert!(matches!(
            store.load("trust"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let _held = store.lock("pipeline").unwrap();
        let started = Instant::now();
        let err = store.save_if("pipeline", &json!({}), None).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));
        assert!(started.elapsed() >= LOCK_TIMEOUT);
    }
}
