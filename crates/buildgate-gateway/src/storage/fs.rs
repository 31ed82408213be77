//! Filesystem-backed artifact store.
//!
//! Layout: `<data_dir>/<bucket>/<key>` holds the artifact bytes and
//! `<data_dir>/<bucket>/<key>.meta.json` holds its [`ArtifactMeta`]. Expiry is
//! enforced by [`FsArtifactStore::sweep_expired`], which the gateway runs on a
//! fixed interval.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ArtifactSession, ArtifactStore, StorageError, UploadOptions};

const META_SUFFIX: &str = ".meta.json";
const PARTIAL_SUFFIX: &str = ".partial";

/// Sidecar record stored next to every artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub key: String,
    pub session_id: String,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Point-in-time counters of store activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub sessions_opened: u64,
    pub active_sessions: usize,
    pub uploads: u64,
}

#[derive(Default)]
struct Counters {
    sessions_opened: AtomicU64,
    active_sessions: AtomicUsize,
    uploads: AtomicU64,
}

/// Artifact store rooted at a local directory.
#[derive(Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
    counters: Arc<Counters>,
}

impl FsArtifactStore {
    /// Store rooted at `<data_dir>/<bucket>`.
    pub fn new(data_dir: impl AsRef<Path>, bucket: &str) -> Self {
        Self {
            root: data_dir.as_ref().join(bucket),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            sessions_opened: self.counters.sessions_opened.load(Ordering::Acquire),
            active_sessions: self.counters.active_sessions.load(Ordering::Acquire),
            uploads: self.counters.uploads.load(Ordering::Acquire),
        }
    }

    /// Read an artifact and its sidecar.
    pub async fn fetch(&self, key: &str) -> Result<(Vec<u8>, ArtifactMeta), StorageError> {
        let path = resolve(&self.root, key)?;
        let meta_raw = match tokio::fs::read(meta_path(&path)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let meta: ArtifactMeta = serde_json::from_slice(&meta_raw)?;
        if meta.expires_at <= Utc::now() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok((data, meta))
    }

    /// Delete every artifact whose lifetime ended at or before `now`.
    ///
    /// Returns the number of artifacts removed. Unreadable sidecars are
    /// skipped with a warning.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(data_path) = strip_meta_suffix(&path) else {
                    continue;
                };
                let meta: ArtifactMeta = match tokio::fs::read(&path)
                    .await
                    .map_err(StorageError::from)
                    .and_then(|raw| serde_json::from_slice(&raw).map_err(StorageError::from))
                {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable artifact metadata");
                        continue;
                    }
                };
                if meta.expires_at > now {
                    continue;
                }
                remove_if_present(&data_path).await?;
                remove_if_present(&path).await?;
                debug!(key = %meta.key, "Expired artifact removed");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, root = %self.root.display(), "Artifact sweep completed");
        }
        Ok(removed)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn open_session(
        &self,
        session_id: &str,
    ) -> Result<Box<dyn ArtifactSession>, StorageError> {
        if session_id.is_empty() {
            return Err(StorageError::Session("empty session id".into()));
        }
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            StorageError::Session(format!("cannot prepare {}: {e}", self.root.display()))
        })?;

        self.counters.sessions_opened.fetch_add(1, Ordering::AcqRel);
        self.counters.active_sessions.fetch_add(1, Ordering::AcqRel);
        debug!(session_id, "Storage session opened");

        Ok(Box::new(FsArtifactSession {
            root: self.root.clone(),
            session_id: session_id.to_string(),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct FsArtifactSession {
    root: PathBuf,
    session_id: String,
    counters: Arc<Counters>,
}

#[async_trait]
impl ArtifactSession for FsArtifactSession {
    async fn upload(
        &mut self,
        data: Vec<u8>,
        key: &str,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        let path = resolve(&self.root, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let created_at = Utc::now();
        let expires_at = TimeDelta::from_std(options.lifetime)
            .ok()
            .and_then(|lifetime| created_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let meta = ArtifactMeta {
            key: key.to_string(),
            session_id: self.session_id.clone(),
            content_type: options.content_type.clone(),
            metadata: options.metadata.clone(),
            created_at,
            expires_at,
        };

        let size = data.len();
        // The sidecar lands first so the sweep can always find the data file.
        let sidecar = meta_path(&path);
        write_atomically(&sidecar, serde_json::to_vec_pretty(&meta)?).await?;
        if let Err(e) = write_atomically(&path, data).await {
            if let Err(cleanup) = remove_if_present(&sidecar).await {
                warn!(key, error = %cleanup, "Failed to remove sidecar of failed upload");
            }
            return Err(e);
        }

        self.counters.uploads.fetch_add(1, Ordering::AcqRel);
        debug!(session_id = %self.session_id, key, size, "Artifact uploaded");
        Ok(key.to_string())
    }

    async fn close(self: Box<Self>) {
        debug!(session_id = %self.session_id, "Storage session closed");
    }
}

impl Drop for FsArtifactSession {
    fn drop(&mut self) {
        self.counters.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Map a key onto a path under `root`, rejecting anything that could escape it.
fn resolve(root: &Path, key: &str) -> Result<PathBuf, StorageError> {
    let relative = Path::new(key);
    let well_formed = !key.is_empty()
        && !key.ends_with(META_SUFFIX)
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !well_formed {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(root.join(relative))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn meta_path(path: &Path) -> PathBuf {
    with_suffix(path, META_SUFFIX)
}

fn strip_meta_suffix(path: &Path) -> Option<PathBuf> {
    path.to_str()
        .and_then(|p| p.strip_suffix(META_SUFFIX))
        .map(PathBuf::from)
}

/// Write `bytes` to a sibling partial file and rename it over `path`.
/// The partial file is removed if either step fails.
async fn write_atomically(path: &Path, bytes: Vec<u8>) -> Result<(), StorageError> {
    let partial = with_suffix(path, PARTIAL_SUFFIX);
    let written = match tokio::fs::write(&partial, bytes).await {
        Ok(()) => tokio::fs::rename(&partial, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(cleanup) = remove_if_present(&partial).await {
            warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial file");
        }
        return Err(e.into());
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn options(lifetime: Duration) -> UploadOptions {
        UploadOptions {
            content_type: "application/x-gzip".into(),
            lifetime,
            metadata: BTreeMap::from([("type".to_string(), "dockerfile-builder".to_string())]),
        }
    }

    #[tokio::test]
    async fn upload_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "uploads");

        let mut session = store.open_session("s-1").await.unwrap();
        let key = session
            .upload(b"gz".to_vec(), "userdata/s-1.tar.gz", &options(Duration::from_secs(60)))
            .await
            .unwrap();
        session.close().await;
        assert_eq!(key, "userdata/s-1.tar.gz");

        let (data, meta) = store.fetch(&key).await.unwrap();
        assert_eq!(data, b"gz");
        assert_eq!(meta.session_id, "s-1");
        assert_eq!(meta.content_type, "application/x-gzip");
        assert_eq!(meta.metadata["type"], "dockerfile-builder");
        assert!(dir.path().join("uploads/userdata/s-1.tar.gz").exists());
    }

    #[tokio::test]
    async fn sessions_are_released_on_close_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "uploads");

        let closed = store.open_session("a").await.unwrap();
        let dropped = store.open_session("b").await.unwrap();
        assert_eq!(store.stats().active_sessions, 2);

        closed.close().await;
        drop(dropped);
        let stats = store.stats();
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.sessions_opened, 2);
    }

    #[tokio::test]
    async fn escaping_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "uploads");
        let mut session = store.open_session("s").await.unwrap();

        for key in ["", "../x.tar.gz", "/etc/x.tar.gz", "a/../../x", "a.meta.json"] {
            let err = session
                .upload(vec![1], key, &options(Duration::from_secs(1)))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "uploads");
        let mut session = store.open_session("s").await.unwrap();
        session
            .upload(vec![1], "userdata/short.tar.gz", &options(Duration::from_secs(1)))
            .await
            .unwrap();
        session
            .upload(vec![2], "userdata/long.tar.gz", &options(Duration::from_secs(3600)))
            .await
            .unwrap();

        let later = Utc::now() + TimeDelta::seconds(120);
        assert_eq!(store.sweep_expired(later).await.unwrap(), 1);

        assert!(matches!(
            store.fetch("userdata/short.tar.gz").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(store.fetch("userdata/long.tar.gz").await.is_ok());
    }

    #[tokio::test]
    async fn failed_upload_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "uploads");
        let mut session = store.open_session("s").await.unwrap();

        // A directory squatting on the sidecar path makes its rename fail.
        let userdata = dir.path().join("uploads/userdata");
        std::fs::create_dir_all(userdata.join("x.tar.gz.meta.json")).unwrap();

        let result = session
            .upload(vec![1], "userdata/x.tar.gz", &options(Duration::from_secs(60)))
            .await;
        assert!(result.is_err());

        let mut left: Vec<_> = std::fs::read_dir(&userdata)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, ["x.tar.gz.meta.json"]);
        assert!(userdata.join("x.tar.gz.meta.json").is_dir());
        assert_eq!(store.stats().uploads, 0);
    }

    #[tokio::test]
    async fn failed_data_write_removes_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "uploads");
        let mut session = store.open_session("s").await.unwrap();

        let userdata = dir.path().join("uploads/userdata");
        std::fs::create_dir_all(userdata.join("y.tar.gz")).unwrap();
        std::fs::write(userdata.join("y.tar.gz/keep"), b"occupied").unwrap();

        let result = session
            .upload(vec![1], "userdata/y.tar.gz", &options(Duration::from_secs(60)))
            .await;
        assert!(result.is_err());
        assert!(!userdata.join("y.tar.gz.meta.json").exists());
        assert!(!userdata.join("y.tar.gz.partial").exists());
        assert!(!userdata.join("y.tar.gz.meta.json.partial").exists());
    }

    #[tokio::test]
    async fn sweep_on_missing_root_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "never-created");
        assert_eq!(store.sweep_expired(Utc::now()).await.unwrap(), 0);
    }
}
