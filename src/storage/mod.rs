//! Object-storage destinations
//!
//! S3-compatible buckets, Azure Blob containers and WebDAV shares all sit behind the
//! small [`ObjectStore`] trait. [`StorageReconciler`] uploads a materialized
//! repository and prunes whatever no longer exists locally, so after a successful
//! run the objects under a repository's prefix are exactly its local files.

pub mod cloud;
pub mod webdav;

use anyhow::{Context, Result};
use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DestinationConfig;
use crate::events::{Event, RunContext};

pub use cloud::CloudStore;
pub use webdav::WebDavStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// 5xx responses, timeouts, connection failures
    Transient,
    /// Everything retrying cannot fix: 4xx, authentication, bad keys
    Permanent,
}

#[derive(Debug, Error)]
#[error("{operation} '{key}' failed: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub operation: &'static str,
    pub key: String,
    pub message: String,
}

impl StorageError {
    pub fn new(
        kind: StorageErrorKind,
        operation: &'static str,
        key: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation,
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StorageErrorKind::Transient
    }
}

/// Minimal capability set of a storage backend.
///
/// Keys are `/`-separated and relative to the backend's root (bucket, container or
/// WebDAV base URL).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Label used in logs and events
    fn name(&self) -> String;

    /// Whether parent collections must exist before a key can be written
    fn needs_collections(&self) -> bool {
        false
    }

    /// Create one collection (directory). Existing collections are not an error.
    async fn make_collection(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError>;

    /// Every object key below `prefix`, recursively
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Delete one object. Missing objects are not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Exponential backoff for transient storage failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_retries: u32,
    pub base: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Run `attempt` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut delay = self.base;
        let mut retries = 0;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        stage = "storage",
                        key = %e.key,
                        "{} (retry {}/{} in {:?})",
                        e,
                        retries,
                        self.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Open the backend for a storage destination
pub fn open(destination: &DestinationConfig, request_timeout: Duration) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match destination {
        DestinationConfig::S3(s3) => Arc::new(CloudStore::s3(s3, request_timeout)?),
        DestinationConfig::Azure(azure) => Arc::new(CloudStore::azure(azure, request_timeout)?),
        DestinationConfig::Webdav(dav) => Arc::new(WebDavStore::new(dav, request_timeout)?),
        other => anyhow::bail!("{} is not a storage destination", other.kind()),
    };
    Ok(store)
}

/// Upload + prune protocol shared by every storage backend
pub struct StorageReconciler {
    store: Arc<dyn ObjectStore>,
    backoff: Backoff,
    ctx: RunContext,
}

impl StorageReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, ctx: RunContext) -> Self {
        Self {
            store,
            backoff: Backoff::default(),
            ctx,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Upload every regular file below `local_dir` to `{prefix}/{relative path}`.
    ///
    /// Always overwrites. Returns the number of uploaded objects.
    pub async fn upload(&self, local_dir: &Path, prefix: &str) -> Result<usize> {
        if self.ctx.dry_run {
            info!(stage = "upload", destination = %self.store.name(), prefix = %prefix, "Dry run: skipping upload");
            return Ok(0);
        }

        let mut collections: HashSet<String> = HashSet::new();
        let mut uploaded = 0;

        for relative in local_files(local_dir)? {
            let key = join_key(prefix, &relative);

            if self.store.needs_collections() {
                for parent in parent_keys(&key) {
                    if collections.insert(parent.clone()) {
                        self.backoff
                            .run(|| self.store.make_collection(&parent))
                            .await
                            .with_context(|| format!("Failed to create collection {}", parent))?;
                    }
                }
            }

            let path = local_dir.join(&relative);
            let body = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;

            self.backoff
                .run(|| self.store.put(&key, body.clone()))
                .await
                .with_context(|| format!("Failed to upload {}", key))?;

            self.ctx.emit(Event::ObjectUploaded {
                destination: self.store.name(),
                key,
            });
            uploaded += 1;
        }

        debug!(stage = "upload", destination = %self.store.name(), prefix = %prefix, uploaded, "Upload finished");
        Ok(uploaded)
    }

    /// Delete every object below `prefix` that has no regular local file.
    ///
    /// Returns the number of deleted objects.
    pub async fn prune(&self, local_dir: &Path, prefix: &str) -> Result<usize> {
        if self.ctx.dry_run {
            info!(stage = "prune", destination = %self.store.name(), prefix = %prefix, "Dry run: skipping prune");
            return Ok(0);
        }

        let keys = self
            .backoff
            .run(|| self.store.list(prefix))
            .await
            .with_context(|| format!("Failed to list {}", prefix))?;

        let local: HashSet<String> = local_files(local_dir)?.into_iter().collect();
        let mut pruned = 0;

        for key in keys {
            let Some(relative) = relative_key(prefix, &key) else {
                continue;
            };
            if local.contains(relative) {
                continue;
            }

            self.backoff
                .run(|| self.store.delete(&key))
                .await
                .with_context(|| format!("Failed to delete {}", key))?;

            self.ctx.emit(Event::ObjectPruned {
                destination: self.store.name(),
                key,
            });
            pruned += 1;
        }

        Ok(pruned)
    }
}

/// Relative `/`-separated paths of every regular file, skipping symlinks
fn local_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escapes {}", entry.path().display(), root.display()))?;

        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(key);
    }

    files.sort();
    Ok(files)
}

pub(crate) fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

fn relative_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_start_matches('/');
    let relative = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')?
    };
    (!relative.is_empty()).then_some(relative)
}

/// `a/b/c` -> `["a", "a/b"]`
fn parent_keys(key: &str) -> Vec<String> {
    let parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
    (1..parts.len()).map(|i| parts[..i].join("/")).collect()
}

/// RFC 3986 unreserved characters pass through untouched
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Percent-encode one path segment
pub(crate) fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Decode `%XX` escapes; malformed escapes are kept verbatim
pub(crate) fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn memory_store() -> Arc<CloudStore> {
        Arc::new(CloudStore::new(Arc::new(InMemory::new()), "memory"))
    }

    #[derive(Default)]
    struct RecordingStore {
        collections: Mutex<Vec<String>>,
        puts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        fn name(&self) -> String {
            "recording".to_string()
        }

        fn needs_collections(&self) -> bool {
            true
        }

        async fn make_collection(&self, key: &str) -> Result<(), StorageError> {
            self.collections.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn put(&self, key: &str, _body: Vec<u8>) -> Result<(), StorageError> {
            self.puts.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }

        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_upload_then_prune_converges() {
        let local = TempDir::new().unwrap();
        write(local.path(), "A", "a");
        write(local.path(), "dir/B", "b");

        let store = memory_store();
        store.put("repo/A", b"old".to_vec()).await.unwrap();
        store.put("repo/dir/B", b"old".to_vec()).await.unwrap();
        store.put("repo/C", b"stale".to_vec()).await.unwrap();
        store.put("other/X", b"unrelated".to_vec()).await.unwrap();

        let reconciler = StorageReconciler::new(store.clone(), RunContext::new(false));
        assert_eq!(reconciler.upload(local.path(), "repo").await.unwrap(), 2);
        assert_eq!(reconciler.prune(local.path(), "repo").await.unwrap(), 1);

        let mut remaining = store.list("repo").await.unwrap();
        remaining.sort();
        assert_eq!(remaining, vec!["repo/A".to_string(), "repo/dir/B".to_string()]);
        assert_eq!(store.list("other").await.unwrap(), vec!["other/X".to_string()]);

        // A second run has nothing left to prune
        assert_eq!(reconciler.prune(local.path(), "repo").await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_uploaded() {
        let local = TempDir::new().unwrap();
        write(local.path(), "real", "x");
        std::os::unix::fs::symlink(local.path().join("real"), local.path().join("link")).unwrap();

        let store = memory_store();
        let reconciler = StorageReconciler::new(store.clone(), RunContext::new(false));
        reconciler.upload(local.path(), "p").await.unwrap();

        assert_eq!(store.list("p").await.unwrap(), vec!["p/real".to_string()]);
    }

    #[tokio::test]
    async fn test_dry_run_is_a_no_op() {
        let local = TempDir::new().unwrap();
        write(local.path(), "A", "a");

        let store = memory_store();
        store.put("repo/C", b"stale".to_vec()).await.unwrap();

        let reconciler = StorageReconciler::new(store.clone(), RunContext::new(true));
        assert_eq!(reconciler.upload(local.path(), "repo").await.unwrap(), 0);
        assert_eq!(reconciler.prune(local.path(), "repo").await.unwrap(), 0);
        assert_eq!(store.list("repo").await.unwrap(), vec!["repo/C".to_string()]);
    }

    #[tokio::test]
    async fn test_collections_created_once_per_parent() {
        let local = TempDir::new().unwrap();
        write(local.path(), "x/y/one", "1");
        write(local.path(), "x/y/two", "2");

        let store = Arc::new(RecordingStore::default());
        let reconciler = StorageReconciler::new(store.clone(), RunContext::new(false));
        reconciler.upload(local.path(), "base").await.unwrap();

        assert_eq!(
            *store.collections.lock().unwrap(),
            vec!["base".to_string(), "base/x".to_string(), "base/x/y".to_string()]
        );
        assert_eq!(store.puts.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_transient_with_doubling_delay() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let result = Backoff::default()
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StorageError::new(StorageErrorKind::Transient, "put", "k", "503"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_after_three_retries() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), StorageError> = Backoff::default()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::new(StorageErrorKind::Transient, "put", "k", "timeout")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_backoff_does_not_retry_permanent() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), StorageError> = Backoff::default()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::new(StorageErrorKind::Permanent, "put", "k", "403")) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, StorageErrorKind::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(join_key("", "a/b"), "a/b");
        assert_eq!(join_key("/p/", "a"), "p/a");
        assert_eq!(relative_key("p", "p/a/b"), Some("a/b"));
        assert_eq!(relative_key("p", "pp/a"), None);
        assert_eq!(relative_key("p", "p"), None);
        assert_eq!(relative_key("", "a"), Some("a"));
        assert_eq!(parent_keys("a/b/c"), vec!["a".to_string(), "a/b".to_string()]);
        assert!(parent_keys("file").is_empty());
    }

    #[test]
    fn test_percent_encoding() {
        assert_eq!(encode_segment("a b+c"), "a%20b%2Bc");
        assert_eq!(percent_decode("a%20b%2Bc"), "a b+c");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("%+5x"), "%+5x");
        assert_eq!(percent_decode("%-1"), "%-1");
        assert_eq!(encode_segment("caf\u{e9}~v1.0_x"), "caf%C3%A9~v1.0_x");
        assert_eq!(percent_decode("caf%C3%A9"), "caf\u{e9}");
    }
}
