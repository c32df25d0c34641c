//! Local filesystem mirrors
//!
//! Converges `{root}/{name}` (or `{root}/{hoster}/{owner}/{name}` in the structured
//! layout) to a clone of the repository:
//!
//! - absent: clone, retrying transient failures with a fixed delay
//! - present as a file: warn and leave it alone
//! - present as a directory: update; on failure delete it and clone from scratch
//!
//! Remotes that refuse access or have no commits are not errors. The repository is
//! reported as unavailable and processing stops.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{AuthMethod, AuthResolver};
use crate::config::{LocalDestination, SyncConfig};
use crate::events::RunContext;
use crate::git::{CloneLayout, Cloner, GitError, GitErrorKind, UpdateOutcome};
use crate::repo::Repo;

/// Fixed-delay retry bound for clone/update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            attempts: sync.retry_attempts.max(1),
            delay: sync.retry_delay(),
        }
    }
}

/// Terminal state of one local reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOutcome {
    Cloned,
    Updated,
    UpToDate,
    /// The target path exists but is not a directory
    SkippedFile,
    /// Remote refused access or is empty
    Unavailable(GitErrorKind),
    DryRun,
}

impl LocalOutcome {
    /// Whether the target now holds a usable copy
    pub fn is_present(&self) -> bool {
        matches!(
            self,
            LocalOutcome::Cloned | LocalOutcome::Updated | LocalOutcome::UpToDate
        )
    }
}

pub struct LocalReconciler {
    root: PathBuf,
    structured: bool,
    layout: CloneLayout,
    cloner: Arc<dyn Cloner>,
    auth: AuthResolver,
    retry: RetryPolicy,
    ctx: RunContext,
}

impl LocalReconciler {
    pub fn new(
        destination: &LocalDestination,
        cloner: Arc<dyn Cloner>,
        auth: AuthResolver,
        retry: RetryPolicy,
        ctx: RunContext,
    ) -> Self {
        Self {
            root: PathBuf::from(&destination.path),
            structured: destination.structured,
            layout: CloneLayout::from_flags(destination.bare, destination.mirror),
            cloner,
            auth,
            retry,
            ctx,
        }
    }

    /// Where `repo` lives under this destination
    pub fn target_path(&self, repo: &Repo) -> PathBuf {
        let relative = repo.relative_path(self.structured);
        let path = self.root.join(relative);
        if self.layout.is_bare() {
            append_to_path(&path, ".git")
        } else {
            path
        }
    }

    /// Drive the target directory of `repo` to a current clone.
    ///
    /// Errors only for authentication problems, fatal git failures, and exhausted retries.
    pub async fn reconcile(&self, repo: &Repo) -> Result<LocalOutcome> {
        let target = self.target_path(repo);
        let url = repo.clone_url();

        let auth = self
            .auth
            .resolve(repo)
            .with_context(|| format!("Cannot authenticate clone of {}", repo.full_name()))?;

        if self.ctx.dry_run {
            info!(
                stage = "local",
                repo = %repo.full_name(),
                url = %url,
                "Dry run: would mirror into {}",
                target.display()
            );
            return Ok(LocalOutcome::DryRun);
        }

        let mut last_error: Option<GitError> = None;

        for attempt in 1..=self.retry.attempts {
            if attempt > 1 {
                debug!(
                    stage = "local",
                    repo = %repo.full_name(),
                    "Waiting {:?} before attempt {}",
                    self.retry.delay,
                    attempt
                );
                tokio::time::sleep(self.retry.delay).await;
            }

            let result = match std::fs::metadata(&target) {
                Ok(meta) if !meta.is_dir() => {
                    warn!(
                        stage = "local",
                        repo = %repo.full_name(),
                        "{} exists but is not a directory, skipping",
                        target.display()
                    );
                    return Ok(LocalOutcome::SkippedFile);
                }
                Ok(_) => self.update(repo, &auth, &target).await,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.clone(repo, &auth, &target).await
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to inspect {}", target.display()))
                }
            };

            match result {
                Ok(outcome) => {
                    self.write_issues(repo, &target).await;
                    return Ok(outcome);
                }
                Err(e) if e.is_benign() => {
                    warn!(
                        stage = "local",
                        repo = %repo.full_name(),
                        url = %url,
                        "Repository unavailable ({:?}): {}",
                        e.kind,
                        e.message
                    );
                    return Ok(LocalOutcome::Unavailable(e.kind));
                }
                Err(e) if e.kind == GitErrorKind::Fatal => {
                    return Err(anyhow::Error::new(e))
                        .with_context(|| format!("Giving up on {}", repo.full_name()));
                }
                Err(e) => {
                    warn!(
                        stage = "local",
                        repo = %repo.full_name(),
                        url = %url,
                        "Attempt {}/{} failed: {}",
                        attempt,
                        self.retry.attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .map(anyhow::Error::new)
            .unwrap_or_else(|| anyhow!("no attempts were made"));
        Err(error.context(format!(
            "Failed to mirror {} into {} after {} attempts",
            repo.full_name(),
            target.display(),
            self.retry.attempts
        )))
    }

    async fn clone(
        &self,
        repo: &Repo,
        auth: &AuthMethod,
        target: &Path,
    ) -> Result<LocalOutcome, GitError> {
        info!(stage = "local", repo = %repo.full_name(), "Cloning into {}", target.display());

        match self
            .cloner
            .clone_repo(repo.clone_url(), auth, target, self.layout)
            .await
        {
            Ok(()) => Ok(LocalOutcome::Cloned),
            Err(e) => {
                // Leave nothing half-written for the next attempt to trip over
                if !e.is_benign() && target.is_dir() {
                    if let Err(remove_err) = tokio::fs::remove_dir_all(target).await {
                        warn!(
                            stage = "local",
                            repo = %repo.full_name(),
                            "Failed to remove partial clone {}: {}",
                            target.display(),
                            remove_err
                        );
                        return Err(GitError::new(
                            GitErrorKind::Fatal,
                            "clone",
                            format!("failed to remove partial clone {}: {}", target.display(), remove_err),
                        ));
                    }
                }
                Err(e)
            }
        }
    }

    async fn update(
        &self,
        repo: &Repo,
        auth: &AuthMethod,
        target: &Path,
    ) -> Result<LocalOutcome, GitError> {
        debug!(stage = "local", repo = %repo.full_name(), "Updating {}", target.display());

        match self.cloner.update(target, auth, self.layout).await {
            Ok(UpdateOutcome::UpToDate) => Ok(LocalOutcome::UpToDate),
            Ok(UpdateOutcome::Updated) => Ok(LocalOutcome::Updated),
            Err(e) if e.kind == GitErrorKind::Transient => {
                warn!(
                    stage = "local",
                    repo = %repo.full_name(),
                    "Update failed, removing {} to clone again: {}",
                    target.display(),
                    e
                );
                if let Err(remove_err) = tokio::fs::remove_dir_all(target).await {
                    return Err(GitError::new(
                        GitErrorKind::Fatal,
                        "update",
                        format!("failed to remove {}: {}", target.display(), remove_err),
                    ));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn write_issues(&self, repo: &Repo, target: &Path) {
        let Some(issues) = repo.issues.as_ref().filter(|issues| !issues.is_empty()) else {
            return;
        };

        let dir = append_to_path(target, ".issues");
        if let Err(e) = write_issue_files(&dir, issues).await {
            warn!(
                stage = "issues",
                repo = %repo.full_name(),
                "Failed to write issues to {}: {:#}",
                dir.display(),
                e
            );
        } else {
            debug!(stage = "issues", repo = %repo.full_name(), "Wrote {} issues", issues.len());
        }
    }
}

async fn write_issue_files(
    dir: &Path,
    issues: &std::collections::BTreeMap<u64, serde_json::Value>,
) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    for (number, issue) in issues {
        let path = dir.join(format!("{}.json", number));
        let body = serde_json::to_vec_pretty(issue).context("Failed to serialize issue")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    Ok(())
}

fn append_to_path(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::git::MockCloner;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn repo() -> Repo {
        Repo {
            name: "warden".to_string(),
            url: "https://github.com/acme/warden.git".to_string(),
            ssh_url: String::new(),
            token: String::new(),
            default_branch: "main".to_string(),
            description: String::new(),
            private: false,
            owner: "acme".to_string(),
            hoster: "github.com".to_string(),
            origin: Arc::new(SourceConfig::default()),
            issues: None,
            companion_of: None,
        }
    }

    fn reconciler(root: &Path, cloner: MockCloner, dry_run: bool) -> LocalReconciler {
        LocalReconciler::new(
            &LocalDestination {
                path: root.to_string_lossy().into_owned(),
                ..LocalDestination::default()
            },
            Arc::new(cloner),
            AuthResolver::with_home("/nonexistent"),
            RetryPolicy::default(),
            RunContext::new(dry_run),
        )
    }

    fn transient() -> GitError {
        GitError::new(GitErrorKind::Transient, "clone", "Could not resolve host")
    }

    #[test]
    fn test_target_path_layouts() {
        let cloner = MockCloner::new();
        let plain = reconciler(Path::new("/srv"), cloner, false);
        assert_eq!(plain.target_path(&repo()), PathBuf::from("/srv/warden"));

        let structured = LocalReconciler::new(
            &LocalDestination {
                path: "/srv".to_string(),
                structured: true,
                bare: true,
                mirror: false,
            },
            Arc::new(MockCloner::new()),
            AuthResolver::default(),
            RetryPolicy::default(),
            RunContext::new(false),
        );
        assert_eq!(
            structured.target_path(&repo()),
            PathBuf::from("/srv/github.com/acme/warden.git")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_fails_twice_then_succeeds() {
        let root = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut cloner = MockCloner::new();
        cloner
            .expect_clone_repo()
            .times(3)
            .returning(move |_, _, _, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(())
                }
            });

        let reconciler = reconciler(root.path(), cloner, false);
        let started = tokio::time::Instant::now();
        let outcome = reconciler.reconcile(&repo()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome, LocalOutcome::Cloned);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_secs(10), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(15), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_clone_is_removed_before_retry() {
        let root = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut cloner = MockCloner::new();
        cloner
            .expect_clone_repo()
            .times(2)
            .returning(move |_, _, target, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::fs::create_dir_all(target.join(".git")).unwrap();
                    std::fs::write(target.join(".git/HEAD"), "partial").unwrap();
                    Err(transient())
                } else {
                    assert!(!target.exists(), "leftover from the failed attempt");
                    std::fs::create_dir_all(target).unwrap();
                    Ok(())
                }
            });

        let outcome = reconciler(root.path(), cloner, false)
            .reconcile(&repo())
            .await
            .unwrap();

        assert_eq!(outcome, LocalOutcome::Cloned);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_is_an_error() {
        let root = TempDir::new().unwrap();
        let mut cloner = MockCloner::new();
        cloner
            .expect_clone_repo()
            .times(5)
            .returning(|_, _, _, _| Err(transient()));

        let result = reconciler(root.path(), cloner, false).reconcile(&repo()).await;
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("after 5 attempts"), "{}", message);
    }

    #[tokio::test]
    async fn test_benign_failures_stop_without_retry() {
        let root = TempDir::new().unwrap();
        let mut cloner = MockCloner::new();
        cloner
            .expect_clone_repo()
            .times(1)
            .returning(|_, _, _, _| {
                Err(GitError::new(GitErrorKind::EmptyRemote, "clone", "remote repository is empty"))
            });

        let outcome = reconciler(root.path(), cloner, false)
            .reconcile(&repo())
            .await
            .unwrap();
        assert_eq!(outcome, LocalOutcome::Unavailable(GitErrorKind::EmptyRemote));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let root = TempDir::new().unwrap();
        let mut cloner = MockCloner::new();
        cloner.expect_clone_repo().times(1).returning(|_, _, _, _| {
            Err(GitError::new(GitErrorKind::Fatal, "clone", "Host key verification failed."))
        });

        assert!(reconciler(root.path(), cloner, false)
            .reconcile(&repo())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_existing_file_is_left_alone() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("warden"), "not a repo").unwrap();

        let outcome = reconciler(root.path(), MockCloner::new(), false)
            .reconcile(&repo())
            .await
            .unwrap();

        assert_eq!(outcome, LocalOutcome::SkippedFile);
        assert_eq!(
            std::fs::read_to_string(root.path().join("warden")).unwrap(),
            "not a repo"
        );
    }

    #[tokio::test]
    async fn test_update_up_to_date_twice() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("warden")).unwrap();

        let mut cloner = MockCloner::new();
        cloner
            .expect_update()
            .times(2)
            .returning(|_, _, _| Ok(UpdateOutcome::UpToDate));

        let reconciler = reconciler(root.path(), cloner, false);
        assert_eq!(reconciler.reconcile(&repo()).await.unwrap(), LocalOutcome::UpToDate);
        assert_eq!(reconciler.reconcile(&repo()).await.unwrap(), LocalOutcome::UpToDate);
        assert!(root.path().join("warden").is_dir());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_recreates_clone() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("warden");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale"), "x").unwrap();

        let mut cloner = MockCloner::new();
        cloner.expect_update().times(1).returning(|_, _, _| {
            Err(GitError::new(GitErrorKind::Transient, "update", "fatal: bad object HEAD"))
        });
        cloner
            .expect_clone_repo()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let outcome = reconciler(root.path(), cloner, false)
            .reconcile(&repo())
            .await
            .unwrap();

        assert_eq!(outcome, LocalOutcome::Cloned);
        assert!(!target.join("stale").exists());
    }

    #[tokio::test]
    async fn test_update_of_empty_remote_keeps_clone() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("warden");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("README"), "kept").unwrap();

        let mut cloner = MockCloner::new();
        cloner.expect_update().times(2).returning(|_, _, _| {
            Err(GitError::new(
                crate::git::classify("fatal: couldn't find remote ref refs/heads/main"),
                "update",
                "couldn't find remote ref",
            ))
        });
        cloner.expect_clone_repo().never();

        let reconciler = reconciler(root.path(), cloner, false);
        for _ in 0..2 {
            assert_eq!(
                reconciler.reconcile(&repo()).await.unwrap(),
                LocalOutcome::Unavailable(GitErrorKind::EmptyRemote)
            );
        }
        assert_eq!(std::fs::read_to_string(target.join("README")).unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let root = TempDir::new().unwrap();
        let outcome = reconciler(root.path(), MockCloner::new(), true)
            .reconcile(&repo())
            .await
            .unwrap();

        assert_eq!(outcome, LocalOutcome::DryRun);
        assert!(!root.path().join("warden").exists());
    }

    #[tokio::test]
    async fn test_missing_ssh_key_fails_before_cloning() {
        let root = TempDir::new().unwrap();
        let mut ssh_repo = repo();
        ssh_repo.origin = Arc::new(SourceConfig {
            ssh: true,
            ..SourceConfig::default()
        });

        let result = reconciler(root.path(), MockCloner::new(), false)
            .reconcile(&ssh_repo)
            .await;
        assert_matches!(result, Err(_));
    }

    #[tokio::test]
    async fn test_issues_written_after_clone() {
        let root = TempDir::new().unwrap();
        let mut cloner = MockCloner::new();
        cloner
            .expect_clone_repo()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut with_issues = repo();
        let mut issues = BTreeMap::new();
        issues.insert(7, serde_json::json!({"title": "Broken build", "number": 7}));
        with_issues.issues = Some(issues);

        reconciler(root.path(), cloner, false)
            .reconcile(&with_issues)
            .await
            .unwrap();

        let written = std::fs::read_to_string(root.path().join("warden.issues").join("7.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["title"], "Broken build");
    }
}
