//! Sync Engine - Orchestrates discovery and reconciliation
//!
//! One unit of work is a (repository, destination) pair. Units run in parallel up
//! to `sync.max_parallel`, each under the per-destination deadline, and two units
//! aimed at the same target never overlap. A failing unit never aborts the run;
//! it only turns the exit status non-zero.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::AuthResolver;
use crate::config::{Config, DestinationConfig, GiteaDestination, LocalDestination};
use crate::discovery::{Discovery, DiscoveryPipeline, StaticDiscovery};
use crate::events::{Event, RunContext};
use crate::git::{Cloner, GitClient};
use crate::github::GitHubDiscovery;
use crate::local::{LocalOutcome, LocalReconciler, RetryPolicy};
use crate::mirror::MirrorReconciler;
use crate::repo::Repo;
use crate::storage::{self, StorageReconciler};

/// Terminal state of one (repository, destination) unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded,
    /// Benign: nothing to do or nothing possible, not a failure
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct UnitResult {
    pub repo: String,
    pub destination: String,
    pub outcome: UnitOutcome,
}

/// Results from a complete sync operation
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub total_repositories: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub skipped_operations: usize,
    pub duration: Duration,
    pub results: Vec<UnitResult>,
}

impl SyncSummary {
    fn compile(total_repositories: usize, results: Vec<UnitResult>, duration: Duration) -> Self {
        let mut summary = Self {
            total_repositories,
            duration,
            ..Self::default()
        };

        for result in &results {
            match result.outcome {
                UnitOutcome::Succeeded => summary.successful_operations += 1,
                UnitOutcome::Skipped(_) => summary.skipped_operations += 1,
                UnitOutcome::Failed(_) => summary.failed_operations += 1,
            }
        }

        summary.results = results;
        summary
    }

    pub fn has_failures(&self) -> bool {
        self.failed_operations > 0
    }

    /// Process exit status for this run
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }
}

/// Keyed async locks, one per reconciliation target
#[derive(Debug, Default)]
struct TargetLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TargetLocks {
    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => locks.entry(key.to_string()).or_default().clone(),
            // A poisoned map only loses sharing; the unit still runs
            Err(poisoned) => poisoned.into_inner().entry(key.to_string()).or_default().clone(),
        }
    }
}

/// The main sync engine that orchestrates repository synchronization
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<Config>,
    cloner: Arc<dyn Cloner>,
    auth: AuthResolver,
    adapters: Vec<Arc<dyn Discovery>>,
    locks: Arc<TargetLocks>,
    ctx: RunContext,
}

impl SyncEngine {
    /// Engine with the git CLI, the GitHub adapter and static sources
    pub fn new(config: Config, ctx: RunContext) -> Self {
        let request_timeout = config.sync.request_timeout();
        Self {
            config: Arc::new(config),
            cloner: Arc::new(GitClient::new()),
            auth: AuthResolver::new(),
            adapters: vec![
                Arc::new(GitHubDiscovery::new(request_timeout)),
                Arc::new(StaticDiscovery),
            ],
            locks: Arc::new(TargetLocks::default()),
            ctx,
        }
    }

    pub fn with_cloner(mut self, cloner: Arc<dyn Cloner>) -> Self {
        self.cloner = cloner;
        self
    }

    pub fn with_auth(mut self, auth: AuthResolver) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn Discovery>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Discover and filter every configured source
    pub async fn discover(&self) -> Vec<Repo> {
        let mut pipeline = DiscoveryPipeline::new(self.cloner.clone(), self.auth.clone(), self.ctx.clone());
        for adapter in &self.adapters {
            pipeline.add_adapter(adapter.clone());
        }
        pipeline.run(&self.config.sources, Utc::now()).await
    }

    /// Run a complete sync operation: discover repositories and reconcile them
    pub async fn run(&self) -> SyncSummary {
        info!(run_id = %self.ctx.run_id, dry_run = self.ctx.dry_run, "Starting repository synchronization");

        let repos = self.discover().await;
        info!("Discovered {} repositories", repos.len());

        let summary = self.reconcile_all(repos).await;

        info!(
            "Sync completed in {:.2}s: {} successful, {} failed, {} skipped",
            summary.duration.as_secs_f64(),
            summary.successful_operations,
            summary.failed_operations,
            summary.skipped_operations
        );

        summary
    }

    /// Fan every repository out to every destination
    pub async fn reconcile_all(&self, repos: Vec<Repo>) -> SyncSummary {
        let start_time = Instant::now();
        let total = repos.len();
        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_parallel.max(1)));
        let deadline = self.config.sync.destination_timeout();

        let mut futures = FuturesUnordered::new();

        for repo in &repos {
            for destination in &self.config.destinations {
                let engine = self.clone();
                let semaphore = semaphore.clone();
                let repo = repo.clone();
                let destination = destination.clone();

                let span = info_span!(
                    "unit",
                    repo = %repo.full_name(),
                    destination = %destination.name()
                );

                futures.push(
                    async move {
                        let repo_name = repo.full_name();
                        let destination_name = destination.name();

                        let outcome = match semaphore.acquire_owned().await {
                            Ok(_permit) => {
                                let target = target_key(&repo, &destination);
                                let lock = engine.locks.lock_for(&target);
                                let _guard = lock.lock().await;

                                match timeout(deadline, engine.reconcile_unit(&repo, &destination)).await {
                                    Ok(outcome) => outcome,
                                    Err(_) => UnitOutcome::Failed(format!(
                                        "timed out after {}s",
                                        deadline.as_secs()
                                    )),
                                }
                            }
                            Err(e) => UnitOutcome::Failed(format!("scheduler closed: {}", e)),
                        };

                        engine.report(&repo_name, &destination_name, &outcome);
                        UnitResult {
                            repo: repo_name,
                            destination: destination_name,
                            outcome,
                        }
                    }
                    .instrument(span),
                );
            }
        }

        let mut results = Vec::new();
        while let Some(result) = futures.next().await {
            debug!("Unit completed: {:?}", result);
            results.push(result);
        }

        SyncSummary::compile(total, results, start_time.elapsed())
    }

    fn report(&self, repo: &str, destination: &str, outcome: &UnitOutcome) {
        let event = match outcome {
            UnitOutcome::Succeeded => Event::ReconcileSucceeded {
                repo: repo.to_string(),
                destination: destination.to_string(),
            },
            UnitOutcome::Skipped(reason) => Event::ReconcileSkipped {
                repo: repo.to_string(),
                destination: destination.to_string(),
                reason: reason.clone(),
            },
            UnitOutcome::Failed(error) => Event::ReconcileFailed {
                repo: repo.to_string(),
                destination: destination.to_string(),
                error: error.clone(),
            },
        };
        self.ctx.emit(event);
    }

    async fn reconcile_unit(&self, repo: &Repo, destination: &DestinationConfig) -> UnitOutcome {
        self.ctx.emit(Event::ReconcileStarted {
            repo: repo.full_name(),
            destination: destination.name(),
        });

        let result = match destination {
            DestinationConfig::Local(local) => self.reconcile_local(repo, local).await,
            DestinationConfig::Gitea(gitea) => self.reconcile_mirror(repo, gitea).await,
            storage_destination => self.reconcile_storage(repo, storage_destination).await,
        };

        result.unwrap_or_else(|e| UnitOutcome::Failed(format!("{:#}", e)))
    }

    fn local_reconciler(&self, destination: &LocalDestination) -> LocalReconciler {
        LocalReconciler::new(
            destination,
            self.cloner.clone(),
            self.auth.clone(),
            RetryPolicy::from_config(&self.config.sync),
            self.ctx.clone(),
        )
    }

    async fn reconcile_local(&self, repo: &Repo, destination: &LocalDestination) -> Result<UnitOutcome> {
        let outcome = self.local_reconciler(destination).reconcile(repo).await?;
        Ok(local_outcome(outcome))
    }

    async fn reconcile_mirror(
        &self,
        repo: &Repo,
        destination: &GiteaDestination,
    ) -> Result<UnitOutcome> {
        if repo.is_companion() {
            return Ok(UnitOutcome::Skipped(
                "companion repositories are not mirrored to hosting services".to_string(),
            ));
        }

        let reconciler = MirrorReconciler::for_gitea(
            destination,
            self.auth.clone(),
            self.ctx.clone(),
            self.config.sync.request_timeout(),
        )?;

        Ok(if reconciler.backup(repo).await {
            UnitOutcome::Succeeded
        } else {
            UnitOutcome::Failed(format!("mirror of {} failed", repo.full_name()))
        })
    }

    /// Clone into a temporary directory, then upload and prune against it
    async fn reconcile_storage(&self, repo: &Repo, destination: &DestinationConfig) -> Result<UnitOutcome> {
        let (path, structured) = storage_layout(destination);
        let prefix = repo.storage_prefix(path, structured);

        if self.ctx.dry_run {
            info!(
                stage = "storage",
                repo = %repo.full_name(),
                destination = %destination.name(),
                "Dry run: would upload to {}",
                prefix
            );
            return Ok(UnitOutcome::Succeeded);
        }

        let workdir = tempfile::Builder::new()
            .prefix("repowarden-")
            .tempdir()
            .context("Failed to create temporary clone directory")?;

        let materialize = LocalDestination {
            path: workdir.path().to_string_lossy().into_owned(),
            ..LocalDestination::default()
        };
        let local = self.local_reconciler(&materialize);

        let outcome = local.reconcile(repo).await?;
        if !outcome.is_present() {
            return Ok(local_outcome(outcome));
        }

        let store = storage::open(destination, self.config.sync.request_timeout())?;
        let reconciler = StorageReconciler::new(store, self.ctx.clone());
        let materialized = local.target_path(repo);

        upload_and_prune(&reconciler, &materialized, &prefix).await?;
        Ok(UnitOutcome::Succeeded)
    }
}

async fn upload_and_prune(reconciler: &StorageReconciler, dir: &Path, prefix: &str) -> Result<()> {
    let uploaded = reconciler.upload(dir, prefix).await?;
    let pruned = reconciler.prune(dir, prefix).await?;
    debug!(stage = "storage", prefix = %prefix, uploaded, pruned, "Storage reconciled");
    Ok(())
}

fn local_outcome(outcome: LocalOutcome) -> UnitOutcome {
    match outcome {
        LocalOutcome::Cloned | LocalOutcome::Updated | LocalOutcome::UpToDate | LocalOutcome::DryRun => {
            UnitOutcome::Succeeded
        }
        LocalOutcome::SkippedFile => {
            UnitOutcome::Skipped("target path exists and is not a directory".to_string())
        }
        LocalOutcome::Unavailable(kind) => {
            warn!("Remote unavailable: {:?}", kind);
            UnitOutcome::Skipped(format!("remote unavailable ({:?})", kind))
        }
    }
}

/// Identity of what a unit writes to.
///
/// Repositories from different owners or hosts share a target whenever the
/// destination layout maps them to the same path, prefix or mirror name.
fn target_key(repo: &Repo, destination: &DestinationConfig) -> String {
    let location = match destination {
        DestinationConfig::Local(local) => repo
            .relative_path(local.structured)
            .to_string_lossy()
            .into_owned(),
        DestinationConfig::Gitea(gitea) => {
            let owner = if !gitea.organization.is_empty() {
                gitea.organization.as_str()
            } else if gitea.create_org && !repo.owner.is_empty() {
                repo.owner.as_str()
            } else {
                // The authenticated user, unknown until the unit runs
                "@user"
            };
            format!("{}/{}", owner, repo.name)
        }
        storage_destination => {
            let (path, structured) = storage_layout(storage_destination);
            repo.storage_prefix(path, structured)
        }
    };
    format!("{}|{}", destination.name(), location)
}

/// Prefix override and structured flag of a storage destination
fn storage_layout(destination: &DestinationConfig) -> (&str, bool) {
    match destination {
        DestinationConfig::S3(s3) => (s3.path.as_str(), s3.structured),
        DestinationConfig::Azure(azure) => (azure.path.as_str(), azure.structured),
        DestinationConfig::Webdav(dav) => (dav.path.as_str(), dav.structured),
        DestinationConfig::Local(local) => (local.path.as_str(), local.structured),
        DestinationConfig::Gitea(_) => ("", false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::git::{GitError, GitErrorKind, MockCloner};
    use tempfile::TempDir;

    fn repo(name: &str) -> Repo {
        Repo {
            name: name.to_string(),
            url: format!("https://github.com/acme/{}.git", name),
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

    fn config_with(root: &Path, retry_attempts: u32) -> Config {
        let mut config = Config::default();
        config.sync.retry_attempts = retry_attempts;
        config.sync.retry_delay_secs = 0;
        config.destinations = vec![DestinationConfig::Local(LocalDestination {
            path: root.to_string_lossy().into_owned(),
            ..LocalDestination::default()
        })];
        config
    }

    #[tokio::test]
    async fn test_summary_counts_and_exit_code() {
        let root = TempDir::new().unwrap();

        let mut cloner = MockCloner::new();
        cloner.expect_clone_repo().returning(|url, _, target, _| {
            if url.contains("broken") {
                Err(GitError::new(GitErrorKind::Fatal, "clone", "fatal: bad object"))
            } else if url.contains("empty") {
                Err(GitError::new(GitErrorKind::EmptyRemote, "clone", "empty repository"))
            } else {
                std::fs::create_dir_all(target).unwrap();
                Ok(())
            }
        });

        let engine = SyncEngine::new(config_with(root.path(), 1), RunContext::new(false))
            .with_cloner(Arc::new(cloner))
            .with_auth(AuthResolver::with_home("/nonexistent"));

        let summary = engine
            .reconcile_all(vec![repo("good"), repo("broken"), repo("empty")])
            .await;

        assert_eq!(summary.total_repositories, 3);
        assert_eq!(summary.successful_operations, 1);
        assert_eq!(summary.failed_operations, 1);
        assert_eq!(summary.skipped_operations, 1);
        assert_eq!(summary.exit_code(), 1);

        let stats = engine.context().stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_clean_run_exits_zero() {
        let root = TempDir::new().unwrap();

        let mut cloner = MockCloner::new();
        cloner.expect_clone_repo().returning(|_, _, target, _| {
            std::fs::create_dir_all(target).unwrap();
            Ok(())
        });

        let engine = SyncEngine::new(config_with(root.path(), 1), RunContext::new(false))
            .with_cloner(Arc::new(cloner))
            .with_auth(AuthResolver::with_home("/nonexistent"));

        let summary = engine.reconcile_all(vec![repo("a"), repo("b")]).await;
        assert_eq!(summary.successful_operations, 2);
        assert_eq!(summary.exit_code(), 0);
        assert!(root.path().join("a").is_dir());
    }

    #[tokio::test]
    async fn test_companions_skip_gitea_destinations() {
        let mut config = Config::default();
        config.destinations = vec![DestinationConfig::Gitea(GiteaDestination {
            url: "http://127.0.0.1:1".to_string(),
            token: String::new(),
            token_file: String::new(),
            organization: String::new(),
            create_org: false,
            visibility: Default::default(),
            mirror_interval: "8h0m0s".to_string(),
            lfs: false,
            wiki: false,
        })];

        let engine = SyncEngine::new(config, RunContext::new(false))
            .with_cloner(Arc::new(MockCloner::new()))
            .with_auth(AuthResolver::with_home("/nonexistent"));

        let mut companion = repo("docs.wiki");
        companion.companion_of = Some("docs".to_string());

        let summary = engine.reconcile_all(vec![companion]).await;
        assert_eq!(summary.skipped_operations, 1);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_storage_dry_run_never_clones() {
        let mut config = Config::default();
        config.destinations = vec![DestinationConfig::Webdav(crate::config::WebdavDestination {
            url: "http://127.0.0.1:1/dav".to_string(),
            ..Default::default()
        })];

        let mut cloner = MockCloner::new();
        cloner.expect_clone_repo().never();

        let engine = SyncEngine::new(config, RunContext::new(true))
            .with_cloner(Arc::new(cloner))
            .with_auth(AuthResolver::with_home("/nonexistent"));

        let summary = engine.reconcile_all(vec![repo("a")]).await;
        assert_eq!(summary.successful_operations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_deadline_reports_failure() {
        let root = TempDir::new().unwrap();
        let mut config = config_with(root.path(), 1);
        config.sync.destination_timeout_secs = 1;

        let mut cloner = MockCloner::new();
        cloner.expect_clone_repo().returning(|_, _, _, _| {
            Err(GitError::new(GitErrorKind::Transient, "clone", "timeout"))
        });
        config.sync.retry_attempts = 3;
        config.sync.retry_delay_secs = 60;

        let engine = SyncEngine::new(config, RunContext::new(false))
            .with_cloner(Arc::new(cloner))
            .with_auth(AuthResolver::with_home("/nonexistent"));

        let summary = engine.reconcile_all(vec![repo("slow")]).await;
        assert_eq!(summary.failed_operations, 1);
        assert!(matches!(
            &summary.results[0].outcome,
            UnitOutcome::Failed(message) if message.contains("timed out")
        ));
    }

    /// Cloner that records how many clones into the same directory overlap
    #[derive(Default)]
    struct OverlapCounter {
        in_flight: std::sync::atomic::AtomicUsize,
        max_in_flight: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Cloner for OverlapCounter {
        async fn clone_repo(
            &self,
            _url: &str,
            _auth: &crate::auth::AuthMethod,
            target: &Path,
            _layout: crate::git::CloneLayout,
        ) -> Result<(), GitError> {
            use std::sync::atomic::Ordering;

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::create_dir_all(target).unwrap();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update(
            &self,
            _target: &Path,
            _auth: &crate::auth::AuthMethod,
            _layout: crate::git::CloneLayout,
        ) -> Result<crate::git::UpdateOutcome, GitError> {
            use std::sync::atomic::Ordering;

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(crate::git::UpdateOutcome::UpToDate)
        }

        async fn probe(&self, _url: &str, _auth: &crate::auth::AuthMethod) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_same_flat_path_from_different_owners_is_serialized() {
        let root = TempDir::new().unwrap();
        let mut config = config_with(root.path(), 1);
        config.sync.max_parallel = 4;

        let counter = Arc::new(OverlapCounter::default());
        let engine = SyncEngine::new(config, RunContext::new(false))
            .with_cloner(counter.clone())
            .with_auth(AuthResolver::with_home("/nonexistent"));

        let alice = Repo {
            owner: "alice".to_string(),
            ..repo("tool")
        };
        let bob = Repo {
            owner: "bob".to_string(),
            hoster: "gitea.example.org".to_string(),
            ..repo("tool")
        };

        let summary = engine.reconcile_all(vec![alice, bob]).await;

        assert_eq!(summary.successful_operations, 2);
        assert_eq!(
            counter
                .max_in_flight
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn test_target_key_follows_destination_layout() {
        let alice = Repo {
            owner: "alice".to_string(),
            ..repo("tool")
        };
        let bob = Repo {
            owner: "bob".to_string(),
            ..repo("tool")
        };

        let flat = DestinationConfig::Local(LocalDestination {
            path: "/srv".to_string(),
            ..LocalDestination::default()
        });
        assert_eq!(target_key(&alice, &flat), target_key(&bob, &flat));

        let structured = DestinationConfig::Local(LocalDestination {
            path: "/srv".to_string(),
            structured: true,
            ..LocalDestination::default()
        });
        assert_ne!(target_key(&alice, &structured), target_key(&bob, &structured));

        let storage = DestinationConfig::Webdav(crate::config::WebdavDestination {
            url: "http://dav".to_string(),
            path: "backups".to_string(),
            ..Default::default()
        });
        assert_eq!(target_key(&alice, &storage), "webdav:http://dav|backups/tool");
        assert_eq!(target_key(&alice, &storage), target_key(&bob, &storage));

        let gitea = DestinationConfig::Gitea(GiteaDestination {
            url: "http://gitea".to_string(),
            token: String::new(),
            token_file: String::new(),
            organization: String::new(),
            create_org: true,
            visibility: Default::default(),
            mirror_interval: "8h0m0s".to_string(),
            lfs: false,
            wiki: false,
        });
        assert_eq!(target_key(&alice, &gitea), "gitea:http://gitea|alice/tool");
        assert_ne!(target_key(&alice, &gitea), target_key(&bob, &gitea));
    }

    #[tokio::test]
    async fn test_target_locks_are_shared_per_key() {
        let locks = TargetLocks::default();
        let first = locks.lock_for("local:/x|github.com/acme/a");
        let second = locks.lock_for("local:/x|github.com/acme/a");
        let other = locks.lock_for("local:/x|github.com/acme/b");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));

        let _held = first.lock().await;
        assert!(second.try_lock().is_err());
        assert!(other.try_lock().is_ok());
    }
}
