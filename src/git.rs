//! Git transport primitive
//!
//! [`Cloner`] is the only place that talks to git. [`GitClient`] drives the git
//! command line and turns its stderr into a [`GitErrorKind`] once, so every
//! reconciler sees the same classification.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::auth::AuthMethod;

/// Classification of a failed git transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitErrorKind {
    /// Worth retrying: network hiccups, corrupted working copies, unknown failures
    Transient,
    /// The remote refuses access or does not exist (e.g. "not exported")
    AccessDenied,
    /// The remote exists but has no commits yet
    EmptyRemote,
    /// Retrying cannot help: bad credentials, host key mismatch, local I/O failure
    Fatal,
}

#[derive(Debug, Error)]
#[error("git {operation} failed: {message}")]
pub struct GitError {
    pub kind: GitErrorKind,
    pub operation: &'static str,
    pub message: String,
}

impl GitError {
    pub fn new(kind: GitErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    /// Benign absence: the repository is legitimately unavailable or empty
    pub fn is_benign(&self) -> bool {
        matches!(self.kind, GitErrorKind::AccessDenied | GitErrorKind::EmptyRemote)
    }
}

/// Shape of the local clone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloneLayout {
    #[default]
    WorkingTree,
    Bare,
    Mirror,
}

impl CloneLayout {
    pub fn from_flags(bare: bool, mirror: bool) -> Self {
        if mirror {
            CloneLayout::Mirror
        } else if bare {
            CloneLayout::Bare
        } else {
            CloneLayout::WorkingTree
        }
    }

    pub fn is_bare(&self) -> bool {
        !matches!(self, CloneLayout::WorkingTree)
    }
}

/// Result of updating an existing clone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Updated,
}

/// Transfer primitive used by every reconciler that needs a copy of a repository
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Cloner: Send + Sync {
    /// Clone `url` into `target`, creating parent directories as needed
    async fn clone_repo(
        &self,
        url: &str,
        auth: &AuthMethod,
        target: &Path,
        layout: CloneLayout,
    ) -> Result<(), GitError>;

    /// Fetch/pull all remotes of an existing clone
    async fn update(
        &self,
        target: &Path,
        auth: &AuthMethod,
        layout: CloneLayout,
    ) -> Result<UpdateOutcome, GitError>;

    /// Cheap reachability check: does the remote answer with a HEAD ref
    async fn probe(&self, url: &str, auth: &AuthMethod) -> bool;
}

/// [`Cloner`] backed by the `git` command line
#[derive(Debug, Clone)]
pub struct GitClient {
    program: String,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitClient {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// Use a specific git binary
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Whether the git binary can be executed
    pub async fn is_available(&self) -> bool {
        AsyncCommand::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn run(
        &self,
        operation: &'static str,
        args: &[&str],
        target: Option<&Path>,
        cwd: Option<&Path>,
        auth: &AuthMethod,
    ) -> Result<GitOutput, GitError> {
        let mut command = AsyncCommand::new(&self.program);
        command
            .args(args)
            .envs(auth.git_env())
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(target) = target {
            command.arg(target);
        }
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(|e| {
            GitError::new(
                GitErrorKind::Fatal,
                operation,
                format!("failed to execute {}: {}", self.program, e),
            )
        })?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl Cloner for GitClient {
    async fn clone_repo(
        &self,
        url: &str,
        auth: &AuthMethod,
        target: &Path,
        layout: CloneLayout,
    ) -> Result<(), GitError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GitError::new(
                    GitErrorKind::Fatal,
                    "clone",
                    format!("failed to create {}: {}", parent.display(), e),
                )
            })?;
        }

        let mut args = vec!["clone", "--quiet"];
        match layout {
            CloneLayout::WorkingTree => {}
            CloneLayout::Bare => args.push("--bare"),
            CloneLayout::Mirror => args.push("--mirror"),
        }
        args.push("--");
        args.push(url);

        debug!(stage = "clone", url = %url, target = %target.display(), "Running git clone");

        let output = self.run("clone", &args, Some(target), None, auth).await?;
        if !output.success {
            return Err(GitError::new(classify(&output.stderr), "clone", output.stderr.trim()));
        }

        info!(stage = "clone", url = %url, "Cloned into {}", target.display());
        Ok(())
    }

    async fn update(
        &self,
        target: &Path,
        auth: &AuthMethod,
        layout: CloneLayout,
    ) -> Result<UpdateOutcome, GitError> {
        let args: &[&str] = if layout.is_bare() {
            &["fetch", "--all", "--prune"]
        } else {
            &["pull", "--all", "--ff-only"]
        };

        let output = self.run("update", args, None, Some(target), auth).await?;
        if !output.success {
            return Err(GitError::new(classify(&output.stderr), "update", output.stderr.trim()));
        }

        let outcome = parse_update_output(layout, &output.stdout, &output.stderr);
        debug!(stage = "update", target = %target.display(), ?outcome, "git update finished");
        Ok(outcome)
    }

    async fn probe(&self, url: &str, auth: &AuthMethod) -> bool {
        match self
            .run("probe", &["ls-remote", "--", url, "HEAD"], None, None, auth)
            .await
        {
            Ok(output) => output.success && !output.stdout.trim().is_empty(),
            Err(e) => {
                debug!(stage = "probe", url = %url, "Probe failed: {}", e);
                false
            }
        }
    }
}

/// Map git's stderr onto an error kind. Commands run with `LC_ALL=C`.
pub fn classify(stderr: &str) -> GitErrorKind {
    let lower = stderr.to_lowercase();

    const FATAL: &[&str] = &[
        "host key verification failed",
        "permission denied (publickey",
        "authentication failed",
        "invalid username or password",
        "could not read username",
        "could not read password",
    ];
    const ACCESS_DENIED: &[&str] = &[
        "not exported",
        "access denied",
        "repository not found",
        "does not appear to be a git repository",
    ];
    // Updates of a clone taken while the remote had no commits fail on the missing ref
    const EMPTY: &[&str] = &[
        "remote repository is empty",
        "empty repository",
        "no such ref was fetched",
        "couldn't find remote ref",
        "no tracking information for the current branch",
    ];

    if FATAL.iter().any(|needle| lower.contains(needle)) {
        GitErrorKind::Fatal
    } else if EMPTY.iter().any(|needle| lower.contains(needle)) {
        GitErrorKind::EmptyRemote
    } else if ACCESS_DENIED.iter().any(|needle| lower.contains(needle)) {
        GitErrorKind::AccessDenied
    } else {
        GitErrorKind::Transient
    }
}

fn parse_update_output(layout: CloneLayout, stdout: &str, stderr: &str) -> UpdateOutcome {
    if layout.is_bare() {
        // `fetch` reports ref updates on stderr as "old..new  ref -> ref"
        let changed = stderr.lines().any(|line| line.contains("->"));
        if changed {
            UpdateOutcome::Updated
        } else {
            UpdateOutcome::UpToDate
        }
    } else if stdout.contains("Already up to date") || stdout.contains("Already up-to-date") {
        UpdateOutcome::UpToDate
    } else {
        UpdateOutcome::Updated
    }
}
