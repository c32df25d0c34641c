//! Common test utilities and helpers for RepoWarden tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

use repowarden::auth::AuthMethod;
use repowarden::git::{CloneLayout, Cloner, GitError, GitErrorKind, UpdateOutcome};

/// Scratch directory holding a config file and destination roots
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("repowarden");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        Self {
            temp_dir,
            config_dir,
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.config_dir.join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Static source with two repositories, one excluded, mirrored to a local root
    pub fn create_static_config(&self, root: &Path) -> PathBuf {
        let config_content = format!(
            r#"
sources:
  - provider: any
    url: "https://git.example.com/acme/tool.git"
    urls:
      - "https://git.example.com/acme/lib.git"
      - "https://git.example.com/acme/scratch.git"
    exclude: ["scratch"]
destinations:
  - kind: local
    path: "{}"
sync:
  retry_attempts: 1
  retry_delay_secs: 0
"#,
            root.display()
        );
        self.create_test_config(&config_content)
    }
}

/// In-process [`Cloner`] that writes a fixed file set instead of talking to a remote
#[derive(Default)]
pub struct FakeCloner {
    pub files: Vec<(String, String)>,
    /// URLs whose clone fails, with the failure kind
    pub failures: Vec<(String, GitErrorKind)>,
    calls: Mutex<Vec<String>>,
}

impl FakeCloner {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn failing(mut self, url: &str, kind: GitErrorKind) -> Self {
        self.failures.push((url.to_string(), kind));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl Cloner for FakeCloner {
    async fn clone_repo(
        &self,
        url: &str,
        _auth: &AuthMethod,
        target: &Path,
        _layout: CloneLayout,
    ) -> Result<(), GitError> {
        self.record(format!("clone {}", url));

        if let Some((_, kind)) = self.failures.iter().find(|(failing, _)| failing == url) {
            return Err(GitError::new(*kind, "clone", "simulated failure"));
        }

        for (path, content) in &self.files {
            let file = target.join(path);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GitError::new(GitErrorKind::Fatal, "clone", e.to_string()))?;
            }
            std::fs::write(&file, content)
                .map_err(|e| GitError::new(GitErrorKind::Fatal, "clone", e.to_string()))?;
        }
        std::fs::create_dir_all(target)
            .map_err(|e| GitError::new(GitErrorKind::Fatal, "clone", e.to_string()))?;
        Ok(())
    }

    async fn update(
        &self,
        target: &Path,
        _auth: &AuthMethod,
        _layout: CloneLayout,
    ) -> Result<UpdateOutcome, GitError> {
        self.record(format!("update {}", target.display()));
        Ok(UpdateOutcome::UpToDate)
    }

    async fn probe(&self, url: &str, _auth: &AuthMethod) -> bool {
        self.record(format!("probe {}", url));
        true
    }
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
