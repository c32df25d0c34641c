//! System health checks for RepoWarden
//!
//! Preflight checks behind `repowarden doctor`, verifying the system and the
//! configuration before any run.

use std::path::{Path, PathBuf};

use crate::config::{Config, DestinationConfig};

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Sources, destinations and their settings
    pub configuration: CheckResult,
    /// Root directories of local destinations
    pub local_roots: CheckResult,
    /// Keys of SSH sources
    pub ssh: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self::run_with_home(config, dirs::home_dir().as_deref())
    }

    /// Run all checks, resolving default SSH keys below `home`
    pub fn run_with_home(config: &Config, home: Option<&Path>) -> Self {
        Self {
            git: Self::check_git("git"),
            configuration: Self::check_configuration(config),
            local_roots: Self::check_local_roots(config),
            ssh: Self::check_ssh_keys(config, home),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, check)| check.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        [&self.git, &self.configuration, &self.local_roots, &self.ssh]
            .into_iter()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        [&self.git, &self.configuration, &self.local_roots, &self.ssh]
            .into_iter()
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check git installation
    fn check_git(program: &str) -> CheckResult {
        match std::process::Command::new(program).arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    fn check_configuration(config: &Config) -> CheckResult {
        let mut problems = Vec::new();
        if config.sources.is_empty() {
            problems.push("no sources configured".to_string());
        }
        if config.destinations.is_empty() {
            problems.push("no destinations configured".to_string());
        }
        problems.extend(config.problems());

        if problems.is_empty() {
            CheckResult::ok_with_details(
                "Configuration is complete",
                format!(
                    "{} source(s), {} destination(s)",
                    config.sources.len(),
                    config.destinations.len()
                ),
            )
        } else {
            CheckResult::error_with_details("Configuration has problems", problems.join("\n"))
        }
    }

    /// Missing roots are created by the first clone, so they only warn
    fn check_local_roots(config: &Config) -> CheckResult {
        let roots: Vec<&str> = config
            .destinations
            .iter()
            .filter_map(|destination| match destination {
                DestinationConfig::Local(local) => Some(local.path.as_str()),
                _ => None,
            })
            .collect();

        if roots.is_empty() {
            return CheckResult::ok("No local destinations");
        }

        let mut missing = Vec::new();
        for root in &roots {
            let path = Path::new(root);
            if path.exists() && !path.is_dir() {
                return CheckResult::error_with_details(
                    "Local destination is not a directory",
                    root.to_string(),
                );
            }
            if !path.exists() {
                missing.push(format!("Run: mkdir -p {}", root));
            }
        }

        if missing.is_empty() {
            CheckResult::ok_with_details("Local destinations exist", roots.join(", "))
        } else {
            CheckResult::warning_with_details(
                "Local destination does not exist yet",
                missing.join("\n"),
            )
        }
    }

    fn check_ssh_keys(config: &Config, home: Option<&Path>) -> CheckResult {
        let mut keys = Vec::new();
        let mut missing = Vec::new();

        for source in config.sources.iter().filter(|s| s.ssh) {
            let key = if source.ssh_key.is_empty() {
                match home {
                    Some(home) => home.join(".ssh").join("id_rsa"),
                    None => {
                        missing.push(format!("{}: no home directory for the default key", source.label()));
                        continue;
                    }
                }
            } else {
                PathBuf::from(&source.ssh_key)
            };

            match crate::auth::check_key(&key) {
                Ok(()) => keys.push(key.display().to_string()),
                Err(e) => missing.push(format!("{}: {}", source.label(), e)),
            }
        }

        if !missing.is_empty() {
            CheckResult::error_with_details("SSH key not usable", missing.join("\n"))
        } else if keys.is_empty() {
            CheckResult::ok("No SSH sources")
        } else {
            CheckResult::ok_with_details("SSH keys found", keys.join(", "))
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Git Installation", &self.git),
            ("Configuration", &self.configuration),
            ("Local Destinations", &self.local_roots),
            ("SSH Keys", &self.ssh),
        ]
    }
}
