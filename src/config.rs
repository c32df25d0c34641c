use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for RepoWarden
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Where repositories are discovered
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Where discovered repositories are mirrored to
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,

    /// Concurrency, retry and timeout settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Optional schedule for `repowarden daemon`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Kind of discovery adapter backing a source block
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Github,
    /// Plain clone URLs without any hosting API behind them
    Any,
}

/// One configured source block
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct SourceConfig {
    #[serde(default)]
    pub provider: Provider,

    /// Literal token, or the name of an environment variable holding it
    #[serde(default)]
    pub token: String,

    #[serde(default, alias = "tokenfile")]
    pub token_file: String,

    /// Account whose repositories are enumerated (authenticated user if empty)
    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Clone over SSH instead of HTTPS
    #[serde(default)]
    pub ssh: bool,

    #[serde(default, alias = "sshkey")]
    pub ssh_key: String,

    /// API base URL for hosted providers, clone URL for `any`
    #[serde(default)]
    pub url: String,

    /// Additional clone URLs for `any` sources
    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default, alias = "includeorgs")]
    pub include_orgs: Vec<String>,

    #[serde(default, alias = "excludeorgs")]
    pub exclude_orgs: Vec<String>,

    #[serde(default)]
    pub starred: bool,

    #[serde(default)]
    pub wiki: bool,

    #[serde(default)]
    pub issues: bool,

    #[serde(default)]
    pub filter: FilterConfig,
}

/// Metadata filters applied to every raw repository of a source
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct FilterConfig {
    /// Minimum star count
    #[serde(default)]
    pub stars: u32,

    /// Maximum staleness, e.g. "1y", "6M", "30d12h". "0" means unlimited.
    #[serde(default, alias = "lastactivity")]
    pub last_activity: String,

    /// Case-insensitive allow-list of primary languages
    #[serde(default)]
    pub languages: Vec<String>,

    #[serde(default, alias = "excludeforks")]
    pub exclude_forks: bool,

    #[serde(default, alias = "excludearchived")]
    pub exclude_archived: bool,
}

/// One configured destination, selected by its `kind` tag
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationConfig {
    Local(LocalDestination),
    Gitea(GiteaDestination),
    S3(S3Destination),
    Azure(AzureDestination),
    Webdav(WebdavDestination),
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct LocalDestination {
    pub path: String,

    /// Nest clones under `{hoster}/{owner}/{name}`
    #[serde(default)]
    pub structured: bool,

    #[serde(default)]
    pub bare: bool,

    #[serde(default)]
    pub mirror: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GiteaDestination {
    pub url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default, alias = "tokenfile")]
    pub token_file: String,

    /// Fixed owner for every mirror; overrides `create_org`
    #[serde(default)]
    pub organization: String,

    /// Create an organization named after the source owner when missing
    #[serde(default, alias = "createorg")]
    pub create_org: bool,

    #[serde(default)]
    pub visibility: VisibilityConfig,

    #[serde(default = "default_mirror_interval", alias = "mirrorinterval")]
    pub mirror_interval: String,

    #[serde(default)]
    pub lfs: bool,

    #[serde(default)]
    pub wiki: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VisibilityConfig {
    /// "private" or "public"
    #[serde(default = "default_visibility")]
    pub repositories: String,

    /// "private", "limited" or "public"
    #[serde(default = "default_visibility")]
    pub organizations: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct S3Destination {
    pub endpoint: String,
    pub bucket: String,

    #[serde(default, alias = "accesskey")]
    pub access_key: String,

    #[serde(default, alias = "secretkey")]
    pub secret_key: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_true", alias = "usessl")]
    pub use_ssl: bool,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub structured: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct AzureDestination {
    pub account: String,
    pub container: String,

    #[serde(default, alias = "accesskey")]
    pub access_key: String,

    /// Custom endpoint, e.g. an Azurite emulator
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub use_cli_credential: bool,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub structured: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct WebdavDestination {
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub structured: bool,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SyncConfig {
    /// Maximum (repo, destination) units in flight
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for every HTTP request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Overall deadline for one (repo, destination) unit in seconds
    #[serde(default = "default_destination_timeout")]
    pub destination_timeout_secs: u64,

    /// Attempts for local clone/update
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between local clone/update attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Daemon schedule
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Time between runs, e.g. "24h" or "30m"
    #[serde(default = "default_schedule_interval")]
    pub interval: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "json"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_mirror_interval() -> String {
    "8h0m0s".to_string()
}
fn default_visibility() -> String {
    "private".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_request_timeout() -> u64 {
    60
}
fn default_destination_timeout() -> u64 {
    1800
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    5
}
fn default_schedule_interval() -> String {
    "24h".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            repositories: default_visibility(),
            organizations: default_visibility(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            request_timeout_secs: default_request_timeout(),
            destination_timeout_secs: default_destination_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn destination_timeout(&self) -> Duration {
        Duration::from_secs(self.destination_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl SourceConfig {
    /// Every clone URL of an `any` source
    pub fn static_urls(&self) -> Vec<String> {
        std::iter::once(&self.url)
            .chain(self.urls.iter())
            .filter(|u| !u.trim().is_empty())
            .cloned()
            .collect()
    }

    /// Short label used in logs
    pub fn label(&self) -> String {
        match self.provider {
            Provider::Github if !self.user.is_empty() => format!("github:{}", self.user),
            Provider::Github => "github".to_string(),
            Provider::Any => "any".to_string(),
        }
    }
}

impl DestinationConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            DestinationConfig::Local(_) => "local",
            DestinationConfig::Gitea(_) => "gitea",
            DestinationConfig::S3(_) => "s3",
            DestinationConfig::Azure(_) => "azure",
            DestinationConfig::Webdav(_) => "webdav",
        }
    }

    /// Stable identifier used in logs and for per-target locking
    pub fn name(&self) -> String {
        match self {
            DestinationConfig::Local(d) => format!("local:{}", d.path),
            DestinationConfig::Gitea(d) => format!("gitea:{}", d.url),
            DestinationConfig::S3(d) => format!("s3:{}/{}", d.endpoint, d.bucket),
            DestinationConfig::Azure(d) => format!("azure:{}/{}", d.account, d.container),
            DestinationConfig::Webdav(d) => format!("webdav:{}", d.url),
        }
    }

    /// Storage destinations need a temporary working copy to upload from
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            DestinationConfig::S3(_) | DestinationConfig::Azure(_) | DestinationConfig::Webdav(_)
        )
    }
}

/// Resolve a credential that may name an environment variable.
///
/// A set, non-empty variable wins; anything else is taken literally.
pub fn resolve_secret(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    match std::env::var(value) {
        Ok(resolved) if !resolved.is_empty() => resolved,
        _ => value.to_string(),
    }
}

fn expand(value: &mut String, what: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    *value = shellexpand::full(value.as_str())
        .with_context(|| format!("Failed to expand {} path", what))?
        .into_owned();
    Ok(())
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::example();
            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repowarden").join("config.yml"))
    }

    /// Expand `~` and environment variables in filesystem paths
    pub fn expand_paths(&mut self) -> Result<()> {
        for source in &mut self.sources {
            expand(&mut source.ssh_key, "ssh_key")?;
            expand(&mut source.token_file, "token_file")?;
        }

        for destination in &mut self.destinations {
            match destination {
                DestinationConfig::Local(local) => expand(&mut local.path, "local destination")?,
                DestinationConfig::Gitea(gitea) => expand(&mut gitea.token_file, "token_file")?,
                _ => {}
            }
        }

        Ok(())
    }

    /// Problems that make parts of the configuration unusable.
    ///
    /// These are not fatal: the affected source or destination is skipped at run time.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (i, source) in self.sources.iter().enumerate() {
            if source.provider == Provider::Any && source.static_urls().is_empty() {
                problems.push(format!("sources[{}]: 'any' source without url", i));
            }
        }

        for (i, destination) in self.destinations.iter().enumerate() {
            let missing = match destination {
                DestinationConfig::Local(d) if d.path.trim().is_empty() => Some("path"),
                DestinationConfig::Gitea(d) if d.url.trim().is_empty() => Some("url"),
                DestinationConfig::S3(d) if d.endpoint.trim().is_empty() => Some("endpoint"),
                DestinationConfig::S3(d) if d.bucket.trim().is_empty() => Some("bucket"),
                DestinationConfig::Azure(d) if d.container.trim().is_empty() => Some("container"),
                DestinationConfig::Webdav(d) if d.url.trim().is_empty() => Some("url"),
                _ => None,
            };
            if let Some(field) = missing {
                problems.push(format!(
                    "destinations[{}] ({}): missing {}",
                    i,
                    destination.kind(),
                    field
                ));
            }
        }

        problems
    }

    /// Starter configuration written by `repowarden init`
    pub fn example() -> Self {
        Self {
            sources: vec![SourceConfig {
                provider: Provider::Github,
                token: "GITHUB_TOKEN".to_string(),
                ..SourceConfig::default()
            }],
            destinations: vec![DestinationConfig::Local(LocalDestination {
                path: "${HOME}/backups/repositories".to_string(),
                structured: true,
                bare: false,
                mirror: false,
            })],
            sync: SyncConfig::default(),
            schedule: None,
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn setup_test_config_dir() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("repowarden");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        (temp_dir, config_dir)
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert!(config.sources.is_empty());
        assert!(config.destinations.is_empty());
        assert_eq!(config.sync.max_parallel, 4);
        assert_eq!(config.sync.request_timeout_secs, 60);
        assert_eq!(config.sync.destination_timeout_secs, 1800);
        assert_eq!(config.sync.retry_attempts, 5);
        assert_eq!(config.sync.retry_delay(), Duration::from_secs(5));
        assert!(config.schedule.is_none());
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
sources:
  - provider: github
    token: MY_TOKEN_VAR
    user: octocat
    include: [proj1]
    exclude: [proj2]
    excludeorgs: [legacy]
    wiki: true
    filter:
      stars: 3
      lastactivity: 1y
      languages: [Rust, Go]
      excludeforks: true
  - provider: any
    url: https://example.com/team/tool.git
destinations:
  - kind: local
    path: /srv/mirrors
    structured: true
  - kind: gitea
    url: https://gitea.example.com
    token: abc
    create_org: true
  - kind: s3
    endpoint: minio.local:9000
    bucket: backups
    use_ssl: false
  - kind: webdav
    url: https://dav.example.com/remote.php/dav/files/me
    username: me
sync:
  max_parallel: 8
schedule:
  interval: 12h
logging:
  format: json
  color: false
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.sources.len(), 2);
        let github = &config.sources[0];
        assert_eq!(github.provider, Provider::Github);
        assert_eq!(github.exclude_orgs, vec!["legacy".to_string()]);
        assert_eq!(github.filter.stars, 3);
        assert_eq!(github.filter.last_activity, "1y");
        assert!(github.filter.exclude_forks);
        assert!(!github.filter.exclude_archived);
        assert_eq!(config.sources[1].provider, Provider::Any);

        assert_eq!(config.destinations.len(), 4);
        match &config.destinations[1] {
            DestinationConfig::Gitea(gitea) => {
                assert_eq!(gitea.mirror_interval, "8h0m0s");
                assert_eq!(gitea.visibility.repositories, "private");
                assert!(gitea.create_org);
            }
            other => panic!("expected gitea destination, got {:?}", other),
        }
        match &config.destinations[2] {
            DestinationConfig::S3(s3) => {
                assert!(!s3.use_ssl);
                assert_eq!(s3.region, "us-east-1");
            }
            other => panic!("expected s3 destination, got {:?}", other),
        }

        assert_eq!(config.sync.max_parallel, 8);
        assert_eq!(config.sync.retry_attempts, 5);
        assert_eq!(config.schedule.unwrap().interval, "12h");
        assert!(!config.logging.color);
    }

    #[test]
    fn test_unknown_destination_kind_is_rejected() {
        let yaml = "destinations:\n  - kind: ftp\n    url: ftp://example.com\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let (_temp_dir, config_dir) = setup_test_config_dir();
        let config_path = config_dir.join("config.yml");

        let mut config = Config::example();
        config.sync.max_parallel = 2;
        config.schedule = Some(ScheduleConfig {
            interval: "6h".to_string(),
        });
        if let DestinationConfig::Local(local) = &mut config.destinations[0] {
            local.path = "/custom/path".to_string();
        }

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.sync.max_parallel, 2);
        assert_eq!(loaded.sources, config.sources);
        assert_eq!(loaded.destinations, config.destinations);
        assert_eq!(loaded.schedule, config.schedule);
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_REPOWARDEN_HOME", "/test/home");

        let mut config = Config::default();
        config.destinations.push(DestinationConfig::Local(LocalDestination {
            path: "${TEST_REPOWARDEN_HOME}/mirrors".to_string(),
            ..LocalDestination::default()
        }));
        config.sources.push(SourceConfig {
            ssh_key: "${TEST_REPOWARDEN_HOME}/.ssh/id_ed25519".to_string(),
            ..SourceConfig::default()
        });

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(
            config.destinations[0],
            DestinationConfig::Local(LocalDestination {
                path: "/test/home/mirrors".to_string(),
                ..LocalDestination::default()
            })
        );
        assert_eq!(config.sources[0].ssh_key, "/test/home/.ssh/id_ed25519");

        env::remove_var("TEST_REPOWARDEN_HOME");
    }

    #[test]
    #[serial]
    fn test_resolve_secret_prefers_environment() {
        env::set_var("TEST_REPOWARDEN_TOKEN", "from-env");

        assert_eq!(resolve_secret("TEST_REPOWARDEN_TOKEN"), "from-env");
        assert_eq!(resolve_secret("ghp_literal"), "ghp_literal");
        assert_eq!(resolve_secret(""), "");

        env::remove_var("TEST_REPOWARDEN_TOKEN");
    }

    #[test]
    fn test_problems_reports_missing_fields() {
        let mut config = Config::default();
        config.sources.push(SourceConfig {
            provider: Provider::Any,
            ..SourceConfig::default()
        });
        config.destinations.push(DestinationConfig::Webdav(WebdavDestination::default()));

        let problems = config.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("'any' source without url"));
        assert!(problems[1].contains("webdav"));
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("repowarden"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }
}
