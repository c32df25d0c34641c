//! GitHub discovery adapter
//!
//! Enumerates the repositories of a GitHub (or GitHub Enterprise) source block:
//! the configured user's or the authenticated user's repositories, the
//! repositories of every organization in `include_orgs`, and optionally the
//! starred repositories.

use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::models::Repository;
use octocrab::Octocrab;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::resolve_token;
use crate::config::{Provider, SourceConfig};
use crate::discovery::{Discovery, SourceListing};
use crate::repo::{get_host, owner_from_url, RawRepo};

const PER_PAGE: u8 = 100;

/// GitHub client wrapper for one source block
#[derive(Clone)]
pub struct GitHubClient {
    client: Octocrab,
    token: String,
}

impl GitHubClient {
    pub fn new(source: &SourceConfig, timeout: Duration) -> Result<Self> {
        let token = resolve_token(&source.token, &source.token_file)
            .context("Failed to resolve GitHub token")?;

        let mut builder = Octocrab::builder()
            .set_connect_timeout(Some(timeout))
            .set_read_timeout(Some(timeout));

        if !source.url.is_empty() {
            builder = builder
                .base_uri(source.url.as_str())
                .with_context(|| format!("Invalid GitHub API URL: {}", source.url))?;
        }
        if !token.is_empty() {
            builder = builder.personal_token(token.clone());
        }

        let client = builder.build().context("Failed to create GitHub client")?;
        Ok(Self { client, token })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Repositories of the authenticated user, including private ones
    pub async fn list_user_repositories(&self) -> Result<Vec<Repository>> {
        debug!(stage = "discover", "Fetching repositories of the authenticated user");

        let mut repositories = Vec::new();
        for page in 1..=u8::MAX {
            let items = self
                .client
                .current()
                .list_repos_for_authenticated_user()
                .per_page(PER_PAGE)
                .page(page)
                .send()
                .await
                .with_context(|| format!("Failed to fetch repositories page {}", page))?
                .items;

            let last = items.len() < PER_PAGE as usize;
            repositories.extend(items);
            if last {
                break;
            }
        }

        Ok(repositories)
    }

    /// Public repositories of a named user
    pub async fn list_named_user_repositories(&self, user: &str) -> Result<Vec<Repository>> {
        debug!(stage = "discover", user = %user, "Fetching user repositories");

        let mut repositories = Vec::new();
        for page in 1..=u8::MAX {
            let items = self
                .client
                .users(user)
                .repos()
                .per_page(PER_PAGE)
                .page(page)
                .send()
                .await
                .with_context(|| format!("Failed to fetch repositories of {} page {}", user, page))?
                .items;

            let last = items.len() < PER_PAGE as usize;
            repositories.extend(items);
            if last {
                break;
            }
        }

        Ok(repositories)
    }

    /// List repositories for a specific organization
    pub async fn list_organization_repositories(&self, org: &str) -> Result<Vec<Repository>> {
        debug!(stage = "discover", org = %org, "Fetching organization repositories");

        let mut repositories = Vec::new();
        for page in 1..=u8::MAX {
            let items = self
                .client
                .orgs(org)
                .list_repos()
                .per_page(PER_PAGE)
                .page(page)
                .send()
                .await
                .with_context(|| {
                    format!("Failed to fetch repositories for organization {} page {}", org, page)
                })?
                .items;

            let last = items.len() < PER_PAGE as usize;
            repositories.extend(items);
            if last {
                break;
            }
        }

        Ok(repositories)
    }

    pub async fn list_starred_repositories(&self) -> Result<Vec<Repository>> {
        let mut repositories = Vec::new();
        for page in 1..=u8::MAX {
            let items = self
                .client
                .current()
                .list_repos_starred_by_authenticated_user()
                .per_page(PER_PAGE)
                .page(page)
                .send()
                .await
                .with_context(|| format!("Failed to fetch starred repositories page {}", page))?
                .items;

            let last = items.len() < PER_PAGE as usize;
            repositories.extend(items);
            if last {
                break;
            }
        }

        Ok(repositories)
    }

    pub async fn languages(&self, owner: &str, name: &str) -> Result<Vec<(String, u64)>> {
        let languages = self
            .client
            .repos(owner, name)
            .list_languages()
            .await
            .with_context(|| format!("Failed to fetch languages of {}/{}", owner, name))?;

        Ok(languages
            .into_iter()
            .map(|(language, bytes)| (language, bytes.max(0) as u64))
            .collect())
    }

    /// All issues (open and closed) keyed by number
    pub async fn issues(&self, owner: &str, name: &str) -> Result<BTreeMap<u64, serde_json::Value>> {
        let mut issues = BTreeMap::new();

        for page in 1..=u8::MAX {
            let items = self
                .client
                .issues(owner, name)
                .list()
                .state(octocrab::params::State::All)
                .per_page(PER_PAGE)
                .page(page)
                .send()
                .await
                .with_context(|| format!("Failed to fetch issues of {}/{} page {}", owner, name, page))?
                .items;

            let last = items.len() < PER_PAGE as usize;
            for issue in items {
                let value = serde_json::to_value(&issue)
                    .with_context(|| format!("Failed to encode issue #{}", issue.number))?;
                issues.insert(issue.number, value);
            }
            if last {
                break;
            }
        }

        Ok(issues)
    }
}

/// Convert an API repository into the provider-neutral raw descriptor
pub fn to_raw(repo: &Repository, fallback_owner: &str) -> RawRepo {
    let clone_url = repo
        .clone_url
        .as_ref()
        .map(|u| u.to_string())
        .unwrap_or_default();

    let owner = repo
        .owner
        .as_ref()
        .map(|o| o.login.clone())
        .or_else(|| Some(owner_from_url(&clone_url)).filter(|o| !o.is_empty()))
        .unwrap_or_else(|| fallback_owner.to_string());

    RawRepo {
        name: repo.name.clone(),
        clone_url,
        ssh_url: repo.ssh_url.clone().unwrap_or_default(),
        default_branch: repo.default_branch.clone().unwrap_or_default(),
        owner,
        description: repo.description.clone().unwrap_or_default(),
        stars: repo.stargazers_count.unwrap_or(0),
        last_activity: repo.pushed_at.or(repo.updated_at),
        fork: repo.fork.unwrap_or(false),
        archived: repo.archived.unwrap_or(false),
        private: repo.private.unwrap_or(false),
        has_wiki: repo.has_wiki.unwrap_or(false),
        languages: None,
        has_metadata: true,
        hoster: None,
    }
}

/// [`Discovery`] for `provider: github` sources
pub struct GitHubDiscovery {
    timeout: Duration,
    clients: Mutex<HashMap<String, GitHubClient>>,
}

impl GitHubDiscovery {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, source: &SourceConfig) -> Result<GitHubClient> {
        let key = format!("{}|{}|{}", source.url, source.token, source.token_file);
        if let Some(client) = self.clients.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(client);
        }

        let client = GitHubClient::new(source, self.timeout)?;
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(key, client.clone());
        }
        Ok(client)
    }

    fn hoster(source: &SourceConfig) -> String {
        if source.url.is_empty() {
            "github.com".to_string()
        } else {
            get_host(&source.url)
        }
    }
}

#[async_trait]
impl Discovery for GitHubDiscovery {
    fn provider_name(&self) -> &'static str {
        "GitHub"
    }

    async fn discover(&self, source: &SourceConfig) -> Result<SourceListing> {
        if source.provider != Provider::Github {
            return Ok(SourceListing::not_configured());
        }

        let client = self.client(source)?;
        let mut repositories = if !source.user.is_empty() {
            client.list_named_user_repositories(&source.user).await?
        } else {
            client.list_user_repositories().await?
        };

        for org in &source.include_orgs {
            match client.list_organization_repositories(org).await {
                Ok(org_repos) => repositories.extend(org_repos),
                Err(e) => {
                    warn!(stage = "discover", org = %org, "Failed to fetch organization repositories: {:#}", e);
                }
            }
        }

        if source.starred {
            repositories.extend(client.list_starred_repositories().await?);
        }

        let repos: Vec<RawRepo> = repositories
            .iter()
            .map(|repo| to_raw(repo, &source.user))
            .collect();

        info!(stage = "discover", source = %source.label(), "Found {} GitHub repositories", repos.len());

        Ok(SourceListing {
            repos,
            configured: true,
            hoster: Self::hoster(source),
            token: client.token().to_string(),
        })
    }

    async fn languages(&self, source: &SourceConfig, raw: &RawRepo) -> Result<Vec<(String, u64)>> {
        self.client(source)?.languages(&raw.owner, &raw.name).await
    }

    async fn issues(
        &self,
        source: &SourceConfig,
        raw: &RawRepo,
    ) -> Result<BTreeMap<u64, serde_json::Value>> {
        self.client(source)?.issues(&raw.owner, &raw.name).await
    }
}
