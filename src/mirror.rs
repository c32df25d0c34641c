//! Remote hosting mirrors (Gitea-compatible API)
//!
//! Each call to [`MirrorReconciler::backup`] takes exactly one small step toward
//! the desired state: create the mirror, fix its sync interval, or trigger a sync.
//! A crash between runs therefore always leaves a state the next run can resume from.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::auth::{resolve_token, AuthMethod, AuthResolver};
use crate::config::GiteaDestination;
use crate::duration::{format_go_duration, parse_go_duration};
use crate::events::RunContext;
use crate::repo::Repo;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cannot encode request body for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl MirrorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MirrorError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteRepo {
    pub name: String,
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub mirror_interval: String,
}

/// Body of a migrate-as-mirror request
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrateRequest {
    pub clone_addr: String,
    pub repo_name: String,
    pub repo_owner: String,
    pub mirror: bool,
    pub private: bool,
    pub description: String,
    pub wiki: bool,
    pub lfs: bool,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_interval: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_password: String,
}

/// Operations the reconciler needs from a hosting service
#[async_trait]
pub trait MirrorHost: Send + Sync {
    async fn current_user(&self) -> Result<RemoteUser, MirrorError>;
    async fn org_exists(&self, name: &str) -> Result<bool, MirrorError>;
    async fn create_org(&self, name: &str, visibility: &str) -> Result<(), MirrorError>;
    async fn find_repo(&self, owner: &str, name: &str) -> Result<Option<RemoteRepo>, MirrorError>;
    async fn migrate(&self, request: &MigrateRequest) -> Result<(), MirrorError>;
    async fn delete_repo(&self, owner: &str, name: &str) -> Result<(), MirrorError>;
    async fn set_mirror_interval(&self, owner: &str, name: &str, interval: &str) -> Result<(), MirrorError>;
    async fn mirror_sync(&self, owner: &str, name: &str) -> Result<(), MirrorError>;
}

/// Gitea/Forgejo REST client
pub struct GiteaClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GiteaClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("repowarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, MirrorError> {
        let url = self.url(path);
        let mut request = self.http.request(method.clone(), &url);
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("token {}", self.token));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|source| MirrorError::Transport {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(MirrorError::Status {
            method,
            url,
            status,
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, MirrorError> {
        let response = self.send(Method::GET, path, None).await?;
        response.json::<T>().await.map_err(|source| MirrorError::Decode {
            url: self.url(path),
            source,
        })
    }
}

fn encode_body<T: Serialize>(path: &str, value: &T) -> Result<serde_json::Value, MirrorError> {
    serde_json::to_value(value).map_err(|source| MirrorError::Encode {
        path: path.to_string(),
        source,
    })
}

#[async_trait]
impl MirrorHost for GiteaClient {
    async fn current_user(&self) -> Result<RemoteUser, MirrorError> {
        self.get_json("/user").await
    }

    async fn org_exists(&self, name: &str) -> Result<bool, MirrorError> {
        match self.send(Method::GET, &format!("/orgs/{}", name), None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_org(&self, name: &str, visibility: &str) -> Result<(), MirrorError> {
        let body = serde_json::json!({ "username": name, "visibility": visibility });
        self.send(Method::POST, "/orgs", Some(body)).await.map(|_| ())
    }

    async fn find_repo(&self, owner: &str, name: &str) -> Result<Option<RemoteRepo>, MirrorError> {
        match self.get_json(&format!("/repos/{}/{}", owner, name)).await {
            Ok(repo) => Ok(Some(repo)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn migrate(&self, request: &MigrateRequest) -> Result<(), MirrorError> {
        let body = encode_body("/repos/migrate", request)?;
        self.send(Method::POST, "/repos/migrate", Some(body))
            .await
            .map(|_| ())
    }

    async fn delete_repo(&self, owner: &str, name: &str) -> Result<(), MirrorError> {
        self.send(Method::DELETE, &format!("/repos/{}/{}", owner, name), None)
            .await
            .map(|_| ())
    }

    async fn set_mirror_interval(&self, owner: &str, name: &str, interval: &str) -> Result<(), MirrorError> {
        let body = serde_json::json!({ "mirror_interval": interval });
        self.send(Method::PATCH, &format!("/repos/{}/{}", owner, name), Some(body))
            .await
            .map(|_| ())
    }

    async fn mirror_sync(&self, owner: &str, name: &str) -> Result<(), MirrorError> {
        self.send(Method::POST, &format!("/repos/{}/{}/mirror-sync", owner, name), None)
            .await
            .map(|_| ())
    }
}

/// The single step taken by one backup call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorAction {
    DryRun,
    Created,
    IntervalUpdated { from: String, to: String },
    Synced,
    /// A repository of that name exists but is not a mirror; left untouched
    NotAMirror,
    /// Wiki/docs companions are not mirrored to hosting services
    SkippedCompanion,
}

pub struct MirrorReconciler {
    host: Arc<dyn MirrorHost>,
    destination: GiteaDestination,
    auth: AuthResolver,
    ctx: RunContext,
}

impl MirrorReconciler {
    pub fn new(
        host: Arc<dyn MirrorHost>,
        destination: GiteaDestination,
        auth: AuthResolver,
        ctx: RunContext,
    ) -> Self {
        Self {
            host,
            destination,
            auth,
            ctx,
        }
    }

    /// Build a reconciler talking to the destination's Gitea instance
    pub fn for_gitea(
        destination: &GiteaDestination,
        auth: AuthResolver,
        ctx: RunContext,
        request_timeout: Duration,
    ) -> Result<Self> {
        let token = resolve_token(&destination.token, &destination.token_file)
            .context("Failed to resolve Gitea token")?;
        let client = GiteaClient::new(&destination.url, &token, request_timeout)?;
        Ok(Self::new(Arc::new(client), destination.clone(), auth, ctx))
    }

    /// Converge the mirror of `repo`. Never fails past this call; failures are
    /// logged and reported as `false`.
    pub async fn backup(&self, repo: &Repo) -> bool {
        match self.step(repo).await {
            Ok(action) => {
                info!(
                    stage = "mirror",
                    url = %self.destination.url,
                    repo = %repo.full_name(),
                    ?action,
                    "Mirror reconciled"
                );
                true
            }
            Err(e) => {
                error!(
                    stage = "mirror",
                    url = %self.destination.url,
                    repo = %repo.full_name(),
                    "Mirror failed: {:#}",
                    e
                );
                false
            }
        }
    }

    /// Take one step and report which one it was
    pub async fn step(&self, repo: &Repo) -> Result<MirrorAction> {
        if repo.is_companion() {
            debug!(stage = "mirror", repo = %repo.full_name(), "Skipping companion repository");
            return Ok(MirrorAction::SkippedCompanion);
        }

        let user = self
            .host
            .current_user()
            .await
            .context("Failed to authenticate to mirror destination")?;

        let owner = self.resolve_owner(repo, &user).await?;

        if self.ctx.dry_run {
            info!(
                stage = "mirror",
                url = %self.destination.url,
                repo = %repo.full_name(),
                "Dry run: would mirror to {}/{}",
                owner,
                repo.name
            );
            return Ok(MirrorAction::DryRun);
        }

        let existing = self
            .host
            .find_repo(&owner, &repo.name)
            .await
            .context("Failed to look up destination repository")?;

        match existing {
            None => self.create(repo, &owner).await,
            Some(existing) => self.reconcile_existing(&owner, &existing).await,
        }
    }

    async fn resolve_owner(&self, repo: &Repo, user: &RemoteUser) -> Result<String> {
        let org = if !self.destination.organization.is_empty() {
            self.destination.organization.clone()
        } else if self.destination.create_org && !repo.owner.is_empty() {
            repo.owner.clone()
        } else {
            return Ok(user.login.clone());
        };

        if self
            .host
            .org_exists(&org)
            .await
            .with_context(|| format!("Failed to look up organization {}", org))?
        {
            return Ok(org);
        }

        if !self.destination.create_org {
            return Err(anyhow!("organization {} does not exist", org));
        }

        if self.ctx.dry_run {
            info!(stage = "mirror", org = %org, "Dry run: would create organization");
            return Ok(org);
        }

        self.host
            .create_org(&org, &self.destination.visibility.organizations)
            .await
            .with_context(|| format!("Failed to create organization {}", org))?;
        info!(stage = "mirror", org = %org, "Created organization");
        Ok(org)
    }

    fn configured_interval(&self) -> Option<Duration> {
        match parse_go_duration(&self.destination.mirror_interval) {
            Ok(interval) => Some(interval),
            Err(e) => {
                warn!(
                    stage = "mirror",
                    value = %self.destination.mirror_interval,
                    "Invalid mirror_interval: {:#}",
                    e
                );
                None
            }
        }
    }

    async fn create(&self, repo: &Repo, owner: &str) -> Result<MirrorAction> {
        let (auth_token, auth_username, auth_password) = match self.auth.resolve_http(repo) {
            AuthMethod::Bearer { token, .. } => (token, String::new(), String::new()),
            AuthMethod::Basic { username, password } => (String::new(), username, password),
            _ => (String::new(), String::new(), String::new()),
        };

        let request = MigrateRequest {
            clone_addr: repo.url.clone(),
            repo_name: repo.name.clone(),
            repo_owner: owner.to_string(),
            mirror: true,
            private: self.destination.visibility.repositories != "public",
            description: repo.description.clone(),
            wiki: self.destination.wiki,
            lfs: self.destination.lfs,
            service: "git".to_string(),
            mirror_interval: self.configured_interval().map(format_go_duration),
            auth_token,
            auth_username,
            auth_password,
        };

        if let Err(e) = self.host.migrate(&request).await {
            // The service may leave a half-created repository behind
            if let Err(cleanup) = self.host.delete_repo(owner, &repo.name).await {
                debug!(stage = "mirror", "Cleanup after failed migrate: {}", cleanup);
            }
            return Err(anyhow::Error::new(e).context("Failed to create mirror"));
        }

        Ok(MirrorAction::Created)
    }

    async fn reconcile_existing(&self, owner: &str, existing: &RemoteRepo) -> Result<MirrorAction> {
        if !existing.mirror {
            warn!(
                stage = "mirror",
                url = %self.destination.url,
                repo = %existing.name,
                "Destination repository exists and is not a mirror, leaving it alone"
            );
            return Ok(MirrorAction::NotAMirror);
        }

        let current = parse_go_duration(&existing.mirror_interval).ok();
        let desired = self.configured_interval().or(current);

        if let Some(desired) = desired {
            if current != Some(desired) {
                let to = format_go_duration(desired);
                self.host
                    .set_mirror_interval(owner, &existing.name, &to)
                    .await
                    .context("Failed to update mirror interval")?;
                return Ok(MirrorAction::IntervalUpdated {
                    from: existing.mirror_interval.clone(),
                    to,
                });
            }
        }

        self.host
            .mirror_sync(owner, &existing.name)
            .await
            .context("Failed to trigger mirror sync")?;
        Ok(MirrorAction::Synced)
    }
}
