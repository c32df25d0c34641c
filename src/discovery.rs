//! Repository discovery abstraction layer
//!
//! Provider adapters implement [`Discovery`] and only report raw descriptors.
//! [`DiscoveryPipeline`] runs every configured source through its adapter, the
//! [`FilterEngine`], and wiki companion derivation, and hands back the ordered
//! list of [`Repo`] values the reconcilers work on.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::{resolve_token, AuthResolver};
use crate::config::{Provider, SourceConfig};
use crate::events::{Event, RunContext};
use crate::filter::{Decision, FilterEngine};
use crate::git::Cloner;
use crate::repo::{get_host, name_from_url, owner_from_url, RawRepo, Repo};

/// What an adapter found for one source block
#[derive(Debug, Clone, Default)]
pub struct SourceListing {
    pub repos: Vec<RawRepo>,

    /// False when the adapter does not handle this kind of source
    pub configured: bool,

    /// Host identifier stamped onto every resulting [`Repo`]
    pub hoster: String,

    /// Resolved token for cloning, empty if none
    pub token: String,
}

impl SourceListing {
    pub fn not_configured() -> Self {
        Self::default()
    }
}

/// Trait for repository discovery from various providers
///
/// Implement this trait to add support for new git hosting providers.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Provider name for display/logging
    fn provider_name(&self) -> &'static str;

    /// Raw repositories of `source`
    async fn discover(&self, source: &SourceConfig) -> Result<SourceListing>;

    /// Language breakdown, fetched only when a language allow-list needs it
    async fn languages(&self, _source: &SourceConfig, _raw: &RawRepo) -> Result<Vec<(String, u64)>> {
        Ok(Vec::new())
    }

    /// Issues keyed by number, fetched when the source asks for them
    async fn issues(
        &self,
        _source: &SourceConfig,
        _raw: &RawRepo,
    ) -> Result<BTreeMap<u64, serde_json::Value>> {
        Ok(BTreeMap::new())
    }
}

/// Plain clone URLs with no hosting API behind them (`provider: any`)
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticDiscovery;

#[async_trait]
impl Discovery for StaticDiscovery {
    fn provider_name(&self) -> &'static str {
        "any"
    }

    async fn discover(&self, source: &SourceConfig) -> Result<SourceListing> {
        if source.provider != Provider::Any {
            return Ok(SourceListing::not_configured());
        }

        let urls = source.static_urls();
        let hoster = urls.first().map(|url| get_host(url)).unwrap_or_default();
        let token = resolve_token(&source.token, &source.token_file)?;

        let repos = urls
            .iter()
            .map(|url| {
                let ssh = url.starts_with("git@") || url.starts_with("ssh://");
                RawRepo {
                    name: name_from_url(url),
                    clone_url: url.clone(),
                    ssh_url: if ssh { url.clone() } else { String::new() },
                    owner: owner_from_url(url),
                    hoster: Some(get_host(url)),
                    ..RawRepo::default()
                }
            })
            .collect();

        Ok(SourceListing {
            repos,
            configured: true,
            hoster,
            token,
        })
    }
}

/// Derive the wiki/docs companion of an accepted repository.
///
/// Only when the source asks for wikis, the provider reports wiki content, and the
/// companion remote actually answers.
pub async fn derive_companion(
    repo: &Repo,
    raw: &RawRepo,
    cloner: &dyn Cloner,
    auth: &AuthResolver,
) -> Option<Repo> {
    if !repo.origin.wiki || !raw.has_wiki {
        return None;
    }

    let companion = repo.companion();
    let method = match auth.resolve(&companion) {
        Ok(method) => method,
        Err(e) => {
            warn!(stage = "discover", repo = %companion.full_name(), "Skipping companion: {}", e);
            return None;
        }
    };

    if cloner.probe(companion.clone_url(), &method).await {
        debug!(stage = "discover", repo = %companion.full_name(), "Companion repository found");
        Some(companion)
    } else {
        debug!(stage = "discover", repo = %companion.full_name(), "Companion repository not reachable");
        None
    }
}

/// Runs every configured source through its adapter and the filter engine
pub struct DiscoveryPipeline {
    adapters: Vec<Arc<dyn Discovery>>,
    cloner: Arc<dyn Cloner>,
    auth: AuthResolver,
    ctx: RunContext,
}

impl DiscoveryPipeline {
    pub fn new(cloner: Arc<dyn Cloner>, auth: AuthResolver, ctx: RunContext) -> Self {
        Self {
            adapters: Vec::new(),
            cloner,
            auth,
            ctx,
        }
    }

    pub fn add_adapter(&mut self, adapter: Arc<dyn Discovery>) {
        self.adapters.push(adapter);
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Discovery>) -> Self {
        self.add_adapter(adapter);
        self
    }

    /// Discover, filter and normalize every source.
    ///
    /// A failing source is logged and skipped; the others still contribute.
    pub async fn run(&self, sources: &[SourceConfig], now: DateTime<Utc>) -> Vec<Repo> {
        let mut repos = Vec::new();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();

        for source in sources {
            let origin = Arc::new(source.clone());
            let mut handled = false;

            for adapter in &self.adapters {
                let listing = match adapter.discover(source).await {
                    Ok(listing) => listing,
                    Err(e) => {
                        warn!(
                            stage = "discover",
                            source = %source.label(),
                            "Failed to discover from {}: {:#}",
                            adapter.provider_name(),
                            e
                        );
                        handled = true;
                        continue;
                    }
                };
                if !listing.configured {
                    continue;
                }
                handled = true;

                info!(
                    stage = "discover",
                    source = %source.label(),
                    "Discovered {} repositories from {}",
                    listing.repos.len(),
                    adapter.provider_name()
                );

                for found in self
                    .accept_all(adapter.as_ref(), &origin, &listing, now)
                    .await
                {
                    let key = (found.hoster.clone(), found.owner.clone(), found.name.clone());
                    if seen.insert(key) {
                        repos.push(found);
                    }
                }
            }

            if !handled {
                warn!(
                    stage = "discover",
                    source = %source.label(),
                    "No discovery adapter handles provider {:?}",
                    source.provider
                );
            }
        }

        repos
    }

    async fn accept_all(
        &self,
        adapter: &dyn Discovery,
        origin: &Arc<SourceConfig>,
        listing: &SourceListing,
        now: DateTime<Utc>,
    ) -> Vec<Repo> {
        let engine = FilterEngine::new(origin);
        let mut accepted = Vec::new();

        for raw in &listing.repos {
            let mut raw = raw.clone();
            let full_name = format!("{}/{}", raw.owner, raw.name);

            if engine.needs_languages() && raw.has_metadata && raw.languages.is_none() {
                match adapter.languages(origin, &raw).await {
                    Ok(languages) => raw.languages = Some(languages),
                    Err(e) => warn!(stage = "filter", repo = %full_name, "Failed to fetch languages: {:#}", e),
                }
            }

            if let Decision::Reject(reason) = engine.evaluate(&raw, now) {
                self.ctx.emit(Event::RepoFiltered {
                    repo: full_name,
                    reason: reason.to_string(),
                });
                continue;
            }

            self.ctx.emit(Event::RepoDiscovered {
                repo: full_name.clone(),
                source: origin.label(),
            });

            let mut repo = Repo::from_raw(&raw, &listing.hoster, &listing.token, origin.clone());
            if origin.issues {
                match adapter.issues(origin, &raw).await {
                    Ok(issues) => repo.issues = Some(issues),
                    Err(e) => warn!(stage = "discover", repo = %full_name, "Failed to fetch issues: {:#}", e),
                }
            }

            let companion = derive_companion(&repo, &raw, self.cloner.as_ref(), &self.auth).await;
            accepted.push(repo);
            if let Some(companion) = companion {
                self.ctx.emit(Event::RepoDiscovered {
                    repo: companion.full_name(),
                    source: origin.label(),
                });
                accepted.push(companion);
            }
        }

        accepted
    }
}
