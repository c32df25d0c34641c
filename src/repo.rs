//! Canonical repository model
//!
//! Discovery adapters produce [`RawRepo`] values straight from a provider. Those are
//! filtered and normalized into [`Repo`], the provider-independent unit every
//! reconciler works on.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SourceConfig;

/// Repository descriptor as reported by a provider, before filtering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRepo {
    pub name: String,
    pub clone_url: String,
    pub ssh_url: String,
    pub default_branch: String,
    pub owner: String,
    pub description: String,
    pub stars: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub fork: bool,
    pub archived: bool,
    pub private: bool,
    pub has_wiki: bool,

    /// Language breakdown in the order the provider returned it.
    ///
    /// Only fetched when a language allow-list is configured.
    pub languages: Option<Vec<(String, u64)>>,

    /// False for statically configured URLs that carry no provider metadata
    pub has_metadata: bool,

    /// Host of this entry when it differs from the listing's host
    pub hoster: Option<String>,
}

impl RawRepo {
    /// Language with the largest share, lower-cased.
    ///
    /// Ties go to the first language seen with the maximum share. Providers do not
    /// guarantee an order, so ties are not deterministic across providers.
    pub fn primary_language(&self) -> Option<String> {
        let mut best: Option<(&str, u64)> = None;
        for (language, share) in self.languages.as_deref().unwrap_or_default() {
            if best.map_or(true, |(_, top)| *share > top) {
                best = Some((language.as_str(), *share));
            }
        }
        best.map(|(language, _)| language.to_lowercase())
    }
}

/// Provider-independent unit of work handed to reconcilers
#[derive(Debug, Clone)]
pub struct Repo {
    pub name: String,
    pub url: String,
    pub ssh_url: String,

    /// Resolved token, empty when the source has none
    pub token: String,
    pub default_branch: String,
    pub description: String,
    pub private: bool,
    pub owner: String,

    /// Host of the originating service, e.g. "github.com"
    pub hoster: String,

    /// Source block this repository was discovered from
    pub origin: Arc<SourceConfig>,

    /// Issue payloads keyed by issue number
    pub issues: Option<BTreeMap<u64, serde_json::Value>>,

    /// Parent repository name when this is a wiki/docs companion
    pub companion_of: Option<String>,
}

impl Repo {
    pub fn from_raw(raw: &RawRepo, hoster: &str, token: &str, origin: Arc<SourceConfig>) -> Self {
        Self {
            name: raw.name.clone(),
            url: raw.clone_url.clone(),
            ssh_url: raw.ssh_url.clone(),
            token: token.to_string(),
            default_branch: raw.default_branch.clone(),
            description: raw.description.clone(),
            private: raw.private,
            owner: raw.owner.clone(),
            hoster: raw.hoster.as_deref().unwrap_or(hoster).to_string(),
            origin,
            issues: None,
            companion_of: None,
        }
    }

    /// Get display name (owner/name format)
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// URL git should clone from, honouring the source's SSH preference
    pub fn clone_url(&self) -> &str {
        if self.origin.ssh && !self.ssh_url.is_empty() {
            &self.ssh_url
        } else {
            &self.url
        }
    }

    pub fn is_companion(&self) -> bool {
        self.companion_of.is_some()
    }

    /// Path relative to a destination root
    pub fn relative_path(&self, structured: bool) -> PathBuf {
        if structured {
            PathBuf::from(&self.hoster).join(&self.owner).join(&self.name)
        } else {
            PathBuf::from(&self.name)
        }
    }

    /// Object key prefix for storage destinations.
    ///
    /// An explicit `path` wins over the structured layout.
    pub fn storage_prefix(&self, path: &str, structured: bool) -> String {
        let base = path.trim_matches('/');
        if !base.is_empty() {
            format!("{}/{}", base, self.name)
        } else if structured {
            format!("{}/{}/{}", self.hoster, self.owner, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Wiki or docs companion of this repository
    pub fn companion(&self) -> Repo {
        let (name_suffix, url_suffix) = companion_suffixes(&self.hoster);
        Repo {
            name: format!("{}{}", self.name, name_suffix),
            url: with_companion_suffix(&self.url, url_suffix),
            ssh_url: if self.ssh_url.is_empty() {
                String::new()
            } else {
                with_companion_suffix(&self.ssh_url, url_suffix)
            },
            issues: None,
            companion_of: Some(self.name.clone()),
            ..self.clone()
        }
    }
}

/// Name and URL suffixes of the companion repository on a given host
pub fn companion_suffixes(hoster: &str) -> (&'static str, &'static str) {
    if hoster.contains("onedev") {
        ("-docs", "-docs")
    } else {
        (".wiki", ".wiki.git")
    }
}

/// Replace a trailing `.git` with `suffix`, or append it
pub fn with_companion_suffix(url: &str, suffix: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let base = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    format!("{}{}", base, suffix)
}

/// Host part of an HTTP(S) or scp-style SSH URL
pub fn get_host(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let without_user = without_scheme
        .split_once('@')
        .filter(|(user, _)| !user.contains('/'))
        .map_or(without_scheme, |(_, rest)| rest);

    without_user
        .split(|c| c == '/' || c == ':')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Repository name from the last path segment of a clone URL
pub fn name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

/// Owner segment (second to last) of a clone URL
pub fn owner_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let mut segments = trimmed.rsplit(|c| c == '/' || c == ':');
    segments.next();
    match segments.next() {
        Some(owner) if !owner.is_empty() && !owner.contains('.') && !owner.contains('@') => {
            owner.to_string()
        }
        _ => String::new(),
    }
}
