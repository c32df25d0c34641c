//! Declarative repository filtering
//!
//! [`FilterEngine`] is built once per source and then evaluated against every raw
//! repository of that source. Evaluation is a pure function of the raw descriptor,
//! the source configuration and the supplied clock.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::config::SourceConfig;
use crate::duration::Staleness;
use crate::repo::RawRepo;

/// Why a repository was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReason {
    /// Named in the include list, which overrides exclude and org filters
    IncludeList,
    /// Passed every filter
    Default,
}

/// Why a repository was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Fork,
    Archived,
    Language { primary: String },
    Stars { stars: u32, minimum: u32 },
    Stale,
    ExcludeList,
    OrgNotIncluded { owner: String },
    OrgExcluded { owner: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Fork => write!(f, "repository is a fork"),
            RejectReason::Archived => write!(f, "repository is archived"),
            RejectReason::Language { primary } => {
                write!(f, "primary language '{}' not in allow-list", primary)
            }
            RejectReason::Stars { stars, minimum } => {
                write!(f, "{} stars is below the minimum of {}", stars, minimum)
            }
            RejectReason::Stale => write!(f, "no activity within the configured window"),
            RejectReason::ExcludeList => write!(f, "name is in the exclude list"),
            RejectReason::OrgNotIncluded { owner } => {
                write!(f, "owner '{}' is not in the org include list", owner)
            }
            RejectReason::OrgExcluded { owner } => {
                write!(f, "owner '{}' is in the org exclude list", owner)
            }
        }
    }
}

/// Outcome of evaluating one raw repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept(AcceptReason),
    Reject(RejectReason),
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accept(_))
    }
}

/// Precompiled filter set of one source
#[derive(Debug, Clone)]
pub struct FilterEngine {
    exclude_forks: bool,
    exclude_archived: bool,
    languages: HashSet<String>,
    min_stars: u32,
    staleness: Staleness,
    include: HashSet<String>,
    exclude: HashSet<String>,
    include_orgs: HashSet<String>,
    exclude_orgs: HashSet<String>,
}

impl FilterEngine {
    /// Build the filter set for a source.
    ///
    /// An unparseable staleness string is logged and treated as "no time restriction".
    pub fn new(source: &SourceConfig) -> Self {
        let staleness = match Staleness::parse(&source.filter.last_activity) {
            Ok(staleness) => staleness,
            Err(e) => {
                warn!(
                    stage = "filter",
                    source = %source.label(),
                    value = %source.filter.last_activity,
                    "Ignoring invalid last_activity filter: {:#}",
                    e
                );
                Staleness::unlimited()
            }
        };

        let set = |items: &[String]| -> HashSet<String> { items.iter().cloned().collect() };

        Self {
            exclude_forks: source.filter.exclude_forks,
            exclude_archived: source.filter.exclude_archived,
            languages: source
                .filter
                .languages
                .iter()
                .map(|l| l.to_lowercase())
                .collect(),
            min_stars: source.filter.stars,
            staleness,
            include: set(&source.include),
            exclude: set(&source.exclude),
            include_orgs: set(&source.include_orgs),
            exclude_orgs: set(&source.exclude_orgs),
        }
    }

    /// Whether language data must be fetched before evaluating
    pub fn needs_languages(&self) -> bool {
        !self.languages.is_empty()
    }

    /// Evaluate one raw repository. The first matching rule decides.
    pub fn evaluate(&self, raw: &RawRepo, now: DateTime<Utc>) -> Decision {
        if self.exclude_forks && raw.fork {
            return Decision::Reject(RejectReason::Fork);
        }

        if self.exclude_archived && raw.archived {
            return Decision::Reject(RejectReason::Archived);
        }

        // Statically configured URLs carry no metadata to judge
        if raw.has_metadata {
            if self.needs_languages() {
                // Repositories without language data are not rejected
                if let Some(primary) = raw.primary_language() {
                    if !self.languages.contains(&primary) {
                        return Decision::Reject(RejectReason::Language { primary });
                    }
                }
            }

            if raw.stars < self.min_stars {
                return Decision::Reject(RejectReason::Stars {
                    stars: raw.stars,
                    minimum: self.min_stars,
                });
            }

            if !self.staleness.is_unlimited() {
                let stale = match raw.last_activity {
                    Some(last_activity) => self.staleness.is_stale(last_activity, now),
                    None => true,
                };
                if stale {
                    return Decision::Reject(RejectReason::Stale);
                }
            }
        }

        if self.include.contains(&raw.name) {
            return Decision::Accept(AcceptReason::IncludeList);
        }

        if self.exclude.contains(&raw.name) {
            return Decision::Reject(RejectReason::ExcludeList);
        }

        if !self.include_orgs.is_empty() && !self.include_orgs.contains(&raw.owner) {
            return Decision::Reject(RejectReason::OrgNotIncluded {
                owner: raw.owner.clone(),
            });
        }

        if self.exclude_orgs.contains(&raw.owner) {
            return Decision::Reject(RejectReason::OrgExcluded {
                owner: raw.owner.clone(),
            });
        }

        Decision::Accept(AcceptReason::Default)
    }
}
