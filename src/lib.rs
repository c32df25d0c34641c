//! RepoWarden - Repository discovery and mirror reconciliation
//!
//! RepoWarden discovers repositories across hosting services, decides which are
//! in scope through a declarative filter set, and converges every configured
//! destination to a mirror of each of them.
//!
//! ## Core Features
//!
//! - **Discovery**: GitHub API enumeration and static clone URLs
//! - **Filtering**: forks, archived, languages, stars, staleness, name and org lists
//! - **Local mirrors**: clone-or-update with retry and failure classification
//! - **Hosted mirrors**: Gitea pull mirrors with owner provisioning
//! - **Object storage**: S3, Azure Blob and WebDAV upload with pruning
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`discovery`] and [`github`]: Source adapters and the discovery pipeline
//! - [`filter`]: Filter evaluation
//! - [`auth`]: Clone authentication
//! - [`local`], [`mirror`], [`storage`]: Destination reconcilers
//! - [`sync`]: Fan-out, per-target serialization and the run summary

pub mod auth;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod duration;
pub mod events;
pub mod filter;
pub mod git;
pub mod github;
pub mod health;
pub mod local;
pub mod mirror;
pub mod repo;
pub mod storage;
pub mod sync;

pub use auth::{AuthMethod, AuthResolver};
pub use config::Config;
pub use daemon::Daemon;
pub use discovery::{Discovery, DiscoveryPipeline, StaticDiscovery};
pub use events::{Event, EventSink, RunContext};
pub use filter::{Decision, FilterEngine};
pub use git::{Cloner, GitClient, GitError, GitErrorKind};
pub use github::GitHubDiscovery;
pub use health::HealthCheck;
pub use repo::{RawRepo, Repo};
pub use sync::{SyncEngine, SyncSummary, UnitOutcome};
