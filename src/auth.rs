//! Clone authentication
//!
//! Every backend that talks to a source repository (local clones, temporary
//! clones for storage destinations, remote mirror creation) resolves credentials
//! through [`AuthResolver`], so the decision cannot drift between them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::config::resolve_secret;
use crate::repo::Repo;

/// Username sent alongside a token for HTTP basic authentication
pub const TOKEN_USERNAME: &str = "oauth2";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("SSH key not found at {}", path.display())]
    KeyMissing { path: PathBuf },

    #[error("SSH key at {} is not readable: {source}", path.display())]
    KeyUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH key at {} is not a PEM or OpenSSH private key", path.display())]
    KeyInvalid { path: PathBuf },

    #[error("token file {} is not readable: {source}", path.display())]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot locate home directory for the default SSH key")]
    NoHomeDirectory,
}

/// How git authenticates against a source remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    SshKey { key_path: PathBuf },
    Bearer { username: String, token: String },
    Basic { username: String, password: String },
    Anonymous,
}

impl AuthMethod {
    pub fn describe(&self) -> &'static str {
        match self {
            AuthMethod::SshKey { .. } => "ssh-key",
            AuthMethod::Bearer { .. } => "token",
            AuthMethod::Basic { .. } => "basic",
            AuthMethod::Anonymous => "anonymous",
        }
    }

    /// Username/password pair for HTTP transports
    pub fn http_credentials(&self) -> Option<(&str, &str)> {
        match self {
            AuthMethod::Bearer { username, token } => Some((username, token)),
            AuthMethod::Basic { username, password } => Some((username, password)),
            _ => None,
        }
    }

    /// Environment applied to every git invocation.
    ///
    /// HTTP credentials travel as an `http.extraHeader` injected through
    /// `GIT_CONFIG_*` so they never show up in the process list or in `.git/config`.
    pub fn git_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];

        match self {
            AuthMethod::SshKey { key_path } => {
                env.push(("GIT_SSH_COMMAND".to_string(), ssh_command(key_path)));
            }
            AuthMethod::Bearer { .. } | AuthMethod::Basic { .. } => {
                if let Some((username, password)) = self.http_credentials() {
                    let encoded = STANDARD.encode(format!("{}:{}", username, password));
                    env.push(("GIT_CONFIG_COUNT".to_string(), "1".to_string()));
                    env.push(("GIT_CONFIG_KEY_0".to_string(), "http.extraHeader".to_string()));
                    env.push((
                        "GIT_CONFIG_VALUE_0".to_string(),
                        format!("Authorization: Basic {}", encoded),
                    ));
                }
            }
            AuthMethod::Anonymous => {}
        }

        env
    }
}

fn ssh_command(key_path: &Path) -> String {
    let quoted = key_path.to_string_lossy().replace('\'', r"'\''");
    format!(
        "ssh -i '{}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new -o BatchMode=yes",
        quoted
    )
}

/// Resolve a token given literally, by environment variable name, or from a file
pub fn resolve_token(token: &str, token_file: &str) -> Result<String, AuthError> {
    if !token.is_empty() {
        return Ok(resolve_secret(token));
    }

    if token_file.is_empty() {
        return Ok(String::new());
    }

    let path = PathBuf::from(token_file);
    let content = std::fs::read_to_string(&path).map_err(|source| AuthError::TokenFile {
        path: path.clone(),
        source,
    })?;

    Ok(content.trim().to_string())
}

/// Picks the authentication method for a repository's origin
#[derive(Debug, Clone, Default)]
pub struct AuthResolver {
    home: Option<PathBuf>,
}

impl AuthResolver {
    pub fn new() -> Self {
        Self {
            home: dirs::home_dir(),
        }
    }

    /// Resolver with an explicit home directory for the default key lookup
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
        }
    }

    /// Decide how to authenticate a clone of `repo`.
    ///
    /// SSH sources need a readable key; failure there is fatal and never retried.
    pub fn resolve(&self, repo: &Repo) -> Result<AuthMethod, AuthError> {
        let origin = &repo.origin;

        if origin.ssh {
            let key_path = self.key_path(&origin.ssh_key)?;
            check_key(&key_path)?;
            debug!(repo = %repo.full_name(), key = %key_path.display(), "Using SSH key authentication");
            return Ok(AuthMethod::SshKey { key_path });
        }

        Ok(self.resolve_http(repo))
    }

    /// Credentials for HTTP transports only.
    ///
    /// Used where a third party performs the transfer (a hosting service pulling a
    /// mirror) and a local SSH key is of no use.
    pub fn resolve_http(&self, repo: &Repo) -> AuthMethod {
        let origin = &repo.origin;

        if !repo.token.is_empty() {
            return AuthMethod::Bearer {
                username: TOKEN_USERNAME.to_string(),
                token: repo.token.clone(),
            };
        }

        if !origin.username.is_empty() && !origin.password.is_empty() {
            return AuthMethod::Basic {
                username: origin.username.clone(),
                password: resolve_secret(&origin.password),
            };
        }

        AuthMethod::Anonymous
    }

    fn key_path(&self, configured: &str) -> Result<PathBuf, AuthError> {
        if !configured.is_empty() {
            return Ok(PathBuf::from(configured));
        }

        self.home
            .as_ref()
            .map(|home| home.join(".ssh").join("id_rsa"))
            .ok_or(AuthError::NoHomeDirectory)
    }
}

/// Verify that `path` holds something git can use as a private key
pub fn check_key(path: &Path) -> Result<(), AuthError> {
    if !path.is_file() {
        return Err(AuthError::KeyMissing {
            path: path.to_path_buf(),
        });
    }

    let contents = std::fs::read_to_string(path).map_err(|source| AuthError::KeyUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    // Covers PEM (RSA, EC, PKCS#8) and the OpenSSH container format
    let header = contents.trim_start().lines().next().unwrap_or_default();
    if header.starts_with("-----BEGIN ") && header.ends_with("PRIVATE KEY-----") {
        Ok(())
    } else {
        Err(AuthError::KeyInvalid {
            path: path.to_path_buf(),
        })
    }
}
