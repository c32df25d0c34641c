//! WebDAV backend
//!
//! Keys map onto URLs below the configured base. Listing walks collections with
//! `PROPFIND` at depth 1, one level per request, since many servers refuse
//! `Depth: infinity`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::events::Event as XmlEvent;
use quick_xml::reader::Reader;
use reqwest::{Method, StatusCode};
use std::time::Duration;
use url::Url;
use tracing::debug;

use super::{encode_segment, percent_decode, ObjectStore, StorageError, StorageErrorKind};
use crate::config::{resolve_secret, WebdavDestination};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

pub struct WebDavStore {
    http: reqwest::Client,
    base: Url,
    credentials: Option<(String, String)>,
}

impl WebDavStore {
    pub fn new(config: &WebdavDestination, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(config.url.trim_end_matches('/'))
            .with_context(|| format!("Invalid WebDAV URL: {}", config.url))?;
        // Url::join treats a base without trailing slash as a file
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build WebDAV HTTP client")?;

        let credentials = (!config.username.is_empty() && !config.password.is_empty())
            .then(|| (config.username.clone(), resolve_secret(&config.password)));

        Ok(Self {
            http,
            base,
            credentials,
        })
    }

    fn url_for(&self, key: &str, collection: bool) -> Result<Url, StorageError> {
        let mut encoded = key
            .split('/')
            .filter(|s| !s.is_empty())
            .map(encode_segment)
            .collect::<Vec<_>>()
            .join("/");
        if collection && !encoded.is_empty() {
            encoded.push('/');
        }

        self.base.join(&encoded).map_err(|e| {
            StorageError::new(StorageErrorKind::Permanent, "resolve", key, e.to_string())
        })
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        url: Url,
        key: &str,
        depth: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, StorageError> {
        let mut request = self.http.request(method, url);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(depth) = depth {
            request = request
                .header("Depth", depth)
                .header(reqwest::header::CONTENT_TYPE, "application/xml");
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::new(transport_kind(&e), operation, key, e.to_string()))
    }

    /// Keys and collection flags directly below `key`
    async fn propfind(&self, key: &str) -> Result<Vec<(String, bool)>, StorageError> {
        let method = custom_method("PROPFIND", key)?;
        let url = self.url_for(key, true)?;
        let response = self
            .send(
                "list",
                method,
                url,
                key,
                Some("1"),
                Some(PROPFIND_BODY.as_bytes().to_vec()),
            )
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            return Err(status_error("list", key, status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| StorageError::new(transport_kind(&e), "list", key, e.to_string()))?;

        let base_path = percent_decode(self.base.path());
        let requested = key.trim_matches('/');

        let entries = parse_multistatus(&body)
            .map_err(|e| {
                StorageError::new(
                    StorageErrorKind::Permanent,
                    "list",
                    key,
                    format!("malformed multistatus response: {}", e),
                )
            })?
            .into_iter()
            .filter_map(|(href, collection)| {
                let path = href_path(&href);
                let relative = percent_decode(&path)
                    .strip_prefix(base_path.as_str())?
                    .trim_matches('/')
                    .to_string();
                (relative != requested && !relative.is_empty()).then_some((relative, collection))
            })
            .collect();

        Ok(entries)
    }
}

#[async_trait]
impl ObjectStore for WebDavStore {
    fn name(&self) -> String {
        format!("webdav:{}", self.base)
    }

    fn needs_collections(&self) -> bool {
        true
    }

    async fn make_collection(&self, key: &str) -> Result<(), StorageError> {
        let method = custom_method("MKCOL", key)?;
        let url = self.url_for(key, true)?;
        let response = self.send("mkcol", method, url, key, None, None).await?;

        match response.status() {
            // 405: collection already exists
            s if s.is_success() || s == StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            s => Err(status_error("mkcol", key, s)),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let url = self.url_for(key, false)?;
        let response = self.send("put", Method::PUT, url, key, None, Some(body)).await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            s => Err(status_error("put", key, s)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut pending = vec![prefix.trim_matches('/').to_string()];

        while let Some(collection) = pending.pop() {
            for (key, is_collection) in self.propfind(&collection).await? {
                if is_collection {
                    pending.push(key);
                } else {
                    keys.push(key);
                }
            }
        }

        debug!(stage = "list", prefix = %prefix, found = keys.len(), "WebDAV listing finished");
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let url = self.url_for(key, false)?;
        let response = self.send("delete", Method::DELETE, url, key, None, None).await?;

        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(status_error("delete", key, s)),
        }
    }
}

fn custom_method(name: &str, key: &str) -> Result<Method, StorageError> {
    Method::from_bytes(name.as_bytes()).map_err(|e| {
        StorageError::new(StorageErrorKind::Permanent, "request", key, e.to_string())
    })
}

fn transport_kind(error: &reqwest::Error) -> StorageErrorKind {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        StorageErrorKind::Transient
    } else {
        match error.status() {
            Some(status) if status.is_client_error() => StorageErrorKind::Permanent,
            _ => StorageErrorKind::Transient,
        }
    }
}

fn status_error(operation: &'static str, key: &str, status: StatusCode) -> StorageError {
    let kind = if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StorageErrorKind::Transient
    } else {
        StorageErrorKind::Permanent
    };
    StorageError::new(kind, operation, key, format!("unexpected status {}", status))
}

/// Path component of an href, which servers send either absolute or as a full URL
fn href_path(href: &str) -> String {
    match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    }
}

/// `(href, is_collection)` for every `<response>` in a multistatus body.
///
/// Elements are matched by local name, so any namespace prefix works.
pub(crate) fn parse_multistatus(body: &str) -> Result<Vec<(String, bool)>, quick_xml::Error> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut href: Option<String> = None;
    let mut collection = false;
    let mut in_href = false;

    loop {
        match reader.read_event()? {
            XmlEvent::Start(element) => match element.local_name().as_ref() {
                b"response" => {
                    href = None;
                    collection = false;
                }
                b"href" => in_href = true,
                b"collection" => collection = true,
                _ => {}
            },
            XmlEvent::Empty(element) => {
                if element.local_name().as_ref() == b"collection" {
                    collection = true;
                }
            }
            XmlEvent::Text(text) if in_href => {
                href.get_or_insert_with(String::new)
                    .push_str(text.unescape()?.trim());
            }
            XmlEvent::End(element) => match element.local_name().as_ref() {
                b"href" => in_href = false,
                b"response" => {
                    if let Some(target) = href.take() {
                        entries.push((target, collection));
                    }
                }
                _ => {}
            },
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}
