//! S3-compatible and Azure Blob backends
//!
//! Both are flat namespaces, so no collection handling is needed. The SDK's own
//! retries are disabled; [`super::Backoff`] is the only retry layer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore as RemoteStore, PutPayload, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

use super::{percent_decode, ObjectStore, StorageError, StorageErrorKind};
use crate::config::{resolve_secret, AzureDestination, S3Destination};

pub struct CloudStore {
    inner: Arc<dyn RemoteStore>,
    label: String,
}

impl CloudStore {
    pub fn new(inner: Arc<dyn RemoteStore>, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
        }
    }

    pub fn s3(config: &S3Destination, timeout: Duration) -> Result<Self> {
        let endpoint = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            let scheme = if config.use_ssl { "https" } else { "http" };
            format!("{}://{}", scheme, config.endpoint)
        };

        let mut builder = AmazonS3Builder::new()
            .with_endpoint(&endpoint)
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_allow_http(!config.use_ssl || endpoint.starts_with("http://"))
            .with_client_options(client_options(timeout))
            .with_retry(no_retries());

        if !config.access_key.is_empty() {
            builder = builder
                .with_access_key_id(resolve_secret(&config.access_key))
                .with_secret_access_key(resolve_secret(&config.secret_key));
        }
        if !config.token.is_empty() {
            builder = builder.with_token(resolve_secret(&config.token));
        }

        let store = builder
            .build()
            .with_context(|| format!("Failed to configure S3 bucket {} at {}", config.bucket, endpoint))?;

        Ok(Self::new(
            Arc::new(store),
            format!("s3:{}/{}", config.endpoint, config.bucket),
        ))
    }

    pub fn azure(config: &AzureDestination, timeout: Duration) -> Result<Self> {
        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(&config.account)
            .with_container_name(&config.container)
            .with_client_options(client_options(timeout))
            .with_retry(no_retries());

        if !config.access_key.is_empty() {
            builder = builder.with_access_key(resolve_secret(&config.access_key));
        }
        if config.use_cli_credential {
            builder = builder.with_use_azure_cli(true);
        }
        if !config.url.is_empty() {
            builder = builder
                .with_endpoint(config.url.clone())
                .with_allow_http(config.url.starts_with("http://"));
        }

        let store = builder.build().with_context(|| {
            format!(
                "Failed to configure Azure container {}/{}",
                config.account, config.container
            )
        })?;

        Ok(Self::new(
            Arc::new(store),
            format!("azure:{}/{}", config.account, config.container),
        ))
    }
}

fn client_options(timeout: Duration) -> ClientOptions {
    ClientOptions::new().with_timeout(timeout)
}

fn no_retries() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        ..RetryConfig::default()
    }
}

fn map_error(operation: &'static str, key: &str, error: object_store::Error) -> StorageError {
    let kind = match &error {
        object_store::Error::NotFound { .. }
        | object_store::Error::InvalidPath { .. }
        | object_store::Error::NotSupported { .. }
        | object_store::Error::AlreadyExists { .. }
        | object_store::Error::Precondition { .. } => StorageErrorKind::Permanent,
        other => classify_message(&other.to_string()),
    };
    StorageError::new(kind, operation, key, error.to_string())
}

/// Generic SDK errors only carry the HTTP outcome in their message
fn classify_message(message: &str) -> StorageErrorKind {
    let lower = message.to_lowercase();
    let permanent = [
        "client error",
        "status 4",
        "unauthorized",
        "forbidden",
        "access denied",
        "not implemented",
        "credential",
    ];

    if permanent.iter().any(|needle| lower.contains(needle)) {
        StorageErrorKind::Permanent
    } else {
        StorageErrorKind::Transient
    }
}

/// Key as written locally, undoing the SDK's path encoding
fn decode_location(location: &ObjectPath) -> String {
    location
        .parts()
        .map(|part| percent_decode(part.as_ref()))
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl ObjectStore for CloudStore {
    fn name(&self) -> String {
        self.label.clone()
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        self.inner
            .put(&ObjectPath::from(key), PutPayload::from(body))
            .await
            .map(|_| ())
            .map_err(|e| map_error("put", key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_matches('/');
        let location = ObjectPath::from(prefix);
        let scope = (!prefix.is_empty()).then_some(&location);

        let objects: Vec<object_store::ObjectMeta> = self
            .inner
            .list(scope)
            .try_collect()
            .await
            .map_err(|e| map_error("list", prefix, e))?;

        Ok(objects
            .iter()
            .map(|meta| decode_location(&meta.location))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.inner.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_error("delete", key, e)),
        }
    }
}
