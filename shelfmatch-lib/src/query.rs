//! Query image input
//!
//! A query image can arrive as raw bytes, a `data:image/...;base64,` URI,
//! an http(s) URL, or a local file path. Whatever the form, it is decoded
//! up front so a bad image is rejected before any search work starts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::DynamicImage;
use reqwest::StatusCode;

use crate::embed::decode_image;
use crate::{Error, Result};

/// Fetches image bytes by URL
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`ImageFetcher`] over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| Error::InvalidInput(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    /// Wrap an existing client, applying `timeout` to each request.
    #[must_use]
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// The same client with a different per-request timeout.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            client: self.client.clone(),
            timeout,
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::InvalidInput(format!("failed to fetch image: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::InvalidInput(format!(
                "failed to fetch image: {}",
                status.as_u16()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::InvalidInput(format!("failed to read image body: {e}")))
    }
}

/// A decoded query image together with its original bytes.
///
/// The bytes are forwarded to providers untouched; the decoded image feeds
/// the embedder.
#[derive(Debug, Clone)]
pub struct QueryImage {
    bytes: Arc<Vec<u8>>,
    image: Arc<DynamicImage>,
}

impl QueryImage {
    /// Decode raw bytes, failing with `InvalidInput` if they are not an image.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let image = decode_image(&bytes)?;
        Ok(Self {
            bytes: Arc::new(bytes),
            image: Arc::new(image),
        })
    }

    /// Resolve a data URI, http(s) URL, or file path into a query image.
    pub async fn from_reference(reference: &str, fetcher: &dyn ImageFetcher) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Error::InvalidInput("no image provided".to_string()));
        }

        let bytes = if starts_with_ignore_case(reference, "data:") {
            decode_data_uri(reference)
                .ok_or_else(|| Error::InvalidInput("invalid data URI".to_string()))?
        } else if starts_with_ignore_case(reference, "http://")
            || starts_with_ignore_case(reference, "https://")
        {
            fetcher.fetch(reference).await?
        } else {
            tokio::fs::read(Path::new(reference)).await.map_err(|e| {
                Error::InvalidInput(format!("failed to read image {reference}: {e}"))
            })?
        };

        Self::from_bytes(bytes)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn image(&self) -> Arc<DynamicImage> {
        Arc::clone(&self.image)
    }
}

/// Decode `data:image/<type>;base64,<payload>`, returning `None` for any
/// other shape or an invalid payload.
#[must_use]
pub fn decode_data_uri(uri: &str) -> Option<Vec<u8>> {
    const PREFIX: &str = "data:image/";
    const MARKER: &str = ";base64,";

    if !starts_with_ignore_case(uri, PREFIX) {
        return None;
    }
    let lower = uri.to_ascii_lowercase();
    let marker = lower[PREFIX.len()..].find(MARKER)? + PREFIX.len();
    let subtype = &uri[PREFIX.len()..marker];
    if subtype.is_empty() || subtype.contains(';') {
        return None;
    }

    STANDARD.decode(uri[marker + MARKER.len()..].trim()).ok()
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
