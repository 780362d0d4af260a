//! External marketplace providers
//!
//! A provider takes the raw query image and returns candidate listings with
//! no similarity score. Responses are validated into [`ProviderItem`] at the
//! boundary; nothing downstream sees provider JSON except as the opaque
//! `raw` field.
//!
//! Candidates can be given a comparable score with [`score_candidates`],
//! which fetches and embeds each listing image concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::embed::{embed_bytes_blocking, SharedEmbedder, UnitVector};
use crate::query::ImageFetcher;
use crate::Result;

/// A provider listing validated into a fixed shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderItem {
    /// Listing id at the provider
    pub external_id: String,
    pub title: String,
    pub image_url: Option<String>,
    /// Price as displayed by the provider
    pub price: Option<String>,
    /// Link to the listing page
    pub detail_link: Option<String>,
    /// Host part of `detail_link`
    pub seller_domain: Option<String>,
    /// Unmodified provider payload for this listing
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Trait for image-search providers
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used to select the provider and to label its results
    fn name(&self) -> &str;

    /// Search the provider's catalog with raw image bytes
    ///
    /// Returns at most `limit` listings, in the provider's order.
    async fn search_by_image(&self, image: &[u8], limit: usize) -> Result<Vec<ProviderItem>>;
}

/// Bounds for candidate image fetching
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Maximum fetches in flight at once
    pub concurrency: usize,
    /// Per-fetch time limit
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Score provider items against the query by image similarity.
///
/// Each item's image is fetched, embedded and compared independently. An
/// item with no image, a failed or timed-out fetch, or an image that can not
/// be embedded scores 0.0; no single item can fail the batch. Output keeps
/// the input order.
pub async fn score_candidates(
    query: Arc<UnitVector>,
    items: Vec<ProviderItem>,
    embedder: SharedEmbedder,
    fetcher: Arc<dyn ImageFetcher>,
    options: FetchOptions,
) -> Vec<(ProviderItem, f32)> {
    let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));

    let tasks = items.into_iter().map(|item| {
        let query = Arc::clone(&query);
        let embedder = Arc::clone(&embedder);
        let fetcher = Arc::clone(&fetcher);
        let permits = Arc::clone(&permits);
        async move {
            let score = score_one(&item, query, embedder, fetcher, permits, options.timeout).await;
            (item, score)
        }
    });

    join_all(tasks).await
}

async fn score_one(
    item: &ProviderItem,
    query: Arc<UnitVector>,
    embedder: SharedEmbedder,
    fetcher: Arc<dyn ImageFetcher>,
    permits: Arc<Semaphore>,
    limit: Duration,
) -> f32 {
    let Some(url) = item.image_url.as_deref() else {
        return 0.0;
    };
    let Ok(_permit) = permits.acquire().await else {
        return 0.0;
    };

    let bytes = match timeout(limit, fetcher.fetch(url)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            debug!(url, error = %err, "candidate image fetch failed");
            return 0.0;
        }
        Err(_) => {
            warn!(url, timeout = ?limit, "candidate image fetch timed out");
            return 0.0;
        }
    };

    match embed_bytes_blocking(embedder, bytes).await {
        Ok(vector) => vector.dot(&query).unwrap_or_else(|err| {
            warn!(url, error = %err, "candidate embedding not comparable");
            0.0
        }),
        Err(err) => {
            debug!(url, error = %err, "candidate image could not be embedded");
            0.0
        }
    }
}

mod ebay;

pub use ebay::*;
