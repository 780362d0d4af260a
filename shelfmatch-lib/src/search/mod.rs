//! High-level search interface
//!
//! Combines the embedder, the served index and the configured providers
//! into the three query entry points.
//!
//! # Usage
//!
//! ```ignore
//! use shelfmatch_lib::search::MatchEngine;
//!
//! let index = Arc::new(IndexHandle::new());
//! index.load_from("data/index".as_ref())?;
//!
//! let engine = MatchEngine::new(ClipEmbedder::new()?, index)
//!     .with_provider(Arc::new(EbayProvider::new(ebay_config)?));
//!
//! let query = QueryImage::from_reference("shoe.jpg", &fetcher).await?;
//! let local = engine.search_local(&query, 10).await?;
//! let merged = engine.search_combined(&query, 10, true).await?;
//! ```
//!
//! Degraded sources never fail a request on their own: a missing index or a
//! failing provider yields fewer results plus a `note` saying why. Only a
//! corrupt index is an error, because serving from it could attach the wrong
//! product to a confident score.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::build::{BuildReport, IndexBuilder, RebuildLock};
use crate::catalog::ProductRecord;
use crate::embed::{embed_image_blocking, ImageEmbedder, LockedEmbedder, SharedEmbedder, UnitVector};
use crate::provider::{score_candidates, FetchOptions, Provider};
use crate::query::{HttpFetcher, ImageFetcher, QueryImage};
use crate::rank::{rank, CandidateExtra, ScoredCandidate};
use crate::snapshot::{CatalogSnapshot, IndexHandle};
use crate::{Error, Result};

/// Note returned when no local index is being served
pub const NOTE_INDEX_UNAVAILABLE: &str = "local index not available; run the index command first";

/// Tuning for query handling
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Result count when the caller does not ask for one
    pub default_top_k: usize,
    /// Maximum concurrent provider image fetches per request
    pub fetch_concurrency: usize,
    /// Time limit per provider image fetch
    pub fetch_timeout: Duration,
    /// Time limit per provider search call, including auth
    pub provider_timeout: Duration,
    /// Time limit for the local exact search
    pub local_search_timeout: Duration,
    /// Base URL joined to server-relative thumbnail references
    pub public_base_url: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            fetch_concurrency: 8,
            fetch_timeout: Duration::from_secs(10),
            provider_timeout: Duration::from_secs(30),
            local_search_timeout: Duration::from_secs(5),
            public_base_url: None,
        }
    }
}

/// Result identifier: catalog id for local hits, listing id for providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResultId {
    Local(u64),
    External(String),
}

/// One result as handed to the serving layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub id: Option<ResultId>,
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
    pub score: f32,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seller_domain: Option<String>,
}

impl ResultRecord {
    fn from_candidate(candidate: ScoredCandidate, base_url: Option<&str>) -> Self {
        let score = candidate.effective_score();
        let source = candidate.source.label().to_string();
        let mut record = Self {
            id: candidate.id.map(ResultId::Local),
            name: candidate.title,
            image: candidate.image_ref,
            thumb: None,
            score,
            source,
            category: None,
            web_link: None,
            price_display: None,
            seller_domain: None,
        };

        match candidate.extra {
            CandidateExtra::Local {
                thumb_ref,
                category,
            } => {
                record.thumb = Some(absolute_thumb(&thumb_ref, base_url));
                record.category = Some(category);
            }
            CandidateExtra::Provider(item) => {
                if !item.external_id.is_empty() {
                    record.id = Some(ResultId::External(item.external_id));
                }
                record.web_link = item.detail_link;
                record.price_display = item.price;
                record.seller_domain = item.seller_domain;
            }
        }
        record
    }
}

/// Results of one query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ResultRecord>,
    /// Why results may be partial, if any source was degraded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SearchResponse {
    fn add_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        self.note = Some(match self.note.take() {
            Some(existing) => format!("{existing}; {note}"),
            None => note,
        });
    }
}

/// Query engine over the served index and external providers.
pub struct MatchEngine {
    embedder: SharedEmbedder,
    index: Arc<IndexHandle>,
    providers: Vec<Arc<dyn Provider>>,
    fetcher: Arc<dyn ImageFetcher>,
    /// The built-in fetcher, `None` once a custom one is set
    http_fetcher: Option<HttpFetcher>,
    config: SearchConfig,
    rebuild_lock: Arc<RebuildLock>,
}

impl MatchEngine {
    /// Create an engine with no providers, fetching provider images over
    /// HTTP.
    pub fn new<E: ImageEmbedder + 'static>(embedder: E, index: Arc<IndexHandle>) -> Result<Self> {
        let config = SearchConfig::default();
        let fetcher = HttpFetcher::new(config.fetch_timeout)?;
        Ok(Self {
            embedder: Arc::new(Mutex::new(embedder)),
            index,
            providers: Vec::new(),
            fetcher: Arc::new(fetcher.clone()),
            http_fetcher: Some(fetcher),
            config,
            rebuild_lock: Arc::new(RebuildLock::new()),
        })
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = fetcher;
        self.http_fetcher = None;
        self
    }

    /// Replace the tuning. The built-in HTTP fetcher picks up the new
    /// `fetch_timeout`; a fetcher set with [`with_fetcher`](Self::with_fetcher)
    /// is left as is.
    #[must_use]
    pub fn with_config(mut self, config: SearchConfig) -> Self {
        if let Some(http) = &self.http_fetcher {
            let http = http.with_timeout(config.fetch_timeout);
            self.fetcher = Arc::new(http.clone());
            self.http_fetcher = Some(http);
        }
        self.config = config;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    #[must_use]
    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    /// Fetcher used for provider images, also usable to resolve query URLs.
    #[must_use]
    pub fn fetcher(&self) -> &dyn ImageFetcher {
        self.fetcher.as_ref()
    }

    /// Names of the configured providers, in query order.
    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name())
    }

    /// Search the local catalog only.
    ///
    /// A missing or empty index gives an empty result with a note. A corrupt
    /// index is an error.
    pub async fn search_local(&self, query: &QueryImage, top_k: usize) -> Result<SearchResponse> {
        let mut response = SearchResponse::default();
        let Some(snapshot) = self.served_snapshot(&mut response)? else {
            return Ok(response);
        };

        let vector = self.query_vector(query).await?;
        let hits = degrade_local(self.local_hits(snapshot, vector, top_k).await, &mut response)?;
        response.results = hits
            .into_iter()
            .map(|(record, score)| self.to_record(ScoredCandidate::local(record, score)))
            .collect();
        Ok(response)
    }

    /// Search a single provider by name.
    ///
    /// Results are scored against the query image and sorted by score. An
    /// unknown provider or a failed provider call gives an empty result
    /// with a note.
    pub async fn search_online(
        &self,
        query: &QueryImage,
        top_k: usize,
        provider: &str,
    ) -> Result<SearchResponse> {
        let mut response = SearchResponse::default();
        let Some(provider) = self.providers.iter().find(|p| p.name() == provider) else {
            response.add_note(format!("unknown provider {provider}"));
            return Ok(response);
        };

        let vector = self.query_vector(query).await?;
        match self.provider_candidates(provider, query, vector, top_k).await {
            Ok(mut candidates) => {
                // sort_by is stable, so provider order breaks ties
                candidates.sort_by(|a, b| b.effective_score().total_cmp(&a.effective_score()));
                response.results = candidates.into_iter().map(|c| self.to_record(c)).collect();
            }
            Err(err) => {
                warn!(provider = provider.name(), error = %err, "provider search failed");
                response.add_note(format!("{} unavailable: {err}", provider.name()));
            }
        }
        Ok(response)
    }

    /// Search the local catalog and, if asked, every provider, then merge.
    ///
    /// With `include_online`, a corrupt local index is reported in the note
    /// and logged instead of failing the providers' results as well.
    pub async fn search_combined(
        &self,
        query: &QueryImage,
        top_k: usize,
        include_online: bool,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let mut response = SearchResponse::default();

        let snapshot = match self.served_snapshot(&mut response) {
            Ok(snapshot) => snapshot,
            Err(Error::CorruptIndex(reason)) if include_online => {
                error!(reason = %reason, "local index corrupt, serving online results only");
                response.add_note(format!("local index corrupt: {reason}"));
                None
            }
            Err(err) => return Err(err),
        };

        let vector = self.query_vector(query).await?;

        let local = async {
            match snapshot {
                Some(snapshot) => self.local_hits(snapshot, Arc::clone(&vector), top_k).await,
                None => Ok(Vec::new()),
            }
        };
        let online = async {
            if !include_online {
                return Vec::new();
            }
            let calls = self.providers.iter().map(|provider| {
                let vector = Arc::clone(&vector);
                async move {
                    let outcome = self.provider_candidates(provider, query, vector, top_k).await;
                    (provider.name().to_string(), outcome)
                }
            });
            join_all(calls).await
        };
        let (local, online) = futures::join!(local, online);

        let mut provider_lists = Vec::with_capacity(online.len());
        for (name, outcome) in online {
            match outcome {
                Ok(candidates) => provider_lists.push((name, candidates)),
                Err(err) => {
                    warn!(provider = %name, error = %err, "provider search failed");
                    response.add_note(format!("{name} unavailable: {err}"));
                }
            }
        }

        let local = degrade_local(local, &mut response)?;
        response.results = rank(local, provider_lists, top_k)
            .into_iter()
            .map(|c| self.to_record(c))
            .collect();

        debug!(
            results = response.results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "combined search finished"
        );
        Ok(response)
    }

    /// Rebuild the index from `builder` into `out_dir` and serve the result.
    ///
    /// The previous snapshot stays served until the new one is persisted.
    /// Fails with `RebuildInProgress` if another rebuild is running.
    pub async fn rebuild(&self, builder: IndexBuilder, out_dir: &Path) -> Result<BuildReport> {
        let lock = Arc::clone(&self.rebuild_lock);
        let mut embedder = LockedEmbedder::new(Arc::clone(&self.embedder))?;
        let out_dir = out_dir.to_path_buf();

        let (snapshot, report) = tokio::task::spawn_blocking(move || {
            builder.build_and_persist(&mut embedder, &out_dir, &lock, |_, _| {})
        })
        .await
        .map_err(|e| Error::Embedding(format!("rebuild task failed: {e}")))??;

        info!(
            indexed = report.indexed,
            generation = ?report.generation,
            "serving rebuilt index"
        );
        self.index.swap(snapshot);
        Ok(report)
    }

    /// The snapshot to search, `None` (with a note) if there is nothing to
    /// search, or `CorruptIndex`.
    fn served_snapshot(
        &self,
        response: &mut SearchResponse,
    ) -> Result<Option<Arc<CatalogSnapshot>>> {
        match self.index.snapshot() {
            Ok(snapshot) if snapshot.is_empty() => {
                response.add_note("local index is empty");
                Ok(None)
            }
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(Error::IndexUnavailable(reason)) => {
                debug!(reason = %reason, "local index unavailable");
                response.add_note(NOTE_INDEX_UNAVAILABLE);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn query_vector(&self, query: &QueryImage) -> Result<Arc<UnitVector>> {
        let vector = embed_image_blocking(Arc::clone(&self.embedder), query.image()).await?;
        Ok(Arc::new(vector))
    }

    async fn local_hits(
        &self,
        snapshot: Arc<CatalogSnapshot>,
        vector: Arc<UnitVector>,
        top_k: usize,
    ) -> Result<Vec<(ProductRecord, f32)>> {
        let limit = self.config.local_search_timeout;
        let task = tokio::task::spawn_blocking(move || snapshot.search(&vector, top_k));
        match timeout(limit, task).await {
            Ok(joined) => joined
                .map_err(|e| Error::IndexUnavailable(format!("local search task failed: {e}")))?,
            Err(_) => Err(Error::IndexUnavailable(format!(
                "local search exceeded {limit:?}"
            ))),
        }
    }

    async fn provider_candidates(
        &self,
        provider: &Arc<dyn Provider>,
        query: &QueryImage,
        vector: Arc<UnitVector>,
        top_k: usize,
    ) -> Result<Vec<ScoredCandidate>> {
        let name = provider.name();
        let items = timeout(
            self.config.provider_timeout,
            provider.search_by_image(query.bytes(), top_k),
        )
        .await
        .map_err(|_| {
            Error::provider(
                name,
                format!("timed out after {:?}", self.config.provider_timeout),
            )
        })??;

        let options = FetchOptions {
            concurrency: self.config.fetch_concurrency,
            timeout: self.config.fetch_timeout,
        };
        let scored = score_candidates(
            vector,
            items,
            Arc::clone(&self.embedder),
            Arc::clone(&self.fetcher),
            options,
        )
        .await;

        Ok(scored
            .into_iter()
            .map(|(item, score)| ScoredCandidate::from_provider(name, item, Some(score)))
            .collect())
    }

    fn to_record(&self, candidate: ScoredCandidate) -> ResultRecord {
        ResultRecord::from_candidate(candidate, self.config.public_base_url.as_deref())
    }
}

/// A local search that ran out of time is reported in the note; any other
/// failure is passed on.
fn degrade_local(
    hits: Result<Vec<(ProductRecord, f32)>>,
    response: &mut SearchResponse,
) -> Result<Vec<(ProductRecord, f32)>> {
    match hits {
        Err(Error::IndexUnavailable(reason)) => {
            warn!(reason = %reason, "local search degraded");
            response.add_note(reason);
            Ok(Vec::new())
        }
        other => other,
    }
}

fn absolute_thumb(thumb_ref: &str, base_url: Option<&str>) -> String {
    match base_url {
        Some(base) if thumb_ref.starts_with('/') => {
            format!("{}{thumb_ref}", base.trim_end_matches('/'))
        }
        _ => thumb_ref.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::build::IndexBuilder;
    use crate::catalog::CatalogIndex;
    use crate::store::FlatStore;
    use crate::provider::ProviderItem;
    use crate::testing::{png_bytes, write_png, MeanColorEmbedder};

    struct CannedFetcher(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl ImageFetcher for CannedFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| Error::InvalidInput(format!("failed to fetch image: 404 {url}")))
        }
    }

    struct StaticProvider {
        name: &'static str,
        items: Vec<ProviderItem>,
    }

    #[async_trait]
    impl Provider for StaticProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn search_by_image(&self, _image: &[u8], limit: usize) -> Result<Vec<ProviderItem>> {
            Ok(self.items.iter().take(limit).cloned().collect())
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl Provider for BrokenProvider {
        fn name(&self) -> &str {
            "broken"
        }

        async fn search_by_image(&self, _image: &[u8], _limit: usize) -> Result<Vec<ProviderItem>> {
            Err(Error::provider("broken", "401 unauthorized"))
        }
    }

    fn listing(title: &str, url: &str) -> ProviderItem {
        ProviderItem {
            external_id: format!("id-{title}"),
            title: title.to_string(),
            image_url: Some(url.to_string()),
            price: Some("9.99".to_string()),
            detail_link: Some(format!("https://shop.example/{title}")),
            seller_domain: Some("shop.example".to_string()),
            ..ProviderItem::default()
        }
    }

    fn indexed_handle() -> (tempfile::TempDir, Arc<IndexHandle>) {
        let images = tempfile::tempdir().unwrap();
        write_png(&images.path().join("red.png"), [240, 10, 10]);
        write_png(&images.path().join("orange.png"), [240, 120, 10]);
        write_png(&images.path().join("blue.png"), [10, 10, 240]);

        let (snapshot, _) = IndexBuilder::new(images.path())
            .build(&mut MeanColorEmbedder::default(), |_, _| {})
            .unwrap();
        (images, Arc::new(IndexHandle::with_snapshot(snapshot)))
    }

    fn engine(index: Arc<IndexHandle>) -> MatchEngine {
        let mut images = HashMap::new();
        images.insert("https://img/red-mug".to_string(), png_bytes([250, 5, 5]));
        images.insert("https://img/green-mug".to_string(), png_bytes([5, 250, 5]));

        MatchEngine::new(MeanColorEmbedder::default(), index)
            .unwrap()
            .with_fetcher(Arc::new(CannedFetcher(images)))
            .with_config(SearchConfig {
                public_base_url: Some("http://localhost:8000/".to_string()),
                ..SearchConfig::default()
            })
            .with_provider(Arc::new(StaticProvider {
                name: "ebay",
                items: vec![
                    listing("green mug", "https://img/green-mug"),
                    listing("red mug", "https://img/red-mug"),
                    listing("gone", "https://img/404"),
                ],
            }))
            .with_provider(Arc::new(BrokenProvider))
    }

    fn red_query() -> QueryImage {
        QueryImage::from_bytes(png_bytes([250, 0, 0])).unwrap()
    }

    #[tokio::test]
    async fn test_search_local_ranks_catalog() {
        let (_images, index) = indexed_handle();
        let response = engine(index).search_local(&red_query(), 2).await.unwrap();

        assert_eq!(response.note, None);
        let names: Vec<_> = response.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["red", "orange"]);

        let top = &response.results[0];
        assert_eq!(top.source, "local");
        assert_eq!(top.category.as_deref(), Some("unknown"));
        assert_eq!(top.thumb.as_deref(), Some("http://localhost:8000/static/red.png"));
        assert!(matches!(top.id, Some(ResultId::Local(_))));
    }

    #[tokio::test]
    async fn test_search_local_without_index_is_a_note() {
        let response = engine(Arc::new(IndexHandle::new()))
            .search_local(&red_query(), 5)
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.note.as_deref(), Some(NOTE_INDEX_UNAVAILABLE));
    }

    fn empty_handle() -> Arc<IndexHandle> {
        let snapshot = CatalogSnapshot::new(FlatStore::new(), CatalogIndex::new()).unwrap();
        Arc::new(IndexHandle::with_snapshot(snapshot))
    }

    #[tokio::test]
    async fn test_search_local_empty_catalog_is_a_note() {
        let response = engine(empty_handle())
            .search_local(&red_query(), 5)
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.note.as_deref(), Some("local index is empty"));
    }

    #[tokio::test]
    async fn test_search_combined_empty_catalog() {
        let engine = engine(empty_handle());

        let local_only = engine
            .search_combined(&red_query(), 5, false)
            .await
            .unwrap();
        assert!(local_only.results.is_empty());
        assert_eq!(local_only.note.as_deref(), Some("local index is empty"));

        let with_online = engine.search_combined(&red_query(), 5, true).await.unwrap();
        assert_eq!(with_online.results.len(), 3);
        assert!(with_online.results.iter().all(|r| r.source == "ebay"));
        assert!(with_online.note.unwrap().starts_with("local index is empty"));
    }

    #[tokio::test]
    async fn test_search_local_corrupt_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(crate::snapshot::CURRENT_FILE), "gen-0").unwrap();
        let index = Arc::new(IndexHandle::new());
        assert!(index.load_from(dir.path()).is_err());

        let err = engine(index).search_local(&red_query(), 5).await.unwrap_err();
        assert!(matches!(err, Error::CorruptIndex(_)));
    }

    #[tokio::test]
    async fn test_search_online_scores_and_sorts() {
        let response = engine(Arc::new(IndexHandle::new()))
            .search_online(&red_query(), 10, "ebay")
            .await
            .unwrap();

        let names: Vec<_> = response.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["red mug", "green mug", "gone"]);
        assert!(response.results[0].score > 0.99);
        assert_eq!(response.results[2].score, 0.0);

        let top = &response.results[0];
        assert_eq!(top.source, "ebay");
        assert_eq!(top.id, Some(ResultId::External("id-red mug".to_string())));
        assert_eq!(top.price_display.as_deref(), Some("9.99"));
        assert_eq!(top.seller_domain.as_deref(), Some("shop.example"));
    }

    #[tokio::test]
    async fn test_search_online_unknown_or_failing_provider() {
        let engine = engine(Arc::new(IndexHandle::new()));

        let response = engine.search_online(&red_query(), 5, "etsy").await.unwrap();
        assert!(response.results.is_empty());
        assert!(response.note.unwrap().contains("unknown provider"));

        let response = engine.search_online(&red_query(), 5, "broken").await.unwrap();
        assert!(response.results.is_empty());
        assert!(response.note.unwrap().contains("broken unavailable"));
    }

    #[tokio::test]
    async fn test_search_combined_merges_sources() {
        let (_images, index) = indexed_handle();
        let response = engine(index)
            .search_combined(&red_query(), 4, true)
            .await
            .unwrap();

        let names: Vec<_> = response.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["red mug", "red", "orange", "blue"]);
        for pair in response.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(response.results[0].source, "ebay");
        assert_eq!(response.results[1].source, "local");
        assert!(response.note.unwrap().contains("broken unavailable"));
    }

    #[tokio::test]
    async fn test_search_combined_local_only() {
        let (_images, index) = indexed_handle();
        let response = engine(index)
            .search_combined(&red_query(), 10, false)
            .await
            .unwrap();

        assert_eq!(response.results.len(), 3);
        assert!(response.results.iter().all(|r| r.source == "local"));
        assert_eq!(response.note, None);
    }

    #[tokio::test]
    async fn test_search_combined_survives_missing_index() {
        let response = engine(Arc::new(IndexHandle::new()))
            .search_combined(&red_query(), 10, true)
            .await
            .unwrap();

        assert_eq!(response.results.len(), 3);
        assert!(response.results.iter().all(|r| r.source == "ebay"));
        assert!(response.note.unwrap().contains(NOTE_INDEX_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_search_combined_zero_k() {
        let (_images, index) = indexed_handle();
        let response = engine(index)
            .search_combined(&red_query(), 0, true)
            .await
            .unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_swaps_served_index() {
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_png(&images.path().join("only.png"), [20, 200, 20]);

        let engine = engine(Arc::new(IndexHandle::new()));
        let report = engine
            .rebuild(IndexBuilder::new(images.path()), out.path())
            .await
            .unwrap();

        assert_eq!(report.indexed, 1);
        assert_eq!(engine.index().snapshot().unwrap().len(), 1);
        assert_eq!(
            CatalogSnapshot::load(out.path()).unwrap().generation(),
            report.generation.as_deref()
        );
    }

    #[test]
    fn test_response_serialization_skips_absent_fields() {
        let response = SearchResponse {
            results: vec![ResultRecord {
                id: Some(ResultId::Local(3)),
                name: "mug".to_string(),
                image: "data/products/mug.jpg".to_string(),
                thumb: Some("/static/mug.jpg".to_string()),
                score: 0.5,
                source: "local".to_string(),
                category: Some("unknown".to_string()),
                web_link: None,
                price_display: None,
                seller_domain: None,
            }],
            note: None,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["results"][0]["id"], 3);
        assert!(json["results"][0].get("web_link").is_none());
        assert!(json.get("note").is_none());
    }

    #[test]
    fn test_config_timeout_reaches_default_fetcher() {
        let config = SearchConfig {
            fetch_timeout: Duration::from_secs(3),
            ..SearchConfig::default()
        };
        let engine = MatchEngine::new(MeanColorEmbedder::default(), Arc::new(IndexHandle::new()))
            .unwrap()
            .with_config(config.clone());
        assert_eq!(
            engine.http_fetcher.as_ref().map(HttpFetcher::timeout),
            Some(Duration::from_secs(3))
        );

        let custom = MatchEngine::new(MeanColorEmbedder::default(), Arc::new(IndexHandle::new()))
            .unwrap()
            .with_fetcher(Arc::new(CannedFetcher(HashMap::new())))
            .with_config(config);
        assert!(custom.http_fetcher.is_none());
    }

    #[test]
    fn test_absolute_thumb() {
        assert_eq!(absolute_thumb("/static/a.jpg", Some("http://h:1/")), "http://h:1/static/a.jpg");
        assert_eq!(absolute_thumb("/static/a.jpg", None), "/static/a.jpg");
        assert_eq!(absolute_thumb("https://cdn/a.jpg", Some("http://h")), "https://cdn/a.jpg");
    }
}
