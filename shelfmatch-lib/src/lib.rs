//! ShelfMatch - visual product matching library
//!
//! # Architecture
//!
//! ```text
//! Image dir -> IndexBuilder -> Embedder -> FlatStore + CatalogIndex -> snapshot on disk
//!                                                                          |
//! Query image -> Embedder -> MatchEngine -> IndexHandle (served snapshot) <+
//!                                 |
//!                                 +-> Providers -> fetch + embed candidates
//!                                 |
//!                              Ranker -> Results
//! ```
//!
//! # Example
//!
//! ```ignore
//! use shelfmatch_lib::{build::IndexBuilder, embed::ClipEmbedder, search::MatchEngine};
//!
//! let mut embedder = ClipEmbedder::new()?;
//!
//! // Index a directory of product photos
//! let (mut snapshot, report) = IndexBuilder::new("data/products").build(&mut embedder, |_, _| {})?;
//! snapshot.persist("data/index".as_ref())?;
//!
//! // Search
//! let index = Arc::new(IndexHandle::with_snapshot(snapshot));
//! let engine = MatchEngine::new(embedder, index)?;
//! let query = QueryImage::from_reference("mug.jpg", engine.fetcher()).await?;
//! let response = engine.search_local(&query, 5).await?;
//! ```

pub mod build;
pub mod catalog;
pub mod embed;
pub mod error;
pub mod provider;
pub mod query;
pub mod rank;
pub mod search;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
