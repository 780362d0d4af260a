//! Vector storage backends
//!
//! Exact, flat storage only: every query scans every row. That is the
//! intended scope for catalogs up to roughly 10^5 to 10^6 products; beyond that
//! an approximate index would slot in behind the same trait.
//!
//! # Storage Model
//!
//! Rows are unit vectors addressed by a dense `u64` id (`0..len`). The id is
//! the row position at insertion time and doubles as the join key into the
//! [`CatalogIndex`](crate::catalog::CatalogIndex).
//!
//! # Usage
//!
//! ```ignore
//! use shelfmatch_lib::store::{FlatStore, VectorStore};
//!
//! let mut store = FlatStore::new();
//! let id = store.add(normalize(raw)?)?;
//!
//! // Search by cosine similarity
//! let hits = store.search(&query, 5)?;
//! ```

use std::cmp::Ordering;

use crate::embed::UnitVector;
use crate::Result;

/// A search hit: row id and cosine similarity to the query
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    /// Row id in the store
    pub id: u64,
    /// Similarity score (higher is more similar), -1.0 to 1.0
    pub score: f32,
}

impl Hit {
    /// Ranking order: higher score first, lower id first on equal scores.
    fn rank_cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Hit {}

// Greater means "ranks ahead of".
impl Ord for Hit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank_cmp(other)
    }
}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Trait for vector storage backends
pub trait VectorStore: Send + Sync {
    /// Append a vector and return its id
    ///
    /// The first vector added to an empty store fixes the dimension; later
    /// vectors of another length fail with `DimensionMismatch`.
    fn add(&mut self, vector: UnitVector) -> Result<u64>;

    /// Exact top-k search
    ///
    /// # Returns
    /// Up to `k` hits sorted by score descending, ties by ascending id.
    /// Fails with `EmptyStore` when nothing is stored.
    fn search(&self, query: &UnitVector, k: usize) -> Result<Vec<Hit>>;

    /// Get total number of stored vectors
    fn len(&self) -> usize;

    /// Check if store is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension, `None` until the first vector is added
    fn dimension(&self) -> Option<usize>;
}

mod flat;

pub use flat::*;
