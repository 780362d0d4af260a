//! Product catalog keyed by vector row id
//!
//! The catalog is a positional list: record `i` describes the vector stored
//! in row `i` of the [`FlatStore`](crate::store::FlatStore). Records are only
//! ever appended, and only during an index build.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A product in the local catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductRecord {
    /// Row id in the vector store
    pub id: u64,
    /// Display name (the image file stem for directory builds)
    pub name: String,
    /// Path of the source image
    pub image_ref: String,
    /// Thumbnail reference, usually a server-relative path
    pub thumb_ref: String,
    pub category: String,
}

/// Ordered catalog of product records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogIndex {
    records: Vec<ProductRecord>,
}

impl CatalogIndex {
    /// Create a new empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Its id must be the next position in the catalog.
    pub fn put(&mut self, record: ProductRecord) -> Result<()> {
        let expected = self.records.len() as u64;
        if record.id != expected {
            return Err(Error::CorruptIndex(format!(
                "record id {} appended at position {expected}",
                record.id
            )));
        }
        self.records.push(record);
        Ok(())
    }

    /// Look up a record by id.
    pub fn get(&self, id: u64) -> Result<&ProductRecord> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.records.get(idx))
            .ok_or(Error::UnknownId(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProductRecord> {
        self.records.iter()
    }

    /// Drop every record from `len` onwards.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }

    /// Write the catalog as a pretty-printed JSON array and flush it to disk.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.records)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read a catalog written by [`persist`](Self::persist).
    ///
    /// Ids must run `0..len` in order; anything else is `CorruptIndex`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let records: Vec<ProductRecord> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::CorruptIndex(format!("unreadable catalog: {e}")))?;

        let mut catalog = Self::new();
        for record in records {
            catalog.put(record)?;
        }
        Ok(catalog)
    }
}
