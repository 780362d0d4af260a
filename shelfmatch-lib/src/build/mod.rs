//! Offline index building
//!
//! Turns a directory of product images into a persisted
//! [`CatalogSnapshot`]. Images that fail to decode or embed are skipped with
//! a warning; an input with no usable image at all is an error.
//!
//! # Usage
//!
//! ```ignore
//! use shelfmatch_lib::build::{IndexBuilder, RebuildLock};
//!
//! let lock = RebuildLock::new();
//! let builder = IndexBuilder::new("data/products");
//! let (snapshot, report) =
//!     builder.build_and_persist(&mut embedder, "data/index".as_ref(), &lock, |_, _| {})?;
//! println!("indexed {} images, skipped {}", report.indexed, report.skipped.len());
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::catalog::{CatalogIndex, ProductRecord};
use crate::embed::{decode_image, normalize, ImageEmbedder, UnitVector};
use crate::snapshot::{CatalogSnapshot, IndexDirLock};
use crate::store::{FlatStore, VectorStore};
use crate::{Error, Result};

/// File extensions treated as catalog images (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Outcome of a build
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Number of images embedded into the index
    pub indexed: usize,
    /// Images left out, with the reason
    pub skipped: Vec<(PathBuf, String)>,
    /// Generation written, if the build was persisted
    pub generation: Option<String>,
}

/// Grows a vector store and catalog in lockstep.
///
/// Each [`append`](PairWriter::append) either adds both a vector and its
/// record or leaves both untouched.
#[derive(Debug, Default)]
pub struct PairWriter {
    store: FlatStore,
    catalog: CatalogIndex,
}

impl PairWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vector and the record built for its id.
    pub fn append(
        &mut self,
        vector: UnitVector,
        make_record: impl FnOnce(u64) -> ProductRecord,
    ) -> Result<u64> {
        let before = self.store.len();
        debug_assert_eq!(before, self.catalog.len());

        let id = self.store.add(vector)?;
        if let Err(err) = self.catalog.put(make_record(id)) {
            self.store.truncate(before);
            return Err(err);
        }
        Ok(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Seal the pair into a snapshot.
    pub fn finish(self) -> Result<CatalogSnapshot> {
        CatalogSnapshot::new(self.store, self.catalog)
    }
}

/// Guarantees at most one rebuild in flight.
#[derive(Debug, Default)]
pub struct RebuildLock {
    busy: AtomicBool,
}

impl RebuildLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, failing with `RebuildInProgress` if it is held.
    pub fn try_acquire(&self) -> Result<RebuildGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| RebuildGuard { lock: self })
            .map_err(|_| Error::RebuildInProgress)
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the [`RebuildLock`] on drop.
#[derive(Debug)]
pub struct RebuildGuard<'a> {
    lock: &'a RebuildLock,
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.lock.busy.store(false, Ordering::Release);
    }
}

/// Builds a catalog index from a directory of images.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    images_dir: PathBuf,
    thumb_prefix: String,
    category: String,
}

impl IndexBuilder {
    /// Builder for `images_dir`, with thumbnails under `/static/` and every
    /// product in the `unknown` category.
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            thumb_prefix: "/static/".to_string(),
            category: "unknown".to_string(),
        }
    }

    /// Prefix joined with the file name to form each thumbnail reference.
    #[must_use]
    pub fn with_thumb_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thumb_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Embed every image and return the in-memory snapshot.
    ///
    /// `progress` is called after each file with `(done, total)`.
    pub fn build<E: ImageEmbedder + ?Sized>(
        &self,
        embedder: &mut E,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(CatalogSnapshot, BuildReport)> {
        let files = discover_images(&self.images_dir)?;
        info!(
            dir = %self.images_dir.display(),
            files = files.len(),
            model = embedder.model_name(),
            "computing embeddings"
        );

        let mut writer = PairWriter::new();
        let mut report = BuildReport::default();

        for (done, path) in files.iter().enumerate() {
            if let Err(err) = self.index_one(embedder, &mut writer, path) {
                warn!(path = %path.display(), error = %err, "skipping image");
                report.skipped.push((path.clone(), err.to_string()));
            }
            progress(done + 1, files.len());
        }

        if writer.is_empty() {
            return Err(Error::NoImagesFound(self.images_dir.clone()));
        }

        report.indexed = writer.len();
        Ok((writer.finish()?, report))
    }

    /// Build, then persist to `out_dir`.
    ///
    /// Both `lock` and the [`IndexDirLock`] of `out_dir` are held
    /// throughout, so a second rebuild in this process or another fails
    /// with `RebuildInProgress` and the served generation is untouched
    /// until the new one is complete.
    pub fn build_and_persist<E: ImageEmbedder + ?Sized>(
        &self,
        embedder: &mut E,
        out_dir: &Path,
        lock: &RebuildLock,
        progress: impl FnMut(usize, usize),
    ) -> Result<(CatalogSnapshot, BuildReport)> {
        let _guard = lock.try_acquire()?;
        let mut dir_lock = IndexDirLock::open(out_dir)?;
        let _dir_guard = dir_lock.try_exclusive()?;

        let (mut snapshot, mut report) = self.build(embedder, progress)?;
        report.generation = Some(snapshot.persist_locked(out_dir)?);
        info!(
            out = %out_dir.display(),
            indexed = report.indexed,
            skipped = report.skipped.len(),
            "index built"
        );
        Ok((snapshot, report))
    }

    fn index_one<E: ImageEmbedder + ?Sized>(
        &self,
        embedder: &mut E,
        writer: &mut PairWriter,
        path: &Path,
    ) -> Result<u64> {
        let bytes = fs::read(path)?;
        let image = decode_image(&bytes)?;
        let vector = normalize(embedder.embed(&image)?)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());

        writer.append(vector, |id| ProductRecord {
            id,
            name,
            image_ref: path.display().to_string(),
            thumb_ref: format!("{}{}", self.thumb_prefix, file_name),
            category: self.category.clone(),
        })
    }
}

/// List image files in `dir` (non-recursive), sorted by file name.
///
/// Fails with `NoImagesFound` if the directory is missing or holds no file
/// with a known image extension.
pub fn discover_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NoImagesFound(dir.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(Error::NoImagesFound(dir.to_path_buf()));
    }

    files.sort();
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_png, FailingEmbedder, MeanColorEmbedder};

    fn product_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a_red.png"), [200, 10, 10]);
        write_png(&dir.path().join("b_green.PNG"), [10, 200, 10]);
        write_png(&dir.path().join("c_blue.png"), [10, 10, 200]);
        fs::write(dir.path().join("d_broken.jpg"), b"not really a jpeg").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        dir
    }

    fn unit(values: &[f32]) -> UnitVector {
        normalize(values.to_vec()).unwrap()
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let dir = product_dir();
        let files = discover_images(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a_red.png", "b_green.PNG", "c_blue.png", "d_broken.jpg"]);
    }

    #[test]
    fn test_discover_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme.md"), b"no images").unwrap();
        assert!(matches!(
            discover_images(dir.path()),
            Err(Error::NoImagesFound(_))
        ));
        assert!(matches!(
            discover_images(&dir.path().join("missing")),
            Err(Error::NoImagesFound(_))
        ));
    }

    #[test]
    fn test_build_skips_undecodable_images() {
        let dir = product_dir();
        let mut embedder = MeanColorEmbedder::default();
        let mut seen = Vec::new();

        let (snapshot, report) = IndexBuilder::new(dir.path())
            .build(&mut embedder, |done, total| seen.push((done, total)))
            .unwrap();

        assert_eq!(report.indexed, 3);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].0.ends_with("d_broken.jpg"));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.catalog().len(), 3);
        assert_eq!(seen.last(), Some(&(4, 4)));
        assert_eq!(embedder.calls, 3);
    }

    #[test]
    fn test_build_record_fields() {
        let dir = product_dir();
        let (snapshot, _) = IndexBuilder::new(dir.path())
            .build(&mut MeanColorEmbedder::default(), |_, _| {})
            .unwrap();

        let record = snapshot.catalog().get(1).unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.name, "b_green");
        assert_eq!(record.thumb_ref, "/static/b_green.PNG");
        assert_eq!(record.category, "unknown");
        assert!(record.image_ref.ends_with("b_green.PNG"));
    }

    #[test]
    fn test_build_skips_degenerate_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("black.png"), [0, 0, 0]);
        write_png(&dir.path().join("white.png"), [255, 255, 255]);

        let (snapshot, report) = IndexBuilder::new(dir.path())
            .build(&mut MeanColorEmbedder::default(), |_, _| {})
            .unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.catalog().get(0).unwrap().name, "white");
        assert!(report.skipped[0].1.contains("degenerate"));
    }

    #[test]
    fn test_build_with_nothing_usable_fails() {
        let dir = product_dir();
        assert!(matches!(
            IndexBuilder::new(dir.path()).build(&mut FailingEmbedder, |_, _| {}),
            Err(Error::NoImagesFound(_))
        ));
    }

    #[test]
    fn test_build_and_persist_round_trip() {
        let images = product_dir();
        let out = tempfile::tempdir().unwrap();
        let lock = RebuildLock::new();

        let (snapshot, report) = IndexBuilder::new(images.path())
            .build_and_persist(
                &mut MeanColorEmbedder::default(),
                out.path(),
                &lock,
                |_, _| {},
            )
            .unwrap();

        assert!(!lock.is_busy());
        let loaded = CatalogSnapshot::load(out.path()).unwrap();
        assert_eq!(loaded.generation(), report.generation.as_deref());
        assert_eq!(loaded.store(), snapshot.store());
        assert_eq!(loaded.catalog(), snapshot.catalog());
    }

    #[test]
    fn test_concurrent_rebuild_rejected() {
        let images = product_dir();
        let out = tempfile::tempdir().unwrap();
        let lock = RebuildLock::new();
        let _held = lock.try_acquire().unwrap();

        assert!(matches!(
            IndexBuilder::new(images.path()).build_and_persist(
                &mut MeanColorEmbedder::default(),
                out.path(),
                &lock,
                |_, _| {}
            ),
            Err(Error::RebuildInProgress)
        ));
        assert!(!out.path().join(crate::snapshot::CURRENT_FILE).exists());
    }

    #[test]
    fn test_rebuild_rejected_while_index_dir_locked() {
        let images = product_dir();
        let out = tempfile::tempdir().unwrap();
        let builder = IndexBuilder::new(images.path());
        let lock = RebuildLock::new();
        let (served, _) = builder
            .build_and_persist(
                &mut MeanColorEmbedder::default(),
                out.path(),
                &lock,
                |_, _| {},
            )
            .unwrap();

        // another process rebuilding the same directory
        let mut other = IndexDirLock::open(out.path()).unwrap();
        let _held = other.try_exclusive().unwrap();

        let mut embedder = MeanColorEmbedder::default();
        assert!(matches!(
            builder.build_and_persist(&mut embedder, out.path(), &lock, |_, _| {}),
            Err(Error::RebuildInProgress)
        ));
        assert_eq!(embedder.calls, 0);
        assert_eq!(
            CatalogSnapshot::load(out.path()).unwrap().generation(),
            served.generation()
        );
    }

    #[test]
    fn test_pair_writer_keeps_counts_aligned() {
        let mut writer = PairWriter::new();
        let record = |id| ProductRecord {
            id,
            name: format!("p{id}"),
            image_ref: String::new(),
            thumb_ref: String::new(),
            category: "unknown".to_string(),
        };

        writer.append(unit(&[1.0, 0.0]), record).unwrap();
        // rejected vector: no record is written either
        assert!(writer.append(unit(&[1.0, 0.0, 0.0]), record).is_err());
        // rejected record: the vector is rolled back
        assert!(writer.append(unit(&[0.0, 1.0]), |_| record(7)).is_err());

        assert_eq!(writer.len(), 1);
        let snapshot = writer.finish().unwrap();
        assert_eq!(snapshot.catalog().len(), 1);
    }
}
