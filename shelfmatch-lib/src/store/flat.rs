use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::embed::{dot, UnitVector};
use crate::store::{Hit, VectorStore};
use crate::{Error, Result};

const MAGIC: [u8; 4] = *b"SMVS";
const FORMAT_VERSION: u32 = 1;
/// Magic, version, dimension and count
const HEADER_LEN: u64 = 20;
/// Largest dimension accepted from a file header
pub const MAX_DIMENSION: usize = 1 << 16;
/// Cap on floats reserved up front, whatever the header claims
const PREALLOC_FLOATS: u64 = 1 << 20;

/// Flat in-memory vector store with exact search.
///
/// Vectors live in one contiguous buffer, row `i` at
/// `data[i * dim..(i + 1) * dim]`. Searching is a dot product against every
/// row with a bounded heap for the top-k, O(N·D + N log k).
///
/// Once built, the store is only read, so it can be shared behind an `Arc`
/// by any number of concurrent searchers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatStore {
    dimension: Option<usize>,
    data: Vec<f32>,
}

impl FlatStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the vector stored under `id`.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&[f32]> {
        let dim = self.dimension?;
        let start = usize::try_from(id).ok()?.checked_mul(dim)?;
        self.data.get(start..start.checked_add(dim)?)
    }

    /// Iterate rows in id order.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension.unwrap_or(1).max(1))
    }

    /// Drop every row from `len` onwards.
    pub(crate) fn truncate(&mut self, len: usize) {
        if let Some(dim) = self.dimension {
            self.data.truncate(len * dim);
            if self.data.is_empty() {
                self.dimension = None;
            }
        }
    }

    /// Write the store to `path`, flushing it to disk.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read a store from `path`.
    ///
    /// Fails with `CorruptIndex` if the file is truncated, carries trailing
    /// bytes, has a row whose length differs from the header dimension, or a
    /// row that is not unit length.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let store = Self::read_checked(BufReader::new(file), Some(file_len))?;
        debug!(
            path = %path.display(),
            count = store.len(),
            dimension = ?store.dimension,
            "loaded vector store"
        );
        Ok(store)
    }

    /// Serialize in id order.
    ///
    /// Layout (little endian): magic `SMVS`, version `u32`, dimension `u32`,
    /// count `u64`, then for each row a `u32` length followed by that many
    /// `f32` values.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let dim = self.dimension.unwrap_or(0);
        let dim_u32 = u32::try_from(dim)
            .map_err(|_| Error::CorruptIndex(format!("dimension {dim} does not fit the format")))?;

        writer.write_all(&MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&dim_u32.to_le_bytes())?;
        writer.write_all(&(self.len() as u64).to_le_bytes())?;
        for row in self.rows() {
            writer.write_all(&dim_u32.to_le_bytes())?;
            for value in row {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        Self::read_checked(reader, None)
    }

    /// Like [`read_from`](Self::read_from), also checking the header against
    /// the total byte length when it is known.
    ///
    /// Nothing is allocated from header values until they are validated.
    fn read_checked<R: Read>(mut reader: R, byte_len: Option<u64>) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(&mut reader, &mut magic, "header")?;
        if magic != MAGIC {
            return Err(Error::CorruptIndex("bad vector file magic".into()));
        }
        let version = read_u32(&mut reader, "header")?;
        if version != FORMAT_VERSION {
            return Err(Error::CorruptIndex(format!(
                "unsupported vector file version {version}"
            )));
        }
        let dim = read_u32(&mut reader, "header")? as usize;
        let count = read_u64(&mut reader, "header")?;

        if count > 0 && dim == 0 {
            return Err(Error::CorruptIndex(format!(
                "{count} rows declared with zero dimension"
            )));
        }
        if dim > MAX_DIMENSION {
            return Err(Error::CorruptIndex(format!(
                "dimension {dim} exceeds the supported maximum {MAX_DIMENSION}"
            )));
        }

        let expected_len = (dim as u64 * 4 + 4)
            .checked_mul(count)
            .and_then(|rows| rows.checked_add(HEADER_LEN))
            .ok_or_else(|| {
                Error::CorruptIndex(format!("{count} rows of dimension {dim} overflow the format"))
            })?;
        if let Some(actual) = byte_len {
            if actual != expected_len {
                return Err(Error::CorruptIndex(format!(
                    "vector file is {actual} bytes, header implies {expected_len}"
                )));
            }
        }

        let mut store = Self::new();
        let floats = (expected_len - HEADER_LEN) / 4;
        store.data.reserve(floats.min(PREALLOC_FLOATS) as usize);

        let mut row = vec![0f32; dim];
        let mut buf = [0u8; 4];
        for i in 0..count {
            let row_len = read_u32(&mut reader, "row length")? as usize;
            if row_len != dim {
                return Err(Error::CorruptIndex(format!(
                    "row {i} has dimension {row_len}, expected {dim}"
                )));
            }
            for value in &mut row {
                read_exact(&mut reader, &mut buf, "row data")?;
                *value = f32::from_le_bytes(buf);
            }
            let vector = UnitVector::from_normalized(row.clone())
                .map_err(|_| Error::CorruptIndex(format!("row {i} is not unit length")))?;
            store.add(vector)?;
        }

        let mut trailing = [0u8; 1];
        match reader.read(&mut trailing)? {
            0 => Ok(store),
            _ => Err(Error::CorruptIndex(
                "trailing bytes after last vector row".into(),
            )),
        }
    }
}

impl VectorStore for FlatStore {
    fn add(&mut self, vector: UnitVector) -> Result<u64> {
        match self.dimension {
            Some(dim) if dim != vector.dim() => {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: vector.dim(),
                });
            }
            Some(_) => {}
            None => self.dimension = Some(vector.dim()),
        }

        let id = self.len() as u64;
        self.data.extend_from_slice(vector.as_slice());
        Ok(id)
    }

    fn search(&self, query: &UnitVector, k: usize) -> Result<Vec<Hit>> {
        let Some(dim) = self.dimension else {
            return Err(Error::EmptyStore);
        };
        if query.dim() != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: query.dim(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        // min-heap of the best k seen so far; the root is the weakest kept hit
        let mut heap: BinaryHeap<Reverse<Hit>> = BinaryHeap::with_capacity(k.min(self.len()));
        for (id, row) in self.rows().enumerate() {
            let hit = Hit {
                id: id as u64,
                score: dot(query.as_slice(), row),
            };
            if heap.len() < k {
                heap.push(Reverse(hit));
            } else if let Some(Reverse(weakest)) = heap.peek() {
                if hit > *weakest {
                    heap.pop();
                    heap.push(Reverse(hit));
                }
            }
        }

        Ok(heap.into_sorted_vec().into_iter().map(|Reverse(hit)| hit).collect())
    }

    fn len(&self) -> usize {
        match self.dimension {
            Some(dim) if dim > 0 => self.data.len() / dim,
            _ => 0,
        }
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::CorruptIndex(format!("vector file truncated in {what}")),
        _ => Error::Io(e),
    })
}

fn read_u32<R: Read>(reader: &mut R, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, what)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, what)?;
    Ok(u64::from_le_bytes(buf))
}
