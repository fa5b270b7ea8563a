//! Vector store
//!
//! Append-only binary file of fixed-size embedding rows plus an in-memory
//! map rebuilt at load. Upserts append; superseded rows become garbage
//! that a periodic vacuum rewrite reclaims with an atomic file swap.
//! Retrieval is a linear scan with a bounded top-k heap; the project
//! filter runs against a side index rebuilt from the chunk store.
//!
//! Row layout: 36-byte chunk id (NUL-padded UUID), 8-byte little-endian
//! last-accessed milliseconds, then `dim` little-endian f32 values. A
//! 12-byte header pins the magic and dimension; a malformed tail row is
//! skipped at load with a warning rather than poisoning the store.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{EngramError, Result};
use crate::math::angular_distance_unchecked;

const MAGIC: &[u8; 8] = b"ENGRAMV1";
const HEADER_LEN: u64 = 12;
const ID_BYTES: usize = 36;

struct VectorRow {
    values: Vec<f32>,
    last_accessed_ms: i64,
    offset: u64,
}

struct Inner {
    file: File,
    rows: HashMap<String, VectorRow>,
    /// Superseded or removed rows still occupying file space
    garbage_rows: usize,
    /// chunk_id -> project slug, for filtered search
    project_index: HashMap<String, String>,
}

/// Append-only embedding store with an in-memory index
pub struct VectorStore {
    path: PathBuf,
    dim: usize,
    inner: RwLock<Inner>,
}

impl VectorStore {
    /// Open or create the vector file. The dimension is fixed at store
    /// creation; reopening with a different dimension is corruption.
    pub fn open(path: impl Into<PathBuf>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(EngramError::invalid("vector dimension must be positive"));
        }
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let mut rows = HashMap::new();
        let mut garbage_rows = 0usize;

        if file_len == 0 {
            file.write_all(MAGIC)?;
            file.write_all(&(dim as u32).to_le_bytes())?;
            file.flush()?;
        } else {
            let stored_dim = read_header(&mut file)?;
            if stored_dim != dim {
                return Err(EngramError::StateCorruption(format!(
                    "vector file dimension {stored_dim} does not match requested {dim}"
                )));
            }
            garbage_rows = load_rows(&mut file, dim, file_len, &mut rows)?;
        }

        info!(
            "vector store loaded: {} rows, {} garbage ({})",
            rows.len(),
            garbage_rows,
            path.display()
        );
        Ok(Self {
            path,
            dim,
            inner: RwLock::new(Inner {
                file,
                rows,
                garbage_rows,
                project_index: HashMap::new(),
            }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn count(&self) -> usize {
        self.inner.read().expect("vector store lock").rows.len()
    }

    /// Replace the side project index (chunk id -> project slug)
    pub fn set_project_index(&self, index: HashMap<String, String>) {
        self.inner.write().expect("vector store lock").project_index = index;
    }

    /// Merge fresh entries into the project index (ingest path)
    pub fn extend_project_index(&self, entries: impl IntoIterator<Item = (String, String)>) {
        self.inner
            .write()
            .expect("vector store lock")
            .project_index
            .extend(entries);
    }

    /// Write or overwrite one embedding. Appends a new row; any previous
    /// row for the id becomes garbage for the next vacuum.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a dimension mismatch or an oversized
    /// chunk id.
    pub fn upsert(&self, chunk_id: &str, values: &[f32], last_accessed: DateTime<Utc>) -> Result<()> {
        if values.len() != self.dim {
            return Err(EngramError::invalid(format!(
                "vector dimension {} does not match store dimension {}",
                values.len(),
                self.dim
            )));
        }
        if chunk_id.len() > ID_BYTES {
            return Err(EngramError::invalid(format!(
                "chunk id longer than {ID_BYTES} bytes: {chunk_id}"
            )));
        }

        let mut inner = self.inner.write().expect("vector store lock");
        let offset = inner.file.seek(SeekFrom::End(0))?;
        let ms = last_accessed.timestamp_millis();
        inner.file.write_all(&encode_row(chunk_id, ms, values))?;
        inner.file.flush()?;

        if inner
            .rows
            .insert(
                chunk_id.to_string(),
                VectorRow {
                    values: values.to_vec(),
                    last_accessed_ms: ms,
                    offset,
                },
            )
            .is_some()
        {
            inner.garbage_rows += 1;
        }
        Ok(())
    }

    /// Every stored embedding, sorted by chunk id for deterministic
    /// downstream clustering
    pub fn all_vectors(&self) -> Vec<(String, Vec<f32>)> {
        let inner = self.inner.read().expect("vector store lock");
        let mut entries: Vec<(String, Vec<f32>)> = inner
            .rows
            .iter()
            .map(|(id, row)| (id.clone(), row.values.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Fetch one embedding
    pub fn get(&self, chunk_id: &str) -> Option<Vec<f32>> {
        self.inner
            .read()
            .expect("vector store lock")
            .rows
            .get(chunk_id)
            .map(|r| r.values.clone())
    }

    /// The k nearest rows to `query` by angular distance, ascending, as
    /// `(chunk_id, distance)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a dimension mismatch.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        self.search_inner(query, k, None)
    }

    /// Nearest rows restricted to chunks whose project is in `projects`
    pub fn search_by_project(
        &self,
        query: &[f32],
        projects: &[String],
        k: usize,
    ) -> Result<Vec<(String, f32)>> {
        self.search_inner(query, k, Some(projects))
    }

    fn search_inner(
        &self,
        query: &[f32],
        k: usize,
        projects: Option<&[String]>,
    ) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dim {
            return Err(EngramError::invalid(format!(
                "query dimension {} does not match store dimension {}",
                query.len(),
                self.dim
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let inner = self.inner.read().expect("vector store lock");
        // Fixed-size worst-first heap: the root is the farthest kept row.
        let mut heap: BinaryHeap<(OrderedF32, Reverse<String>)> = BinaryHeap::with_capacity(k + 1);
        for (id, row) in &inner.rows {
            if let Some(projects) = projects {
                match inner.project_index.get(id) {
                    Some(slug) if projects.contains(slug) => {}
                    _ => continue,
                }
            }
            let dist = angular_distance_unchecked(query, &row.values);
            heap.push((OrderedF32(dist), Reverse(id.clone())));
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut hits: Vec<(String, f32)> = heap
            .into_iter()
            .map(|(d, Reverse(id))| (id, d.0))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(hits)
    }

    /// Best-effort in-place refresh of last-accessed stamps. Rows keep
    /// their offsets, so the stamp is patched without appending.
    pub fn bump_last_accessed(&self, chunk_ids: &[String], at: DateTime<Utc>) {
        let ms = at.timestamp_millis();
        let mut inner = self.inner.write().expect("vector store lock");
        for id in chunk_ids {
            let Some(offset) = inner.rows.get(id).map(|r| r.offset) else {
                continue;
            };
            if let Some(row) = inner.rows.get_mut(id) {
                row.last_accessed_ms = ms;
            }
            let patched = inner
                .file
                .seek(SeekFrom::Start(offset + ID_BYTES as u64))
                .and_then(|_| inner.file.write_all(&ms.to_le_bytes()));
            if let Err(e) = patched {
                warn!("last-accessed patch for {} failed: {}", id, e);
            }
        }
        let _ = inner.file.flush();
    }

    /// Remove rows by id. The file space is reclaimed by the next vacuum.
    pub fn remove(&self, chunk_ids: &[String]) -> usize {
        let mut inner = self.inner.write().expect("vector store lock");
        let mut removed = 0;
        for id in chunk_ids {
            if inner.rows.remove(id).is_some() {
                removed += 1;
                inner.garbage_rows += 1;
            }
        }
        removed
    }

    /// Evict vectors of orphaned chunks whose last access is older than
    /// `ttl_days`. The orphan set comes from the chunk store. Returns the
    /// evicted chunk ids.
    pub fn cleanup_expired(
        &self,
        ttl_days: u32,
        orphaned: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let cutoff_ms = (now - chrono::Duration::days(ttl_days as i64)).timestamp_millis();
        let expired: Vec<String> = {
            let inner = self.inner.read().expect("vector store lock");
            inner
                .rows
                .iter()
                .filter(|(id, row)| orphaned.contains(*id) && row.last_accessed_ms < cutoff_ms)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let removed = self.remove(&expired);
        if removed > 0 {
            debug!("vector TTL cleanup evicted {} rows", removed);
        }
        expired
    }

    /// Enforce the FIFO cap: keep the newest `max_count` rows by last
    /// access; 0 means unlimited. Returns the evicted chunk ids.
    pub fn evict_oldest_by_count(&self, max_count: usize) -> Vec<String> {
        if max_count == 0 {
            return Vec::new();
        }
        let victims: Vec<String> = {
            let inner = self.inner.read().expect("vector store lock");
            if inner.rows.len() <= max_count {
                return Vec::new();
            }
            let mut by_age: Vec<(&String, i64)> = inner
                .rows
                .iter()
                .map(|(id, row)| (id, row.last_accessed_ms))
                .collect();
            by_age.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
            by_age
                .iter()
                .take(inner.rows.len() - max_count)
                .map(|(id, _)| (*id).clone())
                .collect()
        };
        let removed = self.remove(&victims);
        if removed > 0 {
            debug!("FIFO cap evicted {} vector rows", removed);
        }
        victims
    }

    /// Rewrite the file keeping only live rows, then swap it into place
    /// atomically. Returns the number of garbage rows reclaimed.
    pub fn vacuum(&self) -> Result<usize> {
        let mut inner = self.inner.write().expect("vector store lock");
        if inner.garbage_rows == 0 {
            return Ok(0);
        }

        let tmp_path = self.path.with_extension("bin.vacuum");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(MAGIC)?;
        tmp.write_all(&(self.dim as u32).to_le_bytes())?;

        let mut ids: Vec<String> = inner.rows.keys().cloned().collect();
        ids.sort();
        let mut offsets = Vec::with_capacity(ids.len());
        for id in &ids {
            let row = &inner.rows[id];
            offsets.push(tmp.stream_position()?);
            tmp.write_all(&encode_row(id, row.last_accessed_ms, &row.values))?;
        }
        tmp.flush()?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        for (id, offset) in ids.iter().zip(offsets) {
            if let Some(row) = inner.rows.get_mut(id) {
                row.offset = offset;
            }
        }
        let reclaimed = inner.garbage_rows;
        inner.garbage_rows = 0;
        inner.file = tmp;
        info!("vector vacuum reclaimed {} rows", reclaimed);
        Ok(reclaimed)
    }
}

/// Total-order f32 wrapper for the top-k heap
#[derive(PartialEq)]
struct OrderedF32(f32);

impl Eq for OrderedF32 {}

impl PartialOrd for OrderedF32 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF32 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

fn encode_row(chunk_id: &str, last_accessed_ms: i64, values: &[f32]) -> Vec<u8> {
    let mut row = Vec::with_capacity(ID_BYTES + 8 + values.len() * 4);
    let mut id_bytes = [0u8; ID_BYTES];
    id_bytes[..chunk_id.len()].copy_from_slice(chunk_id.as_bytes());
    row.extend_from_slice(&id_bytes);
    row.extend_from_slice(&last_accessed_ms.to_le_bytes());
    for v in values {
        row.extend_from_slice(&v.to_le_bytes());
    }
    row
}

fn read_header(file: &mut File) -> Result<usize> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(EngramError::StateCorruption(
            "vector file magic mismatch".to_string(),
        ));
    }
    let mut dim_bytes = [0u8; 4];
    file.read_exact(&mut dim_bytes)?;
    Ok(u32::from_le_bytes(dim_bytes) as usize)
}

/// Scan every row into the map; later rows supersede earlier ones.
/// Returns the number of superseded (garbage) rows. A truncated tail is
/// skipped with a warning.
fn load_rows(
    file: &mut File,
    dim: usize,
    file_len: u64,
    rows: &mut HashMap<String, VectorRow>,
) -> Result<usize> {
    let row_len = (ID_BYTES + 8 + dim * 4) as u64;
    let mut garbage = 0usize;
    let mut offset = HEADER_LEN;
    file.seek(SeekFrom::Start(HEADER_LEN))?;

    let mut buf = vec![0u8; row_len as usize];
    while offset + row_len <= file_len {
        file.read_exact(&mut buf)?;
        let id_end = buf[..ID_BYTES]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(ID_BYTES);
        let id = match std::str::from_utf8(&buf[..id_end]) {
            Ok(id) if !id.is_empty() => id.to_string(),
            _ => {
                warn!("skipping malformed vector row at offset {}", offset);
                garbage += 1;
                offset += row_len;
                continue;
            }
        };
        let last_accessed_ms = i64::from_le_bytes(buf[ID_BYTES..ID_BYTES + 8].try_into().expect("8 bytes"));
        let values: Vec<f32> = buf[ID_BYTES + 8..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        if rows
            .insert(
                id,
                VectorRow {
                    values,
                    last_accessed_ms,
                    offset,
                },
            )
            .is_some()
        {
            garbage += 1;
        }
        offset += row_len;
    }

    if offset < file_len {
        warn!(
            "vector file has {} trailing bytes of partial row; ignored",
            file_len - offset
        );
    }
    Ok(garbage)
}
