//! On-disk layout of one cache namespace.
//!
//! Entry file format:
//! - Header: [`EntryHeader`] (magic, version, width, height, fingerprint)
//! - Data: little-endian f32 pixels, `[[x, y]]` row-major (width * height * 4 bytes)
//!
//! The namespace directory also holds `index.json` with the byte size and
//! last access stamp of every entry, so LRU order survives restarts.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::fingerprint::{CACHE_FORMAT_VERSION, Fingerprint};
use crate::error::CacheError;

const MAGIC: [u8; 4] = *b"MPRC";
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct EntryHeader {
    magic: [u8; 4],
    version: u32,
    width: u32,
    height: u32,
    fingerprint: [u8; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexRecord {
    pub(crate) bytes: u64,
    pub(crate) last_access: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NamespaceIndex {
    pub(crate) version: u32,
    pub(crate) field: String,
    pub(crate) entries: BTreeMap<String, IndexRecord>,
}

impl NamespaceIndex {
    pub(crate) fn new(field: &str) -> Self {
        Self {
            version: CACHE_FORMAT_VERSION,
            field: field.to_owned(),
            entries: BTreeMap::new(),
        }
    }
}

pub(crate) fn entry_path(dir: &Path, fingerprint: Fingerprint) -> PathBuf {
    dir.join(format!("{fingerprint}.bin"))
}

/// Write to a sibling temp file and rename, so readers never see a partial
/// entry.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| CacheError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| CacheError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CacheError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CacheError::io(path, e))
}

pub(crate) fn write_entry(
    dir: &Path,
    fingerprint: Fingerprint,
    pixels: &Array2<f32>,
) -> Result<(), CacheError> {
    let (width, height) = pixels.dim();
    let header = EntryHeader {
        magic: MAGIC,
        version: CACHE_FORMAT_VERSION.to_le(),
        width: (width as u32).to_le(),
        height: (height as u32).to_le(),
        fingerprint: fingerprint.to_le_bytes(),
    };
    let mut bytes = Vec::with_capacity(size_of::<EntryHeader>() + pixels.len() * 4);
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    for value in pixels.iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    write_atomic(&entry_path(dir, fingerprint), &bytes)
}

pub(crate) fn read_entry(dir: &Path, fingerprint: Fingerprint) -> Result<Array2<f32>, CacheError> {
    let path = entry_path(dir, fingerprint);
    let bytes = fs::read(&path).map_err(|e| CacheError::io(&path, e))?;
    if bytes.len() < size_of::<EntryHeader>() {
        return Err(CacheError::corrupt(&path, "truncated header"));
    }
    let (head, body) = bytes.split_at(size_of::<EntryHeader>());
    let header: EntryHeader = bytemuck::pod_read_unaligned(head);
    if header.magic != MAGIC {
        return Err(CacheError::corrupt(&path, "bad magic"));
    }
    let version = u32::from_le(header.version);
    if version != CACHE_FORMAT_VERSION {
        return Err(CacheError::VersionMismatch {
            found: version,
            expected: CACHE_FORMAT_VERSION,
        });
    }
    if Fingerprint::from_le_bytes(header.fingerprint) != fingerprint {
        return Err(CacheError::corrupt(&path, "fingerprint mismatch"));
    }
    let width = u32::from_le(header.width) as usize;
    let height = u32::from_le(header.height) as usize;
    if body.len() != width * height * 4 {
        return Err(CacheError::corrupt(
            &path,
            format!("expected {} data bytes, found {}", width * height * 4, body.len()),
        ));
    }
    let values: Vec<f32> = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array2::from_shape_vec((width, height), values)
        .map_err(|e| CacheError::corrupt(&path, e.to_string()))
}

/// Size on disk of an entry holding `pixel_bytes` of data.
pub(crate) fn entry_file_len(pixel_bytes: u64) -> u64 {
    size_of::<EntryHeader>() as u64 + pixel_bytes
}

/// Delete an entry file. A file that is already gone is not an error.
pub(crate) fn remove_entry(dir: &Path, fingerprint: Fingerprint) -> bool {
    let path = entry_path(dir, fingerprint);
    match fs::remove_file(&path) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            warn!(path = %path.display(), %err, "Failed to remove cache entry");
            false
        }
    }
}

/// Delete entry files not listed in `keep` and leftover temp files.
/// Returns the number of files removed.
pub(crate) fn sweep_orphans(dir: &Path, keep: &HashSet<Fingerprint>) -> usize {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for item in read_dir.flatten() {
        let path = item.path();
        let orphan = match path.extension().and_then(|e| e.to_str()) {
            Some("tmp") => true,
            Some("bin") => path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<Fingerprint>().ok())
                .is_none_or(|fp| !keep.contains(&fp)),
            _ => false,
        };
        if orphan && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

pub(crate) fn write_index(dir: &Path, index: &NamespaceIndex) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec_pretty(index)?;
    write_atomic(&dir.join(INDEX_FILE), &bytes)
}

pub(crate) fn read_index(dir: &Path) -> Result<NamespaceIndex, CacheError> {
    let path = dir.join(INDEX_FILE);
    let bytes = fs::read(&path).map_err(|e| CacheError::io(&path, e))?;
    let index: NamespaceIndex = serde_json::from_slice(&bytes)?;
    if index.version != CACHE_FORMAT_VERSION {
        return Err(CacheError::VersionMismatch {
            found: index.version,
            expected: CACHE_FORMAT_VERSION,
        });
    }
    Ok(index)
}
