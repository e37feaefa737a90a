//! Per-file cache metadata: size, checksum and the block residency bitmap.
//!
//! One bit per [`IO_BLOCK_SIZE`] block of the cached file records whether
//! that block has been written to the local cache file. The record is
//! persisted as JSON under `metaData/<path>` when a handle closes, so that a
//! later open can trust what is already on disk.
//!
//! The bitmap is packed into bytes (`Lsb0`) on disk:
//!
//! ```json
//! {"size": 40000, "checksum": "9e107d...", "blocks": 3, "bitmap": [5]}
//! ```

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use crate::config::IO_BLOCK_SIZE;
use crate::error::{CacheError, CacheResult};

/// Number of blocks needed to hold `size` bytes.
pub fn block_count(size: u64) -> u64 {
    size.div_ceil(IO_BLOCK_SIZE)
}

/// Blocks touched when `size` bytes are written starting at `offset`.
///
/// Returns `(first_block, num_blocks)`. A zero-length range touches no block.
pub fn block_info(offset: u64, size: u64) -> (u64, u64) {
    let first = offset / IO_BLOCK_SIZE;
    if size == 0 {
        return (first, 0);
    }
    let last = (offset + size - 1) / IO_BLOCK_SIZE;
    (first, last - first + 1)
}

#[allow(clippy::cast_possible_truncation)] // bitmap lengths are bounded by addressable memory
fn idx(block: u64) -> usize {
    block as usize
}

/// Residency record for one cached file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "PersistedMetaData", try_from = "PersistedMetaData")]
pub struct CacheMetaData {
    size: u64,
    checksum: String,
    bitmap: BitVec<u8, Lsb0>,
}

impl CacheMetaData {
    /// A record with no resident blocks.
    pub fn new(size: u64, checksum: impl Into<String>) -> Self {
        Self {
            size,
            checksum: checksum.into(),
            bitmap: bitvec![u8, Lsb0; 0; idx(block_count(size))],
        }
    }

    /// A record with every block resident.
    pub fn fully_resident(size: u64, checksum: impl Into<String>) -> Self {
        Self {
            size,
            checksum: checksum.into(),
            bitmap: bitvec![u8, Lsb0; 1; idx(block_count(size))],
        }
    }

    /// File size the record was created for.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Checksum of the content the resident blocks belong to.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Number of blocks tracked.
    pub fn blocks(&self) -> u64 {
        self.bitmap.len() as u64
    }

    /// Mark blocks `first..=last` resident.
    pub fn set_read_blocks(&mut self, first: u64, last: u64) -> CacheResult<()> {
        if first > last || last >= self.blocks() {
            return Err(CacheError::consistency(format!(
                "Incorrect block interval {first}..={last} for {} blocks",
                self.blocks()
            )));
        }
        self.bitmap[idx(first)..=idx(last)].fill(true);
        Ok(())
    }

    /// Whether `block` is resident. Blocks past the end are not.
    pub fn is_resident(&self, block: u64) -> bool {
        self.bitmap.get(idx(block)).is_some_and(|b| *b)
    }

    /// Number of resident blocks.
    pub fn resident_count(&self) -> u64 {
        self.bitmap.count_ones() as u64
    }

    /// Whether every tracked block is resident. True for an empty bitmap.
    pub fn is_complete(&self) -> bool {
        self.bitmap.all()
    }

    /// The smallest block range that still has to be fetched to make
    /// `first..=last` resident, or `None` if it already is.
    ///
    /// The interval is clamped to the tracked blocks.
    pub fn missing_range(&self, first: u64, last: u64) -> Option<(u64, u64)> {
        if self.bitmap.is_empty() || first > last || first >= self.blocks() {
            return None;
        }
        let last = last.min(self.blocks() - 1);
        let window = &self.bitmap[idx(first)..=idx(last)];
        let start = window.first_zero()?;
        let end = window.last_zero()?;
        Some((first + start as u64, first + end as u64))
    }

    /// First resident block strictly after `block`.
    pub fn next_resident_block(&self, block: u64) -> Option<u64> {
        let from = idx(block) + 1;
        if from >= self.bitmap.len() {
            return None;
        }
        self.bitmap[from..].first_one().map(|i| (from + i) as u64)
    }

    /// Re-size to `size` bytes with every block resident.
    ///
    /// Used when the local content becomes authoritative (write, truncate).
    pub fn resize_all_resident(&mut self, size: u64) {
        self.size = size;
        self.bitmap = bitvec![u8, Lsb0; 1; idx(block_count(size))];
    }

    /// Write the record to `path`, creating owner-only parent directories.
    pub fn persist(&self, path: &Path) -> CacheResult<()> {
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }
        let json = serde_json::to_vec(self)?;
        fs::write(path, json)?;
        tracing::trace!(path = %path.display(), blocks = self.blocks(), "Persisted cache metadata");
        Ok(())
    }

    /// Load a persisted record. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> CacheResult<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a persisted record. A missing file is not an error.
    pub fn remove(path: &Path) -> CacheResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// On-disk form of [`CacheMetaData`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedMetaData {
    size: u64,
    checksum: String,
    blocks: u64,
    bitmap: Vec<u8>,
}

impl From<CacheMetaData> for PersistedMetaData {
    fn from(meta: CacheMetaData) -> Self {
        let blocks = meta.blocks();
        Self {
            size: meta.size,
            checksum: meta.checksum,
            blocks,
            bitmap: meta.bitmap.into_vec(),
        }
    }
}

impl TryFrom<PersistedMetaData> for CacheMetaData {
    type Error = String;

    fn try_from(p: PersistedMetaData) -> Result<Self, Self::Error> {
        let blocks = idx(p.blocks);
        if p.bitmap.len() * 8 < blocks {
            return Err(format!(
                "bitmap holds {} bits but {} blocks are declared",
                p.bitmap.len() * 8,
                p.blocks
            ));
        }
        let mut bitmap = BitVec::<u8, Lsb0>::from_vec(p.bitmap);
        bitmap.truncate(blocks);
        Ok(Self {
            size: p.size,
            checksum: p.checksum,
            bitmap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BS: u64 = IO_BLOCK_SIZE;

    #[test]
    fn test_block_info() {
        assert_eq!(block_info(0, 0), (0, 0));
        assert_eq!(block_info(0, 1), (0, 1));
        assert_eq!(block_info(0, BS), (0, 1));
        assert_eq!(block_info(0, BS + 1), (0, 2));
        assert_eq!(block_info(BS - 1, 2), (0, 2));
        assert_eq!(block_info(3 * BS, BS), (3, 1));
    }

    #[test]
    fn test_new_record_has_no_resident_blocks() {
        let meta = CacheMetaData::new(3 * BS + 1, "abc");
        assert_eq!(meta.blocks(), 4);
        assert_eq!(meta.resident_count(), 0);
        assert!(!meta.is_complete());
        assert_eq!(meta.missing_range(0, 3), Some((0, 3)));
    }

    #[test]
    fn test_empty_file_is_complete() {
        let meta = CacheMetaData::new(0, crate::config::ZERO_LENGTH_MD5);
        assert_eq!(meta.blocks(), 0);
        assert!(meta.is_complete());
        assert_eq!(meta.missing_range(0, 0), None);
    }

    #[test]
    fn test_missing_range_narrows_to_gaps() {
        let mut meta = CacheMetaData::new(10 * BS, "x");
        meta.set_read_blocks(0, 2).unwrap();
        meta.set_read_blocks(7, 9).unwrap();
        assert_eq!(meta.missing_range(0, 9), Some((3, 6)));
        assert_eq!(meta.missing_range(0, 2), None);
        assert_eq!(meta.missing_range(5, 8), Some((5, 6)));
        // Clamped to the tracked blocks
        assert_eq!(meta.missing_range(8, 100), None);
    }

    #[test]
    fn test_next_resident_block() {
        let mut meta = CacheMetaData::new(10 * BS, "x");
        meta.set_read_blocks(6, 6).unwrap();
        assert_eq!(meta.next_resident_block(2), Some(6));
        assert_eq!(meta.next_resident_block(6), None);
        assert_eq!(meta.next_resident_block(9), None);
    }

    #[test]
    fn test_set_read_blocks_rejects_bad_interval() {
        let mut meta = CacheMetaData::new(2 * BS, "x");
        assert!(meta.set_read_blocks(1, 0).is_err());
        assert!(meta.set_read_blocks(0, 2).is_err());
        assert_eq!(meta.resident_count(), 0);
    }

    #[test]
    fn test_resize_all_resident() {
        let mut meta = CacheMetaData::new(BS, "x");
        meta.resize_all_resident(5 * BS - 3);
        assert_eq!(meta.size(), 5 * BS - 3);
        assert_eq!(meta.blocks(), 5);
        assert!(meta.is_complete());
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dirs/file.meta");

        let mut meta = CacheMetaData::new(13 * BS, "d00d");
        meta.set_read_blocks(1, 4).unwrap();
        meta.set_read_blocks(12, 12).unwrap();
        meta.persist(&path).unwrap();

        let loaded = CacheMetaData::load(&path).unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.resident_count(), 5);
        assert_eq!(loaded.checksum(), "d00d");
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(CacheMetaData::load(&dir.path().join("nope")).unwrap().is_none());
        CacheMetaData::remove(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn test_load_rejects_short_bitmap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad");
        fs::write(&path, r#"{"size": 1, "checksum": "c", "blocks": 20, "bitmap": [1]}"#).unwrap();
        assert!(CacheMetaData::load(&path).is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A missing range, when present, starts and ends on missing
            /// blocks and everything outside it inside the query is resident.
            #[test]
            fn missing_range_is_tight(
                blocks in 1u64..64,
                resident in proptest::collection::vec(any::<bool>(), 64),
                a in 0u64..64,
                b in 0u64..64,
            ) {
                let mut meta = CacheMetaData::new(blocks * BS, "p");
                for block in 0..blocks {
                    if resident[idx(block)] {
                        meta.set_read_blocks(block, block).unwrap();
                    }
                }
                let (first, last) = (a.min(b), a.max(b));
                match meta.missing_range(first, last) {
                    None => {
                        for block in first..=last.min(blocks - 1) {
                            prop_assert!(meta.is_resident(block));
                        }
                    }
                    Some((s, e)) => {
                        prop_assert!(first <= s && s <= e && e <= last);
                        prop_assert!(!meta.is_resident(s));
                        prop_assert!(!meta.is_resident(e));
                        for block in first..s {
                            prop_assert!(meta.is_resident(block));
                        }
                        for block in (e + 1)..=last.min(blocks - 1) {
                            prop_assert!(meta.is_resident(block));
                        }
                    }
                }
            }

            /// Complete exactly when every block of the size is resident.
            #[test]
            fn complete_iff_all_blocks_resident(size in 0u64..(40 * BS), fill in any::<bool>()) {
                let mut meta = CacheMetaData::new(size, "p");
                if fill && meta.blocks() > 0 {
                    meta.set_read_blocks(0, meta.blocks() - 1).unwrap();
                }
                prop_assert_eq!(meta.is_complete(), size == 0 || fill);
                prop_assert_eq!(meta.blocks(), block_count(size));
            }
        }
    }
}
