use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bitvec::prelude::{BitVec, Lsb0};
use model::TileCoord;
use parking_lot::Mutex;
use static_assertions::const_assert;

use crate::compressor::{
    CompressError, TileCompressor, TileRecord, read_tile_record, write_tile_record,
};

pub const SWAP_CHUNK_BYTES: usize = 4096;

const_assert!(SWAP_CHUNK_BYTES.is_power_of_two());
const_assert!(SWAP_CHUNK_BYTES > crate::compressor::TILE_RECORD_HEADER_BYTES);

/// Location of one swapped-out tile record inside the swap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot {
    first_chunk: usize,
    chunk_count: usize,
    len: usize,
}

impl SwapSlot {
    pub fn stored_bytes(&self) -> usize {
        self.len
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("failed to create swap file: {0}")]
    Create(#[source] io::Error),
    #[error("swap file i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("swap record holds tile ({found_col}, {found_row}), expected ({expected_col}, {expected_row})")]
    CoordMismatch {
        expected_col: i32,
        expected_row: i32,
        found_col: i32,
        found_row: i32,
    },
    #[error("swapped tile payload is corrupt: {0}")]
    Corrupt(#[from] CompressError),
    #[error("injected swap {0} failure")]
    Injected(&'static str),
}

#[derive(Debug, Default)]
struct SwapFile {
    file: Option<File>,
    chunks: BitVec<u64, Lsb0>,
    failing_reads: usize,
    failing_writes: usize,
}

/// Append-mostly backing file for evicted tiles.
///
/// Space is handed out in `SWAP_CHUNK_BYTES` chunks; a record always occupies
/// one contiguous run, reused first-fit after its tile is swapped back in.
#[derive(Debug)]
pub struct SwapStore {
    directory: Option<PathBuf>,
    inner: Mutex<SwapFile>,
}

impl SwapStore {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self {
            directory,
            inner: Mutex::new(SwapFile::default()),
        }
    }

    pub fn store(&self, coord: TileCoord, data: &[u8]) -> Result<SwapSlot, SwapError> {
        let record = TileRecord::encode(coord, TileCompressor::CURRENT, data);
        let mut bytes = Vec::with_capacity(record.encoded_len());
        write_tile_record(&mut bytes, &record)?;

        let mut inner = self.inner.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(SwapError::Injected("write"));
        }
        if inner.file.is_none() {
            let file = match &self.directory {
                Some(directory) => tempfile::tempfile_in(directory),
                None => tempfile::tempfile(),
            }
            .map_err(SwapError::Create)?;
            tracing::debug!(directory = ?self.directory, "created tile swap file");
            inner.file = Some(file);
        }

        let chunk_count = bytes.len().div_ceil(SWAP_CHUNK_BYTES);
        let first_chunk = inner.allocate_chunks(chunk_count);
        let slot = SwapSlot {
            first_chunk,
            chunk_count,
            len: bytes.len(),
        };
        if let Err(error) = inner.write_at(slot.offset(), &bytes) {
            inner.release_chunks(slot);
            return Err(error.into());
        }
        Ok(slot)
    }

    pub fn load(
        &self,
        slot: SwapSlot,
        coord: TileCoord,
        expected_len: usize,
    ) -> Result<Vec<u8>, SwapError> {
        let bytes = {
            let mut inner = self.inner.lock();
            if inner.failing_reads > 0 {
                inner.failing_reads -= 1;
                return Err(SwapError::Injected("read"));
            }
            inner.read_at(slot.offset(), slot.len)?
        };
        let record = read_tile_record(&mut bytes.as_slice())?;
        if record.coord != coord {
            return Err(SwapError::CoordMismatch {
                expected_col: coord.col,
                expected_row: coord.row,
                found_col: record.coord.col,
                found_row: record.coord.row,
            });
        }
        Ok(record.decode(expected_len)?)
    }

    pub fn free(&self, slot: SwapSlot) {
        self.inner.lock().release_chunks(slot);
    }

    pub fn used_chunks(&self) -> usize {
        self.inner.lock().chunks.count_ones()
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub fn inject_read_failures(&self, count: usize) {
        self.inner.lock().failing_reads = count;
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub fn inject_write_failures(&self, count: usize) {
        self.inner.lock().failing_writes = count;
    }
}

impl SwapSlot {
    fn offset(&self) -> u64 {
        (self.first_chunk as u64)
            .checked_mul(SWAP_CHUNK_BYTES as u64)
            .expect("swap offset overflow")
    }
}

impl SwapFile {
    fn allocate_chunks(&mut self, count: usize) -> usize {
        assert!(count > 0, "swap record must occupy at least one chunk");
        let mut run_start = 0;
        let mut run_len = 0;
        for (index, used) in self.chunks.iter().by_vals().enumerate() {
            if used {
                run_start = index + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == count {
                self.chunks[run_start..run_start + count].fill(true);
                return run_start;
            }
        }
        let start = self.chunks.len() - run_len;
        self.chunks.resize(start + count, false);
        self.chunks[start..start + count].fill(true);
        start
    }

    fn release_chunks(&mut self, slot: SwapSlot) {
        let end = slot.first_chunk + slot.chunk_count;
        assert!(end <= self.chunks.len(), "swap slot outside swap file");
        assert!(
            self.chunks[slot.first_chunk..end].all(),
            "swap slot released twice"
        );
        self.chunks[slot.first_chunk..end].fill(false);
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "swap file not created"))
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)
    }

    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0; len];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_loads_tile_bytes() {
        let directory = tempfile::tempdir().expect("create swap dir");
        let store = SwapStore::new(Some(directory.path().to_path_buf()));
        let data = (0..16384).map(|index| (index / 64) as u8).collect::<Vec<_>>();

        let slot = store.store(TileCoord::new(2, -1), &data).expect("store tile");
        let loaded = store
            .load(slot, TileCoord::new(2, -1), data.len())
            .expect("load tile");
        assert_eq!(loaded, data);
    }

    #[test]
    fn freed_chunks_are_reused_first_fit() {
        let store = SwapStore::new(None);
        let data = vec![9u8; 64];
        let first = store.store(TileCoord::new(0, 0), &data).expect("store first");
        let second = store.store(TileCoord::new(1, 0), &data).expect("store second");
        assert_eq!(store.used_chunks(), 2);

        store.free(first);
        assert_eq!(store.used_chunks(), 1);
        let third = store.store(TileCoord::new(2, 0), &data).expect("store third");
        assert_eq!(third.first_chunk, first.first_chunk);
        assert_ne!(third.first_chunk, second.first_chunk);
    }

    #[test]
    fn load_rejects_record_for_other_tile() {
        let store = SwapStore::new(None);
        let slot = store
            .store(TileCoord::new(4, 4), &[1, 2, 3, 4])
            .expect("store tile");
        let error = store
            .load(slot, TileCoord::new(5, 4), 4)
            .expect_err("coordinate mismatch must fail");
        assert!(matches!(error, SwapError::CoordMismatch { .. }));
    }

    #[test]
    fn injected_failures_surface_as_errors() {
        let store = SwapStore::new(None);
        store.inject_write_failures(1);
        assert!(matches!(
            store.store(TileCoord::new(0, 0), &[0; 8]),
            Err(SwapError::Injected("write"))
        ));
        let slot = store.store(TileCoord::new(0, 0), &[0; 8]).expect("second store");

        store.inject_read_failures(1);
        assert!(matches!(
            store.load(slot, TileCoord::new(0, 0), 8),
            Err(SwapError::Injected("read"))
        ));
        assert_eq!(
            store
                .load(slot, TileCoord::new(0, 0), 8)
                .expect("retry load"),
            vec![0; 8]
        );
    }

    #[test]
    #[should_panic(expected = "swap slot released twice")]
    fn double_free_aborts() {
        let store = SwapStore::new(None);
        let slot = store.store(TileCoord::new(0, 0), &[1; 8]).expect("store tile");
        store.free(slot);
        store.free(slot);
    }
}
