use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use model::{TILE_PIXELS, TileCoord};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::memory::MemoryManager;
use crate::swap::{SwapError, SwapSlot, SwapStore};

pub fn tile_byte_len(pixel_size: usize) -> usize {
    TILE_PIXELS
        .checked_mul(pixel_size)
        .expect("tile byte length overflow")
}

#[derive(Debug)]
enum TileBuffer {
    Resident(Box<[u8]>),
    Swapped(SwapSlot),
}

pub(crate) enum SwapOut {
    Evicted(Box<[u8]>),
    Busy,
    Failed(SwapError),
}

/// One `TILE_SIZE x TILE_SIZE` block of pixels.
///
/// Tiles are shared as `Arc<TileData>`; a tile reachable from more than one
/// place is copied before it is written. Pixels are read through
/// [`TileData::read`], whose guard pins the tile in memory until it is
/// dropped. Writes happen inside the data manager that owns the tile.
///
/// `coord` is the grid position the tile was created for. A tile shared at
/// several positions (see `TiledDataManager::fill`) keeps its original one.
/// Content lost in swap is reset to the default pixel the tile was created
/// with.
pub struct TileData {
    id: u64,
    coord: TileCoord,
    pixel_size: usize,
    default_pixel: Arc<[u8]>,
    state: RwLock<TileBuffer>,
    pins: AtomicUsize,
    last_touch: AtomicU64,
    degraded: AtomicBool,
    memory: Arc<MemoryManager>,
}

impl TileData {
    pub(crate) fn filled(
        coord: TileCoord,
        pixel: &[u8],
        default_pixel: Arc<[u8]>,
        memory: &Arc<MemoryManager>,
    ) -> Arc<Self> {
        assert_eq!(
            pixel.len(),
            default_pixel.len(),
            "fill pixel size does not match tile pixel size"
        );
        Self::allocate(coord, default_pixel, memory, |buffer| {
            fill_pixels(buffer, pixel);
        })
    }

    pub(crate) fn from_bytes(
        coord: TileCoord,
        bytes: &[u8],
        default_pixel: Arc<[u8]>,
        memory: &Arc<MemoryManager>,
    ) -> Arc<Self> {
        assert_eq!(
            bytes.len(),
            tile_byte_len(default_pixel.len()),
            "tile bytes do not match tile size"
        );
        Self::allocate(coord, default_pixel, memory, |buffer| {
            buffer.copy_from_slice(bytes);
        })
    }

    pub(crate) fn duplicate_at(&self, coord: TileCoord) -> Arc<Self> {
        let source = self.read();
        Self::allocate(coord, self.default_pixel.clone(), &self.memory, |buffer| {
            buffer.copy_from_slice(&source);
        })
    }

    fn allocate(
        coord: TileCoord,
        default_pixel: Arc<[u8]>,
        memory: &Arc<MemoryManager>,
        init: impl FnOnce(&mut [u8]),
    ) -> Arc<Self> {
        let pixel_size = default_pixel.len();
        let byte_len = tile_byte_len(pixel_size);
        memory.reserve(byte_len);
        let mut buffer = memory.take_buffer(byte_len);
        init(&mut buffer);
        let tile = Arc::new(Self {
            id: memory.next_tile_id(),
            coord,
            pixel_size,
            default_pixel,
            state: RwLock::new(TileBuffer::Resident(buffer)),
            pins: AtomicUsize::new(0),
            last_touch: AtomicU64::new(memory.tick()),
            degraded: AtomicBool::new(false),
            memory: memory.clone(),
        });
        memory.register(&tile);
        tile
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    pub fn byte_len(&self) -> usize {
        tile_byte_len(self.pixel_size)
    }

    pub fn last_touch(&self) -> u64 {
        self.last_touch.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::SeqCst) > 0
    }

    pub fn is_resident(&self) -> bool {
        matches!(*self.state.read(), TileBuffer::Resident(_))
    }

    /// Set when swapping the tile back in failed and its content was reset
    /// to the default pixel.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn read(&self) -> TileReadGuard<'_> {
        self.pin();
        self.ensure_resident();
        let state = self.state.read();
        self.touch();
        TileReadGuard {
            tile: self,
            state: Some(state),
        }
    }

    /// Tiles may be shared between devices, snapshots and spans, so only
    /// the owning data manager writes, after making its copy unique.
    pub(crate) fn write(&self) -> TileWriteGuard<'_> {
        self.pin();
        self.ensure_resident();
        let state = self.state.write();
        self.touch();
        TileWriteGuard {
            tile: self,
            state: Some(state),
        }
    }

    /// Whether every pixel equals `pixel`.
    pub fn is_uniform(&self, pixel: &[u8]) -> bool {
        let pixels = self.read();
        pixels.chunks_exact(self.pixel_size).all(|each| each == pixel)
    }

    fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    fn unpin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "tile unpinned more often than pinned");
        if previous == 1 {
            self.memory.notify_unpinned();
        }
    }

    fn touch(&self) {
        self.last_touch
            .store(self.memory.tick(), Ordering::Release);
    }

    fn ensure_resident(&self) {
        if self.is_resident() {
            return;
        }
        let mut state = self.state.write();
        let TileBuffer::Swapped(slot) = *state else {
            return;
        };
        let byte_len = self.byte_len();
        self.memory.reserve(byte_len);
        let mut buffer = self.memory.take_buffer(byte_len);
        match self.memory.swap().load(slot, self.coord, byte_len) {
            Ok(data) => {
                buffer.copy_from_slice(&data);
                self.memory.record_swap_in();
            }
            Err(error) => {
                tracing::warn!(
                    tile = self.id,
                    col = self.coord.col,
                    row = self.coord.row,
                    %error,
                    "swap-in failed; tile reset to default content"
                );
                fill_pixels(&mut buffer, &self.default_pixel);
                self.degraded.store(true, Ordering::Release);
                self.memory.record_swap_read_failure();
            }
        }
        self.memory.swap().free(slot);
        *state = TileBuffer::Resident(buffer);
        self.memory.mark_resident(self.id);
    }

    /// Moves the buffer to swap unless the tile is pinned or locked.
    pub(crate) fn swap_out(&self, swap: &SwapStore) -> SwapOut {
        if self.is_pinned() {
            return SwapOut::Busy;
        }
        let Some(mut state) = self.state.try_write() else {
            return SwapOut::Busy;
        };
        if self.is_pinned() {
            return SwapOut::Busy;
        }
        let slot = match &*state {
            TileBuffer::Resident(buffer) => match swap.store(self.coord, buffer) {
                Ok(slot) => slot,
                Err(error) => return SwapOut::Failed(error),
            },
            TileBuffer::Swapped(_) => return SwapOut::Busy,
        };
        match std::mem::replace(&mut *state, TileBuffer::Swapped(slot)) {
            TileBuffer::Resident(buffer) => SwapOut::Evicted(buffer),
            TileBuffer::Swapped(_) => panic!("tile residency changed under its write lock"),
        }
    }
}

impl Drop for TileData {
    fn drop(&mut self) {
        let byte_len = tile_byte_len(self.pixel_size);
        match self.state.get_mut() {
            TileBuffer::Resident(buffer) => {
                let buffer = std::mem::take(buffer);
                self.memory.release_resident(self.id, byte_len, buffer);
            }
            TileBuffer::Swapped(slot) => {
                let slot = *slot;
                self.memory.release_swapped(self.id, slot);
            }
        }
    }
}

impl fmt::Debug for TileData {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TileData")
            .field("id", &self.id)
            .field("coord", &self.coord)
            .field("pixel_size", &self.pixel_size)
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

pub struct TileReadGuard<'a> {
    tile: &'a TileData,
    state: Option<RwLockReadGuard<'a, TileBuffer>>,
}

impl Deref for TileReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.state.as_deref() {
            Some(TileBuffer::Resident(buffer)) => buffer,
            _ => panic!("pinned tile is not resident"),
        }
    }
}

impl Drop for TileReadGuard<'_> {
    fn drop(&mut self) {
        self.state.take();
        self.tile.unpin();
    }
}

pub(crate) struct TileWriteGuard<'a> {
    tile: &'a TileData,
    state: Option<RwLockWriteGuard<'a, TileBuffer>>,
}

impl Deref for TileWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.state.as_deref() {
            Some(TileBuffer::Resident(buffer)) => buffer,
            _ => panic!("pinned tile is not resident"),
        }
    }
}

impl DerefMut for TileWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.state.as_deref_mut() {
            Some(TileBuffer::Resident(buffer)) => buffer,
            _ => panic!("pinned tile is not resident"),
        }
    }
}

impl Drop for TileWriteGuard<'_> {
    fn drop(&mut self) {
        self.state.take();
        self.tile.unpin();
    }
}

pub(crate) fn fill_pixels(buffer: &mut [u8], pixel: &[u8]) {
    if pixel.iter().all(|byte| *byte == pixel[0]) {
        buffer.fill(pixel[0]);
        return;
    }
    for chunk in buffer.chunks_exact_mut(pixel.len()) {
        chunk.copy_from_slice(pixel);
    }
}
