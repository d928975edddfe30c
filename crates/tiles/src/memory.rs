use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Deserialize;

use crate::swap::{SwapSlot, SwapStore};
use crate::tile::{SwapOut, TileData};

const BACKPRESSURE_POLL: Duration = Duration::from_millis(20);
const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Resident bytes above which tiles are proactively swapped out.
    pub soft_limit_bytes: usize,
    /// Resident bytes never exceeded; allocations wait for eviction instead.
    pub hard_limit_bytes: usize,
    /// Freed tile buffers kept for reuse.
    pub pool_limit: usize,
    /// Directory for the swap file; the system temp dir when unset.
    pub swap_directory: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_limit_bytes: 256 * MIB,
            hard_limit_bytes: 384 * MIB,
            pool_limit: 64,
            swap_directory: None,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hard_limit_bytes == 0 {
            return Err(ConfigError::ZeroHardLimit);
        }
        if self.soft_limit_bytes > self.hard_limit_bytes {
            return Err(ConfigError::SoftLimitAboveHardLimit {
                soft: self.soft_limit_bytes,
                hard: self.hard_limit_bytes,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("memory hard limit must be greater than zero")]
    ZeroHardLimit,
    #[error("memory soft limit ({soft} bytes) exceeds hard limit ({hard} bytes)")]
    SoftLimitAboveHardLimit { soft: usize, hard: usize },
    #[error("a tile of {tile_bytes} bytes does not fit under the hard limit ({hard} bytes)")]
    TileExceedsHardLimit { tile_bytes: usize, hard: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub resident_bytes: usize,
    pub resident_tiles: usize,
    pub swapped_tiles: usize,
    pub evictions: u64,
    pub swap_ins: u64,
    pub swap_read_failures: u64,
    pub swap_write_failures: u64,
    pub pooled_buffers: usize,
}

struct TileEntry {
    tile: Weak<TileData>,
    bytes: usize,
    resident: bool,
}

#[derive(Default)]
struct Registry {
    tiles: HashMap<u64, TileEntry>,
    resident_bytes: usize,
    largest_tile: usize,
}

#[derive(Default)]
struct Counters {
    evictions: AtomicU64,
    swap_ins: AtomicU64,
    swap_read_failures: AtomicU64,
    swap_write_failures: AtomicU64,
}

/// Accounts for every tile's memory and moves cold tiles to swap.
///
/// All tiles created against one manager share its limits. The registry
/// holds weak references only, so tiles are freed by their owners and report
/// back through `release_*`.
pub struct MemoryManager {
    config: ArcSwap<MemoryConfig>,
    registry: Mutex<Registry>,
    released: Condvar,
    pool: ArrayQueue<Box<[u8]>>,
    swap: SwapStore,
    clock: AtomicU64,
    next_tile_id: AtomicU64,
    counters: Counters,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let pool = ArrayQueue::new(config.pool_limit.max(1));
        let swap = SwapStore::new(config.swap_directory.clone());
        Ok(Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            registry: Mutex::new(Registry::default()),
            released: Condvar::new(),
            pool,
            swap,
            clock: AtomicU64::new(0),
            next_tile_id: AtomicU64::new(1),
            counters: Counters::default(),
        }))
    }

    pub fn config(&self) -> Arc<MemoryConfig> {
        self.config.load_full()
    }

    /// Replaces the limits. The new values apply from the next eviction
    /// check; the swap directory and pool capacity are fixed at construction.
    ///
    /// A hard limit below the largest admitted tile size is rejected.
    pub fn reload_config(&self, config: MemoryConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let registry = self.registry.lock();
        if config.hard_limit_bytes < registry.largest_tile {
            return Err(ConfigError::TileExceedsHardLimit {
                tile_bytes: registry.largest_tile,
                hard: config.hard_limit_bytes,
            });
        }
        tracing::debug!(
            soft_limit_bytes = config.soft_limit_bytes,
            hard_limit_bytes = config.hard_limit_bytes,
            "memory limits reloaded"
        );
        self.config.store(Arc::new(config));
        drop(registry);
        self.released.notify_all();
        Ok(())
    }

    /// Registers a tile size that devices on this manager will allocate.
    /// Fails when a single such tile would not fit under the hard limit.
    pub fn admit_tile_size(&self, tile_bytes: usize) -> Result<(), ConfigError> {
        let mut registry = self.registry.lock();
        let hard = self.config.load().hard_limit_bytes;
        if tile_bytes > hard {
            return Err(ConfigError::TileExceedsHardLimit { tile_bytes, hard });
        }
        registry.largest_tile = registry.largest_tile.max(tile_bytes);
        Ok(())
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub fn stats(&self) -> MemoryStats {
        let registry = self.registry.lock();
        let resident_tiles = registry
            .tiles
            .values()
            .filter(|entry| entry.resident)
            .count();
        MemoryStats {
            resident_bytes: registry.resident_bytes,
            resident_tiles,
            swapped_tiles: registry.tiles.len() - resident_tiles,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            swap_ins: self.counters.swap_ins.load(Ordering::Relaxed),
            swap_read_failures: self.counters.swap_read_failures.load(Ordering::Relaxed),
            swap_write_failures: self.counters.swap_write_failures.load(Ordering::Relaxed),
            pooled_buffers: self.pool.len(),
        }
    }

    /// Accounts `bytes` of new resident tile memory.
    ///
    /// Evicts least recently touched tiles while the hard limit would be
    /// exceeded and waits when nothing is evictable. Afterwards the soft limit
    /// is restored as far as unpinned tiles allow.
    pub fn reserve(&self, bytes: usize) {
        let mut keep_alive = Vec::new();
        let mut registry = self.registry.lock();
        let mut waiting = false;
        loop {
            let hard_limit = self.config.load().hard_limit_bytes;
            assert!(
                bytes <= hard_limit,
                "tile of {bytes} bytes exceeds the hard memory limit of {hard_limit} bytes"
            );
            if registry.resident_bytes + bytes <= hard_limit {
                registry.resident_bytes += bytes;
                break;
            }
            self.evict_locked(&mut registry, hard_limit - bytes, &mut keep_alive);
            if !keep_alive.is_empty() {
                MutexGuard::unlocked(&mut registry, || keep_alive.clear());
            }
            if registry.resident_bytes + bytes <= hard_limit {
                continue;
            }
            if !waiting {
                tracing::debug!(
                    requested = bytes,
                    resident = registry.resident_bytes,
                    hard_limit,
                    "tile allocation waiting for evictable memory"
                );
                waiting = true;
            }
            self.released.wait_for(&mut registry, BACKPRESSURE_POLL);
        }
        let soft_limit = self.config.load().soft_limit_bytes;
        if registry.resident_bytes > soft_limit {
            self.evict_locked(&mut registry, soft_limit, &mut keep_alive);
        }
        drop(registry);
        drop(keep_alive);
    }

    /// Swaps out unpinned tiles until resident memory is at or below the soft
    /// limit. Returns the number of bytes freed.
    pub fn request_eviction(&self) -> usize {
        let mut keep_alive = Vec::new();
        let freed = {
            let mut registry = self.registry.lock();
            let soft_limit = self.config.load().soft_limit_bytes;
            self.evict_locked(&mut registry, soft_limit, &mut keep_alive)
        };
        drop(keep_alive);
        freed
    }

    /// Upgraded tiles are parked in `keep_alive`; the caller drops them after
    /// releasing the registry lock because a tile's `Drop` re-enters it.
    fn evict_locked(
        &self,
        registry: &mut Registry,
        target_bytes: usize,
        keep_alive: &mut Vec<Arc<TileData>>,
    ) -> usize {
        if registry.resident_bytes <= target_bytes {
            return 0;
        }
        let mut candidates = registry
            .tiles
            .values()
            .filter(|entry| entry.resident)
            .filter_map(|entry| entry.tile.upgrade())
            .collect::<Vec<_>>();
        candidates.sort_by_key(|tile| (tile.last_touch(), tile.coord(), tile.id()));

        let mut freed = 0;
        for tile in &candidates {
            if registry.resident_bytes <= target_bytes {
                break;
            }
            match tile.swap_out(&self.swap) {
                SwapOut::Evicted(buffer) => {
                    let Some(entry) = registry.tiles.get_mut(&tile.id()) else {
                        panic!("evicted tile missing from memory registry");
                    };
                    entry.resident = false;
                    registry.resident_bytes -= entry.bytes;
                    freed += entry.bytes;
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    self.recycle(buffer);
                }
                SwapOut::Busy => {}
                SwapOut::Failed(error) => {
                    self.counters
                        .swap_write_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tile = tile.id(),
                        col = tile.coord().col,
                        row = tile.coord().row,
                        %error,
                        "swap-out failed; tile stays resident"
                    );
                }
            }
        }
        if freed > 0 {
            tracing::debug!(
                freed,
                resident = registry.resident_bytes,
                target = target_bytes,
                "evicted tiles to swap"
            );
        }
        keep_alive.extend(candidates);
        freed
    }

    pub(crate) fn register(&self, tile: &Arc<TileData>) {
        let mut registry = self.registry.lock();
        let previous = registry.tiles.insert(
            tile.id(),
            TileEntry {
                tile: Arc::downgrade(tile),
                bytes: tile.byte_len(),
                resident: true,
            },
        );
        if previous.is_some() {
            panic!("tile {} registered twice", tile.id());
        }
    }

    pub(crate) fn mark_resident(&self, tile_id: u64) {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.tiles.get_mut(&tile_id) else {
            panic!("swapped-in tile {tile_id} missing from memory registry");
        };
        entry.resident = true;
    }

    pub(crate) fn release_resident(&self, tile_id: u64, bytes: usize, buffer: Box<[u8]>) {
        {
            let mut registry = self.registry.lock();
            registry.tiles.remove(&tile_id);
            registry.resident_bytes = registry
                .resident_bytes
                .checked_sub(bytes)
                .expect("resident tile bytes underflow");
        }
        self.recycle(buffer);
        self.released.notify_all();
    }

    pub(crate) fn release_swapped(&self, tile_id: u64, slot: SwapSlot) {
        self.registry.lock().tiles.remove(&tile_id);
        self.swap.free(slot);
    }

    pub(crate) fn notify_unpinned(&self) {
        self.released.notify_all();
    }

    pub(crate) fn take_buffer(&self, len: usize) -> Box<[u8]> {
        while let Some(buffer) = self.pool.pop() {
            if buffer.len() == len {
                return buffer;
            }
        }
        vec![0; len].into_boxed_slice()
    }

    fn recycle(&self, buffer: Box<[u8]>) {
        if buffer.is_empty() || self.pool.len() >= self.config.load().pool_limit {
            return;
        }
        let _ = self.pool.push(buffer);
    }

    pub(crate) fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn next_tile_id(&self) -> u64 {
        self.next_tile_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_swap_in(&self) {
        self.counters.swap_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_swap_read_failure(&self) {
        self.counters
            .swap_read_failures
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MemoryManager")
            .field("config", &self.config())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
