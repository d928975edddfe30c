//! Tiled pixel storage: copy-on-write tiles, a memory manager that swaps cold
//! tiles to disk, and the per-device data manager built on both.

mod compressor;
mod data_manager;
mod dump;
mod extent;
mod memory;
mod snapshot;
mod spans;
mod swap;
mod tile;

pub use compressor::{
    CompressError, TILE_RECORD_HEADER_BYTES, TileCompressor, TileRecord, read_tile_record,
    write_tile_record,
};
pub use data_manager::TiledDataManager;
pub use dump::{DUMP_VERSION, DumpError};
pub use memory::{ConfigError, MemoryConfig, MemoryManager, MemoryStats};
pub use model::{COORD_LIMIT, Rect, TILE_SIZE, TileCoord};
pub use snapshot::{DataSnapshot, Transaction};
pub use spans::{TileSpan, TileSpans};
pub use swap::{SWAP_CHUNK_BYTES, SwapError, SwapSlot, SwapStore};
pub use tile::{TileData, TileReadGuard, tile_byte_len};
