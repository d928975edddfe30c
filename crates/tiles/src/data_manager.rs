use std::collections::HashMap;
use std::sync::Arc;

use model::{Rect, TileCoord};
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::extent::ExtentTracker;
use crate::memory::{ConfigError, MemoryManager};
use crate::spans::TileSpans;
use crate::tile::{TileData, fill_pixels, tile_byte_len};

/// Tiles plus the pixel that absent tiles read as.
#[derive(Debug, Clone)]
pub(crate) struct TileMap {
    pub(crate) tiles: Arc<HashMap<TileCoord, Arc<TileData>>>,
    extent: Arc<ExtentTracker>,
    pub(crate) default_pixel: Arc<[u8]>,
}

impl TileMap {
    pub(crate) fn new(default_pixel: Arc<[u8]>) -> Self {
        Self {
            tiles: Arc::default(),
            extent: Arc::default(),
            default_pixel,
        }
    }

    pub(crate) fn get(&self, coord: TileCoord) -> Option<&Arc<TileData>> {
        self.tiles.get(&coord)
    }

    pub(crate) fn insert(&mut self, coord: TileCoord, tile: Arc<TileData>) {
        let previous = Arc::make_mut(&mut self.tiles).insert(coord, tile);
        if previous.is_none() {
            Arc::make_mut(&mut self.extent).add(coord);
        }
    }

    pub(crate) fn remove(&mut self, coord: TileCoord) -> Option<Arc<TileData>> {
        if !self.tiles.contains_key(&coord) {
            return None;
        }
        let removed = Arc::make_mut(&mut self.tiles).remove(&coord);
        Arc::make_mut(&mut self.extent).remove(coord);
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.tiles.len()
    }

    pub(crate) fn extent(&self) -> Rect {
        self.extent.extent()
    }

    pub(crate) fn sorted_coords(&self) -> Vec<TileCoord> {
        let mut coords = self.tiles.keys().copied().collect::<Vec<_>>();
        coords.sort();
        coords
    }

    /// The tile at `coord` when a writer may modify it in place.
    fn exclusive(&self, coord: TileCoord) -> Option<&Arc<TileData>> {
        if Arc::strong_count(&self.tiles) != 1 {
            return None;
        }
        self.tiles
            .get(&coord)
            .filter(|tile| Arc::strong_count(tile) == 1)
    }

    pub(crate) fn read_pixel_into(&self, x: i32, y: i32, out: &mut [u8]) {
        assert_eq!(
            out.len(),
            self.default_pixel.len(),
            "pixel buffer does not match device pixel size"
        );
        let coord = TileCoord::from_pixel(x, y);
        match self.get(coord) {
            Some(tile) => {
                let offset = coord.pixel_index(x, y) * out.len();
                let pixels = tile.read();
                out.copy_from_slice(&pixels[offset..offset + out.len()]);
            }
            None => out.copy_from_slice(&self.default_pixel),
        }
    }
}

/// Sparse, unbounded tiled pixel storage for one paint device.
///
/// Absent tiles read as the default pixel. Tiles are shared with snapshots
/// and other devices and are copied on their first write afterwards. All
/// methods take `&self`; concurrent writers to different tiles only contend
/// on the tiles themselves.
///
/// Pixels are stored within [`Rect::ADDRESSABLE`]; writing outside it
/// panics.
#[derive(Debug)]
pub struct TiledDataManager {
    pixel_size: usize,
    memory: Arc<MemoryManager>,
    content: RwLock<TileMap>,
}

impl TiledDataManager {
    /// Fails when one tile of this pixel size would not fit under the
    /// memory manager's hard limit.
    pub fn new(
        pixel_size: usize,
        default_pixel: &[u8],
        memory: Arc<MemoryManager>,
    ) -> Result<Self, ConfigError> {
        assert!(pixel_size > 0, "pixel size must be at least one byte");
        assert_eq!(
            default_pixel.len(),
            pixel_size,
            "default pixel does not match pixel size"
        );
        memory.admit_tile_size(tile_byte_len(pixel_size))?;
        Ok(Self {
            pixel_size,
            memory,
            content: RwLock::new(TileMap::new(Arc::from(default_pixel))),
        })
    }

    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    pub fn default_pixel(&self) -> Arc<[u8]> {
        self.content.read().default_pixel.clone()
    }

    /// Changes what absent tiles read as. Allocated tiles keep their pixels.
    pub fn set_default_pixel(&self, pixel: &[u8]) {
        self.check_pixel(pixel);
        self.content.write().default_pixel = Arc::from(pixel);
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn read_pixel(&self, x: i32, y: i32) -> Vec<u8> {
        let mut pixel = vec![0; self.pixel_size];
        self.read_pixel_into(x, y, &mut pixel);
        pixel
    }

    pub fn read_pixel_into(&self, x: i32, y: i32, out: &mut [u8]) {
        self.content.read().read_pixel_into(x, y, out);
    }

    pub fn write_pixel(&self, x: i32, y: i32, pixel: &[u8]) {
        self.check_pixel(pixel);
        check_addressable(Rect::new(x, y, 1, 1));
        let coord = TileCoord::from_pixel(x, y);
        let offset = coord.pixel_index(x, y) * self.pixel_size;
        self.with_writable_tile(coord, |pixels| {
            pixels[offset..offset + pixel.len()].copy_from_slice(pixel);
        });
    }

    /// Tile-aligned bounding box of all allocated tiles.
    pub fn extent(&self) -> Rect {
        self.content.read().extent()
    }

    pub fn tile_count(&self) -> usize {
        self.content.read().len()
    }

    /// Row runs of allocated tiles, top to bottom.
    pub fn region(&self) -> Vec<Rect> {
        let coords = self.content.read().sorted_coords();
        let mut runs: Vec<Rect> = Vec::new();
        for coord in coords {
            let tile_rect = coord.rect();
            match runs.last_mut() {
                Some(run) if run.y == tile_rect.y && run.max_x() == tile_rect.x => {
                    *run = run.united(&tile_rect);
                }
                _ => runs.push(tile_rect),
            }
        }
        runs
    }

    /// Coordinates of tiles whose content was lost to a swap read failure.
    pub fn degraded_tiles(&self) -> Vec<TileCoord> {
        let content = self.content.read();
        let mut coords = content
            .tiles
            .iter()
            .filter(|(_, tile)| tile.is_degraded())
            .map(|(coord, _)| *coord)
            .collect::<Vec<_>>();
        coords.sort();
        coords
    }

    /// Resets `rect` to the default pixel. Tiles left holding only default
    /// pixels are dropped.
    pub fn clear(&self, rect: Rect) {
        let default_pixel = self.default_pixel();
        self.fill(rect.intersected(&Rect::ADDRESSABLE), &default_pixel);
    }

    /// Sets every pixel of `rect`. Fully covered tiles share one buffer.
    pub fn fill(&self, rect: Rect, pixel: &[u8]) {
        self.check_pixel(pixel);
        if rect.is_empty() {
            return;
        }
        check_addressable(rect);
        let mut content = self.content.write();
        let default_pixel = content.default_pixel.clone();
        let filling_default = pixel == &*default_pixel;
        let mut shared_fill: Option<Arc<TileData>> = None;
        for coord in TileCoord::covering(rect) {
            let tile_rect = coord.rect();
            if rect.contains_rect(&tile_rect) {
                if filling_default {
                    content.remove(coord);
                    continue;
                }
                let tile = shared_fill
                    .get_or_insert_with(|| {
                        TileData::filled(coord, pixel, default_pixel.clone(), &self.memory)
                    })
                    .clone();
                content.insert(coord, tile);
                continue;
            }
            if filling_default && content.get(coord).is_none() {
                continue;
            }
            let area = rect.intersected(&tile_rect);
            let tile = self.writable_tile(&mut content, coord);
            {
                let mut pixels = tile.write();
                for_each_row(coord, area, self.pixel_size, |range| {
                    fill_pixels(&mut pixels[range], pixel);
                });
            }
            if filling_default && tile.is_uniform(&default_pixel) {
                content.remove(coord);
            }
        }
    }

    /// Copies `rect` into `out` row-major, `rect.width * pixel_size` bytes per row.
    pub fn read_bytes(&self, rect: Rect, out: &mut [u8]) {
        assert_eq!(
            out.len() as i64,
            rect.area() * self.pixel_size as i64,
            "byte buffer does not match rect"
        );
        let content = self.content.read();
        for coord in TileCoord::covering(rect) {
            let area = rect.intersected(&coord.rect());
            let tile = content.get(coord).map(|tile| tile.read());
            for (row, range) in tile_rows(coord, area, self.pixel_size) {
                let start = self.linear_offset(rect, area.x, row);
                let target = &mut out[start..start + range.len()];
                match &tile {
                    Some(pixels) => target.copy_from_slice(&pixels[range]),
                    None => fill_pixels(target, &content.default_pixel),
                }
            }
        }
    }

    /// Writes `data`, laid out as for [`TiledDataManager::read_bytes`], into `rect`.
    pub fn write_bytes(&self, rect: Rect, data: &[u8]) {
        assert_eq!(
            data.len() as i64,
            rect.area() * self.pixel_size as i64,
            "byte buffer does not match rect"
        );
        if rect.is_empty() {
            return;
        }
        check_addressable(rect);
        let mut content = self.content.write();
        for coord in TileCoord::covering(rect) {
            let area = rect.intersected(&coord.rect());
            let tile = self.writable_tile(&mut content, coord);
            let mut pixels = tile.write();
            for (row, range) in tile_rows(coord, area, self.pixel_size) {
                let start = self.linear_offset(rect, area.x, row);
                let len = range.len();
                pixels[range].copy_from_slice(&data[start..start + len]);
            }
        }
    }

    /// Copies `rect` from `source`. Tiles fully inside `rect` are shared
    /// rather than copied.
    pub fn bit_blt(&self, source: &TiledDataManager, rect: Rect) {
        assert_eq!(
            source.pixel_size, self.pixel_size,
            "bit_blt between devices of different pixel size"
        );
        let rect = rect.intersected(&Rect::ADDRESSABLE);
        if rect.is_empty() {
            return;
        }
        let source = source.snapshot();
        let mut content = self.content.write();
        assert_eq!(
            source.map.default_pixel, content.default_pixel,
            "bit_blt between devices with different default pixels"
        );
        let default_pixel = content.default_pixel.clone();
        for coord in TileCoord::covering(rect) {
            let tile_rect = coord.rect();
            let source_tile = source.map.get(coord);
            if rect.contains_rect(&tile_rect) {
                match source_tile {
                    Some(tile) => content.insert(coord, tile.clone()),
                    None => {
                        content.remove(coord);
                    }
                }
                continue;
            }
            let area = rect.intersected(&tile_rect);
            match source_tile {
                Some(source_tile) => {
                    let tile = self.writable_tile(&mut content, coord);
                    let source_pixels = source_tile.read();
                    let mut pixels = tile.write();
                    for_each_row(coord, area, self.pixel_size, |range| {
                        pixels[range.clone()].copy_from_slice(&source_pixels[range]);
                    });
                }
                None => {
                    if content.get(coord).is_none() {
                        continue;
                    }
                    let tile = self.writable_tile(&mut content, coord);
                    {
                        let mut pixels = tile.write();
                        for_each_row(coord, area, self.pixel_size, |range| {
                            fill_pixels(&mut pixels[range], &default_pixel);
                        });
                    }
                    if tile.is_uniform(&default_pixel) {
                        content.remove(coord);
                    }
                }
            }
        }
    }

    /// Drops tiles touching `rect` that hold only default pixels.
    pub fn purge(&self, rect: Rect) {
        let mut content = self.content.write();
        let default_pixel = content.default_pixel.clone();
        for coord in TileCoord::covering(rect.intersected(&Rect::ADDRESSABLE)) {
            let is_default = content
                .get(coord)
                .is_some_and(|tile| tile.is_uniform(&default_pixel));
            if is_default {
                content.remove(coord);
            }
        }
    }

    /// Discards everything outside `rect`.
    pub fn crop(&self, rect: Rect) {
        let mut content = self.content.write();
        let default_pixel = content.default_pixel.clone();
        for coord in content.sorted_coords() {
            let tile_rect = coord.rect();
            if rect.contains_rect(&tile_rect) {
                continue;
            }
            let keep = rect.intersected(&tile_rect);
            if keep.is_empty() {
                content.remove(coord);
                continue;
            }
            let tile = self.writable_tile(&mut content, coord);
            {
                let mut pixels = tile.write();
                for outside in subtract(tile_rect, keep) {
                    for_each_row(coord, outside, self.pixel_size, |range| {
                        fill_pixels(&mut pixels[range], &default_pixel);
                    });
                }
            }
            if tile.is_uniform(&default_pixel) {
                content.remove(coord);
            }
        }
    }

    /// Restartable walk over the tiles of `rect`. Writes made after the walk
    /// was created are not visible through it.
    pub fn tile_spans(&self, rect: Rect) -> TileSpans {
        let content = self.content.write();
        TileSpans::new(rect, content.tiles.clone(), content.default_pixel.clone())
    }

    pub(crate) fn replace_map(&self, map: TileMap) -> TileMap {
        std::mem::replace(&mut *self.content.write(), map)
    }

    pub(crate) fn clone_map(&self) -> TileMap {
        // Exclusive so no in-place writer is mid-write on a tile being shared.
        self.content.write().clone()
    }

    pub(crate) fn new_tile_from_bytes(
        &self,
        map: &TileMap,
        coord: TileCoord,
        bytes: &[u8],
    ) -> Arc<TileData> {
        TileData::from_bytes(coord, bytes, map.default_pixel.clone(), &self.memory)
    }

    fn with_writable_tile<R>(&self, coord: TileCoord, write: impl FnOnce(&mut [u8]) -> R) -> R {
        {
            let content = self.content.read();
            if let Some(tile) = content.exclusive(coord) {
                let mut pixels = tile.write();
                return write(&mut pixels);
            }
        }
        let mut content = self.content.write();
        let tile = self.writable_tile(&mut content, coord);
        let content = RwLockWriteGuard::downgrade(content);
        let mut pixels = tile.write();
        let result = write(&mut pixels);
        drop(pixels);
        drop(tile);
        drop(content);
        result
    }

    /// The tile at `coord`, copied first if it is shared and created if absent.
    fn writable_tile(&self, content: &mut TileMap, coord: TileCoord) -> Arc<TileData> {
        if let Some(tile) = content.get(coord) {
            if Arc::strong_count(tile) == 1 {
                return tile.clone();
            }
        }
        let tile = match content.get(coord) {
            Some(shared) => shared.duplicate_at(coord),
            None => TileData::filled(
                coord,
                &content.default_pixel,
                content.default_pixel.clone(),
                &self.memory,
            ),
        };
        content.insert(coord, tile.clone());
        tile
    }

    fn check_pixel(&self, pixel: &[u8]) {
        assert_eq!(
            pixel.len(),
            self.pixel_size,
            "pixel does not match device pixel size"
        );
    }

    fn linear_offset(&self, rect: Rect, x: i32, y: i32) -> usize {
        let index = (y - rect.y) as usize * rect.width as usize + (x - rect.x) as usize;
        index * self.pixel_size
    }
}

fn check_addressable(rect: Rect) {
    assert!(
        Rect::ADDRESSABLE.contains_rect(&rect),
        "{rect:?} lies outside the addressable pixel range"
    );
}

/// Byte ranges inside a tile buffer for each pixel row of `area`.
fn tile_rows(
    coord: TileCoord,
    area: Rect,
    pixel_size: usize,
) -> impl Iterator<Item = (i32, std::ops::Range<usize>)> {
    let row_len = area.width.max(0) as usize * pixel_size;
    (area.y..area.max_y()).map(move |y| {
        let start = coord.pixel_index(area.x, y) * pixel_size;
        (y, start..start + row_len)
    })
}

fn for_each_row(
    coord: TileCoord,
    area: Rect,
    pixel_size: usize,
    mut visit: impl FnMut(std::ops::Range<usize>),
) {
    for (_, range) in tile_rows(coord, area, pixel_size) {
        visit(range);
    }
}

/// `outer` minus `inner` as up to four disjoint rects; `inner` must lie inside `outer`.
fn subtract(outer: Rect, inner: Rect) -> Vec<Rect> {
    [
        Rect::from_bounds(outer.x, outer.y, outer.max_x(), inner.y),
        Rect::from_bounds(outer.x, inner.max_y(), outer.max_x(), outer.max_y()),
        Rect::from_bounds(outer.x, inner.y, inner.x, inner.max_y()),
        Rect::from_bounds(inner.max_x(), inner.y, outer.max_x(), inner.max_y()),
    ]
    .into_iter()
    .filter(|rect| !rect.is_empty())
    .collect()
}
