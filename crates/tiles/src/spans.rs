use std::collections::HashMap;
use std::sync::Arc;

use model::{Rect, TileCover, TileCoord};

use crate::tile::TileData;

/// The part of one tile a query rect covers. `tile` is `None` where the
/// device holds default content.
#[derive(Debug, Clone)]
pub struct TileSpan {
    pub coord: TileCoord,
    pub rect: Rect,
    pub tile: Option<Arc<TileData>>,
}

/// Row-major walk over the tiles of a rect, fixed to the tile map that
/// existed when the walk was created.
#[derive(Debug, Clone)]
pub struct TileSpans {
    rect: Rect,
    tiles: Arc<HashMap<TileCoord, Arc<TileData>>>,
    default_pixel: Arc<[u8]>,
    cover: TileCover,
}

impl TileSpans {
    pub(crate) fn new(
        rect: Rect,
        tiles: Arc<HashMap<TileCoord, Arc<TileData>>>,
        default_pixel: Arc<[u8]>,
    ) -> Self {
        Self {
            rect,
            tiles,
            default_pixel,
            cover: TileCoord::covering(rect),
        }
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// What spans without a tile hold.
    pub fn default_pixel(&self) -> &[u8] {
        &self.default_pixel
    }

    pub fn restart(&mut self) {
        self.cover.restart();
    }
}

impl Iterator for TileSpans {
    type Item = TileSpan;

    fn next(&mut self) -> Option<TileSpan> {
        let coord = self.cover.next()?;
        Some(TileSpan {
            coord,
            rect: coord.rect().intersected(&self.rect),
            tile: self.tiles.get(&coord).cloned(),
        })
    }
}
