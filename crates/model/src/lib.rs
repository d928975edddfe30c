use static_assertions::const_assert;

pub const TILE_SIZE: i32 = 64;
pub const TILE_PIXELS: usize = (TILE_SIZE as usize) * (TILE_SIZE as usize);

/// Tiled devices store pixels in `-COORD_LIMIT..COORD_LIMIT` on both axes,
/// which keeps every tile edge and extent inside `i32`.
pub const COORD_LIMIT: i32 = 1 << 29;

const_assert!(TILE_SIZE > 0 && (TILE_SIZE & (TILE_SIZE - 1)) == 0);
const_assert!(COORD_LIMIT % TILE_SIZE == 0);

slotmap::new_key_type! {
    /// Node of a layered image's tree.
    pub struct NodeId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrokeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateFlags: u8 {
        /// Recomposite only; the node's own content is not marked filthy.
        const NO_FILTHY = 1 << 0;
        /// Do not invalidate cached animation frames for the region.
        const DONT_INVALIDATE_FRAMES = 1 << 1;
    }
}

/// Half-open integer rectangle covering `x..x + width` by `y..y + height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Rect spanning from `(min_x, min_y)` up to, but excluding, `(max_x, max_y)`.
    pub fn from_bounds(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        if max_x <= min_x || max_y <= min_y {
            return Self::empty();
        }
        Self::new(min_x, min_y, max_x.saturating_sub(min_x), max_y.saturating_sub(min_y))
    }

    /// Smallest rect containing both pixels, inclusive.
    pub fn from_points(a: (i32, i32), b: (i32, i32)) -> Self {
        Self::from_bounds(a.0.min(b.0), a.1.min(b.1), a.0.max(b.0) + 1, a.1.max(b.1) + 1)
    }

    pub const fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Pixels a tiled device can address.
    pub const ADDRESSABLE: Rect =
        Rect::new(-COORD_LIMIT, -COORD_LIMIT, 2 * COORD_LIMIT, 2 * COORD_LIMIT);

    /// Saturates at `i32::MAX`.
    pub const fn max_x(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    pub const fn max_y(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        i64::from(self.width) * i64::from(self.height)
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.max_x() && y >= self.y && y < self.max_y()
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        if other.is_empty() {
            return !self.is_empty();
        }
        other.x >= self.x
            && other.y >= self.y
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersected(other).is_empty()
    }

    pub fn intersected(&self, other: &Rect) -> Rect {
        if self.is_empty() || other.is_empty() {
            return Rect::empty();
        }
        Rect::from_bounds(
            self.x.max(other.x),
            self.y.max(other.y),
            self.max_x().min(other.max_x()),
            self.max_y().min(other.max_y()),
        )
    }

    pub fn united(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_bounds(
            self.x.min(other.x),
            self.y.min(other.y),
            self.max_x().max(other.max_x()),
            self.max_y().max(other.max_y()),
        )
    }

    /// True when the rects touch along a complete shared edge without overlapping.
    pub fn is_adjacent_to(&self, other: &Rect) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let same_rows = self.y == other.y && self.height == other.height;
        let same_columns = self.x == other.x && self.width == other.width;
        (same_rows && (self.max_x() == other.x || other.max_x() == self.x))
            || (same_columns && (self.max_y() == other.y || other.max_y() == self.y))
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Splits the rect into row-major patches no larger than `patch_size` on either side.
    pub fn split_into_patches(&self, patch_size: i32) -> Vec<Rect> {
        assert!(patch_size > 0, "patch size must be positive");
        let mut patches = Vec::new();
        if self.is_empty() {
            return patches;
        }
        let mut y = self.y;
        while y < self.max_y() {
            let height = patch_size.min(self.max_y() - y);
            let mut x = self.x;
            while x < self.max_x() {
                let width = patch_size.min(self.max_x() - x);
                patches.push(Rect::new(x, y, width, height));
                x += width;
            }
            y += height;
        }
        patches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub col: i32,
    pub row: i32,
}

impl TileCoord {
    pub const fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }

    pub fn from_pixel(x: i32, y: i32) -> Self {
        Self {
            col: x.div_euclid(TILE_SIZE),
            row: y.div_euclid(TILE_SIZE),
        }
    }

    /// Whether the tile lies inside [`Rect::ADDRESSABLE`].
    pub fn is_addressable(&self) -> bool {
        let limit = COORD_LIMIT / TILE_SIZE;
        (-limit..limit).contains(&self.col) && (-limit..limit).contains(&self.row)
    }

    pub fn rect(&self) -> Rect {
        Rect::new(
            self.col * TILE_SIZE,
            self.row * TILE_SIZE,
            TILE_SIZE,
            TILE_SIZE,
        )
    }

    /// Offset of pixel `(x, y)` inside this tile, in pixels.
    pub fn pixel_index(&self, x: i32, y: i32) -> usize {
        let local_x = x - self.col * TILE_SIZE;
        let local_y = y - self.row * TILE_SIZE;
        debug_assert!(
            (0..TILE_SIZE).contains(&local_x) && (0..TILE_SIZE).contains(&local_y),
            "pixel ({x}, {y}) is outside tile ({}, {})",
            self.col,
            self.row
        );
        (local_y * TILE_SIZE + local_x) as usize
    }

    /// Row-major iterator over every tile touching `rect`.
    pub fn covering(rect: Rect) -> TileCover {
        TileCover::new(rect)
    }
}

/// Restartable row-major walk over the tiles touching a rect.
#[derive(Debug, Clone)]
pub struct TileCover {
    first: TileCoord,
    last: TileCoord,
    next: Option<TileCoord>,
    empty: bool,
}

impl TileCover {
    pub fn new(rect: Rect) -> Self {
        if rect.is_empty() {
            let origin = TileCoord::new(0, 0);
            return Self {
                first: origin,
                last: origin,
                next: None,
                empty: true,
            };
        }
        let first = TileCoord::from_pixel(rect.x, rect.y);
        let last = TileCoord::from_pixel(rect.max_x() - 1, rect.max_y() - 1);
        Self {
            first,
            last,
            next: Some(first),
            empty: false,
        }
    }

    pub fn restart(&mut self) {
        if !self.empty {
            self.next = Some(self.first);
        }
    }
}

impl Iterator for TileCover {
    type Item = TileCoord;

    fn next(&mut self) -> Option<TileCoord> {
        let current = self.next?;
        self.next = if current.col < self.last.col {
            Some(TileCoord::new(current.col + 1, current.row))
        } else if current.row < self.last.row {
            Some(TileCoord::new(self.first.col, current.row + 1))
        } else {
            None
        };
        Some(current)
    }
}

impl PartialOrd for TileCoord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TileCoord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.row, self.col).cmp(&(other.row, other.col))
    }
}
