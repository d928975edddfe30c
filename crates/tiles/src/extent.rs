use std::collections::BTreeMap;

use model::{Rect, TileCoord};

/// Per-column and per-row tile counts; the extent follows from the outermost
/// occupied column and row without scanning the tile map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ExtentTracker {
    columns: BTreeMap<i32, usize>,
    rows: BTreeMap<i32, usize>,
}

impl ExtentTracker {
    pub(crate) fn add(&mut self, coord: TileCoord) {
        *self.columns.entry(coord.col).or_insert(0) += 1;
        *self.rows.entry(coord.row).or_insert(0) += 1;
    }

    pub(crate) fn remove(&mut self, coord: TileCoord) {
        decrement(&mut self.columns, coord.col, "column");
        decrement(&mut self.rows, coord.row, "row");
    }

    pub(crate) fn extent(&self) -> Rect {
        let (Some((&min_col, _)), Some((&max_col, _))) =
            (self.columns.first_key_value(), self.columns.last_key_value())
        else {
            return Rect::empty();
        };
        let (Some((&min_row, _)), Some((&max_row, _))) =
            (self.rows.first_key_value(), self.rows.last_key_value())
        else {
            panic!("extent tracker has columns but no rows");
        };
        let first = TileCoord::new(min_col, min_row).rect();
        let last = TileCoord::new(max_col, max_row).rect();
        Rect::from_bounds(first.x, first.y, last.max_x(), last.max_y())
    }
}

fn decrement(counts: &mut BTreeMap<i32, usize>, key: i32, axis: &str) {
    let Some(count) = counts.get_mut(&key) else {
        panic!("extent tracker has no tiles in {axis} {key}");
    };
    *count -= 1;
    if *count == 0 {
        counts.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::COORD_LIMIT;

    #[test]
    fn extent_shrinks_when_outer_tiles_leave() {
        let mut tracker = ExtentTracker::default();
        tracker.add(TileCoord::new(0, 0));
        tracker.add(TileCoord::new(-2, 3));
        tracker.add(TileCoord::new(1, 0));
        assert_eq!(tracker.extent(), Rect::new(-128, 0, 4 * 64, 4 * 64));

        tracker.remove(TileCoord::new(-2, 3));
        assert_eq!(tracker.extent(), Rect::new(0, 0, 128, 64));

        tracker.remove(TileCoord::new(0, 0));
        tracker.remove(TileCoord::new(1, 0));
        assert!(tracker.extent().is_empty());
    }

    #[test]
    fn extent_reaches_the_edge_of_the_addressable_range() {
        let mut tracker = ExtentTracker::default();
        tracker.add(TileCoord::from_pixel(COORD_LIMIT - 1, -COORD_LIMIT));
        tracker.add(TileCoord::from_pixel(-COORD_LIMIT, COORD_LIMIT - 1));
        assert_eq!(tracker.extent(), Rect::ADDRESSABLE);

        tracker.add(TileCoord::from_pixel(i32::MAX, 0));
        assert_eq!(tracker.extent().max_x(), i32::MAX);
    }

    #[test]
    #[should_panic(expected = "extent tracker has no tiles in column 4")]
    fn removing_unknown_tile_aborts() {
        let mut tracker = ExtentTracker::default();
        tracker.remove(TileCoord::new(4, 4));
    }
}
