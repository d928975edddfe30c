use std::sync::Arc;

use model::Rect;

use crate::data_manager::{TileMap, TiledDataManager};

/// Frozen view of a device's tiles and default pixel. Taking one is O(1);
/// the live device copies any tile it writes afterwards.
#[derive(Debug, Clone)]
pub struct DataSnapshot {
    pixel_size: usize,
    pub(crate) map: TileMap,
}

impl DataSnapshot {
    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    pub fn read_pixel(&self, x: i32, y: i32) -> Vec<u8> {
        let mut pixel = vec![0; self.pixel_size];
        self.read_pixel_into(x, y, &mut pixel);
        pixel
    }

    pub fn read_pixel_into(&self, x: i32, y: i32, out: &mut [u8]) {
        self.map.read_pixel_into(x, y, out);
    }

    pub fn default_pixel(&self) -> &[u8] {
        &self.map.default_pixel
    }

    pub fn extent(&self) -> Rect {
        self.map.extent()
    }

    pub fn tile_count(&self) -> usize {
        self.map.len()
    }
}

impl TiledDataManager {
    pub fn snapshot(&self) -> DataSnapshot {
        DataSnapshot {
            pixel_size: self.pixel_size(),
            map: self.clone_map(),
        }
    }

    /// Makes the device's content and default pixel equal to `snapshot` again.
    pub fn restore(&self, snapshot: &DataSnapshot) {
        assert_eq!(
            snapshot.pixel_size,
            self.pixel_size(),
            "snapshot restored onto a device of different pixel size"
        );
        let replaced = self.replace_map(snapshot.map.clone());
        drop(replaced);
    }
}

/// Undo scope over one device: `revert` puts back the content the device had
/// at `begin`.
#[derive(Debug)]
pub struct Transaction {
    device: Arc<TiledDataManager>,
    before: DataSnapshot,
}

impl Transaction {
    pub fn begin(device: &Arc<TiledDataManager>) -> Self {
        Self {
            device: device.clone(),
            before: device.snapshot(),
        }
    }

    pub fn device(&self) -> &Arc<TiledDataManager> {
        &self.device
    }

    pub fn before(&self) -> &DataSnapshot {
        &self.before
    }

    pub fn revert(self) {
        tracing::debug!(tiles = self.before.tile_count(), "reverting transaction");
        self.device.restore(&self.before);
    }

    /// Keeps the changes and releases the tiles held for undo.
    pub fn commit(self) {}
}
