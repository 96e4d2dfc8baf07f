use crate::types::{ChipletError, ChipletResult, Raster, TileHeader};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of georeferenced raster tiles.
///
/// Implementations must collapse a redundant single-band axis into a raster
/// with one band, and report the tile's nodata value when it has one.
pub trait RasterTileProvider: Send + Sync {
    /// Georeferencing and size of a tile, without reading its pixels
    fn read_header(&self, path: &Path) -> ChipletResult<TileHeader>;

    /// Read the full tile
    fn read(&self, path: &Path) -> ChipletResult<Raster>;
}

/// Tile provider backed by rasters held in memory.
///
/// Used for synthetic data; counts pixel reads so callers can verify that a
/// pass did (or did not) touch the source tiles.
#[derive(Debug, Default)]
pub struct MemoryTileProvider {
    tiles: HashMap<PathBuf, Raster>,
    reads: AtomicUsize,
}

impl MemoryTileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: Into<PathBuf>>(&mut self, path: P, raster: Raster) {
        self.tiles.insert(path.into(), raster);
    }

    /// Number of header or pixel reads served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn lookup(&self, path: &Path) -> ChipletResult<&Raster> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.tiles
            .get(path)
            .ok_or_else(|| ChipletError::NoTiles(format!("no tile registered at {}", path.display())))
    }
}

impl RasterTileProvider for MemoryTileProvider {
    fn read_header(&self, path: &Path) -> ChipletResult<TileHeader> {
        Ok(self.lookup(path)?.header())
    }

    fn read(&self, path: &Path) -> ChipletResult<Raster> {
        Ok(self.lookup(path)?.clone())
    }
}
