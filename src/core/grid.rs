//! Grid referencing of chips on the global tiling scheme

use crate::io::paths::num_str_to_int;
use crate::types::{BoundingBox, ChipletError, ChipletResult, GridRef, TileHeader, GRID_CELL_SIZE};
use regex::Regex;
use std::path::Path;

/// Tolerance for treating a corner coordinate as lying on a cell boundary
const ALIGNMENT_TOLERANCE: f64 = 1e-6;

impl GridRef {
    /// Cell whose lower-left corner coincides with that of `bbox`.
    ///
    /// The corner must sit exactly on a cell boundary.
    pub fn from_bounds(bbox: &BoundingBox, cell_size: f64, path: &Path) -> ChipletResult<Self> {
        let gx = bbox.left / cell_size;
        let gy = bbox.bottom / cell_size;

        let (rx, ry) = (gx.round(), gy.round());
        if (gx - rx).abs() > ALIGNMENT_TOLERANCE || (gy - ry).abs() > ALIGNMENT_TOLERANCE {
            return Err(ChipletError::MisalignedGridRef {
                path: path.display().to_string(),
                x: bbox.left,
                y: bbox.bottom,
                cell_size,
            });
        }

        Ok(GridRef::new(rx as i64, ry as i64))
    }

    /// Grid reference of a tile on the default 100 km grid
    pub fn from_header(header: &TileHeader, path: &Path) -> ChipletResult<Self> {
        Self::from_bounds(&header.bounds(), GRID_CELL_SIZE, path)
    }

    /// Parse the `x<gx>y<gy>` form used in chip filenames (`"x9y-24"`)
    pub fn from_xy_str(xy: &str) -> ChipletResult<Self> {
        let pattern = Regex::new(r"^x(?P<x>-?[\d.]+)y(?P<y>-?[\d.]+)$")
            .map_err(|e| ChipletError::InvalidFormat(format!("Bad grid reference pattern: {}", e)))?;
        let caps = pattern
            .captures(xy)
            .ok_or_else(|| ChipletError::InvalidFormat(format!("Unexpected grid reference: {}", xy)))?;
        Ok(GridRef::new(num_str_to_int(&caps["x"])?, num_str_to_int(&caps["y"])?))
    }

    /// Lower-left corner of this cell in projected coordinates
    pub fn origin(&self, cell_size: f64) -> (f64, f64) {
        (self.x as f64 * cell_size, self.y as f64 * cell_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AffineTransform;

    #[test]
    fn test_grid_ref_from_tile_header() {
        let header = TileHeader {
            transform: AffineTransform::north_up(-1_000_000.0, -1_700_000.0, 25.0, 25.0),
            width: 4000,
            height: 4000,
            bands: 1,
            nodata: None,
        };
        let grid_ref = GridRef::from_header(&header, Path::new("chip.tif")).unwrap();
        assert_eq!(grid_ref, GridRef::new(-10, -18));
        assert_eq!(grid_ref.origin(GRID_CELL_SIZE), (-1_000_000.0, -1_800_000.0));
    }

    #[test]
    fn test_misaligned_tile_rejected() {
        let bbox = BoundingBox::new(-1_000_025.0, -1_800_000.0, -900_025.0, -1_700_000.0);
        match GridRef::from_bounds(&bbox, GRID_CELL_SIZE, Path::new("bad.tif")) {
            Err(ChipletError::MisalignedGridRef { path, x, .. }) => {
                assert_eq!(path, "bad.tif");
                assert_eq!(x, -1_000_025.0);
            }
            other => panic!("expected misalignment error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_xy_str() {
        assert_eq!(GridRef::from_xy_str("x9y-24").unwrap(), GridRef::new(9, -24));
        assert_eq!(GridRef::from_xy_str("x-10y-18").unwrap(), GridRef::new(-10, -18));
        assert!(GridRef::from_xy_str("x9.5y-24").is_err());
        assert!(GridRef::from_xy_str("9,-24").is_err());
    }
}
