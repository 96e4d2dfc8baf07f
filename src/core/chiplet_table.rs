//! Chiplet table: the index of every chiplet carved from the chip grid.
//!
//! The table is the single source of truth for store shape and for the
//! mapping from store position to chiplet geometry. Every store built for
//! one (ROI, padding) pair must be built against the same table.

use crate::core::roi::RegionOfInterest;
use crate::io::completion;
use crate::io::paths::OutputLayout;
use crate::io::raster::RasterTileProvider;
use crate::io::store_array::StoreShape;
use crate::types::{
    AffineTransform, BoundingBox, ChipletError, ChipletResult, GridRef, RoiName, GRID_CELL_SIZE,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Parameters of the chiplet tiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableParams {
    /// Side length of an unpadded chiplet in pixels
    pub base_size_pix: usize,
    /// Context added on every side of a chiplet
    pub pad_size_pix: usize,
    /// Number of random subsets the chiplets are split into
    pub n_subsets: u32,
}

impl Default for TableParams {
    fn default() -> Self {
        Self {
            base_size_pix: 160,
            pad_size_pix: 0,
            n_subsets: 5,
        }
    }
}

/// Fixed RNG seed for the subset split of each (ROI, padding) pair
pub fn table_seed(roi: RoiName, pad_size_pix: usize) -> ChipletResult<u64> {
    match (roi, pad_size_pix) {
        (RoiName::Savanna, 0) => Ok(1_048_907_938),
        (RoiName::Savanna, 32) => Ok(2_847_122_306),
        (RoiName::Australia, 0) => Ok(3_591_028_477),
        (RoiName::Australia, 32) => Ok(718_255_641),
        _ => Err(ChipletError::UnknownSeed { roi, pad_size_pix }),
    }
}

/// One chiplet of the table
#[derive(Debug, Clone, PartialEq)]
pub struct ChipletRecord {
    /// Position of the chiplet in every store built from this table
    pub index: usize,
    pub grid_ref: GridRef,
    /// Pixel offset of the chiplet's top-left corner within its chip
    pub chip_i_x_base: usize,
    pub chip_i_y_base: usize,
    pub base_bbox: BoundingBox,
    pub padded_bbox: BoundingBox,
    /// Pixel-to-coordinate transform of the parent chip
    pub transform: AffineTransform,
    pub partial_roi_overlap: bool,
    pub subset_num: u32,
    pub subset_instance_num: u32,
}

/// Flat on-disk form of a record
#[derive(Debug, Serialize, Deserialize)]
struct ChipletRow {
    index: usize,
    chip_grid_ref_x_base: i64,
    chip_grid_ref_y_base: i64,
    chip_i_x_base: usize,
    chip_i_y_base: usize,
    bbox_left: f64,
    bbox_bottom: f64,
    bbox_right: f64,
    bbox_top: f64,
    pad_bbox_left: f64,
    pad_bbox_bottom: f64,
    pad_bbox_right: f64,
    pad_bbox_top: f64,
    chip_transform_i_to_coords_coeff_a: f64,
    chip_transform_i_to_coords_coeff_b: f64,
    chip_transform_i_to_coords_coeff_c: f64,
    chip_transform_i_to_coords_coeff_d: f64,
    chip_transform_i_to_coords_coeff_e: f64,
    chip_transform_i_to_coords_coeff_f: f64,
    chip_transform_i_to_coords_coeff_g: f64,
    chip_transform_i_to_coords_coeff_h: f64,
    chip_transform_i_to_coords_coeff_i: f64,
    partial_roi_overlap: bool,
    subset_num: u32,
    subset_instance_num: u32,
}

impl From<&ChipletRecord> for ChipletRow {
    fn from(record: &ChipletRecord) -> Self {
        let [a, b, c, d, e, f, g, h, i] = record.transform.coefficients();
        Self {
            index: record.index,
            chip_grid_ref_x_base: record.grid_ref.x,
            chip_grid_ref_y_base: record.grid_ref.y,
            chip_i_x_base: record.chip_i_x_base,
            chip_i_y_base: record.chip_i_y_base,
            bbox_left: record.base_bbox.left,
            bbox_bottom: record.base_bbox.bottom,
            bbox_right: record.base_bbox.right,
            bbox_top: record.base_bbox.top,
            pad_bbox_left: record.padded_bbox.left,
            pad_bbox_bottom: record.padded_bbox.bottom,
            pad_bbox_right: record.padded_bbox.right,
            pad_bbox_top: record.padded_bbox.top,
            chip_transform_i_to_coords_coeff_a: a,
            chip_transform_i_to_coords_coeff_b: b,
            chip_transform_i_to_coords_coeff_c: c,
            chip_transform_i_to_coords_coeff_d: d,
            chip_transform_i_to_coords_coeff_e: e,
            chip_transform_i_to_coords_coeff_f: f,
            chip_transform_i_to_coords_coeff_g: g,
            chip_transform_i_to_coords_coeff_h: h,
            chip_transform_i_to_coords_coeff_i: i,
            partial_roi_overlap: record.partial_roi_overlap,
            subset_num: record.subset_num,
            subset_instance_num: record.subset_instance_num,
        }
    }
}

impl TryFrom<ChipletRow> for ChipletRecord {
    type Error = ChipletError;

    fn try_from(row: ChipletRow) -> ChipletResult<Self> {
        let transform = AffineTransform::from_coefficients(&[
            row.chip_transform_i_to_coords_coeff_a,
            row.chip_transform_i_to_coords_coeff_b,
            row.chip_transform_i_to_coords_coeff_c,
            row.chip_transform_i_to_coords_coeff_d,
            row.chip_transform_i_to_coords_coeff_e,
            row.chip_transform_i_to_coords_coeff_f,
            row.chip_transform_i_to_coords_coeff_g,
            row.chip_transform_i_to_coords_coeff_h,
            row.chip_transform_i_to_coords_coeff_i,
        ])?;
        Ok(Self {
            index: row.index,
            grid_ref: GridRef::new(row.chip_grid_ref_x_base, row.chip_grid_ref_y_base),
            chip_i_x_base: row.chip_i_x_base,
            chip_i_y_base: row.chip_i_y_base,
            base_bbox: BoundingBox::new(row.bbox_left, row.bbox_bottom, row.bbox_right, row.bbox_top),
            padded_bbox: BoundingBox::new(
                row.pad_bbox_left,
                row.pad_bbox_bottom,
                row.pad_bbox_right,
                row.pad_bbox_top,
            ),
            transform,
            partial_roi_overlap: row.partial_roi_overlap,
            subset_num: row.subset_num,
            subset_instance_num: row.subset_instance_num,
        })
    }
}

/// Spatial extent of a chiplet, expanded by `pad_size_pix` on every side
pub fn get_bbox(
    chip_i_x_base: usize,
    chip_i_y_base: usize,
    base_size_pix: usize,
    pad_size_pix: usize,
    transform: &AffineTransform,
) -> BoundingBox {
    let (x0, y0) = (
        chip_i_x_base as f64 - pad_size_pix as f64,
        chip_i_y_base as f64 - pad_size_pix as f64,
    );
    let (x1, y1) = (
        (chip_i_x_base + base_size_pix + pad_size_pix) as f64,
        (chip_i_y_base + base_size_pix + pad_size_pix) as f64,
    );
    BoundingBox::from_points(&[
        transform.apply(x0, y0),
        transform.apply(x1, y0),
        transform.apply(x0, y1),
        transform.apply(x1, y1),
    ])
}

/// The chiplet table of one (ROI, padding) pair
#[derive(Debug, Clone)]
pub struct ChipletTable {
    roi: RoiName,
    pad_size_pix: usize,
    records: Vec<ChipletRecord>,
}

impl ChipletTable {
    /// Wrap records, checking that their indices run 0..N-1 in order
    pub fn new(roi: RoiName, pad_size_pix: usize, records: Vec<ChipletRecord>) -> ChipletResult<Self> {
        for (position, record) in records.iter().enumerate() {
            if record.index != position {
                return Err(ChipletError::Consistency(format!(
                    "Chiplet table row {} carries index {}",
                    position, record.index
                )));
            }
        }
        Ok(Self {
            roi,
            pad_size_pix,
            records,
        })
    }

    pub fn roi(&self) -> RoiName {
        self.roi
    }

    pub fn pad_size_pix(&self) -> usize {
        self.pad_size_pix
    }

    pub fn records(&self) -> &[ChipletRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ChipletRecord> {
        self.records.get(index)
    }

    /// Shape of a store built against this table
    pub fn array_shape(&self, base_size_pix: usize, n_extra: usize) -> StoreShape {
        let side = base_size_pix + 2 * self.pad_size_pix;
        StoreShape::new(self.records.len(), n_extra, side, side)
    }

    /// Distinct grid cells, ascending
    pub fn grid_refs(&self) -> Vec<GridRef> {
        self.records
            .iter()
            .map(|r| r.grid_ref)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Rows belonging to one grid cell, in table order
    pub fn rows_for(&self, grid_ref: GridRef) -> Vec<&ChipletRecord> {
        self.records.iter().filter(|r| r.grid_ref == grid_ref).collect()
    }

    /// Write the table as CSV and mark it complete
    pub fn save(&self, path: &Path, protect: bool) -> ChipletResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        completion::clear(path)?;

        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(ChipletRow::from(record))?;
        }
        writer.flush()?;
        drop(writer);

        completion::mark_complete(path, None, &[self.records.len()], protect)?;
        log::info!("Saved chiplet table with {} rows to {}", self.records.len(), path.display());
        Ok(())
    }

    /// Read a table written by `save`
    pub fn load(path: &Path, roi: RoiName, pad_size_pix: usize) -> ChipletResult<Self> {
        if !completion::is_complete(path) {
            return Err(ChipletError::Consistency(format!(
                "Chiplet table at {} is missing or incomplete",
                path.display()
            )));
        }

        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for row in reader.deserialize::<ChipletRow>() {
            records.push(ChipletRecord::try_from(row?)?);
        }
        log::debug!("Loaded {} chiplet rows from {}", records.len(), path.display());

        Self::new(roi, pad_size_pix, records)
    }

    /// Load the table for (ROI, padding) from the standard output layout
    pub fn open(layout: &OutputLayout, roi: RoiName, pad_size_pix: usize) -> ChipletResult<Self> {
        Self::load(&layout.table_path(roi, pad_size_pix), roi, pad_size_pix)
    }
}

/// Candidate chiplets of one chip, before indexing and subset assignment
fn chip_entries(
    path: &Path,
    provider: &dyn RasterTileProvider,
    roi: &RegionOfInterest,
    params: &TableParams,
) -> ChipletResult<(GridRef, Vec<ChipletRecord>)> {
    let header = provider.read_header(path)?;
    let transform = header.transform;
    let grid_ref = GridRef::from_bounds(&header.bounds(), GRID_CELL_SIZE, path)?;

    // every chiplet of a fully contained chip is itself fully contained
    let roi_contains_chip = roi.contains_bbox(&header.bounds())?;

    let mut rows = Vec::new();
    for chip_i_x_base in (0..header.width).step_by(params.base_size_pix) {
        for chip_i_y_base in (0..header.height).step_by(params.base_size_pix) {
            let base_bbox = get_bbox(chip_i_x_base, chip_i_y_base, params.base_size_pix, 0, &transform);

            let partial_roi_overlap = if roi_contains_chip {
                false
            } else {
                if !roi.intersects_bbox(&base_bbox)? {
                    continue;
                }
                !roi.contains_bbox(&base_bbox)?
            };

            rows.push(ChipletRecord {
                index: 0,
                grid_ref,
                chip_i_x_base,
                chip_i_y_base,
                base_bbox,
                padded_bbox: get_bbox(
                    chip_i_x_base,
                    chip_i_y_base,
                    params.base_size_pix,
                    params.pad_size_pix,
                    &transform,
                ),
                transform,
                partial_roi_overlap,
                subset_num: 0,
                subset_instance_num: 0,
            });
        }
    }

    log::debug!(
        "Chip {} ({}): {} chiplets, fully inside ROI: {}",
        grid_ref,
        path.display(),
        rows.len(),
        roi_contains_chip
    );
    Ok((grid_ref, rows))
}

/// Build the chiplet table from one representative chip per grid cell.
///
/// Chip paths are processed in lexicographic order so that indices and the
/// subset split depend only on the set of chips, not on how they were listed.
pub fn form_chiplet_table(
    provider: &dyn RasterTileProvider,
    chip_paths: &[PathBuf],
    roi: &RegionOfInterest,
    params: &TableParams,
) -> ChipletResult<ChipletTable> {
    if chip_paths.is_empty() {
        return Err(ChipletError::NoTiles(format!(
            "no chips supplied for the chiplet table of ROI '{}'",
            roi.name()
        )));
    }
    if params.base_size_pix == 0 || params.n_subsets == 0 {
        return Err(ChipletError::InvalidFormat(format!("Invalid table parameters {:?}", params)));
    }

    let seed = table_seed(roi.name(), params.pad_size_pix)?;

    log::info!(
        "Forming chiplet table for ROI '{}' (pad {}) from {} chips",
        roi.name(),
        params.pad_size_pix,
        chip_paths.len()
    );

    let mut ordered: Vec<&PathBuf> = chip_paths.iter().collect();
    ordered.sort();

    let mut seen: HashMap<GridRef, &Path> = HashMap::new();
    let mut records = Vec::new();
    for path in ordered {
        let (grid_ref, rows) = chip_entries(path, provider, roi, params)?;
        if let Some(first) = seen.insert(grid_ref, path.as_path()) {
            return Err(ChipletError::DuplicateGridRef {
                grid_ref,
                first: first.display().to_string(),
                second: path.display().to_string(),
            });
        }
        records.extend(rows);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut instance_counts: HashMap<u32, u32> = HashMap::new();
    for (index, record) in records.iter_mut().enumerate() {
        record.index = index;
        record.subset_num = rng.gen_range(1..=params.n_subsets);
        let count = instance_counts.entry(record.subset_num).or_insert(0);
        *count += 1;
        record.subset_instance_num = *count;
    }

    log::info!("Chiplet table for ROI '{}' has {} rows", roi.name(), records.len());
    ChipletTable::new(roi.name(), params.pad_size_pix, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raster::MemoryTileProvider;
    use crate::types::Raster;
    use approx::assert_relative_eq;
    use geo::polygon;
    use ndarray::Array3;

    fn chip(provider: &mut MemoryTileProvider, name: &str, gx: i64, gy: i64, size: usize) -> PathBuf {
        let pixel = GRID_CELL_SIZE / size as f64;
        let transform = AffineTransform::north_up(
            gx as f64 * GRID_CELL_SIZE,
            (gy + 1) as f64 * GRID_CELL_SIZE,
            pixel,
            pixel,
        );
        provider.insert(name, Raster::new(Array3::zeros((1, size, size)), transform, Some(0.0)));
        PathBuf::from(name)
    }

    #[test]
    fn test_get_bbox_matches_known_chiplet() {
        let transform = AffineTransform::new(25.0, 0.0, -1_000_000.0, 0.0, -25.0, -1_700_000.0);

        let base = get_bbox(480, 3840, 160, 0, &transform);
        assert_relative_eq!(base.left, -988_000.0);
        assert_relative_eq!(base.bottom, -1_800_000.0);
        assert_relative_eq!(base.right, -984_000.0);
        assert_relative_eq!(base.top, -1_796_000.0);

        let padded = get_bbox(480, 3840, 160, 32, &transform);
        assert_relative_eq!(padded.left, -988_800.0);
        assert_relative_eq!(padded.bottom, -1_800_800.0);
        assert_relative_eq!(padded.right, -983_200.0);
        assert_relative_eq!(padded.top, -1_795_200.0);
    }

    #[test]
    fn test_unknown_seed_rejected() {
        assert!(table_seed(RoiName::Savanna, 0).is_ok());
        assert!(matches!(
            table_seed(RoiName::Savanna, 16),
            Err(ChipletError::UnknownSeed { pad_size_pix: 16, .. })
        ));
    }

    #[test]
    fn test_roi_clips_chiplets() {
        let mut provider = MemoryTileProvider::new();
        let path = chip(&mut provider, "x0y0.tif", 0, 0, 40);

        // left half of the chip, cutting through the middle chiplet column
        let roi = RegionOfInterest::from_polygon(
            RoiName::Savanna,
            polygon![(x: -10.0, y: -10.0), (x: 50_000.0, y: -10.0), (x: 50_000.0, y: 100_010.0), (x: -10.0, y: 100_010.0)],
        );
        let params = TableParams {
            base_size_pix: 8,
            pad_size_pix: 0,
            n_subsets: 5,
        };
        let table = form_chiplet_table(&provider, &[path], &roi, &params).unwrap();

        // columns at 0 and 8 are inside, 16 straddles the boundary, 24 and 32 are out
        assert_eq!(table.len(), 3 * 5);
        for record in table.records() {
            assert!(roi.intersects_bbox(&record.base_bbox).unwrap());
            assert_eq!(record.partial_roi_overlap, record.chip_i_x_base == 16);
        }
        assert_eq!(table.array_shape(8, 0), StoreShape::new(15, 0, 8, 8));
    }

    #[test]
    fn test_duplicate_grid_ref_rejected() {
        let mut provider = MemoryTileProvider::new();
        let a = chip(&mut provider, "a.tif", 3, -20, 16);
        let b = chip(&mut provider, "b.tif", 3, -20, 16);
        let roi = RegionOfInterest::from_polygon(
            RoiName::Australia,
            polygon![(x: -1e7, y: -1e7), (x: 1e7, y: -1e7), (x: 1e7, y: 1e7), (x: -1e7, y: 1e7)],
        );
        let params = TableParams {
            base_size_pix: 8,
            ..TableParams::default()
        };
        let result = form_chiplet_table(&provider, &[a, b], &roi, &params);
        assert!(matches!(result, Err(ChipletError::DuplicateGridRef { .. })));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let mut provider = MemoryTileProvider::new();
        let path = chip(&mut provider, "x1y-2.tif", 1, -2, 32);
        let roi = RegionOfInterest::from_polygon(
            RoiName::Australia,
            polygon![(x: -1e7, y: -1e7), (x: 1e7, y: -1e7), (x: 1e7, y: 1e7), (x: -1e7, y: 1e7)],
        );
        let params = TableParams {
            base_size_pix: 8,
            pad_size_pix: 32,
            n_subsets: 5,
        };
        let table = form_chiplet_table(&provider, &[path], &roi, &params).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let table_path = layout.table_path(RoiName::Australia, 32);
        table.save(&table_path, false).unwrap();

        let loaded = ChipletTable::open(&layout, RoiName::Australia, 32).unwrap();
        assert_eq!(loaded.records(), table.records());
        assert_eq!(loaded.grid_refs(), vec![GridRef::new(1, -2)]);
        assert_eq!(loaded.rows_for(GridRef::new(1, -2)).len(), 16);
    }
}
