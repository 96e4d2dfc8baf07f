//! Relabelling of categorical chiplets before they are stored

use crate::core::chiplet_table::ChipletRecord;
use crate::core::roi::RegionOfInterest;
use crate::io::paths::num_str_to_int;
use crate::types::{ChipletError, ChipletResult};
use ndarray::Array3;
use std::path::Path;

/// Label given to codes the lookup table does not map
pub const SENTINEL_LABEL: u8 = 99;

/// Land cover classes that may be open water
pub const WATER_LABELS: [u8; 2] = [20, 21];

pub const OCEAN_LABEL: u8 = 22;

/// Where a patch came from, for relabellers that need its geometry
#[derive(Debug, Clone, Copy)]
pub struct PatchContext<'a> {
    pub year: i32,
    pub record: &'a ChipletRecord,
    /// Pixel-centre x coordinate of each patch column
    pub xs: &'a [f64],
    /// Pixel-centre y coordinate of each patch row
    pub ys: &'a [f64],
}

impl PatchContext<'_> {
    /// Relabelling error locating this patch
    pub fn error(&self, message: impl Into<String>) -> ChipletError {
        ChipletError::Relabel {
            year: self.year,
            index: self.record.index,
            grid_ref: self.record.grid_ref,
            pixel_offset: (self.record.chip_i_x_base, self.record.chip_i_y_base),
            message: message.into(),
        }
    }
}

/// Remaps the categorical codes of a patch in place
pub trait Relabeller: Send + Sync {
    fn relabel(&self, patch: &mut Array3<f32>, ctx: &PatchContext<'_>) -> ChipletResult<()>;
}

/// Dense code-to-code lookup table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelabelLut {
    table: Vec<u8>,
}

impl RelabelLut {
    /// A table of `size` codes, all mapped to the sentinel
    pub fn new(size: usize) -> Self {
        Self {
            table: vec![SENTINEL_LABEL; size],
        }
    }

    pub fn set(&mut self, from: usize, to: u8) -> ChipletResult<()> {
        let size = self.table.len();
        let slot = self
            .table
            .get_mut(from)
            .ok_or_else(|| ChipletError::InvalidFormat(format!("Code {} outside a table of {}", from, size)))?;
        *slot = to;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Read a mapping from two columns of a CSV file.
    ///
    /// Source codes run from 0 to `max_from` and mapped codes may not exceed
    /// `max_to`. Cells are decoded leniently, so Latin-1 files are accepted.
    pub fn from_csv(path: &Path, from_col: &str, to_col: &str, max_from: usize, max_to: u8) -> ChipletResult<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.byte_headers()?.clone();
        let column = |name: &str| -> ChipletResult<usize> {
            headers
                .iter()
                .position(|h| String::from_utf8_lossy(h).trim_start_matches('\u{feff}') == name)
                .ok_or_else(|| ChipletError::InvalidFormat(format!("No column '{}' in {}", name, path.display())))
        };
        let (from_idx, to_idx) = (column(from_col)?, column(to_col)?);

        let mut lut = Self::new(max_from + 1);
        for record in reader.byte_records() {
            let record = record?;
            if record.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            let cell = |idx: usize| String::from_utf8_lossy(record.get(idx).unwrap_or_default()).into_owned();
            let from = num_str_to_int(&cell(from_idx))?;
            let to = num_str_to_int(&cell(to_idx))?;

            if from < 0 || to < 0 || from > max_from as i64 || to > max_to as i64 {
                return Err(ChipletError::InvalidFormat(format!(
                    "Unexpected labels in {}: {}, {}",
                    path.display(),
                    from,
                    to
                )));
            }
            lut.set(from as usize, to as u8)?;
        }

        log::debug!("Read {}-entry relabel table from {}", lut.len(), path.display());
        Ok(lut)
    }

    /// Map every code of `patch`, failing on codes outside the table
    pub fn apply(&self, patch: &mut Array3<f32>, ctx: &PatchContext<'_>) -> ChipletResult<()> {
        for value in patch.iter_mut() {
            let code = *value;
            if !(code >= 0.0) || code.fract() != 0.0 || code as usize >= self.table.len() {
                return Err(ctx.error(format!("code {} has no relabel entry", code)));
            }
            *value = self.table[code as usize] as f32;
        }
        Ok(())
    }
}

fn check_sentinel(patch: &Array3<f32>, ctx: &PatchContext<'_>) -> ChipletResult<()> {
    if let Some(((_, row, col), _)) = patch.indexed_iter().find(|(_, &v)| v == SENTINEL_LABEL as f32) {
        return Err(ctx.error(format!(
            "unexpected relabelling; sentinel value at patch pixel ({}, {})",
            row, col
        )));
    }
    Ok(())
}

/// Land cover: lookup remap plus ocean detection along the coast.
///
/// In patches that only partly overlap the ROI, water pixels whose centre lies
/// outside the coastline become ocean.
pub struct LandCoverRelabeller {
    lut: RelabelLut,
    coastal_roi: RegionOfInterest,
}

impl LandCoverRelabeller {
    pub fn new(lut: RelabelLut, coastal_roi: RegionOfInterest) -> ChipletResult<Self> {
        // fail at construction rather than on the first coastal patch
        coastal_roi.shape()?;
        Ok(Self { lut, coastal_roi })
    }
}

impl Relabeller for LandCoverRelabeller {
    fn relabel(&self, patch: &mut Array3<f32>, ctx: &PatchContext<'_>) -> ChipletResult<()> {
        self.lut.apply(patch, ctx)?;

        let is_water = |v: f32| WATER_LABELS.iter().any(|&w| v == w as f32);
        if ctx.record.partial_roi_overlap && patch.iter().any(|&v| is_water(v)) {
            let mut n_ocean = 0usize;
            for ((_, row, col), value) in patch.indexed_iter_mut() {
                if !is_water(*value) {
                    continue;
                }
                let (x, y) = match (ctx.xs.get(col), ctx.ys.get(row)) {
                    (Some(&x), Some(&y)) => (x, y),
                    _ => return Err(ctx.error("patch larger than its coordinates")),
                };
                if !self.coastal_roi.contains_point(x, y)? {
                    *value = OCEAN_LABEL as f32;
                    n_ocean += 1;
                }
            }
            if n_ocean > 0 {
                log::debug!("Row {}: {} water pixels relabelled as ocean", ctx.record.index, n_ocean);
            }
        }

        check_sentinel(patch, ctx)
    }
}

/// Land use: lookup remap only
pub struct LandUseRelabeller {
    lut: RelabelLut,
}

impl LandUseRelabeller {
    pub fn new(lut: RelabelLut) -> Self {
        Self { lut }
    }
}

impl Relabeller for LandUseRelabeller {
    fn relabel(&self, patch: &mut Array3<f32>, ctx: &PatchContext<'_>) -> ChipletResult<()> {
        self.lut.apply(patch, ctx)?;
        check_sentinel(patch, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AffineTransform, BoundingBox, GridRef, RoiName};
    use geo::polygon;

    fn record(partial: bool) -> ChipletRecord {
        ChipletRecord {
            index: 7,
            grid_ref: GridRef::new(1, 2),
            chip_i_x_base: 16,
            chip_i_y_base: 32,
            base_bbox: BoundingBox::new(0.0, 0.0, 20.0, 20.0),
            padded_bbox: BoundingBox::new(0.0, 0.0, 20.0, 20.0),
            transform: AffineTransform::north_up(0.0, 20.0, 10.0, 10.0),
            partial_roi_overlap: partial,
            subset_num: 1,
            subset_instance_num: 1,
        }
    }

    fn lut() -> RelabelLut {
        let mut lut = RelabelLut::new(128);
        lut.set(1, 20).unwrap();
        lut.set(2, 5).unwrap();
        lut
    }

    #[test]
    fn test_lut_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relabel.csv");
        std::fs::write(&path, "level4,LCNS_n,label\n1,20,water\n2,5.,grass\n,,\n").unwrap();

        let lut = RelabelLut::from_csv(&path, "level4", "LCNS_n", 127, 255).unwrap();
        assert_eq!(lut.len(), 128);
        assert_eq!(lut, self::lut());

        std::fs::write(&path, "level4,LCNS_n\n200,1\n").unwrap();
        assert!(RelabelLut::from_csv(&path, "level4", "LCNS_n", 127, 255).is_err());
        assert!(RelabelLut::from_csv(&path, "Value", "LCNS_n", 127, 255).is_err());
    }

    #[test]
    fn test_sentinel_reports_patch_location() {
        let record = record(false);
        let ctx = PatchContext {
            year: 1999,
            record: &record,
            xs: &[5.0, 15.0],
            ys: &[15.0, 5.0],
        };
        let mut patch = Array3::from_elem((1, 2, 2), 2.0);
        patch[[0, 1, 0]] = 3.0;

        match LandUseRelabeller::new(lut()).relabel(&mut patch, &ctx) {
            Err(ChipletError::Relabel { year, index, pixel_offset, .. }) => {
                assert_eq!((year, index, pixel_offset), (1999, 7, (16, 32)));
            }
            other => panic!("expected relabel error, got {:?}", other),
        }
    }

    #[test]
    fn test_water_outside_coast_becomes_ocean() {
        // coastline covers only the left column of the patch
        let coast = RegionOfInterest::from_polygon(
            RoiName::Australia,
            polygon![(x: -1.0, y: -1.0), (x: 10.0, y: -1.0), (x: 10.0, y: 21.0), (x: -1.0, y: 21.0)],
        );
        let relabeller = LandCoverRelabeller::new(lut(), coast).unwrap();

        for (partial, expected_right) in [(true, OCEAN_LABEL as f32), (false, 20.0)] {
            let record = record(partial);
            let ctx = PatchContext {
                year: 2001,
                record: &record,
                xs: &[5.0, 15.0],
                ys: &[15.0, 5.0],
            };
            let mut patch = Array3::from_elem((1, 2, 2), 1.0);
            patch[[0, 1, 1]] = 2.0;

            relabeller.relabel(&mut patch, &ctx).unwrap();
            assert_eq!(patch[[0, 0, 0]], 20.0);
            assert_eq!(patch[[0, 0, 1]], expected_right);
            assert_eq!(patch[[0, 1, 1]], 5.0);
        }
    }
}
