//! Cutting chiplets out of packets, and placing them back on the map

use crate::core::chiplet_table::{ChipletRecord, ChipletTable};
use crate::core::packet::{ChipletTiles, Packet, TileSource};
use crate::io::store_array::{ChipletArrayReader, StoreElement};
use crate::types::{AffineTransform, ChipletError, ChipletResult, GridRef, Raster};
use ndarray::{s, Array3, ArrayView3};
use std::collections::HashMap;

/// Per-chip transforms, keyed by grid reference.
///
/// Every chiplet of a chip shares the chip's transform, so it is taken from
/// the first row seen for a cell and reused. Rows of the same cell that carry
/// a different transform are rejected.
#[derive(Debug, Default)]
pub struct TransformCache {
    transforms: HashMap<GridRef, AffineTransform>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, record: &ChipletRecord) -> ChipletResult<AffineTransform> {
        let cached = *self.transforms.entry(record.grid_ref).or_insert(record.transform);
        if cached != record.transform {
            return Err(ChipletError::Consistency(format!(
                "Row {} of grid cell {} has transform {:?}, the cell uses {:?}",
                record.index, record.grid_ref, record.transform, cached
            )));
        }
        Ok(cached)
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

/// Pixel-centre coordinates of a (padded) chiplet, as `(xs, ys)`
pub fn chiplet_coords(
    record: &ChipletRecord,
    transform: &AffineTransform,
    base_size_pix: usize,
    pad_size_pix: usize,
) -> (Vec<f64>, Vec<f64>) {
    let side = base_size_pix + 2 * pad_size_pix;
    let x0 = record.chip_i_x_base as f64 - pad_size_pix as f64;
    let y0 = record.chip_i_y_base as f64 - pad_size_pix as f64;

    (0..side)
        .map(|k| {
            let i = k as f64 + 0.5;
            transform.apply(x0 + i, y0 + i)
        })
        .unzip()
}

/// Cut the chiplet described by `record` out of `packet`, as `(bands, side, side)`
pub fn get_chiplet_from_packet<S: TileSource>(
    packet: &mut Packet<S>,
    record: &ChipletRecord,
    transforms: &mut TransformCache,
    base_size_pix: usize,
    pad_size_pix: usize,
) -> ChipletResult<Array3<f32>> {
    let transform = transforms.get(record)?;
    let (xs, ys) = chiplet_coords(record, &transform, base_size_pix, pad_size_pix);
    packet.extract(&xs, &ys)
}

/// Georeference a stored chiplet, dropping its padding.
///
/// The result covers exactly the chiplet's base extent, so its first pixel
/// centre sits half a pixel inside `base_bbox`.
pub fn chiplet_to_raster(
    chiplet: ArrayView3<f32>,
    record: &ChipletRecord,
    base_size_pix: usize,
    pad_size_pix: usize,
    nodata: Option<f32>,
) -> ChipletResult<Raster> {
    let side = base_size_pix + 2 * pad_size_pix;
    let (_, height, width) = chiplet.dim();
    if (height, width) != (side, side) {
        return Err(ChipletError::Consistency(format!(
            "Chiplet {} is {}x{}, expected {}x{}",
            record.index, height, width, side, side
        )));
    }

    let data = chiplet
        .slice(s![
            ..,
            pad_size_pix..pad_size_pix + base_size_pix,
            pad_size_pix..pad_size_pix + base_size_pix
        ])
        .to_owned();
    let transform = record
        .transform
        .translated(record.chip_i_x_base as f64, record.chip_i_y_base as f64);

    Ok(Raster::new(data, transform, nodata))
}

/// Packet over one band of a stored array, with chiplets back in place
pub fn form_packet_from_chiplets<'a, T: StoreElement>(
    reader: &'a ChipletArrayReader<T>,
    table: &'a ChipletTable,
    base_size_pix: usize,
    band: usize,
    nodata: f32,
    cache_size: usize,
) -> ChipletResult<Packet<ChipletTiles<'a, T>>> {
    let tiles = ChipletTiles::new(reader, table, base_size_pix, band, nodata)?;
    Packet::new(tiles, nodata, cache_size)
}

/// One grid cell of a store reassembled into a single raster
pub fn grid_cell_raster<T: StoreElement>(
    reader: &ChipletArrayReader<T>,
    table: &ChipletTable,
    grid_ref: GridRef,
    base_size_pix: usize,
    band: usize,
    nodata: f32,
) -> ChipletResult<Raster> {
    let rows: Vec<usize> = table.rows_for(grid_ref).iter().map(|r| r.index).collect();
    if rows.is_empty() {
        return Err(ChipletError::NoTiles(format!("no chiplets in grid cell {}", grid_ref)));
    }
    let n_rows = rows.len();
    let tiles = ChipletTiles::new(reader, table, base_size_pix, band, nodata)?.for_rows(rows);
    let mut packet = Packet::new(tiles, nodata, n_rows)?;
    packet.to_raster()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn known_record() -> ChipletRecord {
        ChipletRecord {
            index: 0,
            grid_ref: GridRef::new(-10, -18),
            chip_i_x_base: 480,
            chip_i_y_base: 3840,
            base_bbox: BoundingBox::new(-988_000.0, -1_800_000.0, -984_000.0, -1_796_000.0),
            padded_bbox: BoundingBox::new(-988_800.0, -1_800_800.0, -983_200.0, -1_795_200.0),
            transform: AffineTransform::new(25.0, 0.0, -1_000_000.0, 0.0, -25.0, -1_700_000.0),
            partial_roi_overlap: true,
            subset_num: 4,
            subset_instance_num: 1,
        }
    }

    #[test]
    fn test_chiplet_coords_are_pixel_centres() {
        let record = known_record();
        let (xs, ys) = chiplet_coords(&record, &record.transform, 160, 0);
        assert_eq!(xs.len(), 160);
        assert_relative_eq!(xs[0], -988_000.0 + 12.5);
        assert_relative_eq!(xs[159], -984_000.0 - 12.5);
        assert_relative_eq!(ys[0], -1_796_000.0 - 12.5);
        assert_relative_eq!(ys[159], -1_800_000.0 + 12.5);

        let (xs, _) = chiplet_coords(&record, &record.transform, 160, 32);
        assert_eq!(xs.len(), 224);
        assert_relative_eq!(xs[0], -988_800.0 + 12.5);
    }

    #[test]
    fn test_chiplet_to_raster_crops_padding() {
        let record = known_record();
        for pad in [0, 32] {
            let side = 160 + 2 * pad;
            let chiplet = Array3::from_shape_fn((1, side, side), |(_, r, c)| {
                if r < pad || c < pad || r >= pad + 160 || c >= pad + 160 {
                    999.0
                } else {
                    1.0
                }
            });
            let raster = chiplet_to_raster(chiplet.view(), &record, 160, pad, None).unwrap();
            assert_eq!(raster.data.dim(), (1, 160, 160));
            assert!(raster.data.iter().all(|&v| v == 1.0));

            let (x_first, y_first) = raster.transform.apply(0.5, 0.5);
            let (x_last, y_last) = raster.transform.apply(159.5, 159.5);
            assert_relative_eq!(x_first, record.base_bbox.left + 12.5);
            assert_relative_eq!(x_last, record.base_bbox.right - 12.5);
            assert_relative_eq!(y_first, record.base_bbox.top - 12.5);
            assert_relative_eq!(y_last, record.base_bbox.bottom + 12.5);
        }
    }

    #[test]
    fn test_transform_cache_rejects_inconsistent_rows() {
        let mut cache = TransformCache::new();
        let record = known_record();
        assert_eq!(cache.get(&record).unwrap(), record.transform);

        let mut other = record.clone();
        other.index = 1;
        other.transform.c += 25.0;
        assert!(cache.get(&other).is_err());
        assert_eq!(cache.len(), 1);
    }
}
