//! GeoTIFF export of unpadded stores, one file per grid cell

use crate::config::PipelineConfig;
use crate::core::chiplet_store::load_chiplets;
use crate::core::chiplet_table::ChipletTable;
use crate::core::chiplets::grid_cell_raster;
use crate::io::completion;
use crate::io::gdal_io::write_geotiff;
use crate::io::paths::OutputLayout;
use crate::io::store_array::{ChipletArrayReader, StoreElement};
use crate::types::{ChipletError, ChipletResult, DataSource, Dtype, GridRef, Raster};
use half::f16;
use ndarray::{concatenate, Axis};
use std::fs;

fn cell_raster<T: StoreElement>(
    reader: &ChipletArrayReader<T>,
    table: &ChipletTable,
    grid_ref: GridRef,
    base_size_pix: usize,
    nodata: f32,
) -> ChipletResult<Raster> {
    let bands = (0..reader.shape().bands())
        .map(|band| grid_cell_raster(reader, table, grid_ref, base_size_pix, band, nodata))
        .collect::<ChipletResult<Vec<_>>>()?;

    let first = bands
        .first()
        .ok_or_else(|| ChipletError::EmptyTable(format!("store for {} has no bands", grid_ref)))?;
    if bands.len() == 1 {
        return Ok(first.clone());
    }

    let views: Vec<_> = bands.iter().map(|raster| raster.data.view()).collect();
    let data = concatenate(Axis(0), &views)
        .map_err(|e| ChipletError::Consistency(format!("Bands of {} differ in shape: {}", grid_ref, e)))?;
    Ok(Raster::new(data, first.transform, first.nodata))
}

fn export_with<T: StoreElement>(
    config: &PipelineConfig,
    layout: &OutputLayout,
    source: DataSource,
    year: i32,
    table: &ChipletTable,
) -> ChipletResult<usize> {
    let reader = load_chiplets::<T>(layout, table, source, year, config.base_size_pix, false)?;
    let nodata = source.nodata();
    let mut written = 0;

    for grid_ref in table.grid_refs() {
        let path = layout.geotiff_path(source, year, table.roi(), grid_ref.x, grid_ref.y);
        if completion::is_complete(&path) {
            log::debug!("{} already exported; skipping", path.display());
            continue;
        }

        let raster = cell_raster(&reader, table, grid_ref, config.base_size_pix, nodata)?;
        completion::clear(&path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_geotiff(&path, &raster)?;
        completion::mark_complete(&path, Some(Dtype::F32), &[raster.bands(), raster.height(), raster.width()], config.protect)?;
        written += 1;
    }
    Ok(written)
}

/// Write every grid cell of one year's unpadded store as a GeoTIFF.
///
/// Returns the number of files written; cells exported by an earlier run are
/// left alone.
pub fn export_year_geotiffs(
    config: &PipelineConfig,
    source: DataSource,
    year: i32,
    table: &ChipletTable,
) -> ChipletResult<usize> {
    if table.pad_size_pix() != 0 {
        return Err(ChipletError::Consistency(format!(
            "Export reads unpadded stores; table has padding {}",
            table.pad_size_pix()
        )));
    }

    let layout = OutputLayout::new(&config.base_output_dir);
    let written = match source.dtype() {
        Dtype::U8 => export_with::<u8>(config, &layout, source, year, table)?,
        Dtype::F16 => export_with::<f16>(config, &layout, source, year, table)?,
        Dtype::F32 => export_with::<f32>(config, &layout, source, year, table)?,
    };

    log::info!("Exported {} GeoTIFFs for {} {}", written, source, year);
    Ok(written)
}
