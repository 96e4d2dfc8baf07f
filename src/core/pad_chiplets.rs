//! Padded stores rebuilt from unpadded ones.
//!
//! The unpadded chiplets of a year are put back on the map as a packet, one
//! band at a time, and each padded chiplet is cut out of that packet. Padding
//! that reaches past the area covered by unpadded chiplets keeps the nodata
//! fill.

use crate::config::PipelineConfig;
use crate::core::chiplet_store::{completed_years, load_chiplets, run_per_year, BuildSummary, YearOutcome};
use crate::core::chiplet_table::ChipletTable;
use crate::core::chiplets::{chiplet_coords, form_packet_from_chiplets, TransformCache};
use crate::io::completion;
use crate::io::paths::OutputLayout;
use crate::io::store_array::{ChipletArrayWriter, StoreElement};
use crate::types::{ChipletError, ChipletResult, DataSource, Dtype};
use half::f16;
use ndarray::Axis;
use std::path::Path;

/// Counts from padding one year
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PadReport {
    /// Chiplet bands cut from the packet
    pub written: usize,
    /// Chiplet bands left at nodata because they left the packet extent
    pub out_of_extent: usize,
}

fn check_tables(unpadded: &ChipletTable, padded: &ChipletTable) -> ChipletResult<()> {
    if unpadded.pad_size_pix() != 0 {
        return Err(ChipletError::Consistency(format!(
            "Padding source table has padding {}",
            unpadded.pad_size_pix()
        )));
    }
    if padded.pad_size_pix() == 0 {
        return Err(ChipletError::Consistency("Padded table has no padding".to_string()));
    }
    if unpadded.roi() != padded.roi() || unpadded.len() != padded.len() {
        return Err(ChipletError::Consistency(format!(
            "Tables differ: {} rows for {} vs {} rows for {}",
            unpadded.len(),
            unpadded.roi(),
            padded.len(),
            padded.roi()
        )));
    }
    Ok(())
}

/// Write the padded store of one year from its completed unpadded store
pub fn pad_chiplets_year(
    config: &PipelineConfig,
    source: DataSource,
    year: i32,
    unpadded: &ChipletTable,
    padded: &ChipletTable,
) -> ChipletResult<YearOutcome> {
    check_tables(unpadded, padded)?;

    let layout = OutputLayout::new(&config.base_output_dir);
    let output = layout.chiplet_path(source, year, padded.roi(), padded.pad_size_pix(), false);
    if completion::is_complete(&output) {
        log::info!("Padded store {} already complete; skipping", output.display());
        return Ok(YearOutcome::Skipped);
    }

    let result = match source.dtype() {
        Dtype::U8 => write_padded::<u8>(config, &layout, source, year, unpadded, padded, &output),
        Dtype::F16 => write_padded::<f16>(config, &layout, source, year, unpadded, padded, &output),
        Dtype::F32 => write_padded::<f32>(config, &layout, source, year, unpadded, padded, &output),
    };

    match result {
        Ok(report) => {
            if report.out_of_extent > 0 {
                log::warn!(
                    "{} {}: {} chiplet band(s) reach outside the unpadded chiplets and were left at nodata",
                    source,
                    year,
                    report.out_of_extent
                );
            }
            Ok(YearOutcome::Written)
        }
        Err(err) => {
            log::error!("Padding {} failed: {}", output.display(), err);
            if let Err(cleanup) = completion::clear(&output) {
                log::warn!("Could not remove partial store {}: {}", output.display(), cleanup);
            }
            Err(err)
        }
    }
}

fn write_padded<T: StoreElement>(
    config: &PipelineConfig,
    layout: &OutputLayout,
    source: DataSource,
    year: i32,
    unpadded: &ChipletTable,
    padded: &ChipletTable,
    output: &Path,
) -> ChipletResult<PadReport> {
    let base_size_pix = config.base_size_pix;
    let pad_size_pix = padded.pad_size_pix();
    let nodata = source.nodata();

    let reader = load_chiplets::<T>(layout, unpadded, source, year, base_size_pix, false)?;
    let n_extra = reader.shape().n_extra;
    let shape = padded.array_shape(base_size_pix, n_extra);

    completion::clear(output)?;
    let mut writer = ChipletArrayWriter::<T>::create(output, shape)?;
    writer.fill(T::from_f32(nodata));

    let mut report = PadReport::default();
    for band in 0..shape.bands() {
        // one band at a time keeps a single band's tiles in memory
        let mut packet =
            form_packet_from_chiplets(&reader, unpadded, base_size_pix, band, nodata, config.tile_cache_size)?;
        let mut transforms = TransformCache::new();

        for record in padded.records() {
            let transform = transforms.get(record)?;
            let (xs, ys) = chiplet_coords(record, &transform, base_size_pix, pad_size_pix);
            match packet.extract(&xs, &ys) {
                Ok(patch) => {
                    writer.write_band(record.index, band, patch.index_axis(Axis(0), 0))?;
                    report.written += 1;
                }
                Err(ChipletError::OutOfExtent { x, y, .. }) => {
                    log::debug!("Row {} band {} leaves the packet at ({}, {})", record.index, band, x, y);
                    report.out_of_extent += 1;
                }
                Err(err) => return Err(err),
            }
        }
        log::debug!("Band {} of {} {}: {} tile reads", band, source, year, packet.tiles_loaded());
    }

    writer.finish()?;
    completion::mark_complete(output, Some(T::DTYPE), &shape.dims(), config.protect)?;
    log::info!("Wrote {} padded chiplets to {}", shape.n_chiplets, output.display());
    Ok(report)
}

/// Pad every year that has a completed unpadded store
pub fn pad_chiplets(
    config: &PipelineConfig,
    source: DataSource,
    unpadded: &ChipletTable,
    padded: &ChipletTable,
) -> ChipletResult<BuildSummary> {
    config.validate()?;
    check_tables(unpadded, padded)?;

    let layout = OutputLayout::new(&config.base_output_dir);
    let years = completed_years(&layout, source, unpadded.roi(), 0, false)?;
    if years.is_empty() {
        log::warn!("No completed unpadded {} stores for {}", source, unpadded.roi());
    }

    let label = format!("{} pad {}", source, padded.pad_size_pix());
    run_per_year(&years, config.cores, config.show_progress, &label, |year| {
        pad_chiplets_year(config, source, year, unpadded, padded)
    })
}
