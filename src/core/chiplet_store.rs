//! Chiplet stores: one memory-mapped array per (source, year, ROI, padding).
//!
//! A year is built by a single worker that owns its output file. The first
//! thing a worker does is look for a completion marker; a completed store is
//! skipped without touching the packet. A failed build removes its partial
//! file so the next run starts that year from scratch.

use crate::config::PipelineConfig;
use crate::core::chiplet_table::ChipletTable;
use crate::core::chiplets::{chiplet_coords, TransformCache};
use crate::core::packet::{form_packet, Packet, TileSource};
use crate::core::relabel::{PatchContext, Relabeller};
use crate::core::resample::Reprojector;
use crate::io::completion;
use crate::io::paths::OutputLayout;
use crate::io::raster::RasterTileProvider;
use crate::io::store_array::{ChipletArrayReader, ChipletArrayWriter, StoreElement, StoreShape};
use crate::progress::{ProgressDisplay, ProgressSender};
use crate::types::{ChipletError, ChipletResult, DataSource, Dtype, RoiName};
use half::f16;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What happened to one year
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearOutcome {
    Written,
    /// A completed store was already present
    Skipped,
}

/// Result of building every year of a source
#[derive(Debug, Default)]
pub struct BuildSummary {
    pub written: Vec<i32>,
    pub skipped: Vec<i32>,
    pub failed: Vec<(i32, ChipletError)>,
}

impl BuildSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn the first failure, if any, into an error
    pub fn into_result(mut self) -> ChipletResult<Self> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        let (year, error) = self.failed.remove(0);
        log::error!("Build failed for {} year(s); first was {}", self.failed.len() + 1, year);
        Err(error)
    }
}

/// Everything needed to build the stores of one source for one table
pub struct StoreBuilder<'a> {
    layout: OutputLayout,
    source: DataSource,
    table: &'a ChipletTable,
    provider: &'a dyn RasterTileProvider,
    relabeller: Option<&'a dyn Relabeller>,
    resample: Option<(&'a dyn Reprojector, f64)>,
    base_size_pix: usize,
    protect: bool,
    tile_cache_size: usize,
}

impl<'a> StoreBuilder<'a> {
    pub fn new(
        config: &PipelineConfig,
        source: DataSource,
        table: &'a ChipletTable,
        provider: &'a dyn RasterTileProvider,
    ) -> Self {
        Self {
            layout: OutputLayout::new(&config.base_output_dir),
            source,
            table,
            provider,
            relabeller: None,
            resample: None,
            base_size_pix: config.base_size_pix,
            protect: config.protect,
            tile_cache_size: config.tile_cache_size,
        }
    }

    pub fn with_relabeller(mut self, relabeller: &'a dyn Relabeller) -> Self {
        self.relabeller = Some(relabeller);
        self
    }

    /// Resample source tiles to `resolution` with the source's own policy
    pub fn with_resampling(mut self, reprojector: &'a dyn Reprojector, resolution: f64) -> Self {
        self.resample = Some((reprojector, resolution));
        self
    }

    pub fn output_path(&self, year: i32) -> PathBuf {
        self.layout
            .chiplet_path(self.source, year, self.table.roi(), self.table.pad_size_pix(), false)
    }

    /// Build the store for one year from its chip files
    pub fn build_year(&self, year: i32, chip_paths: &[PathBuf]) -> ChipletResult<YearOutcome> {
        let output = self.output_path(year);

        if completion::is_complete(&output) {
            log::info!("Store {} already complete; skipping", output.display());
            return Ok(YearOutcome::Skipped);
        }

        if chip_paths.is_empty() {
            return Err(ChipletError::NoTiles(format!(
                "no {} chips for {}",
                self.source, year
            )));
        }

        log::info!(
            "Building {} store for {} from {} chips",
            self.source,
            year,
            chip_paths.len()
        );

        let resample = self
            .resample
            .map(|(reprojector, resolution)| (reprojector, resolution, self.source.resampling()));
        let packet = form_packet(
            self.provider,
            chip_paths,
            self.source.nodata(),
            resample,
            self.tile_cache_size,
        )?;

        let result = match self.source.dtype() {
            Dtype::U8 => self.write_store::<u8, _>(packet, year, &output),
            Dtype::F16 => self.write_store::<f16, _>(packet, year, &output),
            Dtype::F32 => self.write_store::<f32, _>(packet, year, &output),
        };

        if let Err(err) = result {
            log::error!("Building {} failed: {}", output.display(), err);
            if let Err(cleanup) = completion::clear(&output) {
                log::warn!("Could not remove partial store {}: {}", output.display(), cleanup);
            }
            return Err(err);
        }

        Ok(YearOutcome::Written)
    }

    fn write_store<T: StoreElement, S: TileSource>(
        &self,
        mut packet: Packet<S>,
        year: i32,
        output: &Path,
    ) -> ChipletResult<()> {
        let pad_size_pix = self.table.pad_size_pix();
        let n_extra = if packet.bands() > 1 { packet.bands() } else { 0 };
        let shape = self.table.array_shape(self.base_size_pix, n_extra);

        completion::clear(output)?;
        let mut writer = ChipletArrayWriter::<T>::create(output, shape)?;
        let mut transforms = TransformCache::new();

        for record in self.table.records() {
            let transform = transforms.get(record)?;
            let (xs, ys) = chiplet_coords(record, &transform, self.base_size_pix, pad_size_pix);
            let mut patch = packet.extract(&xs, &ys)?;

            if let Some(relabeller) = self.relabeller {
                let ctx = PatchContext {
                    year,
                    record,
                    xs: &xs,
                    ys: &ys,
                };
                relabeller.relabel(&mut patch, &ctx)?;
            }

            writer.write_chiplet(record.index, patch.view())?;
        }

        writer.finish()?;
        completion::mark_complete(output, Some(T::DTYPE), &shape.dims(), self.protect)?;

        log::info!(
            "Wrote {} chiplets to {} ({} tile reads)",
            shape.n_chiplets,
            output.display(),
            packet.tiles_loaded()
        );
        Ok(())
    }

    /// Build every year on a pool of `cores` workers.
    ///
    /// A failing year is recorded in the summary and does not stop the others.
    pub fn build_all(
        &self,
        chips_by_year: &BTreeMap<i32, Vec<PathBuf>>,
        cores: usize,
        show_progress: bool,
    ) -> ChipletResult<BuildSummary> {
        let years: Vec<i32> = chips_by_year.keys().copied().collect();
        let label = format!("{} stores", self.source);
        run_per_year(&years, cores, show_progress, &label, |year| {
            let paths = chips_by_year.get(&year).map(Vec::as_slice).unwrap_or_default();
            self.build_year(year, paths)
        })
    }
}

/// Run `task` for every year on a pool of `cores` workers, one year per task.
///
/// Progress goes over a channel to a single display thread. Failures are
/// collected per year rather than aborting the pool.
pub(crate) fn run_per_year<F>(
    years: &[i32],
    cores: usize,
    show_progress: bool,
    label: &str,
    task: F,
) -> ChipletResult<BuildSummary>
where
    F: Fn(i32) -> ChipletResult<YearOutcome> + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cores.max(1))
        .build()
        .map_err(|e| ChipletError::WorkerPool(e.to_string()))?;

    let (progress, display) = ProgressDisplay::spawn(years.len() as u64, label, show_progress);

    let outcomes: Vec<(i32, ChipletResult<YearOutcome>)> = pool.install(|| {
        years
            .par_iter()
            .map_with(progress, |progress: &mut ProgressSender, &year| {
                let outcome = task(year);
                progress.message(format!("{} {}", label, year));
                progress.advance(1);
                (year, outcome)
            })
            .collect()
    });
    display.finish();

    let mut summary = BuildSummary::default();
    for (year, outcome) in outcomes {
        match outcome {
            Ok(YearOutcome::Written) => summary.written.push(year),
            Ok(YearOutcome::Skipped) => summary.skipped.push(year),
            Err(err) => summary.failed.push((year, err)),
        }
    }

    log::info!(
        "{}: {} written, {} skipped, {} failed",
        label,
        summary.written.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    Ok(summary)
}

/// Build all years of `source` under the standard layout
pub fn build_chiplet_stores(
    config: &PipelineConfig,
    source: DataSource,
    table: &ChipletTable,
    provider: &dyn RasterTileProvider,
    chips_by_year: &BTreeMap<i32, Vec<PathBuf>>,
    relabeller: Option<&dyn Relabeller>,
) -> ChipletResult<BuildSummary> {
    config.validate()?;
    let mut builder = StoreBuilder::new(config, source, table, provider);
    if let Some(relabeller) = relabeller {
        builder = builder.with_relabeller(relabeller);
    }
    builder.build_all(chips_by_year, config.cores, config.show_progress)
}

/// Store shape recorded by the completion marker, checked against the table
fn completed_shape(path: &Path, table: &ChipletTable, base_size_pix: usize, dtype: Dtype) -> ChipletResult<StoreShape> {
    let record = completion::read_record(path)
        .filter(|_| completion::is_complete(path))
        .ok_or_else(|| ChipletError::Consistency(format!("Store {} is missing or incomplete", path.display())))?;

    if record.dtype.is_some_and(|d| d != dtype) {
        return Err(ChipletError::Consistency(format!(
            "Store {} holds {:?}, expected {}",
            path.display(),
            record.dtype,
            dtype
        )));
    }

    let n_extra = if record.shape.len() == 4 { record.shape[1] } else { 0 };
    Ok(table.array_shape(base_size_pix, n_extra))
}

/// Open the completed store at `path` read-only, with its shape taken from `table`
pub fn open_store<T: StoreElement>(path: &Path, table: &ChipletTable, base_size_pix: usize) -> ChipletResult<ChipletArrayReader<T>> {
    let shape = completed_shape(path, table, base_size_pix, T::DTYPE)?;
    ChipletArrayReader::open(path, shape)
}

/// Open the store of (source, year) for the table's ROI and padding
pub fn load_chiplets<T: StoreElement>(
    layout: &OutputLayout,
    table: &ChipletTable,
    source: DataSource,
    year: i32,
    base_size_pix: usize,
    denan: bool,
) -> ChipletResult<ChipletArrayReader<T>> {
    let path = layout.chiplet_path(source, year, table.roi(), table.pad_size_pix(), denan);
    open_store(&path, table, base_size_pix)
}

/// Years with a completed store for (source, ROI, padding)
pub fn completed_years(
    layout: &OutputLayout,
    source: DataSource,
    roi: RoiName,
    pad_size_pix: usize,
    denan: bool,
) -> ChipletResult<Vec<i32>> {
    Ok(layout
        .available_years(source, roi, pad_size_pix, denan)?
        .into_iter()
        .filter(|&year| completion::is_complete(&layout.chiplet_path(source, year, roi, pad_size_pix, denan)))
        .collect())
}
