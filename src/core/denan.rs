//! Missing-value imputation for continuous stores.
//!
//! Every NaN of a chiplet is replaced by the mean of that chiplet's valid
//! pixels. Chiplets with no valid pixels are only expected for sources that
//! allow them, and those are filled with zero.

use crate::config::PipelineConfig;
use crate::core::chiplet_store::{completed_years, load_chiplets, run_per_year, BuildSummary, YearOutcome};
use crate::core::chiplet_table::ChipletTable;
use crate::io::completion;
use crate::io::paths::OutputLayout;
use crate::io::store_array::{ChipletArrayWriter, StoreElement};
use crate::types::{ChipletError, ChipletResult, DataSource, Dtype};
use half::f16;
use ndarray::ArrayViewMut3;
use std::path::Path;

/// Fill for chiplets without a single valid pixel
pub const ALL_MISSING_FILL: f32 = 0.0;

/// What imputation did to one chiplet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Imputation {
    /// No missing pixels
    Untouched,
    /// `count` pixels set to the chiplet mean `fill`
    Filled { count: usize, fill: f32 },
    /// Every pixel missing; set to the constant fill
    AllMissing,
}

/// Mean of the non-NaN values, accumulated in double precision
pub fn nanmean<I: IntoIterator<Item = f32>>(values: I) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0f64, 0usize), |(sum, n), v| (sum + v as f64, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Replace the NaNs of one chiplet in place
pub fn impute_chiplet<T: StoreElement>(
    mut chiplet: ArrayViewMut3<'_, T>,
    source: DataSource,
    year: i32,
    index: usize,
) -> ChipletResult<Imputation> {
    let count = chiplet.iter().filter(|v| v.to_f32().is_nan()).count();
    if count == 0 {
        return Ok(Imputation::Untouched);
    }

    if count == chiplet.len() {
        if !source.allows_all_missing() {
            return Err(ChipletError::AllMissing {
                data_source: source,
                year,
                index,
            });
        }
        chiplet.fill(T::from_f32(ALL_MISSING_FILL));
        return Ok(Imputation::AllMissing);
    }

    let mean = nanmean(chiplet.iter().map(|v| v.to_f32())).unwrap_or(ALL_MISSING_FILL as f64);
    // rounded to the store type once so every filled pixel is identical
    let fill = T::from_f32(mean as f32);
    chiplet.map_inplace(|v| {
        if v.to_f32().is_nan() {
            *v = fill;
        }
    });
    Ok(Imputation::Filled {
        count,
        fill: fill.to_f32(),
    })
}

/// Write the imputed copy of one year's store
pub fn denan_year(config: &PipelineConfig, source: DataSource, year: i32, table: &ChipletTable) -> ChipletResult<YearOutcome> {
    if !source.is_continuous() {
        return Err(ChipletError::InvalidFormat(format!(
            "{} is categorical; imputation only applies to continuous sources",
            source
        )));
    }

    let layout = OutputLayout::new(&config.base_output_dir);
    let output = layout.chiplet_path(source, year, table.roi(), table.pad_size_pix(), true);
    if completion::is_complete(&output) {
        log::info!("Imputed store {} already complete; skipping", output.display());
        return Ok(YearOutcome::Skipped);
    }

    let result = match source.dtype() {
        Dtype::F16 => write_denan::<f16>(config, &layout, source, year, table, &output),
        Dtype::F32 => write_denan::<f32>(config, &layout, source, year, table, &output),
        Dtype::U8 => Err(ChipletError::InvalidFormat(format!("{} is stored as bytes", source))),
    };

    if let Err(err) = result {
        log::error!("Imputing {} failed: {}", output.display(), err);
        if let Err(cleanup) = completion::clear(&output) {
            log::warn!("Could not remove partial store {}: {}", output.display(), cleanup);
        }
        return Err(err);
    }
    Ok(YearOutcome::Written)
}

fn write_denan<T: StoreElement>(
    config: &PipelineConfig,
    layout: &OutputLayout,
    source: DataSource,
    year: i32,
    table: &ChipletTable,
    output: &Path,
) -> ChipletResult<()> {
    let reader = load_chiplets::<T>(layout, table, source, year, config.base_size_pix, false)?;
    let shape = reader.shape();

    completion::clear(output)?;
    let mut writer = ChipletArrayWriter::<T>::create(output, shape)?;

    let (mut n_filled, mut n_all_missing) = (0usize, 0usize);
    for index in 0..shape.n_chiplets {
        let original = reader.chiplet(index)?;
        let mut target = writer.chiplet_mut(index)?;
        target.assign(&original);

        match impute_chiplet(target, source, year, index)? {
            Imputation::Untouched => {}
            Imputation::Filled { .. } => n_filled += 1,
            Imputation::AllMissing => n_all_missing += 1,
        }
    }

    writer.finish()?;
    completion::mark_complete(output, Some(T::DTYPE), &shape.dims(), config.protect)?;
    log::info!(
        "Imputed {} {}: {} chiplets filled, {} entirely missing",
        source,
        year,
        n_filled,
        n_all_missing
    );
    Ok(())
}

/// Impute every year with a completed store for the table's ROI and padding
pub fn run_denan(config: &PipelineConfig, source: DataSource, table: &ChipletTable) -> ChipletResult<BuildSummary> {
    config.validate()?;
    if !source.is_continuous() {
        return Err(ChipletError::InvalidFormat(format!(
            "Only continuous sources can be imputed, not {}",
            source
        )));
    }

    let layout = OutputLayout::new(&config.base_output_dir);
    let years = completed_years(&layout, source, table.roi(), table.pad_size_pix(), false)?;

    let label = format!("{} denan", source);
    run_per_year(&years, config.cores, config.show_progress, &label, |year| {
        denan_year(config, source, year, table)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    #[test]
    fn test_nanmean_skips_missing() {
        assert_relative_eq!(nanmean([1.0, f32::NAN, 2.0, 6.0]).unwrap(), 3.0);
        assert!(nanmean([f32::NAN, f32::NAN]).is_none());
    }

    #[test]
    fn test_impute_with_chiplet_mean() {
        let mut chiplet = Array3::from_shape_vec((1, 2, 2), vec![1.0f32, f32::NAN, 2.0, f32::NAN]).unwrap();
        let outcome = impute_chiplet(chiplet.view_mut(), DataSource::Rain, 2001, 0).unwrap();

        assert_eq!(outcome, Imputation::Filled { count: 2, fill: 1.5 });
        assert_eq!(chiplet.into_raw_vec(), vec![1.0, 1.5, 2.0, 1.5]);
    }

    #[test]
    fn test_fill_is_rounded_to_store_type() {
        let values: Vec<f16> = [0.1f32, 0.2, f32::NAN].iter().map(|&v| f16::from_f32(v)).collect();
        let mut chiplet = Array3::from_shape_vec((1, 1, 3), values).unwrap();
        impute_chiplet(chiplet.view_mut(), DataSource::Tmax, 2001, 0).unwrap();

        let expected = f16::from_f32(((f16::from_f32(0.1).to_f64() + f16::from_f32(0.2).to_f64()) / 2.0) as f32);
        assert_eq!(chiplet[[0, 0, 2]], expected);
    }

    #[test]
    fn test_all_missing_only_for_allowed_sources() {
        let mut soil = Array3::from_elem((1, 2, 2), f32::NAN);
        let outcome = impute_chiplet(soil.view_mut(), DataSource::SoilClay, 2001, 3).unwrap();
        assert_eq!(outcome, Imputation::AllMissing);
        assert!(soil.iter().all(|&v| v == ALL_MISSING_FILL));

        let mut rain = Array3::from_elem((1, 2, 2), f32::NAN);
        match impute_chiplet(rain.view_mut(), DataSource::Rain, 2001, 3) {
            Err(ChipletError::AllMissing { data_source, year, index }) => {
                assert_eq!((data_source, year, index), (DataSource::Rain, 2001, 3));
            }
            other => panic!("expected all-missing error, got {:?}", other),
        }
    }

    #[test]
    fn test_categorical_sources_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::with_base_dir(dir.path());
        let table = ChipletTable::new(crate::types::RoiName::Savanna, 0, Vec::new()).unwrap();
        assert!(run_denan(&config, DataSource::LandCover, &table).is_err());
    }
}
