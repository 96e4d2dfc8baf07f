//! Summary statistics of continuous sources.
//!
//! Values are streamed one year at a time through a Welford accumulator.
//! Each year gets its own accumulator and the per-year results are merged
//! with Chan's update, so the result does not depend on the order years are
//! visited beyond floating-point rounding.

use crate::config::PipelineConfig;
use crate::core::chiplet_store::{completed_years, load_chiplets};
use crate::core::chiplet_table::ChipletTable;
use crate::io::completion;
use crate::io::paths::OutputLayout;
use crate::io::store_array::StoreElement;
use crate::types::{ChipletError, ChipletResult, DataSource, Dtype};
use half::f16;
use serde::{Deserialize, Serialize};
use std::fs;

/// Running count, mean, variance, min and max
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatTracker {
    count: u64,
    mean: f64,
    /// Sum of squared deviations from the mean
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for StatTracker {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl StatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn add_all<I: IntoIterator<Item = f64>>(&mut self, values: I) {
        values.into_iter().for_each(|v| self.add(v));
    }

    /// Combine with an accumulator over disjoint data
    pub fn merge(&mut self, other: &StatTracker) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let (n_a, n_b, n) = (self.count as f64, other.count as f64, count as f64);

        self.mean += delta * n_b / n;
        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.count = count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Population variance
    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| self.m2 / self.count as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

/// Stored statistics of one source over a set of years
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub source_name: DataSource,
    pub years: Vec<i32>,
    pub min_val: f64,
    pub max_val: f64,
    pub mean: f64,
    pub sd: f64,
    #[serde(default)]
    pub log_transform: bool,
}

impl SummaryStats {
    fn from_tracker(source: DataSource, years: Vec<i32>, tracker: &StatTracker, log_transform: bool) -> ChipletResult<Self> {
        let missing = || ChipletError::EmptyTable(format!("no {} values to summarise", source));
        Ok(Self {
            source_name: source,
            years,
            min_val: tracker.min().ok_or_else(missing)?,
            max_val: tracker.max().ok_or_else(missing)?,
            mean: tracker.mean().ok_or_else(missing)?,
            sd: tracker.std_dev().ok_or_else(missing)?,
            log_transform,
        })
    }
}

fn year_tracker<T: StoreElement>(
    layout: &OutputLayout,
    table: &ChipletTable,
    source: DataSource,
    year: i32,
    base_size_pix: usize,
    log_transform: bool,
) -> ChipletResult<StatTracker> {
    let reader = load_chiplets::<T>(layout, table, source, year, base_size_pix, true)?;
    let mut tracker = StatTracker::new();

    for (offset, value) in reader.data().iter().enumerate() {
        let value = value.to_f32() as f64;
        if value.is_nan() {
            return Err(ChipletError::Consistency(format!(
                "Imputed store {} still holds NaN at element {}",
                reader.path().display(),
                offset
            )));
        }
        if log_transform && value <= -1.0 {
            return Err(ChipletError::Consistency(format!(
                "Store {} holds {} at element {}, outside the domain of ln(1 + x)",
                reader.path().display(),
                value,
                offset
            )));
        }
        tracker.add(if log_transform { value.ln_1p() } else { value });
    }

    log::debug!("{} {}: {} values", source, year, tracker.count());
    Ok(tracker)
}

/// Compute (or load, when already complete) the statistics of `source`.
///
/// Uses the imputed unpadded stores of every year up to the configured last
/// year.
pub fn compute_summary_stats(
    config: &PipelineConfig,
    source: DataSource,
    table: &ChipletTable,
    log_transform: bool,
) -> ChipletResult<SummaryStats> {
    if !source.is_continuous() {
        return Err(ChipletError::InvalidFormat(format!(
            "Statistics are only computed for continuous sources, not {}",
            source
        )));
    }
    if table.pad_size_pix() != 0 {
        return Err(ChipletError::Consistency(format!(
            "Statistics use unpadded stores; table has padding {}",
            table.pad_size_pix()
        )));
    }

    let layout = OutputLayout::new(&config.base_output_dir);
    let output = layout.stats_path(source, table.roi(), log_transform);
    if completion::is_complete(&output) {
        log::info!("Statistics {} already complete; loading", output.display());
        return load_summary_stats(config, source, table.roi(), log_transform);
    }

    let years: Vec<i32> = completed_years(&layout, source, table.roi(), 0, true)?
        .into_iter()
        .filter(|&year| config.stats_last_year.map_or(true, |last| year <= last))
        .collect();
    if years.is_empty() {
        return Err(ChipletError::NoTiles(format!(
            "no completed imputed {} stores for {}",
            source,
            table.roi()
        )));
    }

    let mut tracker = StatTracker::new();
    for &year in &years {
        let year_stats = match source.dtype() {
            Dtype::F16 => year_tracker::<f16>(&layout, table, source, year, config.base_size_pix, log_transform)?,
            Dtype::F32 => year_tracker::<f32>(&layout, table, source, year, config.base_size_pix, log_transform)?,
            Dtype::U8 => year_tracker::<u8>(&layout, table, source, year, config.base_size_pix, log_transform)?,
        };
        tracker.merge(&year_stats);
    }

    let stats = SummaryStats::from_tracker(source, years, &tracker, log_transform)?;

    completion::clear(&output)?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&output, serde_json::to_string_pretty(&stats)?)?;
    completion::mark_complete(&output, None, &[], config.protect)?;

    log::info!(
        "{} statistics over {} years: mean {:.4}, sd {:.4}, range [{}, {}]",
        source,
        stats.years.len(),
        stats.mean,
        stats.sd,
        stats.min_val,
        stats.max_val
    );
    Ok(stats)
}

/// Read previously computed statistics
pub fn load_summary_stats(
    config: &PipelineConfig,
    source: DataSource,
    roi: crate::types::RoiName,
    log_transform: bool,
) -> ChipletResult<SummaryStats> {
    let path = OutputLayout::new(&config.base_output_dir).stats_path(source, roi, log_transform);
    if !completion::is_complete(&path) {
        return Err(ChipletError::Consistency(format!(
            "Statistics {} are missing or incomplete",
            path.display()
        )));
    }
    let stats: SummaryStats = serde_json::from_str(&fs::read_to_string(&path)?)?;
    if stats.source_name != source {
        return Err(ChipletError::Consistency(format!(
            "Statistics {} are for {}, not {}",
            path.display(),
            stats.source_name,
            source
        )));
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_pass(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (mean, var)
    }

    #[test]
    fn test_streaming_matches_two_pass() {
        let values: Vec<f64> = (0..10_000).map(|i| 1e4 + ((i * 7919) % 1000) as f64 * 0.37).collect();
        let mut tracker = StatTracker::new();
        tracker.add_all(values.iter().copied());

        let (mean, var) = two_pass(&values);
        assert_relative_eq!(tracker.mean().unwrap(), mean, max_relative = 1e-6);
        assert_relative_eq!(tracker.variance().unwrap(), var, max_relative = 1e-6);
        assert_eq!(tracker.min().unwrap(), 1e4);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let chunks: Vec<Vec<f64>> = vec![vec![1.0, 2.0, 3.0], vec![10.0], vec![-4.0, 0.5], Vec::new()];
        let tracker_of = |values: &[f64]| {
            let mut t = StatTracker::new();
            t.add_all(values.iter().copied());
            t
        };

        let mut forward = StatTracker::new();
        chunks.iter().for_each(|c| forward.merge(&tracker_of(c)));
        let mut backward = StatTracker::new();
        chunks.iter().rev().for_each(|c| backward.merge(&tracker_of(c)));
        let whole = tracker_of(&chunks.concat());

        for t in [forward, backward] {
            assert_eq!(t.count(), whole.count());
            assert_relative_eq!(t.mean().unwrap(), whole.mean().unwrap(), max_relative = 1e-12);
            assert_relative_eq!(t.variance().unwrap(), whole.variance().unwrap(), max_relative = 1e-12);
            assert_eq!((t.min(), t.max()), (Some(-4.0), Some(10.0)));
        }
    }

    #[test]
    fn test_empty_tracker_has_no_stats() {
        let tracker = StatTracker::new();
        assert!(tracker.mean().is_none());
        assert!(SummaryStats::from_tracker(DataSource::Rain, vec![], &tracker, false).is_err());
    }
}
