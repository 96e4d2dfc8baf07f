//! On-disk layout of generated outputs.
//!
//! Every chiplet store filename encodes its source, year, ROI and padding, so a
//! directory listing alone is enough to recover which years are available.

use crate::types::{ChipletError, ChipletResult, DataSource, RoiName};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const STORE_EXTENSION: &str = "bin";

/// Identity of a chiplet store, recovered from its filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipletFileInfo {
    pub path: PathBuf,
    pub source: DataSource,
    pub year: i32,
    pub roi: RoiName,
    pub pad_size_pix: usize,
}

/// Directory layout rooted at the pipeline's base output directory
#[derive(Debug, Clone)]
pub struct OutputLayout {
    base: PathBuf,
}

impl OutputLayout {
    pub fn new<P: AsRef<Path>>(base_output_dir: P) -> Self {
        Self {
            base: base_output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Prepared ROI polygon
    pub fn roi_path(&self, roi: RoiName) -> PathBuf {
        self.base
            .join("roi")
            .join(format!("ecofuture_roi_shape_{}.json", roi))
    }

    /// Chiplet table for one (ROI, padding) pair
    pub fn table_path(&self, roi: RoiName, pad_size_pix: usize) -> PathBuf {
        self.base
            .join("chiplet_table")
            .join(format!("chiplet_table_roi_{}_pad_{}.csv", roi, pad_size_pix))
    }

    /// Directory holding the raw chips of a source, one subdirectory per year
    pub fn chips_dir(&self, source: DataSource) -> PathBuf {
        self.base.join("chips").join(source.as_str())
    }

    /// Directory holding every year's store for (source, ROI, padding)
    pub fn chiplet_dir(&self, source: DataSource, roi: RoiName, pad_size_pix: usize, denan: bool) -> PathBuf {
        let root = if denan { "chiplets-denan" } else { "chiplets" };
        self.base
            .join(root)
            .join(format!("roi_{}", roi))
            .join(format!("pad_{}", pad_size_pix))
            .join(source.as_str())
    }

    pub fn chiplet_path(
        &self,
        source: DataSource,
        year: i32,
        roi: RoiName,
        pad_size_pix: usize,
        denan: bool,
    ) -> PathBuf {
        self.chiplet_dir(source, roi, pad_size_pix, denan).join(format!(
            "chiplets_{}_{}_roi_{}_pad_{}.{}",
            source, year, roi, pad_size_pix, STORE_EXTENSION
        ))
    }

    /// Summary statistics artifact for a source
    pub fn stats_path(&self, source: DataSource, roi: RoiName, log_transform: bool) -> PathBuf {
        let suffix = if log_transform { "_log" } else { "" };
        self.base
            .join("summary_stats")
            .join(format!("roi_{}", roi))
            .join(format!("summary_stats_{}_roi_{}{}.json", source, roi, suffix))
    }

    /// GeoTIFF export of one grid cell of one year
    pub fn geotiff_path(&self, source: DataSource, year: i32, roi: RoiName, chip_x: i64, chip_y: i64) -> PathBuf {
        self.base
            .join("chiplets_geotiff")
            .join(format!("roi_{}", roi))
            .join(source.as_str())
            .join(year.to_string())
            .join(format!(
                "chiplets_{}_{}_roi_{}_x{}y{}.tif",
                source, year, roi, chip_x, chip_y
            ))
    }

    /// Years with a store on disk for (source, ROI, padding), ascending
    pub fn available_years(
        &self,
        source: DataSource,
        roi: RoiName,
        pad_size_pix: usize,
        denan: bool,
    ) -> ChipletResult<Vec<i32>> {
        let dir = self.chiplet_dir(source, roi, pad_size_pix, denan);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut years = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            let info = parse_chiplet_filename(&path)?;
            if info.source == source && info.roi == roi && info.pad_size_pix == pad_size_pix {
                years.push(info.year);
            }
        }
        years.sort_unstable();
        Ok(years)
    }
}

const CHIPLET_FILENAME_PATTERN: &str =
    r"^chiplets_(?P<source>[a-z_]+)_(?P<year>-?\d+)_roi_(?P<roi>[a-z]+)_pad_(?P<pad>\d+)\.bin$";

/// Recover (source, year, ROI, padding) from a store path
pub fn parse_chiplet_filename(path: &Path) -> ChipletResult<ChipletFileInfo> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ChipletError::InvalidFormat(format!("Bad chiplet path: {}", path.display())))?;

    let pattern = Regex::new(CHIPLET_FILENAME_PATTERN)
        .map_err(|e| ChipletError::InvalidFormat(format!("Bad filename pattern: {}", e)))?;
    let caps = pattern
        .captures(filename)
        .ok_or_else(|| ChipletError::InvalidFormat(format!("Unexpected chiplet filename: {}", filename)))?;

    let year = caps["year"]
        .parse()
        .map_err(|_| ChipletError::InvalidFormat(format!("Bad year in {}", filename)))?;
    let pad_size_pix = caps["pad"]
        .parse()
        .map_err(|_| ChipletError::InvalidFormat(format!("Bad padding in {}", filename)))?;

    Ok(ChipletFileInfo {
        path: path.to_path_buf(),
        source: caps["source"].parse()?,
        year,
        roi: caps["roi"].parse()?,
        pad_size_pix,
    })
}

/// Parse a number that must be integral ("5", "5.", "-5"), rejecting "5.5"
pub fn num_str_to_int(num_str: &str) -> ChipletResult<i64> {
    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| ChipletError::InvalidFormat(format!("{} is not a number", num_str)))?;
    if !num.is_finite() || num.fract() != 0.0 {
        return Err(ChipletError::InvalidFormat(format!("{} is not an integer", num_str)));
    }
    Ok(num as i64)
}

/// Year subdirectories of `path`, ascending.
///
/// Non-directory entries and directories that are not years are errors unless
/// `error_if_other_files` is false, in which case they are ignored.
pub fn years_in_path(path: &Path, error_if_no_years: bool, error_if_other_files: bool) -> ChipletResult<Vec<i32>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();

    let mut years = Vec::new();
    for entry in entries {
        if !entry.is_dir() {
            if error_if_other_files {
                return Err(ChipletError::InvalidFormat(format!(
                    "Found unexpected non-year path at {}",
                    entry.display()
                )));
            }
            continue;
        }
        let name = entry.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        match num_str_to_int(name) {
            Ok(year) => years.push(year as i32),
            Err(err) if error_if_other_files => return Err(err),
            Err(_) => {}
        }
    }

    if years.is_empty() && error_if_no_years {
        return Err(ChipletError::NoTiles(format!(
            "No year directories found in {}",
            path.display()
        )));
    }

    Ok(years)
}

/// Chip files per year under `<chips_dir>/<year>/*.tif`, each list sorted
pub fn chip_paths_by_year(chips_dir: &Path) -> ChipletResult<BTreeMap<i32, Vec<PathBuf>>> {
    let mut by_year = BTreeMap::new();
    for year in years_in_path(chips_dir, true, false)? {
        let year_dir = chips_dir.join(year.to_string());
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&year_dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("tif") | Some("tiff")))
            .collect();
        paths.sort();
        by_year.insert(year, paths);
    }
    Ok(by_year)
}
