use ecochiplets::config::PipelineConfig;
use ecochiplets::core::chiplet_store::{build_chiplet_stores, completed_years, load_chiplets};
use ecochiplets::core::chiplet_table::{form_chiplet_table, ChipletTable, TableParams};
use ecochiplets::core::chiplets::{chiplet_to_raster, grid_cell_raster};
use ecochiplets::core::relabel::{LandUseRelabeller, RelabelLut};
use ecochiplets::core::roi::RegionOfInterest;
use ecochiplets::io::completion;
use ecochiplets::io::paths::parse_chiplet_filename;
use ecochiplets::io::{MemoryTileProvider, OutputLayout};
use ecochiplets::types::{AffineTransform, ChipletError, DataSource, Raster, RoiName, GRID_CELL_SIZE};
use geo::polygon;
use half::f16;
use ndarray::Array3;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CHIP_SIZE: usize = 40;
const PIXEL: f64 = GRID_CELL_SIZE / CHIP_SIZE as f64;
/// Top edge of the two-by-two block of chips
const TOP: f64 = 2.0 * GRID_CELL_SIZE;

/// Value of the global pixel (row, col) of the chip block; exact in f16
fn pixel_value(row: usize, col: usize, year: i32) -> f32 {
    ((col + 3 * row) % 512) as f32 + (year - 2000) as f32
}

/// Nodata value declared by the tiles of the nodata tests
const TILE_NODATA: f32 = -9999.0;

/// Global pixel (row, col) of the chip block under a map coordinate
fn pixel_at(x: f64, y: f64) -> (usize, usize) {
    (((TOP - y) / PIXEL).floor() as usize, (x / PIXEL).floor() as usize)
}

/// Value expected at a map coordinate
fn value_at(x: f64, y: f64, year: i32) -> f32 {
    let (row, col) = pixel_at(x, y);
    pixel_value(row, col, year)
}

fn add_year(provider: &mut MemoryTileProvider, year: i32, value: impl Fn(usize, usize) -> f32) -> Vec<PathBuf> {
    add_year_with_nodata(provider, year, None, value)
}

fn add_year_with_nodata(
    provider: &mut MemoryTileProvider,
    year: i32,
    nodata: Option<f32>,
    value: impl Fn(usize, usize) -> f32,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for gx in 0..2usize {
        for gy in 0..2usize {
            let name = format!("{}/x{}y{}.tif", year, gx, gy);
            let transform = AffineTransform::north_up(
                gx as f64 * GRID_CELL_SIZE,
                (gy + 1) as f64 * GRID_CELL_SIZE,
                PIXEL,
                PIXEL,
            );
            let row_off = (1 - gy) * CHIP_SIZE;
            let col_off = gx * CHIP_SIZE;
            let data = Array3::from_shape_fn((1, CHIP_SIZE, CHIP_SIZE), |(_, r, c)| value(row_off + r, col_off + c));
            provider.insert(name.as_str(), Raster::new(data, transform, nodata));
            paths.push(PathBuf::from(name));
        }
    }
    paths
}

fn table(provider: &MemoryTileProvider, paths: &[PathBuf]) -> ChipletTable {
    let roi = RegionOfInterest::from_polygon(
        RoiName::Australia,
        polygon![(x: 10_000.0, y: 10_000.0), (x: 190_000.0, y: 10_000.0), (x: 100_000.0, y: 190_000.0)],
    );
    let params = TableParams {
        base_size_pix: 8,
        pad_size_pix: 0,
        n_subsets: 5,
    };
    form_chiplet_table(provider, paths, &roi, &params).unwrap()
}

fn config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::with_base_dir(dir);
    config.base_size_pix = 8;
    config.cores = 2;
    config.protect = false;
    config.show_progress = false;
    config.tile_cache_size = 2;
    config
}

#[test]
fn test_stored_chiplets_match_source_pixels() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut provider = MemoryTileProvider::new();
    let mut chips = BTreeMap::new();
    for year in [2001, 2002] {
        chips.insert(year, add_year(&mut provider, year, |r, c| pixel_value(r, c, year)));
    }
    let table = table(&provider, &chips[&2001]);
    let config = config(dir.path());

    let summary = build_chiplet_stores(&config, DataSource::Elevation, &table, &provider, &chips, None).unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.written, vec![2001, 2002]);

    let layout = OutputLayout::new(dir.path());
    for year in [2001, 2002] {
        let reader = load_chiplets::<f16>(&layout, &table, DataSource::Elevation, year, 8, false).unwrap();
        for record in table.records() {
            let chiplet = reader.chiplet(record.index).unwrap().mapv(|v| v.to_f32());
            let raster = chiplet_to_raster(chiplet.view(), record, 8, 0, None).unwrap();
            for r in 0..8 {
                for c in 0..8 {
                    let (x, y) = raster.transform.apply(c as f64 + 0.5, r as f64 + 0.5);
                    assert_eq!(raster.data[[0, r, c]], value_at(x, y, year), "row {} pixel ({}, {})", record.index, r, c);
                }
            }
        }
    }
}

#[test]
fn test_rebuild_is_skipped_without_touching_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = MemoryTileProvider::new();
    let chips = BTreeMap::from([(2001, add_year(&mut provider, 2001, |r, c| pixel_value(r, c, 2001)))]);
    let table = table(&provider, &chips[&2001]);
    let config = config(dir.path());

    build_chiplet_stores(&config, DataSource::Rain, &table, &provider, &chips, None)
        .unwrap()
        .into_result()
        .unwrap();
    let path = OutputLayout::new(dir.path()).chiplet_path(DataSource::Rain, 2001, RoiName::Australia, 0, false);
    let bytes = std::fs::read(&path).unwrap();
    let marker = std::fs::read(completion::marker_path(&path)).unwrap();
    let reads = provider.read_count();

    let again = build_chiplet_stores(&config, DataSource::Rain, &table, &provider, &chips, None).unwrap();
    assert_eq!(again.skipped, vec![2001]);
    assert!(again.written.is_empty());
    assert_eq!(provider.read_count(), reads);
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
    assert_eq!(std::fs::read(completion::marker_path(&path)).unwrap(), marker);
}

#[test]
fn test_relabel_failure_leaves_no_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = MemoryTileProvider::new();
    let mut chips = BTreeMap::new();
    chips.insert(2001, add_year(&mut provider, 2001, |_, _| 1.0));
    // code 3 has no entry in the lookup table
    chips.insert(2002, add_year(&mut provider, 2002, |r, c| if (r, c) == (45, 45) { 3.0 } else { 1.0 }));
    let table = table(&provider, &chips[&2001]);
    let config = config(dir.path());

    let mut lut = RelabelLut::new(8);
    lut.set(1, 5).unwrap();
    let relabeller = LandUseRelabeller::new(lut);

    let summary =
        build_chiplet_stores(&config, DataSource::LandUse, &table, &provider, &chips, Some(&relabeller)).unwrap();
    assert_eq!(summary.written, vec![2001]);
    assert_eq!(summary.failed.len(), 1);
    assert!(matches!(summary.failed[0], (2002, ChipletError::Relabel { year: 2002, .. })));

    let layout = OutputLayout::new(dir.path());
    let failed = layout.chiplet_path(DataSource::LandUse, 2002, RoiName::Australia, 0, false);
    assert!(!failed.exists());
    assert!(!completion::marker_path(&failed).exists());
    assert_eq!(
        completed_years(&layout, DataSource::LandUse, RoiName::Australia, 0, false).unwrap(),
        vec![2001]
    );

    let reader = load_chiplets::<u8>(&layout, &table, DataSource::LandUse, 2001, 8, false).unwrap();
    assert!(reader.data().iter().all(|&v| v == 5));
}

#[test]
fn test_grid_cell_reassembles_chip() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = MemoryTileProvider::new();
    let chips = BTreeMap::from([(2001, add_year(&mut provider, 2001, |r, c| pixel_value(r, c, 2001)))]);
    let table = table(&provider, &chips[&2001]);
    let config = config(dir.path());
    build_chiplet_stores(&config, DataSource::Tmax, &table, &provider, &chips, None)
        .unwrap()
        .into_result()
        .unwrap();

    let layout = OutputLayout::new(dir.path());
    let reader = load_chiplets::<f16>(&layout, &table, DataSource::Tmax, 2001, 8, false).unwrap();
    let grid_ref = table.grid_refs()[0];
    let raster = grid_cell_raster(&reader, &table, grid_ref, 8, 0, f32::NAN).unwrap();

    let n_rows = table.rows_for(grid_ref).len();
    let n_valid = raster.data.iter().filter(|v| !v.is_nan()).count();
    assert_eq!(n_valid, n_rows * 64);
    for ((_, r, c), &value) in raster.data.indexed_iter() {
        if !value.is_nan() {
            let (x, y) = raster.transform.apply(c as f64 + 0.5, r as f64 + 0.5);
            assert_eq!(value, value_at(x, y, 2001));
        }
    }
}

#[test]
fn test_store_filenames_round_trip() {
    let layout = OutputLayout::new("/data");
    for source in DataSource::ALL {
        for roi in RoiName::ALL {
            for pad in [0, 32] {
                for year in [1988, 2023] {
                    for denan in [false, true] {
                        let path = layout.chiplet_path(source, year, roi, pad, denan);
                        let info = parse_chiplet_filename(&path).unwrap();
                        assert_eq!((info.source, info.year, info.roi, info.pad_size_pix), (source, year, roi, pad));
                    }
                }
            }
        }
    }
}

/// Whether the global pixel (row, col) carries the tile nodata value
fn is_hole(row: usize, col: usize) -> bool {
    (row + 2 * col) % 7 == 0
}

#[test]
fn test_tile_nodata_stored_as_fill() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = MemoryTileProvider::new();
    let paths = add_year_with_nodata(&mut provider, 2001, Some(TILE_NODATA), |r, c| {
        if is_hole(r, c) {
            TILE_NODATA
        } else {
            pixel_value(r, c, 2001)
        }
    });
    let table = table(&provider, &paths);
    let chips = BTreeMap::from([(2001, paths)]);
    let config = config(dir.path());

    build_chiplet_stores(&config, DataSource::Rain, &table, &provider, &chips, None)
        .unwrap()
        .into_result()
        .unwrap();

    let layout = OutputLayout::new(dir.path());
    let reader = load_chiplets::<f16>(&layout, &table, DataSource::Rain, 2001, 8, false).unwrap();
    let mut holes = 0;
    for record in table.records() {
        let chiplet = reader.chiplet(record.index).unwrap().mapv(|v| v.to_f32());
        let raster = chiplet_to_raster(chiplet.view(), record, 8, 0, None).unwrap();
        for ((_, r, c), &value) in raster.data.indexed_iter() {
            let (x, y) = raster.transform.apply(c as f64 + 0.5, r as f64 + 0.5);
            let (row, col) = pixel_at(x, y);
            if is_hole(row, col) {
                assert!(value.is_nan(), "row {} pixel ({}, {}) kept {}", record.index, r, c, value);
                holes += 1;
            } else {
                assert_eq!(value, pixel_value(row, col, 2001));
            }
        }
    }
    assert!(holes > 0);
}

#[test]
fn test_overlapping_nodata_tile_keeps_underlying_values() {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = MemoryTileProvider::new();
    let paths = add_year(&mut provider, 2001, |r, c| pixel_value(r, c, 2001));
    let table = table(&provider, &paths);

    // a later tile over grid cell (0, 0), valid only on its first row
    let mut overlay = Array3::from_elem((1, CHIP_SIZE, CHIP_SIZE), TILE_NODATA);
    overlay.slice_mut(ndarray::s![.., 0, ..]).fill(1000.0);
    provider.insert(
        "2001/overlay.tif",
        Raster::new(
            overlay,
            AffineTransform::north_up(0.0, GRID_CELL_SIZE, PIXEL, PIXEL),
            Some(TILE_NODATA),
        ),
    );
    let mut year_paths = paths.clone();
    year_paths.push(PathBuf::from("2001/overlay.tif"));
    let chips = BTreeMap::from([(2001, year_paths)]);
    let config = config(dir.path());

    build_chiplet_stores(&config, DataSource::Elevation, &table, &provider, &chips, None)
        .unwrap()
        .into_result()
        .unwrap();

    let layout = OutputLayout::new(dir.path());
    let reader = load_chiplets::<f16>(&layout, &table, DataSource::Elevation, 2001, 8, false).unwrap();
    let mut overlaid = 0;
    for record in table.records() {
        let chiplet = reader.chiplet(record.index).unwrap().mapv(|v| v.to_f32());
        let raster = chiplet_to_raster(chiplet.view(), record, 8, 0, None).unwrap();
        for ((_, r, c), &value) in raster.data.indexed_iter() {
            let (x, y) = raster.transform.apply(c as f64 + 0.5, r as f64 + 0.5);
            let (row, col) = pixel_at(x, y);
            // the overlay's first row is global row CHIP_SIZE, columns 0..CHIP_SIZE
            if row == CHIP_SIZE && col < CHIP_SIZE {
                assert_eq!(value, 1000.0);
                overlaid += 1;
            } else {
                assert_eq!(value, pixel_value(row, col, 2001), "row {} pixel ({}, {})", record.index, r, c);
            }
        }
    }
    assert!(overlaid > 0);
}
