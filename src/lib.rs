//! ecochiplets: fixed-size, georeferenced chiplets from tiled environmental rasters
//!
//! Large raster tiles covering a region of interest are carved into a dense,
//! indexed grid of chiplets. The chiplet table records the geometry of every
//! chiplet; stores hold the pixel data of one (source, year, ROI, padding)
//! combination as a memory-mapped array indexed by table row.

pub mod config;
pub mod core;
pub mod io;
pub mod progress;
pub mod types;

// Re-export main types and functions for easier access
pub use config::PipelineConfig;
pub use types::{
    AffineTransform, BoundingBox, ChipletError, ChipletResult, DataSource, Dtype, GridRef, Raster, Resampling,
    RoiName,
};

pub use core::{
    build_chiplet_stores, compute_summary_stats, form_chiplet_table, pad_chiplets, run_denan, ChipletRecord,
    ChipletTable, Packet, RegionOfInterest, TableParams,
};
pub use io::{ChipletArrayReader, MemoryTileProvider, OutputLayout, RasterTileProvider};

#[cfg(feature = "gdal")]
pub use io::GdalTileProvider;
