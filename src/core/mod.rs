//! Chiplet indexing, extraction and post-processing

pub mod chiplet_store;
pub mod chiplet_table;
pub mod chiplets;
pub mod crs;
pub mod denan;
pub mod grid;
pub mod pad_chiplets;
pub mod packet;
pub mod relabel;
pub mod resample;
pub mod roi;
pub mod summary_stats;

#[cfg(feature = "gdal")]
pub mod export;

// Re-export main types
pub use chiplet_store::{
    build_chiplet_stores, completed_years, load_chiplets, open_store, BuildSummary, StoreBuilder, YearOutcome,
};
pub use chiplet_table::{form_chiplet_table, get_bbox, table_seed, ChipletRecord, ChipletTable, TableParams};
pub use chiplets::{chiplet_coords, chiplet_to_raster, get_chiplet_from_packet, grid_cell_raster, TransformCache};
pub use crs::CrsTransformer;
pub use denan::{denan_year, run_denan};
pub use pad_chiplets::{pad_chiplets, pad_chiplets_year};
pub use packet::{form_packet, Packet, ProviderTiles, TileSource};
pub use relabel::{LandCoverRelabeller, LandUseRelabeller, PatchContext, RelabelLut, Relabeller};
pub use resample::{GridResampler, Reprojector};
pub use roi::RegionOfInterest;
pub use summary_stats::{compute_summary_stats, load_summary_stats, StatTracker, SummaryStats};

#[cfg(feature = "gdal")]
pub use export::export_year_geotiffs;
