//! I/O modules for raster tiles, memory-mapped chiplet stores and output layout

pub mod completion;
pub mod paths;
pub mod raster;
pub mod store_array;

#[cfg(feature = "gdal")]
pub mod gdal_io;

pub use paths::{OutputLayout, ChipletFileInfo, parse_chiplet_filename};
pub use raster::{RasterTileProvider, MemoryTileProvider};
pub use store_array::{ChipletArrayReader, ChipletArrayWriter, StoreElement, StoreShape};

#[cfg(feature = "gdal")]
pub use gdal_io::GdalTileProvider;
