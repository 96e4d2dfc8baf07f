//! Packets: lazily merged mosaics of many tiles.
//!
//! A packet indexes the footprint of every tile in an R-tree and only reads a
//! tile's pixels when an extraction touches it. Loaded tiles are kept in a
//! small LRU cache, so memory is bounded by the cache size rather than by the
//! number of tiles.
//!
//! All tiles share one north-up pixel grid. A tile's nodata pixels are
//! masked; where valid pixels of several tiles overlap, the tile that comes
//! last in input order wins. Pixels inside the packet extent without a valid
//! value take the packet's fill value.
//!
//! When the source asks for a new resolution, the merged mosaic is resampled
//! onto one grid anchored at the packet extent. Extraction resamples only the
//! window it needs, plus a one pixel margin for interpolation kernels.

use crate::core::chiplet_table::ChipletTable;
use crate::core::resample::{grid_for_resolution, is_missing, Reprojector};
use crate::io::raster::RasterTileProvider;
use crate::io::store_array::{ChipletArrayReader, StoreElement};
use crate::types::{
    AffineTransform, BoundingBox, ChipletError, ChipletResult, GridSpec, Raster, Resampling, TileHeader,
};
use lru::LruCache;
use ndarray::{s, Array3};
use rstar::{RTree, RTreeObject, AABB};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Relative tolerance when comparing pixel sizes and grid offsets
const GRID_TOLERANCE: f64 = 1e-6;

/// An ordered collection of tiles a packet can be formed from
pub trait TileSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Georeferencing of tile `index` as it will be delivered by `load`
    fn header(&self, index: usize) -> ChipletResult<TileHeader>;

    /// Reprojector, resolution and policy for the merged mosaic, if any
    fn resampling(&self) -> Option<(&dyn Reprojector, f64, Resampling)> {
        None
    }

    /// Pixels of tile `index`
    fn load(&self, index: usize) -> ChipletResult<Raster>;

    /// Human readable name of tile `index`, for errors and logs
    fn describe(&self, index: usize) -> String;
}

/// Tiles read from paths through a raster provider
pub struct ProviderTiles<'a> {
    provider: &'a dyn RasterTileProvider,
    paths: Vec<PathBuf>,
    resample: Option<(&'a dyn Reprojector, f64, Resampling)>,
}

impl<'a> ProviderTiles<'a> {
    pub fn new(provider: &'a dyn RasterTileProvider, paths: Vec<PathBuf>) -> Self {
        Self {
            provider,
            paths,
            resample: None,
        }
    }

    /// Resample the merged tiles onto `resolution` pixels
    pub fn with_resampling(mut self, reprojector: &'a dyn Reprojector, resolution: f64, resampling: Resampling) -> Self {
        self.resample = Some((reprojector, resolution, resampling));
        self
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn path(&self, index: usize) -> ChipletResult<&Path> {
        self.paths
            .get(index)
            .map(PathBuf::as_path)
            .ok_or_else(|| ChipletError::Consistency(format!("Tile {} out of range", index)))
    }
}

impl TileSource for ProviderTiles<'_> {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn header(&self, index: usize) -> ChipletResult<TileHeader> {
        self.provider.read_header(self.path(index)?)
    }

    fn resampling(&self) -> Option<(&dyn Reprojector, f64, Resampling)> {
        self.resample
    }

    fn load(&self, index: usize) -> ChipletResult<Raster> {
        self.provider.read(self.path(index)?)
    }

    fn describe(&self, index: usize) -> String {
        self.paths
            .get(index)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("tile {}", index))
    }
}

/// Chiplets of a stored array, each placed back at its position in its chip.
///
/// Padding is cropped, so only the unpadded centre of each chiplet is used.
pub struct ChipletTiles<'a, T: StoreElement> {
    reader: &'a ChipletArrayReader<T>,
    table: &'a ChipletTable,
    rows: Vec<usize>,
    base_size_pix: usize,
    band: usize,
    nodata: f32,
}

impl<'a, T: StoreElement> ChipletTiles<'a, T> {
    pub fn new(
        reader: &'a ChipletArrayReader<T>,
        table: &'a ChipletTable,
        base_size_pix: usize,
        band: usize,
        nodata: f32,
    ) -> ChipletResult<Self> {
        let expected = table.array_shape(base_size_pix, reader.shape().n_extra);
        if reader.shape() != expected {
            return Err(ChipletError::Consistency(format!(
                "Store {} has shape {:?} but its table implies {:?}",
                reader.path().display(),
                reader.shape().dims(),
                expected.dims()
            )));
        }
        Ok(Self {
            reader,
            table,
            rows: (0..table.len()).collect(),
            base_size_pix,
            band,
            nodata,
        })
    }

    /// Restrict the tiles to the given table rows, keeping their order
    pub fn for_rows(mut self, rows: Vec<usize>) -> Self {
        self.rows = rows;
        self
    }

    fn row(&self, index: usize) -> ChipletResult<usize> {
        self.rows
            .get(index)
            .copied()
            .ok_or_else(|| ChipletError::Consistency(format!("Tile {} out of range", index)))
    }
}

impl<T: StoreElement> TileSource for ChipletTiles<'_, T> {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn header(&self, index: usize) -> ChipletResult<TileHeader> {
        let row = self.row(index)?;
        let record = self
            .table
            .get(row)
            .ok_or_else(|| ChipletError::Consistency(format!("No table row {}", row)))?;
        Ok(TileHeader {
            transform: record
                .transform
                .translated(record.chip_i_x_base as f64, record.chip_i_y_base as f64),
            width: self.base_size_pix,
            height: self.base_size_pix,
            bands: 1,
            nodata: Some(self.nodata),
        })
    }

    fn load(&self, index: usize) -> ChipletResult<Raster> {
        let header = self.header(index)?;
        let pad = self.table.pad_size_pix();
        let band = self.reader.band(self.row(index)?, self.band)?;
        let centre = band.slice(s![pad..pad + self.base_size_pix, pad..pad + self.base_size_pix]);
        let data = centre.mapv(|v| v.to_f32()).insert_axis(ndarray::Axis(0));
        Ok(Raster::new(data, header.transform, Some(self.nodata)))
    }

    fn describe(&self, index: usize) -> String {
        match self.row(index) {
            Ok(row) => format!("{} row {}", self.reader.path().display(), row),
            Err(_) => format!("tile {}", index),
        }
    }
}

/// Footprint of one tile in packet pixel space
#[derive(Debug, Clone, Copy)]
struct TileFootprint {
    order: usize,
    col_off: i64,
    row_off: i64,
    width: usize,
    height: usize,
    nodata: Option<f32>,
}

impl RTreeObject for TileFootprint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.col_off as f64, self.row_off as f64],
            [
                (self.col_off + self.width as i64) as f64,
                (self.row_off + self.height as i64) as f64,
            ],
        )
    }
}

fn offset_in_pixels(delta: f64, pixel: f64, what: &str, tile: &str) -> ChipletResult<i64> {
    let offset = delta / pixel;
    let rounded = offset.round();
    if (offset - rounded).abs() > GRID_TOLERANCE * offset.abs().max(1.0) {
        return Err(ChipletError::Consistency(format!(
            "Tile {} is not aligned to the packet grid ({} offset {} pixels)",
            tile, what, offset
        )));
    }
    Ok(rounded as i64)
}

/// A north-up pixel grid and its inverse
#[derive(Debug, Clone, Copy)]
struct PacketGrid {
    transform: AffineTransform,
    inverse: AffineTransform,
    width: usize,
    height: usize,
}

impl PacketGrid {
    fn new(transform: AffineTransform, width: usize, height: usize) -> ChipletResult<Self> {
        Ok(Self {
            transform,
            inverse: transform.inverse()?,
            width,
            height,
        })
    }

    fn extent(&self) -> BoundingBox {
        self.transform.bounds(self.width, self.height)
    }

    fn pixel_index(&self, x: f64, y: f64) -> ChipletResult<(i64, i64)> {
        let (col, row) = self.inverse.apply(x, y);
        let (col, row) = (col.floor(), row.floor());
        if !(col >= 0.0 && row >= 0.0 && col < self.width as f64 && row < self.height as f64) {
            return Err(ChipletError::OutOfExtent {
                x,
                y,
                extent: self.extent(),
            });
        }
        Ok((col as i64, row as i64))
    }
}

fn span(indices: &[i64]) -> Option<(i64, i64)> {
    Some((*indices.iter().min()?, *indices.iter().max()?))
}

/// A seamless virtual raster over many tiles
pub struct Packet<S: TileSource> {
    source: S,
    footprints: Vec<TileFootprint>,
    tree: RTree<TileFootprint>,
    cache: LruCache<usize, Arc<Array3<f32>>>,
    /// grid of the tiles
    native: PacketGrid,
    /// grid values are delivered on; the native grid unless resampling
    output: PacketGrid,
    bands: usize,
    fill: f32,
    tiles_loaded: usize,
}

impl<S: TileSource> Packet<S> {
    /// Index the tiles of `source`; no pixels are read yet
    pub fn new(source: S, fill: f32, cache_size: usize) -> ChipletResult<Self> {
        if source.is_empty() {
            return Err(ChipletError::NoTiles("cannot form a packet from zero tiles".to_string()));
        }

        let headers = (0..source.len())
            .map(|i| source.header(i))
            .collect::<ChipletResult<Vec<_>>>()?;

        let first = headers[0];
        let (pixel_w, pixel_h) = (first.transform.a, first.transform.e);
        if !(pixel_w > 0.0 && pixel_h < 0.0) {
            return Err(ChipletError::Consistency(format!(
                "Tile {} is not north-up (pixel size {} x {})",
                source.describe(0),
                pixel_w,
                pixel_h
            )));
        }

        let mut extent = first.bounds();
        for (i, header) in headers.iter().enumerate() {
            let t = &header.transform;
            let same_size = (t.a - pixel_w).abs() <= GRID_TOLERANCE * pixel_w.abs()
                && (t.e - pixel_h).abs() <= GRID_TOLERANCE * pixel_h.abs();
            if !t.is_rectilinear() || !same_size {
                return Err(ChipletError::Consistency(format!(
                    "Tile {} has transform {:?}, incompatible with pixel size {} x {}",
                    source.describe(i),
                    t,
                    pixel_w,
                    pixel_h
                )));
            }
            if header.bands != first.bands {
                return Err(ChipletError::Consistency(format!(
                    "Tile {} has {} bands, expected {}",
                    source.describe(i),
                    header.bands,
                    first.bands
                )));
            }
            extent = extent.union(&header.bounds());
        }

        let native = PacketGrid::new(
            AffineTransform::north_up(extent.left, extent.top, pixel_w, -pixel_h),
            (extent.width() / pixel_w).round() as usize,
            (extent.height() / -pixel_h).round() as usize,
        )?;
        let output = match source.resampling().map(|(_, resolution, _)| resolution) {
            None => native,
            Some(resolution) => {
                let grid = grid_for_resolution(&native.extent(), resolution)?;
                PacketGrid::new(grid.transform, grid.width, grid.height)?
            }
        };

        let footprints = headers
            .iter()
            .enumerate()
            .map(|(order, header)| {
                let name = source.describe(order);
                Ok(TileFootprint {
                    order,
                    col_off: offset_in_pixels(header.transform.c - extent.left, pixel_w, "column", &name)?,
                    row_off: offset_in_pixels(header.transform.f - extent.top, pixel_h, "row", &name)?,
                    width: header.width,
                    height: header.height,
                    nodata: header.nodata,
                })
            })
            .collect::<ChipletResult<Vec<_>>>()?;

        log::debug!(
            "Formed packet of {} tiles: {}x{} pixels ({}x{} before resampling), extent {:?}",
            footprints.len(),
            output.width,
            output.height,
            native.width,
            native.height,
            extent
        );

        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            source,
            tree: RTree::bulk_load(footprints.clone()),
            footprints,
            cache: LruCache::new(capacity),
            native,
            output,
            bands: first.bands,
            fill,
            tiles_loaded: 0,
        })
    }

    pub fn transform(&self) -> AffineTransform {
        self.output.transform
    }

    pub fn width(&self) -> usize {
        self.output.width
    }

    pub fn height(&self) -> usize {
        self.output.height
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn fill(&self) -> f32 {
        self.fill
    }

    pub fn extent(&self) -> BoundingBox {
        self.output.extent()
    }

    pub fn tile_count(&self) -> usize {
        self.footprints.len()
    }

    /// Number of tile pixel reads so far
    pub fn tiles_loaded(&self) -> usize {
        self.tiles_loaded
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn tile_data(&mut self, order: usize) -> ChipletResult<Arc<Array3<f32>>> {
        if let Some(data) = self.cache.get(&order) {
            return Ok(Arc::clone(data));
        }

        let raster = self.source.load(order)?;
        let footprint = self.footprints[order];
        if raster.data.dim() != (self.bands, footprint.height, footprint.width) {
            return Err(ChipletError::Consistency(format!(
                "Tile {} delivered shape {:?}, its header promised {:?}",
                self.source.describe(order),
                raster.data.dim(),
                (self.bands, footprint.height, footprint.width)
            )));
        }
        self.tiles_loaded += 1;

        let data = Arc::new(raster.data);
        self.cache.put(order, Arc::clone(&data));
        Ok(data)
    }

    /// Mosaic values at the native pixels `rows` x `cols`
    fn merge(&mut self, rows: &[i64], cols: &[i64]) -> ChipletResult<Array3<f32>> {
        let mut out = Array3::from_elem((self.bands, rows.len(), cols.len()), self.fill);
        let ((min_c, max_c), (min_r, max_r)) = match (span(cols), span(rows)) {
            (Some(c), Some(r)) => (c, r),
            _ => return Ok(out),
        };
        let window = AABB::from_corners(
            [min_c as f64 + 0.5, min_r as f64 + 0.5],
            [max_c as f64 + 0.5, max_r as f64 + 0.5],
        );

        let mut candidates: Vec<TileFootprint> = self.tree.locate_in_envelope_intersecting(&window).copied().collect();
        candidates.sort_by_key(|f| f.order);

        // ascending order so later valid pixels overwrite earlier ones
        for footprint in candidates {
            let data = self.tile_data(footprint.order)?;
            for (i, &row) in rows.iter().enumerate() {
                let tile_row = row - footprint.row_off;
                if tile_row < 0 || tile_row >= footprint.height as i64 {
                    continue;
                }
                for (j, &col) in cols.iter().enumerate() {
                    let tile_col = col - footprint.col_off;
                    if tile_col < 0 || tile_col >= footprint.width as i64 {
                        continue;
                    }
                    for band in 0..self.bands {
                        let value = data[[band, tile_row as usize, tile_col as usize]];
                        if !is_missing(value, footprint.nodata) {
                            out[[band, i, j]] = value;
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    /// Resampled values at the output pixels `rows` x `cols`
    fn merge_resampled(&mut self, rows: &[i64], cols: &[i64]) -> ChipletResult<Array3<f32>> {
        let mut out = Array3::from_elem((self.bands, rows.len(), cols.len()), self.fill);
        let ((min_c, max_c), (min_r, max_r)) = match (span(cols), span(rows)) {
            (Some(c), Some(r)) => (c, r),
            _ => return Ok(out),
        };

        let target = GridSpec {
            transform: self.output.transform.translated(min_c as f64, min_r as f64),
            width: (max_c - min_c + 1) as usize,
            height: (max_r - min_r + 1) as usize,
        };
        let bounds = target.transform.bounds(target.width, target.height);
        let (left, top) = self.native.inverse.apply(bounds.left, bounds.top);
        let (right, bottom) = self.native.inverse.apply(bounds.right, bounds.bottom);
        let native_cols: Vec<i64> =
            ((left.floor() as i64 - 1).max(0)..(right.ceil() as i64 + 1).min(self.native.width as i64)).collect();
        let native_rows: Vec<i64> =
            ((top.floor() as i64 - 1).max(0)..(bottom.ceil() as i64 + 1).min(self.native.height as i64)).collect();
        let (col_start, row_start) = match (native_cols.first(), native_rows.first()) {
            (Some(&c), Some(&r)) => (c, r),
            _ => return Ok(out),
        };

        let merged = self.merge(&native_rows, &native_cols)?;
        let window = Raster::new(
            merged,
            self.native.transform.translated(col_start as f64, row_start as f64),
            Some(self.fill),
        );

        let (reprojector, _, resampling) = self
            .source
            .resampling()
            .ok_or_else(|| ChipletError::Consistency("Packet source no longer resamples".to_string()))?;
        let resampled = reprojector.reproject(&window, &target, resampling)?;

        for (i, &row) in rows.iter().enumerate() {
            for (j, &col) in cols.iter().enumerate() {
                for band in 0..self.bands {
                    out[[band, i, j]] = resampled.data[[band, (row - min_r) as usize, (col - min_c) as usize]];
                }
            }
        }
        Ok(out)
    }

    /// Values at the grid of coordinates `xs` x `ys`, as `(bands, ys, xs)`.
    ///
    /// Each coordinate selects the packet pixel containing it; any coordinate
    /// outside the packet extent is an error.
    pub fn extract(&mut self, xs: &[f64], ys: &[f64]) -> ChipletResult<Array3<f32>> {
        let y_first = ys.first().copied().unwrap_or(self.output.transform.f);
        let x_first = xs.first().copied().unwrap_or(self.output.transform.c);

        let cols = xs
            .iter()
            .map(|&x| self.output.pixel_index(x, y_first).map(|(c, _)| c))
            .collect::<ChipletResult<Vec<_>>>()?;
        let rows = ys
            .iter()
            .map(|&y| self.output.pixel_index(x_first, y).map(|(_, r)| r))
            .collect::<ChipletResult<Vec<_>>>()?;

        if self.source.resampling().is_some() {
            self.merge_resampled(&rows, &cols)
        } else {
            self.merge(&rows, &cols)
        }
    }

    /// Materialise the whole packet as one raster
    pub fn to_raster(&mut self) -> ChipletResult<Raster> {
        let transform = self.output.transform;
        let xs: Vec<f64> = (0..self.output.width).map(|c| transform.apply(c as f64 + 0.5, 0.5).0).collect();
        let ys: Vec<f64> = (0..self.output.height).map(|r| transform.apply(0.5, r as f64 + 0.5).1).collect();
        let data = self.extract(&xs, &ys)?;
        Ok(Raster::new(data, transform, Some(self.fill)))
    }
}

/// Packet over chip files for one (source, year)
pub fn form_packet<'a>(
    provider: &'a dyn RasterTileProvider,
    paths: &[PathBuf],
    fill: f32,
    resample: Option<(&'a dyn Reprojector, f64, Resampling)>,
    cache_size: usize,
) -> ChipletResult<Packet<ProviderTiles<'a>>> {
    let mut tiles = ProviderTiles::new(provider, paths.to_vec());
    if let Some((reprojector, resolution, resampling)) = resample {
        tiles = tiles.with_resampling(reprojector, resolution, resampling);
    }
    Packet::new(tiles, fill, cache_size)
}
