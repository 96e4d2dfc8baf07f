use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Side length of one cell of the global chip grid, in projected metres
pub const GRID_CELL_SIZE: f64 = 100_000.0;

/// EPSG code of the working spatial reference (GDA94 / Australian Albers)
pub const WORKING_CRS: u32 = 3577;

/// Integer position of a chip on the global tiling scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridRef {
    pub x: i64,
    pub y: i64,
}

impl GridRef {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for GridRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}y{}", self.x, self.y)
    }
}

/// Spatial bounding box in projected coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl BoundingBox {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self { left, bottom, right, top }
    }

    /// Smallest box enclosing a set of points
    pub fn from_points(points: &[(f64, f64)]) -> Self {
        let mut bbox = Self::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &(x, y) in points {
            bbox.left = bbox.left.min(x);
            bbox.right = bbox.right.max(x);
            bbox.bottom = bbox.bottom.min(y);
            bbox.top = bbox.top.max(y);
        }
        bbox
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    /// Union of two boxes
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            left: self.left.min(other.left),
            bottom: self.bottom.min(other.bottom),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
        }
    }

    pub fn to_rect(&self) -> geo::Rect<f64> {
        geo::Rect::new(
            geo::coord! { x: self.left, y: self.bottom },
            geo::coord! { x: self.right, y: self.top },
        )
    }

    pub fn to_polygon(&self) -> geo::Polygon<f64> {
        self.to_rect().to_polygon()
    }
}

/// Affine mapping from pixel index space (column, row) to projected coordinates.
///
/// Coefficient naming follows the usual `a b c / d e f / g h i` layout, so that
/// `x = a * col + b * row + c` and `y = d * col + e * row + f`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl AffineTransform {
    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// North-up transform with square-ish pixels anchored at a top-left corner
    pub fn north_up(left: f64, top: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self::new(pixel_width, 0.0, left, 0.0, -pixel_height.abs(), top)
    }

    /// Build from a GDAL geotransform `[c, a, b, f, d, e]`
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self::new(gt[1], gt[2], gt[0], gt[4], gt[5], gt[3])
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [self.c, self.a, self.b, self.f, self.d, self.e]
    }

    /// Full homogeneous coefficients `a..i`
    pub fn coefficients(&self) -> [f64; 9] {
        [self.a, self.b, self.c, self.d, self.e, self.f, 0.0, 0.0, 1.0]
    }

    /// Rebuild from homogeneous coefficients, rejecting non-affine bottom rows
    pub fn from_coefficients(coeffs: &[f64; 9]) -> ChipletResult<Self> {
        if coeffs[6] != 0.0 || coeffs[7] != 0.0 || coeffs[8] != 1.0 {
            return Err(ChipletError::InvalidFormat(format!(
                "Transform coefficients g, h, i must be 0, 0, 1; got {}, {}, {}",
                coeffs[6], coeffs[7], coeffs[8]
            )));
        }
        Ok(Self::new(coeffs[0], coeffs[1], coeffs[2], coeffs[3], coeffs[4], coeffs[5]))
    }

    /// Map a (possibly fractional) pixel index to coordinates
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    pub fn inverse(&self) -> ChipletResult<AffineTransform> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return Err(ChipletError::InvalidFormat(format!(
                "Transform {:?} is not invertible",
                self
            )));
        }
        let ia = self.e / det;
        let ib = -self.b / det;
        let id = -self.d / det;
        let ie = self.a / det;
        Ok(AffineTransform::new(
            ia,
            ib,
            -(ia * self.c + ib * self.f),
            id,
            ie,
            -(id * self.c + ie * self.f),
        ))
    }

    /// Transform of the window whose top-left pixel is `(col_off, row_off)`
    pub fn translated(&self, col_off: f64, row_off: f64) -> AffineTransform {
        let (c, f) = self.apply(col_off, row_off);
        AffineTransform::new(self.a, self.b, c, self.d, self.e, f)
    }

    /// Same origin, pixel size scaled by the given factors
    pub fn scaled(&self, sx: f64, sy: f64) -> AffineTransform {
        AffineTransform::new(self.a * sx, self.b * sy, self.c, self.d * sx, self.e * sy, self.f)
    }

    pub fn is_rectilinear(&self) -> bool {
        self.b == 0.0 && self.d == 0.0
    }

    /// Spatial extent of a `width` x `height` pixel grid under this transform
    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        let (w, h) = (width as f64, height as f64);
        BoundingBox::from_points(&[
            self.apply(0.0, 0.0),
            self.apply(w, 0.0),
            self.apply(0.0, h),
            self.apply(w, h),
        ])
    }
}

/// Resampling policy used when a raster moves onto a new grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resampling {
    Nearest,
    Bilinear,
}

/// Element type of a chiplet store on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    U8,
    F16,
    F32,
}

impl Dtype {
    pub fn size_of(&self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::F16 => 2,
            Dtype::F32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        !matches!(self, Dtype::U8)
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::U8 => write!(f, "uint8"),
            Dtype::F16 => write!(f, "float16"),
            Dtype::F32 => write!(f, "float32"),
        }
    }
}

/// Environmental data sources handled by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    LandCover,
    Tmax,
    Rain,
    Elevation,
    LandUse,
    FireScarEarly,
    FireScarLate,
    SoilEce,
    SoilDepth,
    SoilClay,
}

impl DataSource {
    pub const ALL: [DataSource; 10] = [
        DataSource::LandCover,
        DataSource::Tmax,
        DataSource::Rain,
        DataSource::Elevation,
        DataSource::LandUse,
        DataSource::FireScarEarly,
        DataSource::FireScarLate,
        DataSource::SoilEce,
        DataSource::SoilDepth,
        DataSource::SoilClay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::LandCover => "land_cover",
            DataSource::Tmax => "tmax",
            DataSource::Rain => "rain",
            DataSource::Elevation => "elevation",
            DataSource::LandUse => "land_use",
            DataSource::FireScarEarly => "fire_scar_early",
            DataSource::FireScarLate => "fire_scar_late",
            DataSource::SoilEce => "soil_ece",
            DataSource::SoilDepth => "soil_depth",
            DataSource::SoilClay => "soil_clay",
        }
    }

    /// Store element type
    pub fn dtype(&self) -> Dtype {
        if self.is_continuous() {
            Dtype::F16
        } else {
            Dtype::U8
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(
            self,
            DataSource::Tmax
                | DataSource::Rain
                | DataSource::Elevation
                | DataSource::SoilEce
                | DataSource::SoilDepth
                | DataSource::SoilClay
        )
    }

    /// Fill value for pixels with no data
    pub fn nodata(&self) -> f32 {
        if self.is_continuous() {
            f32::NAN
        } else {
            0.0
        }
    }

    /// Value marking pixels that fall outside every source tile
    pub fn sentinel(&self) -> f32 {
        if self.is_continuous() {
            f32::NAN
        } else {
            255.0
        }
    }

    pub fn resampling(&self) -> Resampling {
        if self.is_continuous() {
            Resampling::Bilinear
        } else {
            Resampling::Nearest
        }
    }

    /// Soil layers legitimately contain chiplets with no valid pixels
    pub fn allows_all_missing(&self) -> bool {
        matches!(
            self,
            DataSource::SoilEce | DataSource::SoilDepth | DataSource::SoilClay
        )
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = ChipletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataSource::ALL
            .iter()
            .copied()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| ChipletError::InvalidFormat(format!("Unknown data source: {}", s)))
    }
}

/// Named regions of interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiName {
    Savanna,
    Australia,
}

impl RoiName {
    pub const ALL: [RoiName; 2] = [RoiName::Savanna, RoiName::Australia];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoiName::Savanna => "savanna",
            RoiName::Australia => "australia",
        }
    }
}

impl fmt::Display for RoiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RoiName {
    type Err = ChipletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoiName::ALL
            .iter()
            .copied()
            .find(|roi| roi.as_str() == s)
            .ok_or_else(|| ChipletError::InvalidFormat(format!("Unknown ROI name: {}", s)))
    }
}

/// Georeferencing and size of a raster, without its pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileHeader {
    pub transform: AffineTransform,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub nodata: Option<f32>,
}

impl TileHeader {
    pub fn bounds(&self) -> BoundingBox {
        self.transform.bounds(self.width, self.height)
    }
}

/// Target grid for resampling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub transform: AffineTransform,
    pub width: usize,
    pub height: usize,
}

/// In-memory georeferenced raster (band, row, col)
#[derive(Debug, Clone)]
pub struct Raster {
    pub data: Array3<f32>,
    pub transform: AffineTransform,
    pub crs: Option<u32>,
    pub nodata: Option<f32>,
}

impl Raster {
    pub fn new(data: Array3<f32>, transform: AffineTransform, nodata: Option<f32>) -> Self {
        Self {
            data,
            transform,
            crs: Some(WORKING_CRS),
            nodata,
        }
    }

    pub fn bands(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    pub fn header(&self) -> TileHeader {
        TileHeader {
            transform: self.transform,
            width: self.width(),
            height: self.height(),
            bands: self.bands(),
            nodata: self.nodata,
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        self.transform.bounds(self.width(), self.height())
    }
}

/// Error types for chiplet processing
#[derive(Debug, thiserror::Error)]
pub enum ChipletError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Tile {path} is not aligned to the {cell_size} m grid (lower-left corner {x}, {y})")]
    MisalignedGridRef {
        path: String,
        x: f64,
        y: f64,
        cell_size: f64,
    },

    #[error("Grid cell {grid_ref} has more than one representative chip: {first} and {second}")]
    DuplicateGridRef {
        grid_ref: GridRef,
        first: String,
        second: String,
    },

    #[error("No tiles found: {0}")]
    NoTiles(String),

    #[error("Chiplet table is empty: {0}")]
    EmptyTable(String),

    #[error("No RNG seed registered for ROI '{roi}' with padding {pad_size_pix}")]
    UnknownSeed { roi: RoiName, pad_size_pix: usize },

    #[error("Shape mismatch for {path}: table implies {expected} bytes but file holds {actual}")]
    ShapeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Region of interest '{0}' has not been loaded")]
    RoiNotLoaded(RoiName),

    #[error("Invalid region of interest: {0}")]
    InvalidRoi(String),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Chiplet {index} of {data_source} in {year} has no valid pixels")]
    AllMissing {
        data_source: DataSource,
        year: i32,
        index: usize,
    },

    #[error("Relabelling failed for year {year}, row {index} (grid ref {grid_ref}, pixel offset {pixel_offset:?}): {message}")]
    Relabel {
        year: i32,
        index: usize,
        grid_ref: GridRef,
        pixel_offset: (usize, usize),
        message: String,
    },

    #[error("Coordinate ({x}, {y}) lies outside the packet extent {extent:?}")]
    OutOfExtent { x: f64, y: f64, extent: BoundingBox },

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

/// Result type for chiplet operations
pub type ChipletResult<T> = Result<T, ChipletError>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transform_inverse_round_trip() {
        let transform = AffineTransform::new(25.0, 0.0, -1_000_000.0, 0.0, -25.0, -1_700_000.0);
        let inverse = transform.inverse().unwrap();

        let (x, y) = transform.apply(480.5, 3840.5);
        let (col, row) = inverse.apply(x, y);

        assert_relative_eq!(col, 480.5, epsilon = 1e-9);
        assert_relative_eq!(row, 3840.5, epsilon = 1e-9);
    }

    #[test]
    fn test_transform_bounds_handle_axis_flip() {
        let transform = AffineTransform::new(25.0, 0.0, -1_000_000.0, 0.0, -25.0, -1_700_000.0);
        let bounds = transform.bounds(4000, 4000);

        assert_eq!(bounds.left, -1_000_000.0);
        assert_eq!(bounds.right, -900_000.0);
        assert_eq!(bounds.top, -1_700_000.0);
        assert_eq!(bounds.bottom, -1_800_000.0);
    }

    #[test]
    fn test_gdal_geotransform_layout() {
        let transform = AffineTransform::from_gdal([100.0, 25.0, 0.0, 200.0, 0.0, -25.0]);
        assert_eq!(transform.c, 100.0);
        assert_eq!(transform.f, 200.0);
        assert_eq!(transform.to_gdal(), [100.0, 25.0, 0.0, 200.0, 0.0, -25.0]);
    }

    #[test]
    fn test_coefficients_reject_projective_rows() {
        let mut coeffs = AffineTransform::north_up(0.0, 0.0, 25.0, 25.0).coefficients();
        assert!(AffineTransform::from_coefficients(&coeffs).is_ok());
        coeffs[7] = 0.5;
        assert!(AffineTransform::from_coefficients(&coeffs).is_err());
    }

    #[test]
    fn test_source_names_parse() {
        for source in DataSource::ALL {
            assert_eq!(source.as_str().parse::<DataSource>().unwrap(), source);
        }
        assert!("ocean".parse::<DataSource>().is_err());
        assert_eq!(DataSource::Rain.dtype(), Dtype::F16);
        assert_eq!(DataSource::LandUse.dtype(), Dtype::U8);
        assert!(DataSource::SoilClay.allows_all_missing());
        assert!(!DataSource::Elevation.allows_all_missing());
    }
}
