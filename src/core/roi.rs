//! Region-of-interest polygons

use crate::core::crs::CrsTransformer;
use crate::io::completion;
use crate::io::paths::OutputLayout;
use crate::types::{BoundingBox, ChipletError, ChipletResult, RoiName, WORKING_CRS};
use geo::{Contains, Intersects, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Subset of GeoJSON needed to pull polygons out of a boundary file
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeoJsonObject {
    FeatureCollection { features: Vec<GeoJsonObject> },
    Feature { geometry: Box<GeoJsonObject> },
    GeometryCollection { geometries: Vec<GeoJsonObject> },
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
}

type Rings = Vec<Vec<Vec<f64>>>;

fn collect_polygons(object: GeoJsonObject, out: &mut Vec<Rings>) {
    match object {
        GeoJsonObject::FeatureCollection { features } => {
            for feature in features {
                collect_polygons(feature, out);
            }
        }
        GeoJsonObject::Feature { geometry } => collect_polygons(*geometry, out),
        GeoJsonObject::GeometryCollection { geometries } => {
            for geometry in geometries {
                collect_polygons(geometry, out);
            }
        }
        GeoJsonObject::Polygon { coordinates } => out.push(coordinates),
        GeoJsonObject::MultiPolygon { coordinates } => out.extend(coordinates),
    }
}

/// Persisted form of a prepared ROI
#[derive(Debug, Serialize, Deserialize)]
struct RoiFile {
    name: RoiName,
    crs: u32,
    exterior: Vec<(f64, f64)>,
    interiors: Vec<Vec<(f64, f64)>>,
}

/// A named region of interest in the working spatial reference.
///
/// The polygon is immutable once loaded; every query is read-only.
#[derive(Debug, Clone)]
pub struct RegionOfInterest {
    name: RoiName,
    shape: Option<Polygon<f64>>,
    base_output_dir: Option<PathBuf>,
}

impl RegionOfInterest {
    /// An ROI that still needs `load()` or `prepare()`
    pub fn new(name: RoiName, base_output_dir: Option<&Path>) -> Self {
        Self {
            name,
            shape: None,
            base_output_dir: base_output_dir.map(Path::to_path_buf),
        }
    }

    /// Load a previously prepared ROI
    pub fn open(name: RoiName, base_output_dir: &Path) -> ChipletResult<Self> {
        let mut roi = Self::new(name, Some(base_output_dir));
        roi.load()?;
        Ok(roi)
    }

    /// Wrap a polygon already in the working spatial reference
    pub fn from_polygon(name: RoiName, polygon: Polygon<f64>) -> Self {
        Self {
            name,
            shape: Some(polygon),
            base_output_dir: None,
        }
    }

    pub fn name(&self) -> RoiName {
        self.name
    }

    pub fn shape(&self) -> ChipletResult<&Polygon<f64>> {
        self.shape.as_ref().ok_or(ChipletError::RoiNotLoaded(self.name))
    }

    pub fn is_loaded(&self) -> bool {
        self.shape.is_some()
    }

    pub fn shape_path(&self) -> ChipletResult<PathBuf> {
        let base = self.base_output_dir.as_ref().ok_or_else(|| {
            ChipletError::InvalidRoi(format!("ROI '{}' has no base output directory", self.name))
        })?;
        Ok(OutputLayout::new(base).roi_path(self.name))
    }

    /// Read a raw GeoJSON boundary, reproject it into `dst_epsg` and, with
    /// `save`, persist it for later `load()` calls.
    ///
    /// The boundary must describe exactly one connected region.
    pub fn prepare(
        &mut self,
        geojson_path: &Path,
        src_epsg: u32,
        dst_epsg: u32,
        save: bool,
        protect: bool,
    ) -> ChipletResult<()> {
        log::info!("Preparing ROI '{}' from {}", self.name, geojson_path.display());

        let text = std::fs::read_to_string(geojson_path)?;
        let object: GeoJsonObject = serde_json::from_str(&text)?;

        let mut polygons = Vec::new();
        collect_polygons(object, &mut polygons);

        if polygons.len() != 1 {
            return Err(ChipletError::InvalidRoi(format!(
                "Unexpected number of components in the region file: {}",
                polygons.len()
            )));
        }
        let rings = polygons.remove(0);

        let transformer = CrsTransformer::new(src_epsg, dst_epsg)?;
        let mut converted = Vec::with_capacity(rings.len());
        for ring in &rings {
            let mut points = Vec::with_capacity(ring.len());
            for position in ring {
                if position.len() < 2 {
                    return Err(ChipletError::InvalidRoi("Position with fewer than two coordinates".to_string()));
                }
                points.push(transformer.transform(position[0], position[1])?);
            }
            converted.push(points);
        }

        let mut rings_iter = converted.into_iter();
        let exterior = rings_iter
            .next()
            .ok_or_else(|| ChipletError::InvalidRoi("Polygon has no exterior ring".to_string()))?;
        let interiors: Vec<Vec<(f64, f64)>> = rings_iter.collect();

        if save {
            let path = self.shape_path()?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = RoiFile {
                name: self.name,
                crs: dst_epsg,
                exterior: exterior.clone(),
                interiors: interiors.clone(),
            };
            completion::clear(&path)?;
            std::fs::write(&path, serde_json::to_string(&file)?)?;
            completion::mark_complete(&path, None, &[], protect)?;
            log::info!("Saved ROI '{}' to {}", self.name, path.display());
        }

        self.shape = Some(build_polygon(exterior, interiors));
        Ok(())
    }

    /// Load the prepared polygon from disk
    pub fn load(&mut self) -> ChipletResult<()> {
        let path = self.shape_path()?;
        if !path.exists() {
            return Err(ChipletError::RoiNotLoaded(self.name));
        }
        let file: RoiFile = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        if file.name != self.name {
            return Err(ChipletError::InvalidRoi(format!(
                "{} holds ROI '{}', expected '{}'",
                path.display(),
                file.name,
                self.name
            )));
        }
        if file.crs != WORKING_CRS {
            log::warn!("ROI '{}' stored in EPSG:{}, not EPSG:{}", self.name, file.crs, WORKING_CRS);
        }
        self.shape = Some(build_polygon(file.exterior, file.interiors));
        Ok(())
    }

    /// True if the two regions share any portion of space
    pub fn intersects_with(&self, other: &RegionOfInterest) -> ChipletResult<bool> {
        Ok(self.shape()?.intersects(other.shape()?))
    }

    /// True if this region lies completely inside `other`
    pub fn is_within(&self, other: &RegionOfInterest) -> ChipletResult<bool> {
        Ok(other.shape()?.contains(self.shape()?))
    }

    pub fn intersects_polygon(&self, polygon: &Polygon<f64>) -> ChipletResult<bool> {
        Ok(self.shape()?.intersects(polygon))
    }

    pub fn contains_polygon(&self, polygon: &Polygon<f64>) -> ChipletResult<bool> {
        Ok(self.shape()?.contains(polygon))
    }

    pub fn intersects_bbox(&self, bbox: &BoundingBox) -> ChipletResult<bool> {
        self.intersects_polygon(&bbox.to_polygon())
    }

    pub fn contains_bbox(&self, bbox: &BoundingBox) -> ChipletResult<bool> {
        self.contains_polygon(&bbox.to_polygon())
    }

    pub fn contains_point(&self, x: f64, y: f64) -> ChipletResult<bool> {
        Ok(self.shape()?.contains(&Point::new(x, y)))
    }
}

fn build_polygon(exterior: Vec<(f64, f64)>, interiors: Vec<Vec<(f64, f64)>>) -> Polygon<f64> {
    Polygon::new(
        LineString::from(exterior),
        interiors.into_iter().map(LineString::from).collect(),
    )
}
