//! Coordinate transformation between the spatial references the pipeline uses

use crate::types::{ChipletError, ChipletResult};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

/// proj definition for a supported EPSG code
pub fn proj_string(epsg: u32) -> Option<&'static str> {
    match epsg {
        4326 => Some("+proj=longlat +datum=WGS84 +no_defs"),
        4283 => Some("+proj=longlat +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +no_defs"),
        3577 => Some(
            "+proj=aea +lat_0=0 +lon_0=132 +lat_1=-18 +lat_2=-36 +x_0=0 +y_0=0 \
             +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
        ),
        _ => None,
    }
}

fn is_geographic(epsg: u32) -> bool {
    matches!(epsg, 4326 | 4283)
}

/// Reusable point transformer between two EPSG codes
pub struct CrsTransformer {
    source: Proj,
    target: Proj,
    source_epsg: u32,
    target_epsg: u32,
}

impl std::fmt::Debug for CrsTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrsTransformer")
            .field("source_epsg", &self.source_epsg)
            .field("target_epsg", &self.target_epsg)
            .finish_non_exhaustive()
    }
}

impl CrsTransformer {
    pub fn new(source_epsg: u32, target_epsg: u32) -> ChipletResult<Self> {
        let build = |epsg: u32| -> ChipletResult<Proj> {
            let definition = proj_string(epsg)
                .ok_or_else(|| ChipletError::Projection(format!("EPSG:{} not supported", epsg)))?;
            Proj::from_proj_string(definition)
                .map_err(|e| ChipletError::Projection(format!("Invalid projection EPSG:{}: {:?}", epsg, e)))
        };

        Ok(Self {
            source: build(source_epsg)?,
            target: build(target_epsg)?,
            source_epsg,
            target_epsg,
        })
    }

    /// Transform one point; geographic coordinates are (lon, lat) in degrees
    pub fn transform(&self, x: f64, y: f64) -> ChipletResult<(f64, f64)> {
        if self.source_epsg == self.target_epsg {
            return Ok((x, y));
        }

        let (in_x, in_y) = if is_geographic(self.source_epsg) {
            (x.to_radians(), y.to_radians())
        } else {
            (x, y)
        };

        let mut point = (in_x, in_y, 0.0);
        transform(&self.source, &self.target, &mut point).map_err(|e| {
            ChipletError::Projection(format!(
                "EPSG:{} -> EPSG:{} failed for ({}, {}): {:?}",
                self.source_epsg, self.target_epsg, x, y, e
            ))
        })?;

        if !point.0.is_finite() || !point.1.is_finite() {
            return Err(ChipletError::Projection(format!(
                "EPSG:{} -> EPSG:{} produced a non-finite result for ({}, {})",
                self.source_epsg, self.target_epsg, x, y
            )));
        }

        if is_geographic(self.target_epsg) {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wgs84_to_albers_and_back() {
        let forward = CrsTransformer::new(4326, 3577).unwrap();
        let (x, y) = forward.transform(130.7263181, -19.3940681).unwrap();

        assert!((x - -133346.94828722897).abs() < 10.0, "x = {}", x);
        assert!((y - -2077422.1437344416).abs() < 10.0, "y = {}", y);

        let backward = CrsTransformer::new(3577, 4326).unwrap();
        let (lon, lat) = backward.transform(x, y).unwrap();
        assert!((lon - 130.7263181).abs() < 1e-4);
        assert!((lat - -19.3940681).abs() < 1e-4);
    }

    #[test]
    fn test_unknown_epsg_rejected() {
        assert!(CrsTransformer::new(4326, 32633).is_err());
    }
}
