//! Resampling of rasters onto a new grid

use crate::types::{AffineTransform, BoundingBox, ChipletError, ChipletResult, GridSpec, Raster, Resampling};
use ndarray::{Array3, Axis, Zip};

/// Moves a raster onto a target grid
pub trait Reprojector: Send + Sync {
    fn reproject(&self, raster: &Raster, target: &GridSpec, resampling: Resampling) -> ChipletResult<Raster>;
}

/// North-up grid of square `resolution` pixels covering `bounds`
pub fn grid_for_resolution(bounds: &BoundingBox, resolution: f64) -> ChipletResult<GridSpec> {
    if !(resolution > 0.0) {
        return Err(ChipletError::InvalidFormat(format!("Invalid resolution {}", resolution)));
    }
    Ok(GridSpec {
        transform: AffineTransform::north_up(bounds.left, bounds.top, resolution, resolution),
        width: (bounds.width() / resolution).round() as usize,
        height: (bounds.height() / resolution).round() as usize,
    })
}

/// Resampler working in the raster's own coordinate system.
///
/// Each target pixel centre is mapped into the source grid; nearest takes the
/// source cell under it, bilinear weights the four surrounding cell centres.
/// Bilinear falls back to nearest next to nodata cells, and target pixels
/// outside the source get the source nodata value (NaN if it has none).
#[derive(Debug, Clone, Copy, Default)]
pub struct GridResampler;

impl GridResampler {
    pub fn new() -> Self {
        Self
    }
}

/// NaN, or equal to the declared nodata value
pub(crate) fn is_missing(value: f32, nodata: Option<f32>) -> bool {
    value.is_nan() || nodata.map_or(false, |nd| value == nd)
}

impl Reprojector for GridResampler {
    fn reproject(&self, raster: &Raster, target: &GridSpec, resampling: Resampling) -> ChipletResult<Raster> {
        log::debug!(
            "Resampling {}x{} raster to {}x{} grid ({:?})",
            raster.width(),
            raster.height(),
            target.width,
            target.height,
            resampling
        );

        let inverse = raster.transform.inverse()?;
        let fill = raster.nodata.unwrap_or(f32::NAN);
        let (src_h, src_w) = (raster.height(), raster.width());
        let mut out = Array3::from_elem((raster.bands(), target.height, target.width), fill);

        for (band_in, mut band_out) in raster.data.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            Zip::indexed(&mut band_out).for_each(|(i, j), value| {
                let (x, y) = target.transform.apply(j as f64 + 0.5, i as f64 + 0.5);
                let (col, row) = inverse.apply(x, y);
                if col < 0.0 || row < 0.0 || col >= src_w as f64 || row >= src_h as f64 {
                    return;
                }
                let nearest = band_in[[row.floor() as usize, col.floor() as usize]];

                *value = match resampling {
                    Resampling::Nearest => nearest,
                    Resampling::Bilinear => {
                        // centre-relative position, clamped so edge pixels reuse their own value
                        let fc = (col - 0.5).clamp(0.0, (src_w - 1) as f64);
                        let fr = (row - 0.5).clamp(0.0, (src_h - 1) as f64);
                        let (c1, r1) = (fc.floor() as usize, fr.floor() as usize);
                        let (c2, r2) = ((c1 + 1).min(src_w - 1), (r1 + 1).min(src_h - 1));
                        let (dx, dy) = (fc - c1 as f64, fr - r1 as f64);

                        let v11 = band_in[[r1, c1]];
                        let v21 = band_in[[r1, c2]];
                        let v12 = band_in[[r2, c1]];
                        let v22 = band_in[[r2, c2]];

                        if [v11, v21, v12, v22].iter().any(|&v| is_missing(v, raster.nodata)) {
                            nearest
                        } else {
                            (v11 as f64 * (1.0 - dx) * (1.0 - dy)
                                + v21 as f64 * dx * (1.0 - dy)
                                + v12 as f64 * (1.0 - dx) * dy
                                + v22 as f64 * dx * dy) as f32
                        }
                    }
                };
            });
        }

        Ok(Raster {
            data: out,
            transform: target.transform,
            crs: raster.crs,
            nodata: raster.nodata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp() -> Raster {
        let data = Array3::from_shape_fn((1, 4, 4), |(_, r, c)| (r * 4 + c) as f32);
        Raster::new(data, AffineTransform::north_up(0.0, 100.0, 25.0, 25.0), Some(-1.0))
    }

    #[test]
    fn test_nearest_downsample() {
        let raster = ramp();
        let grid = grid_for_resolution(&raster.bounds(), 50.0).unwrap();
        assert_eq!((grid.width, grid.height), (2, 2));

        let out = GridResampler::new().reproject(&raster, &grid, Resampling::Nearest).unwrap();
        // centre of the first 50 m pixel lies on the corner shared by source cells (0,0)..(1,1)
        assert_eq!(out.data[[0, 0, 0]], 5.0);
        assert_eq!(out.data[[0, 1, 1]], 15.0);
    }

    #[test]
    fn test_bilinear_identity_grid() {
        let raster = ramp();
        let grid = GridSpec {
            transform: raster.transform,
            width: 4,
            height: 4,
        };
        let out = GridResampler::new().reproject(&raster, &grid, Resampling::Bilinear).unwrap();
        for (a, b) in out.data.iter().zip(raster.data.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_bilinear_upsample_interpolates() {
        let raster = ramp();
        let grid = grid_for_resolution(&raster.bounds(), 12.5).unwrap();
        let out = GridResampler::new().reproject(&raster, &grid, Resampling::Bilinear).unwrap();
        // target pixel (3, 3) has its centre a quarter cell past source centre (1, 1)
        assert_relative_eq!(out.data[[0, 3, 3]], 5.0 + 0.25 * 4.0 + 0.25, epsilon = 1e-5);
    }

    #[test]
    fn test_outside_source_gets_nodata() {
        let raster = ramp();
        let grid = GridSpec {
            transform: AffineTransform::north_up(-50.0, 100.0, 25.0, 25.0),
            width: 2,
            height: 1,
        };
        let out = GridResampler::new().reproject(&raster, &grid, Resampling::Nearest).unwrap();
        assert_eq!(out.data[[0, 0, 0]], -1.0);
    }
}
