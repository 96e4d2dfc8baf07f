use crate::io::raster::RasterTileProvider;
use crate::types::{AffineTransform, ChipletError, ChipletResult, Raster, TileHeader};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::{Dataset, DriverManager};
use ndarray::Array3;
use std::path::Path;

/// GeoTIFF (or any GDAL-readable) tile provider
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalTileProvider;

impl GdalTileProvider {
    pub fn new() -> Self {
        Self
    }
}

impl RasterTileProvider for GdalTileProvider {
    fn read_header(&self, path: &Path) -> ChipletResult<TileHeader> {
        let dataset = Dataset::open(path)?;
        let (width, height) = dataset.raster_size();
        let bands = dataset.raster_count() as usize;
        let nodata = dataset.rasterband(1)?.no_data_value().map(|v| v as f32);

        Ok(TileHeader {
            transform: AffineTransform::from_gdal(dataset.geo_transform()?),
            width,
            height,
            bands,
            nodata,
        })
    }

    fn read(&self, path: &Path) -> ChipletResult<Raster> {
        log::debug!("Reading tile: {}", path.display());

        let dataset = Dataset::open(path)?;
        let (width, height) = dataset.raster_size();
        let n_bands = dataset.raster_count() as usize;
        if n_bands == 0 {
            return Err(ChipletError::InvalidFormat(format!(
                "{} has no raster bands",
                path.display()
            )));
        }

        let mut flat = Vec::with_capacity(n_bands * width * height);
        let mut nodata = None;
        for band_index in 1..=n_bands {
            let band = dataset.rasterband(band_index as isize)?;
            if band_index == 1 {
                nodata = band.no_data_value().map(|v| v as f32);
            }
            let buffer = band.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
            flat.extend(buffer.data);
        }

        // a single band stays as one plane rather than an extra axis
        let data = Array3::from_shape_vec((n_bands, height, width), flat)
            .map_err(|e| ChipletError::InvalidFormat(format!("Failed to reshape tile data: {}", e)))?;

        let crs = dataset
            .spatial_ref()
            .ok()
            .and_then(|srs| srs.auth_code().ok())
            .map(|code| code as u32);

        Ok(Raster {
            data,
            transform: AffineTransform::from_gdal(dataset.geo_transform()?),
            crs,
            nodata,
        })
    }
}

/// Write a raster as an LZW-compressed GeoTIFF
pub fn write_geotiff<P: AsRef<Path>>(path: P, raster: &Raster) -> ChipletResult<()> {
    log::debug!("Writing GeoTIFF: {}", path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (bands, height, width) = raster.data.dim();

    let options = [RasterCreationOption {
        key: "COMPRESS",
        value: "LZW",
    }];

    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        path.as_ref(),
        width as isize,
        height as isize,
        bands as isize,
        &options,
    )?;

    dataset.set_geo_transform(&raster.transform.to_gdal())?;
    if let Some(epsg) = raster.crs {
        dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(epsg)?)?;
    }

    for band_index in 0..bands {
        let mut rasterband = dataset.rasterband(band_index as isize + 1)?;
        let flat_data: Vec<f32> = raster
            .data
            .index_axis(ndarray::Axis(0), band_index)
            .iter()
            .copied()
            .collect();
        let buffer = Buffer::new((width, height), flat_data);
        rasterband.write((0, 0), (width, height), &buffer)?;
        if let Some(nodata) = raster.nodata {
            rasterband.set_no_data_value(Some(nodata as f64))?;
        }
    }

    Ok(())
}
