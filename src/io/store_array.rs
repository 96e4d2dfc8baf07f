//! Memory-mapped chiplet arrays.
//!
//! A store is a flat, headerless file of `n_chiplets * bands * height * width`
//! elements in C order. Its shape is never recorded in the file; it is always
//! re-derived from the chiplet table the store was built against.

use crate::types::{ChipletError, ChipletResult, Dtype};
use half::f16;
use memmap2::{Mmap, MmapMut, MmapOptions};
use ndarray::{ArrayView2, ArrayView3, ArrayView4, ArrayViewMut3};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Element type that can live in a chiplet store
pub trait StoreElement: bytemuck::Pod + Send + Sync + std::fmt::Debug + 'static {
    const DTYPE: Dtype;

    fn from_f32(value: f32) -> Self;

    fn to_f32(self) -> f32;
}

impl StoreElement for u8 {
    const DTYPE: Dtype = Dtype::U8;

    fn from_f32(value: f32) -> Self {
        // saturating; NaN maps to 0
        value.round() as u8
    }

    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl StoreElement for f16 {
    const DTYPE: Dtype = Dtype::F16;

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

impl StoreElement for f32 {
    const DTYPE: Dtype = Dtype::F32;

    fn from_f32(value: f32) -> Self {
        value
    }

    fn to_f32(self) -> f32 {
        self
    }
}

/// Logical shape of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreShape {
    pub n_chiplets: usize,
    /// Size of the extra (band) axis; 0 means the store is `(N, H, W)`
    pub n_extra: usize,
    pub height: usize,
    pub width: usize,
}

impl StoreShape {
    pub fn new(n_chiplets: usize, n_extra: usize, height: usize, width: usize) -> Self {
        Self { n_chiplets, n_extra, height, width }
    }

    /// Planes per chiplet
    pub fn bands(&self) -> usize {
        self.n_extra.max(1)
    }

    pub fn chiplet_len(&self) -> usize {
        self.bands() * self.height * self.width
    }

    pub fn len(&self) -> usize {
        self.n_chiplets * self.chiplet_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self, dtype: Dtype) -> u64 {
        self.len() as u64 * dtype.size_of() as u64
    }

    /// Dimensions as written in the logical array
    pub fn dims(&self) -> Vec<usize> {
        if self.n_extra > 0 {
            vec![self.n_chiplets, self.n_extra, self.height, self.width]
        } else {
            vec![self.n_chiplets, self.height, self.width]
        }
    }

    fn chiplet_range(&self, index: usize) -> ChipletResult<std::ops::Range<usize>> {
        if index >= self.n_chiplets {
            return Err(ChipletError::Consistency(format!(
                "Chiplet index {} out of range for store of {} chiplets",
                index, self.n_chiplets
            )));
        }
        let start = index * self.chiplet_len();
        Ok(start..start + self.chiplet_len())
    }
}

/// Write handle for a freshly allocated store
pub struct ChipletArrayWriter<T: StoreElement> {
    path: PathBuf,
    shape: StoreShape,
    mmap: MmapMut,
    _element: PhantomData<T>,
}

impl<T: StoreElement> ChipletArrayWriter<T> {
    /// Create (or truncate) the file at `path` and map it for writing
    pub fn create(path: &Path, shape: StoreShape) -> ChipletResult<Self> {
        if shape.is_empty() {
            return Err(ChipletError::EmptyTable(format!(
                "refusing to allocate an empty store at {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(shape.byte_len(T::DTYPE))?;

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        log::debug!(
            "Allocated {} store {:?} at {}",
            T::DTYPE,
            shape.dims(),
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            shape,
            mmap,
            _element: PhantomData,
        })
    }

    pub fn shape(&self) -> StoreShape {
        self.shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data_mut(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(&mut self.mmap[..])
    }

    /// Set every element to `value`
    pub fn fill(&mut self, value: T) {
        self.data_mut().fill(value);
    }

    /// Mutable `(bands, height, width)` view of one chiplet
    pub fn chiplet_mut(&mut self, index: usize) -> ChipletResult<ArrayViewMut3<'_, T>> {
        let range = self.shape.chiplet_range(index)?;
        let dims = (self.shape.bands(), self.shape.height, self.shape.width);
        ArrayViewMut3::from_shape(dims, &mut self.data_mut()[range])
            .map_err(|e| ChipletError::Consistency(format!("Bad chiplet view: {}", e)))
    }

    /// Write all bands of chiplet `index` from single-precision values
    pub fn write_chiplet(&mut self, index: usize, values: ArrayView3<f32>) -> ChipletResult<()> {
        let mut target = self.chiplet_mut(index)?;
        if target.dim() != values.dim() {
            return Err(ChipletError::Consistency(format!(
                "Chiplet {} has shape {:?}, store expects {:?}",
                index,
                values.dim(),
                target.dim()
            )));
        }
        target.zip_mut_with(&values, |out, &v| *out = T::from_f32(v));
        Ok(())
    }

    /// Write one band of chiplet `index`
    pub fn write_band(&mut self, index: usize, band: usize, values: ArrayView2<f32>) -> ChipletResult<()> {
        let mut target = self.chiplet_mut(index)?;
        if band >= target.dim().0 {
            return Err(ChipletError::Consistency(format!(
                "Band {} out of range for chiplet with {} bands",
                band,
                target.dim().0
            )));
        }
        let mut plane = target.index_axis_mut(ndarray::Axis(0), band);
        if plane.dim() != values.dim() {
            return Err(ChipletError::Consistency(format!(
                "Band of chiplet {} has shape {:?}, store expects {:?}",
                index,
                values.dim(),
                plane.dim()
            )));
        }
        plane.zip_mut_with(&values, |out, &v| *out = T::from_f32(v));
        Ok(())
    }

    /// Flush to disk and release the mapping
    pub fn finish(self) -> ChipletResult<()> {
        self.mmap.flush()?;
        log::debug!("Flushed store {}", self.path.display());
        Ok(())
    }
}

/// Read-only memory-mapped view of a store
pub struct ChipletArrayReader<T: StoreElement> {
    path: PathBuf,
    shape: StoreShape,
    mmap: Mmap,
    _element: PhantomData<T>,
}

impl<T: StoreElement> ChipletArrayReader<T> {
    /// Map an existing store, checking its size against the expected shape
    pub fn open(path: &Path, shape: StoreShape) -> ChipletResult<Self> {
        let expected = shape.byte_len(T::DTYPE);
        let actual = fs::metadata(path)?.len();
        if expected != actual {
            return Err(ChipletError::ShapeMismatch {
                path: path.display().to_string(),
                expected,
                actual,
            });
        }
        if shape.is_empty() {
            return Err(ChipletError::EmptyTable(format!(
                "store at {} has no chiplets",
                path.display()
            )));
        }

        let file = fs::File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        Ok(Self {
            path: path.to_path_buf(),
            shape,
            mmap,
            _element: PhantomData,
        })
    }

    pub fn shape(&self) -> StoreShape {
        self.shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[T] {
        bytemuck::cast_slice(&self.mmap[..])
    }

    /// Whole store as `(n, bands, height, width)`
    pub fn view(&self) -> ChipletResult<ArrayView4<'_, T>> {
        let dims = (
            self.shape.n_chiplets,
            self.shape.bands(),
            self.shape.height,
            self.shape.width,
        );
        ArrayView4::from_shape(dims, self.data())
            .map_err(|e| ChipletError::Consistency(format!("Bad store view: {}", e)))
    }

    /// One chiplet as `(bands, height, width)`
    pub fn chiplet(&self, index: usize) -> ChipletResult<ArrayView3<'_, T>> {
        let range = self.shape.chiplet_range(index)?;
        let dims = (self.shape.bands(), self.shape.height, self.shape.width);
        ArrayView3::from_shape(dims, &self.data()[range])
            .map_err(|e| ChipletError::Consistency(format!("Bad chiplet view: {}", e)))
    }

    /// One band of one chiplet
    pub fn band(&self, index: usize, band: usize) -> ChipletResult<ArrayView2<'_, T>> {
        let chiplet = self.chiplet(index)?;
        if band >= chiplet.dim().0 {
            return Err(ChipletError::Consistency(format!(
                "Band {} out of range for chiplet with {} bands",
                band,
                chiplet.dim().0
            )));
        }
        Ok(chiplet.index_axis_move(ndarray::Axis(0), band))
    }
}
