//! Views of integer label maps, one `i32` per pixel.
//!
//! `-1` marks an unlabeled pixel; every other value must be a superpixel id below the
//! declared count.

use crate::arrays::Array2D;
use crate::error::{BridgeError, Result};
use crate::image_handle::ImageHandle;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Label of a pixel that belongs to no superpixel.
pub const UNLABELED: i32 = -1;

const LABEL_SIZE: usize = std::mem::size_of::<i32>();

fn check_layout(
    ptr: *const i32,
    width: usize,
    height: usize,
    stride: usize,
) -> Result<NonNull<i32>> {
    if width == 0 || height == 0 {
        return Err(BridgeError::InvalidShape(format!(
            "label map of {width}x{height}"
        )));
    }
    let ptr = NonNull::new(ptr as *mut i32).ok_or(BridgeError::NullPointer)?;
    let min = width.checked_mul(LABEL_SIZE).ok_or_else(|| {
        BridgeError::InvalidShape(format!("label row of {width} elements overflows"))
    })?;
    if stride < min {
        return Err(BridgeError::InvalidStride { stride, min });
    }
    if stride % LABEL_SIZE != 0 {
        return Err(BridgeError::UnsupportedLayout(format!(
            "label stride {stride} is not a multiple of {LABEL_SIZE}"
        )));
    }
    if stride.checked_mul(height).is_none() {
        return Err(BridgeError::InvalidShape(format!(
            "{height} rows of {stride} bytes overflow"
        )));
    }
    Ok(ptr)
}

/// Read-only label map view, e.g. benchmark input.
#[derive(Clone, Copy)]
pub struct LabelMap<'a> {
    ptr: NonNull<i32>,
    width: usize,
    height: usize,
    stride: usize,
    _marker: PhantomData<&'a [i32]>,
}

// SAFETY: shared read-only view, same caller obligation as `ImageHandle`.
unsafe impl Send for LabelMap<'_> {}
unsafe impl Sync for LabelMap<'_> {}

impl<'a> LabelMap<'a> {
    /// Wraps caller memory; `stride` is in bytes.
    ///
    /// # Safety
    /// On success `ptr` must be valid for reads of `stride * (height - 1) + width * 4` bytes
    /// for `'a`, aligned for `i32`, and not mutated while the view is alive.
    pub unsafe fn wrap(ptr: *const i32, width: usize, height: usize, stride: usize) -> Result<Self> {
        let ptr = check_layout(ptr, width, height, stride)?;
        Ok(Self {
            ptr,
            width,
            height,
            stride,
            _marker: PhantomData,
        })
    }

    /// # Safety
    /// The parts must describe a layout that `wrap` accepted for memory valid for `'a`.
    pub(crate) unsafe fn from_parts(
        ptr: NonNull<i32>,
        width: usize,
        height: usize,
        stride: usize,
    ) -> Self {
        Self {
            ptr,
            width,
            height,
            stride,
            _marker: PhantomData,
        }
    }

    /// Contiguous labels, row after row.
    pub fn from_slice(data: &'a [i32], width: usize, height: usize) -> Result<Self> {
        if data.len() != width * height {
            return Err(BridgeError::InvalidShape(format!(
                "{} labels cannot fill {width}x{height}",
                data.len()
            )));
        }
        // SAFETY: the slice holds exactly `width * height` labels.
        unsafe { Self::wrap(data.as_ptr(), width, height, width * LABEL_SIZE) }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn as_ptr(&self) -> *const i32 {
        self.ptr.as_ptr()
    }

    pub fn row(&self, y: usize) -> &'a [i32] {
        assert!(y < self.height, "row index {y} out of bounds ({})", self.height);
        // SAFETY: `wrap` checked that the stride keeps rows inside the borrowed memory and
        // that it is a whole number of labels.
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(y * (self.stride / LABEL_SIZE)),
                self.width,
            )
        }
    }

    pub fn get(&self, x: usize, y: usize) -> i32 {
        self.row(y)[x]
    }

    /// Fails with `DimensionMismatch` unless the map covers exactly the image's pixels.
    pub fn validate_against(&self, image: &ImageHandle<'_>) -> Result<()> {
        if self.width != image.width() || self.height != image.height() {
            return Err(BridgeError::mismatch(
                (image.width(), image.height()),
                (self.width, self.height),
            ));
        }
        Ok(())
    }

    /// Fails on the first label (raster order) outside `[-1, count)`.
    pub fn validate_labels(&self, count: u32) -> Result<()> {
        self.check_labels(count, |v| v < UNLABELED || v as i64 >= count as i64)
    }

    /// Fails on the first label (raster order) below -1. Used for maps whose label count is
    /// not known up front, such as ground truth.
    pub fn validate_min(&self) -> Result<()> {
        let count = self.max_label().map_or(0, |max| (max as i64 + 1).max(0) as u32);
        self.check_labels(count, |v| v < UNLABELED)
    }

    fn check_labels(&self, count: u32, invalid: impl Fn(i32) -> bool) -> Result<()> {
        for y in 0..self.height {
            if let Some((x, value)) = self.row(y).iter().enumerate().find(|(_, v)| invalid(**v)) {
                return Err(BridgeError::LabelOutOfRange {
                    value: *value,
                    x,
                    y,
                    count,
                });
            }
        }
        Ok(())
    }

    pub fn max_label(&self) -> Option<i32> {
        (0..self.height)
            .flat_map(|y| self.row(y).iter().copied())
            .filter(|v| *v != UNLABELED)
            .max()
    }

    pub fn to_labels(&self) -> Labels {
        let mut labels = Labels::new(self.width, self.height, UNLABELED);
        for y in 0..self.height {
            labels.data.get_row_mut(y).copy_from_slice(self.row(y));
        }
        labels
    }
}

impl std::fmt::Debug for LabelMap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelMap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}

/// Mutable label map view, a write target for segmentation output.
pub struct LabelMapMut<'a> {
    ptr: NonNull<i32>,
    width: usize,
    height: usize,
    stride: usize,
    _marker: PhantomData<&'a mut [i32]>,
}

// SAFETY: exclusive view; moving it to another thread moves the exclusive borrow with it.
unsafe impl Send for LabelMapMut<'_> {}

impl<'a> LabelMapMut<'a> {
    /// # Safety
    /// On success `ptr` must be valid for reads and writes of
    /// `stride * (height - 1) + width * 4` bytes for `'a`, aligned for `i32`, and not
    /// accessed through any other path while the view is alive.
    pub unsafe fn wrap(ptr: *mut i32, width: usize, height: usize, stride: usize) -> Result<Self> {
        let ptr = check_layout(ptr, width, height, stride)?;
        Ok(Self {
            ptr,
            width,
            height,
            stride,
            _marker: PhantomData,
        })
    }

    pub fn from_slice(data: &'a mut [i32], width: usize, height: usize) -> Result<Self> {
        if data.len() != width * height {
            return Err(BridgeError::InvalidShape(format!(
                "{} labels cannot fill {width}x{height}",
                data.len()
            )));
        }
        // SAFETY: the exclusive borrow covers exactly `width * height` labels.
        unsafe { Self::wrap(data.as_mut_ptr(), width, height, width * LABEL_SIZE) }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [i32] {
        assert!(y < self.height, "row index {y} out of bounds ({})", self.height);
        // SAFETY: see `LabelMap::row`; `&mut self` keeps the row borrow exclusive.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(y * (self.stride / LABEL_SIZE)),
                self.width,
            )
        }
    }

    pub fn fill(&mut self, value: i32) {
        for y in 0..self.height {
            self.row_mut(y).fill(value);
        }
    }

    /// Copies `source` into this view; dimensions must match.
    pub fn copy_from(&mut self, source: &LabelMap<'_>) -> Result<()> {
        if source.width() != self.width || source.height() != self.height {
            return Err(BridgeError::mismatch(
                (self.width, self.height),
                (source.width(), source.height()),
            ));
        }
        for y in 0..self.height {
            self.row_mut(y).copy_from_slice(source.row(y));
        }
        Ok(())
    }

    pub fn as_map(&self) -> LabelMap<'_> {
        LabelMap {
            ptr: self.ptr,
            width: self.width,
            height: self.height,
            stride: self.stride,
            _marker: PhantomData,
        }
    }
}

/// Owned, contiguous label map.
#[derive(Debug, Clone)]
pub struct Labels {
    pub data: Array2D<i32>,
}

impl Labels {
    pub fn new(width: usize, height: usize, value: i32) -> Self {
        Self {
            data: Array2D::from_fill(value, width, height),
        }
    }

    pub fn from_vec(data: Vec<i32>, width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(BridgeError::InvalidShape(format!(
                "label map of {width}x{height}"
            )));
        }
        Ok(Self {
            data: Array2D::from_slice(&data, width, height)?,
        })
    }

    pub fn width(&self) -> usize {
        self.data.width
    }

    pub fn height(&self) -> usize {
        self.data.height
    }

    pub fn as_slice(&self) -> &[i32] {
        self.data.as_slice()
    }

    pub fn as_map(&self) -> LabelMap<'_> {
        LabelMap {
            // SAFETY: AVec storage pointers are never null.
            ptr: unsafe { NonNull::new_unchecked(self.data.data.as_ptr() as *mut i32) },
            width: self.data.width,
            height: self.data.height,
            stride: self.data.width * LABEL_SIZE,
            _marker: PhantomData,
        }
    }

    pub fn as_map_mut(&mut self) -> LabelMapMut<'_> {
        LabelMapMut {
            // SAFETY: as in `as_map`.
            ptr: unsafe { NonNull::new_unchecked(self.data.data.as_mut_ptr()) },
            width: self.data.width,
            height: self.data.height,
            stride: self.data.width * LABEL_SIZE,
            _marker: PhantomData,
        }
    }
}

impl PartialEq for Labels {
    fn eq(&self, other: &Self) -> bool {
        self.width() == other.width()
            && self.height() == other.height()
            && self.as_slice() == other.as_slice()
    }
}
