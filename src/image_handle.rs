//! Read-only views of caller-owned pixel memory.

use crate::arrays::Array2D;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::str::FromStr;

/// Element type of one channel sample.
///
/// The discriminants are the dtype codes of the native ABI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ElementType {
    #[serde(rename = "uint8")]
    U8 = 1,
    #[serde(rename = "float32")]
    F32 = 2,
}

impl ElementType {
    /// Byte size of a single sample.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::F32 => 4,
        }
    }

    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(ElementType::U8),
            2 => Ok(ElementType::F32),
            other => Err(BridgeError::UnsupportedElementType(format!("code {other}"))),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElementType::U8 => "uint8",
            ElementType::F32 => "float32",
        }
    }
}

impl FromStr for ElementType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uint8" | "u8" => Ok(ElementType::U8),
            "float32" | "f32" => Ok(ElementType::F32),
            other => Err(BridgeError::UnsupportedElementType(other.to_string())),
        }
    }
}

impl Display for ElementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Borrowed, read-only view of a 2D interleaved image.
///
/// The handle never copies or frees the memory it points at. `stride` is the byte distance
/// between the first samples of consecutive rows and may include padding.
///
/// Handles are `Send + Sync`: any number of calls may read the same buffer at once as long
/// as the caller does not mutate it while a handle is alive. The bridge takes no locks.
#[derive(Clone, Copy)]
pub struct ImageHandle<'a> {
    ptr: NonNull<u8>,
    width: usize,
    height: usize,
    channels: usize,
    element_type: ElementType,
    stride: usize,
    _marker: PhantomData<&'a [u8]>,
}

// SAFETY: the handle is a shared read-only view; see the type docs for the caller obligation.
unsafe impl Send for ImageHandle<'_> {}
unsafe impl Sync for ImageHandle<'_> {}

impl<'a> ImageHandle<'a> {
    /// Wraps caller memory without copying.
    ///
    /// Checks are done in order: shape, pointer, stride.
    ///
    /// # Safety
    /// When this returns `Ok`, `ptr` must be valid for reads of
    /// `stride * (height - 1) + width * channels * element_type.size()` bytes for `'a`, and
    /// the memory must not be mutated while the handle (or a copy of it) is alive.
    pub unsafe fn wrap(
        ptr: *const u8,
        width: usize,
        height: usize,
        channels: usize,
        element_type: ElementType,
        stride: usize,
    ) -> Result<Self> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(BridgeError::InvalidShape(format!(
                "{width}x{height} with {channels} channels"
            )));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(BridgeError::NullPointer)?;
        let min = min_row_bytes(width, channels, element_type)?;
        if stride < min {
            return Err(BridgeError::InvalidStride { stride, min });
        }
        if stride.checked_mul(height).is_none() {
            return Err(BridgeError::InvalidShape(format!(
                "{height} rows of {stride} bytes overflow"
            )));
        }
        Ok(Self {
            ptr,
            width,
            height,
            channels,
            element_type,
            stride,
            _marker: PhantomData,
        })
    }

    /// Safe wrapper over a byte slice holding `uint8` samples.
    pub fn from_slice(
        data: &'a [u8],
        width: usize,
        height: usize,
        channels: usize,
        stride: usize,
    ) -> Result<Self> {
        // SAFETY: `check_len` guarantees the slice covers every row before it is handed out.
        let handle = unsafe {
            Self::wrap(data.as_ptr(), width, height, channels, ElementType::U8, stride)?
        };
        handle.check_len(data.len())?;
        Ok(handle)
    }

    /// Safe wrapper over `float32` samples. `stride` is still in bytes.
    pub fn from_f32_slice(
        data: &'a [f32],
        width: usize,
        height: usize,
        channels: usize,
        stride: usize,
    ) -> Result<Self> {
        // SAFETY: as in `from_slice`, with the length measured in bytes.
        let handle = unsafe {
            Self::wrap(
                data.as_ptr() as *const u8,
                width,
                height,
                channels,
                ElementType::F32,
                stride,
            )?
        };
        handle.check_len(std::mem::size_of_val(data))?;
        Ok(handle)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        let required = self.required_len();
        if len < required {
            return Err(BridgeError::InvalidShape(format!(
                "buffer of {len} bytes is shorter than the {required} bytes the view spans"
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Bytes of pixel data in one row, without padding.
    pub fn row_bytes(&self) -> usize {
        self.width * self.channels * self.element_type.size()
    }

    /// Bytes spanned from the first sample to the last one.
    pub fn required_len(&self) -> usize {
        self.stride * (self.height - 1) + self.row_bytes()
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == self.row_bytes()
    }

    /// The pixel bytes of row `y`, padding excluded.
    pub fn row(&self, y: usize) -> &'a [u8] {
        assert!(y < self.height, "row index {y} out of bounds ({})", self.height);
        // SAFETY: `wrap` established that every row lies inside the borrowed memory.
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr().add(y * self.stride), self.row_bytes())
        }
    }

    /// Channel `c` of pixel `(x, y)` as `f32`; `uint8` samples keep their 0..=255 range.
    pub fn sample(&self, x: usize, y: usize, c: usize) -> f32 {
        assert!(x < self.width && c < self.channels, "sample ({x}, {y}, {c}) out of bounds");
        let row = self.row(y);
        let index = x * self.channels + c;
        match self.element_type {
            ElementType::U8 => row[index] as f32,
            ElementType::F32 => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&row[index * 4..index * 4 + 4]);
                f32::from_ne_bytes(bytes)
            }
        }
    }

    /// Copies the pixels into a new contiguous byte vector.
    pub fn to_contiguous_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.row_bytes() * self.height);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }
}

impl std::fmt::Debug for ImageHandle<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("element_type", &self.element_type)
            .field("stride", &self.stride)
            .finish()
    }
}

fn min_row_bytes(width: usize, channels: usize, element_type: ElementType) -> Result<usize> {
    width
        .checked_mul(channels)
        .and_then(|v| v.checked_mul(element_type.size()))
        .ok_or_else(|| {
            BridgeError::InvalidShape(format!("row of {width}x{channels} samples overflows"))
        })
}

/// Contiguous image owned by Rust, e.g. decoded from disk.
#[derive(Debug, Clone)]
pub struct OwnedImage {
    rows: Array2D<u8>,
    width: usize,
    channels: usize,
    element_type: ElementType,
}

impl OwnedImage {
    /// Zero-filled image.
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        element_type: ElementType,
    ) -> Result<Self> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(BridgeError::InvalidShape(format!(
                "{width}x{height} with {channels} channels"
            )));
        }
        let row_bytes = min_row_bytes(width, channels, element_type)?;
        Ok(Self {
            rows: Array2D::from_fill(0u8, row_bytes, height),
            width,
            channels,
            element_type,
        })
    }

    pub fn from_u8(data: &[u8], width: usize, height: usize, channels: usize) -> Result<Self> {
        let mut image = Self::new(width, height, channels, ElementType::U8)?;
        if data.len() != image.rows.data.len() {
            return Err(BridgeError::InvalidShape(format!(
                "{} samples cannot fill {width}x{height}x{channels}",
                data.len()
            )));
        }
        image.rows.as_mut_slice().copy_from_slice(data);
        Ok(image)
    }

    pub fn from_f32(data: &[f32], width: usize, height: usize, channels: usize) -> Result<Self> {
        let mut image = Self::new(width, height, channels, ElementType::F32)?;
        if data.len() * 4 != image.rows.data.len() {
            return Err(BridgeError::InvalidShape(format!(
                "{} samples cannot fill {width}x{height}x{channels}",
                data.len()
            )));
        }
        for (out, value) in image.rows.as_mut_slice().chunks_exact_mut(4).zip(data) {
            out.copy_from_slice(&value.to_ne_bytes());
        }
        Ok(image)
    }

    /// Deep copy of any handle, dropping row padding.
    pub fn copy_from(handle: &ImageHandle<'_>) -> Self {
        let rows = Array2D {
            data: aligned_vec::AVec::from_slice(
                crate::arrays::ALIGN,
                &handle.to_contiguous_bytes(),
            ),
            width: handle.row_bytes(),
            height: handle.height(),
        };
        Self {
            rows,
            width: handle.width(),
            channels: handle.channels(),
            element_type: handle.element_type(),
        }
    }

    pub fn as_handle(&self) -> ImageHandle<'_> {
        ImageHandle {
            // SAFETY: AVec storage is never null, even when empty; the image is non-empty.
            ptr: unsafe { NonNull::new_unchecked(self.rows.data.as_ptr() as *mut u8) },
            width: self.width,
            height: self.rows.height,
            channels: self.channels,
            element_type: self.element_type,
            stride: self.rows.width,
            _marker: PhantomData,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.rows.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.rows.as_slice()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.rows.as_mut_slice()
    }
}
