//! Conversion between caller arrays and bridge handles.
//!
//! Caller arrays are described the way the numpy array interface describes them: a data
//! pointer, a shape, byte strides per dimension and a dtype name. Incoming arrays are
//! wrapped without copying; outgoing arrays are always deep copies in caller-managed
//! memory, or an explicit [`OwnershipToken`](crate::native::OwnershipToken) handover.

use crate::arrays::ALIGN;
use crate::error::{BridgeError, Result};
use crate::image_handle::{ElementType, ImageHandle};
use crate::label_map::{LabelMap, Labels};
use crate::native::NativeLabels;
use aligned_vec::{AVec, ConstAlign};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::str::FromStr;
use tracing::debug;

/// Numpy dtype names. Only some of them can cross into the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl DType {
    pub const fn size(self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::Uint8 => 1,
            DType::Int16 | DType::Uint16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Int64 | DType::Uint64 | DType::Float64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Uint8 => "uint8",
            DType::Int16 => "int16",
            DType::Uint16 => "uint16",
            DType::Int32 => "int32",
            DType::Uint32 => "uint32",
            DType::Int64 => "int64",
            DType::Uint64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    /// The image element type this dtype maps to, if any.
    pub fn element_type(self) -> Option<ElementType> {
        match self {
            DType::Uint8 => Some(ElementType::U8),
            DType::Float32 => Some(ElementType::F32),
            _ => None,
        }
    }
}

impl From<ElementType> for DType {
    fn from(element_type: ElementType) -> Self {
        match element_type {
            ElementType::U8 => DType::Uint8,
            ElementType::F32 => DType::Float32,
        }
    }
}

impl FromStr for DType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "bool" => DType::Bool,
            "int8" => DType::Int8,
            "uint8" => DType::Uint8,
            "int16" => DType::Int16,
            "uint16" => DType::Uint16,
            "int32" => DType::Int32,
            "uint32" => DType::Uint32,
            "int64" => DType::Int64,
            "uint64" => DType::Uint64,
            "float32" => DType::Float32,
            "float64" => DType::Float64,
            other => {
                return Err(BridgeError::UnsupportedLayout(format!(
                    "unknown dtype `{other}`"
                )))
            }
        })
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Element types a caller array can be built from safely.
pub trait Element: Copy + 'static {
    const DTYPE: DType;
}

impl Element for u8 {
    const DTYPE: DType = DType::Uint8;
}

impl Element for i32 {
    const DTYPE: DType = DType::Int32;
}

impl Element for f32 {
    const DTYPE: DType = DType::Float32;
}

fn c_strides(shape: &[usize], item_size: usize) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut step = item_size as isize;
    for (stride, dim) in strides.iter_mut().zip(shape).rev() {
        *stride = step;
        step *= *dim as isize;
    }
    strides
}

/// A borrowed caller array: data pointer, shape, byte strides and dtype.
#[derive(Clone)]
pub struct ArrayDescriptor<'a> {
    data: *const u8,
    shape: Vec<usize>,
    strides: Vec<isize>,
    dtype: DType,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> ArrayDescriptor<'a> {
    /// # Safety
    /// Every element addressed by `shape` and `strides` must be readable for `'a` and must
    /// not be mutated while the descriptor or a handle derived from it is alive.
    pub unsafe fn from_raw_parts(
        data: *const u8,
        shape: &[usize],
        strides: &[isize],
        dtype: DType,
    ) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(BridgeError::InvalidShape(format!(
                "{} dimensions but {} strides",
                shape.len(),
                strides.len()
            )));
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            dtype,
            _marker: PhantomData,
        })
    }

    /// C-contiguous array over `data`.
    pub fn from_slice<T: Element>(data: &'a [T], shape: &[usize]) -> Result<Self> {
        let strides = c_strides(shape, T::DTYPE.size());
        Self::from_strided(data, shape, &strides)
    }

    /// Array over `data` with explicit byte strides. Negative strides are rejected.
    pub fn from_strided<T: Element>(
        data: &'a [T],
        shape: &[usize],
        strides: &[isize],
    ) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(BridgeError::InvalidShape(format!(
                "{} dimensions but {} strides",
                shape.len(),
                strides.len()
            )));
        }
        if let Some(stride) = strides.iter().find(|s| **s < 0) {
            return Err(BridgeError::UnsupportedLayout(format!(
                "negative stride {stride}"
            )));
        }
        if shape.iter().all(|d| *d > 0) {
            let overflow = || BridgeError::InvalidShape("strided view overflows usize".into());
            let extent = shape
                .iter()
                .zip(strides)
                .try_fold(T::DTYPE.size(), |acc, (d, s)| {
                    (d - 1)
                        .checked_mul(*s as usize)
                        .and_then(|span| acc.checked_add(span))
                })
                .ok_or_else(overflow)?;
            let len = std::mem::size_of_val(data);
            if extent > len {
                return Err(BridgeError::InvalidShape(format!(
                    "strided view spans {extent} bytes of a {len} byte buffer"
                )));
            }
        }
        // SAFETY: the extent check above keeps every element inside `data`.
        unsafe {
            Self::from_raw_parts(data.as_ptr() as *const u8, shape, strides, T::DTYPE)
        }
    }

    pub fn data(&self) -> *const u8 {
        self.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn is_c_contiguous(&self) -> bool {
        let expected = c_strides(&self.shape, self.dtype.size());
        self.shape
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(dim, (stride, want))| *dim <= 1 || stride == want)
    }
}

impl std::fmt::Debug for ArrayDescriptor<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayDescriptor")
            .field("data", &self.data)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("dtype", &self.dtype)
            .finish()
    }
}

/// Shared checks for the 2D and 3D layouts: rejects negative strides and requires the
/// dimensions after the first to be packed. Returns the row stride in bytes.
fn row_stride(array: &ArrayDescriptor<'_>) -> Result<usize> {
    if let Some(stride) = array.strides.iter().find(|s| **s < 0) {
        return Err(BridgeError::UnsupportedLayout(format!(
            "negative stride {stride}"
        )));
    }
    if let Some(dim) = array.shape.iter().position(|d| *d == 0) {
        return Err(BridgeError::InvalidShape(format!(
            "dimension {dim} of shape {:?} is empty",
            array.shape
        )));
    }
    let item_size = array.dtype.size();
    let mut packed = item_size;
    for axis in (1..array.ndim()).rev() {
        if array.shape[axis] > 1 && array.strides[axis] as usize != packed {
            return Err(BridgeError::UnsupportedLayout(format!(
                "axis {axis} has stride {} where {packed} bytes are required",
                array.strides[axis]
            )));
        }
        packed *= array.shape[axis];
    }
    // the stride of a single row is meaningless; treat it as packed
    if array.shape[0] == 1 {
        return Ok(packed);
    }
    Ok(array.strides[0] as usize)
}

/// Wraps a `(h, w)` or `(h, w, c)` `uint8`/`float32` array as an image handle.
pub fn from_caller_array<'a>(array: &ArrayDescriptor<'a>) -> Result<ImageHandle<'a>> {
    let element_type = array.dtype.element_type().ok_or_else(|| {
        BridgeError::UnsupportedLayout(format!("dtype {} cannot hold an image", array.dtype))
    })?;
    let channels = match array.ndim() {
        2 => 1,
        3 => array.shape[2],
        n => {
            return Err(BridgeError::UnsupportedLayout(format!(
                "images need 2 or 3 dimensions, got {n}"
            )))
        }
    };
    let stride = row_stride(array)?;
    debug!(shape = ?array.shape, dtype = %array.dtype, stride, "wrapping caller image");
    // SAFETY: the descriptor vouches for every element it addresses, and the checks above
    // make those elements exactly the rows `wrap` reads.
    unsafe {
        ImageHandle::wrap(
            array.data,
            array.shape[1],
            array.shape[0],
            channels,
            element_type,
            stride,
        )
    }
}

/// Wraps a `(h, w)` `int32` array as a label map.
pub fn label_map_from_caller_array<'a>(array: &ArrayDescriptor<'a>) -> Result<LabelMap<'a>> {
    if array.dtype != DType::Int32 {
        return Err(BridgeError::UnsupportedLayout(format!(
            "label maps are int32, got {}",
            array.dtype
        )));
    }
    if array.ndim() != 2 {
        return Err(BridgeError::UnsupportedLayout(format!(
            "label maps need 2 dimensions, got {}",
            array.ndim()
        )));
    }
    let stride = row_stride(array)?;
    // SAFETY: as in `from_caller_array`.
    unsafe { LabelMap::wrap(array.data as *const i32, array.shape[1], array.shape[0], stride) }
}

/// A C-contiguous array in caller-managed memory.
#[derive(Clone)]
pub struct CallerArray {
    bytes: AVec<u8, ConstAlign<ALIGN>>,
    shape: Vec<usize>,
    dtype: DType,
}

impl CallerArray {
    fn zeroed(shape: Vec<usize>, dtype: DType) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size();
        Self {
            bytes: AVec::from_iter(ALIGN, (0..len).map(|_| 0u8)),
            shape,
            dtype,
        }
    }

    /// Copies `data` into a new array of the given shape.
    pub fn from_elements<T: Element>(data: &[T], shape: &[usize]) -> Result<Self> {
        let count = shape.iter().product::<usize>();
        if count != data.len() {
            return Err(BridgeError::InvalidShape(format!(
                "{} elements cannot fill shape {shape:?}",
                data.len()
            )));
        }
        let bytes = std::mem::size_of_val(data);
        // SAFETY: `Element` is only implemented for plain numeric types.
        let raw = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, bytes) };
        Ok(Self {
            bytes: AVec::from_slice(ALIGN, raw),
            shape: shape.to_vec(),
            dtype: T::DTYPE,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> Vec<isize> {
        c_strides(&self.shape, self.dtype.size())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Borrows the array as a descriptor, the way a caller would pass it back in.
    pub fn descriptor(&self) -> ArrayDescriptor<'_> {
        ArrayDescriptor {
            data: self.bytes.as_ptr(),
            shape: self.shape.clone(),
            strides: self.strides(),
            dtype: self.dtype,
            _marker: PhantomData,
        }
    }

    fn typed<T: Element>(&self) -> Option<&[T]> {
        if self.dtype != T::DTYPE {
            return None;
        }
        // SAFETY: the storage is 64-byte aligned and holds `len / size` values of `T`.
        Some(unsafe {
            std::slice::from_raw_parts(
                self.bytes.as_ptr() as *const T,
                self.bytes.len() / T::DTYPE.size(),
            )
        })
    }

    fn typed_mut<T: Element>(&mut self) -> Option<&mut [T]> {
        if self.dtype != T::DTYPE {
            return None;
        }
        let len = self.bytes.len() / T::DTYPE.size();
        // SAFETY: as in `typed`, with exclusive access.
        Some(unsafe { std::slice::from_raw_parts_mut(self.bytes.as_mut_ptr() as *mut T, len) })
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        self.typed()
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        self.typed()
    }

    pub fn as_i32_mut(&mut self) -> Option<&mut [i32]> {
        self.typed_mut()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        self.typed()
    }

    /// Copies a `(h, w)` `int32` array into an owned label buffer.
    pub fn to_labels(&self) -> Result<Labels> {
        let map = label_map_from_caller_array(&self.descriptor())?;
        Ok(map.to_labels())
    }
}

impl PartialEq for CallerArray {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.shape == other.shape && self.as_bytes() == other.as_bytes()
    }
}

impl std::fmt::Debug for CallerArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerArray")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

/// Deep copy of a label map as a `(h, w)` `int32` array.
pub fn to_caller_array(labels: &LabelMap<'_>) -> CallerArray {
    let mut array = CallerArray::zeroed(vec![labels.height(), labels.width()], DType::Int32);
    let width = labels.width();
    if let Some(out) = array.as_i32_mut() {
        for (y, row) in out.chunks_exact_mut(width).enumerate() {
            row.copy_from_slice(labels.row(y));
        }
    }
    array
}

/// Deep copy of an image. Single-channel images come back as `(h, w)` arrays.
pub fn image_to_caller_array(image: &ImageHandle<'_>) -> CallerArray {
    let shape = if image.channels() == 1 {
        vec![image.height(), image.width()]
    } else {
        vec![image.height(), image.width(), image.channels()]
    };
    CallerArray {
        bytes: AVec::from_slice(ALIGN, &image.to_contiguous_bytes()),
        shape,
        dtype: image.element_type().into(),
    }
}

/// How native label memory leaves the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoverPolicy {
    /// Copy into caller memory and release the native buffer right away.
    #[default]
    Copy,
    /// Give the caller the ownership token.
    Transfer,
}

/// Label memory after handover; exactly one party owns it.
#[derive(Debug)]
pub enum Handover {
    Copied(CallerArray),
    Owned(NativeLabels),
}

impl Handover {
    pub fn width(&self) -> usize {
        match self {
            Handover::Copied(array) => array.shape()[1],
            Handover::Owned(labels) => labels.width(),
        }
    }

    pub fn height(&self) -> usize {
        match self {
            Handover::Copied(array) => array.shape()[0],
            Handover::Owned(labels) => labels.height(),
        }
    }

    /// Copies owned native labels out (releasing them); copied arrays pass through.
    pub fn into_caller_array(self) -> CallerArray {
        match self {
            Handover::Copied(array) => array,
            Handover::Owned(labels) => copy_and_release(labels),
        }
    }
}

fn copy_and_release(labels: NativeLabels) -> CallerArray {
    let array = to_caller_array(&labels.as_map());
    labels.release();
    array
}

/// Moves native labels out of the bridge according to `policy`.
pub fn hand_over(labels: NativeLabels, policy: HandoverPolicy) -> Handover {
    debug!(?policy, width = labels.width(), height = labels.height(), "handing over labels");
    match policy {
        HandoverPolicy::Copy => Handover::Copied(copy_and_release(labels)),
        HandoverPolicy::Transfer => Handover::Owned(labels),
    }
}
