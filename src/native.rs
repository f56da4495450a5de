//! C ABI of the native segmentation and benchmark library.
//!
//! The adapter only talks to a library through a [`NativeApi`] table of `extern "C"`
//! function pointers. [`NativeApi::bundled`] points at the entry points below, which run the
//! crate's own backend; with the `system-library` feature [`NativeApi::system`] points at an
//! externally built `superpixel_benchmark_c`.
//!
//! Error signalling convention: every call returns a status code (`SP_OK` on success) and
//! fills the caller-provided [`SpStatus`] with the same code and a message. There is no
//! global "last error", so concurrent calls never observe each other's failures.
//!
//! Panics inside the bundled backend are caught at the boundary and reported as
//! `SP_ERR_INTERNAL`. Aborts (`abort()`, segmentation faults, `panic = "abort"` builds)
//! cannot be intercepted and take the process down.

use crate::common::{DistanceMetric, SegmentationParams};
use crate::engine;
use crate::error::{BridgeError, Result};
use crate::image_handle::{ElementType, ImageHandle};
use crate::label_map::{LabelMap, Labels};
use std::any::Any;
use std::ffi::c_char;
use std::mem::ManuallyDrop;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;

pub const SP_OK: i32 = 0;
pub const SP_ERR_INVALID_ARGUMENT: i32 = 1;
pub const SP_ERR_ALLOCATION: i32 = 2;
/// The library failed internally (for the bundled backend: a caught panic).
pub const SP_ERR_INTERNAL: i32 = 3;
/// The library returned output that breaks the label map contract. Raised by the adapter.
pub const SP_ERR_CONTRACT: i32 = 4;

pub const SP_STATUS_MESSAGE_LEN: usize = 256;

/// Image descriptor. `dtype` is an [`ElementType`] code, `stride` is in bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SpImage {
    pub data: *const u8,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub dtype: u32,
    pub stride: usize,
}

impl SpImage {
    pub fn from_handle(image: &ImageHandle<'_>) -> Self {
        SpImage {
            data: image.as_ptr(),
            width: image.width(),
            height: image.height(),
            channels: image.channels(),
            dtype: image.element_type().code(),
            stride: image.stride(),
        }
    }

    /// # Safety
    /// `data` must satisfy the contract of [`ImageHandle::wrap`] for `'a`.
    pub unsafe fn as_handle<'a>(&self) -> Result<ImageHandle<'a>> {
        let element_type = ElementType::from_code(self.dtype)?;
        ImageHandle::wrap(
            self.data,
            self.width,
            self.height,
            self.channels,
            element_type,
            self.stride,
        )
    }
}

/// Borrowed label map passed into the library.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SpLabelsView {
    pub data: *const i32,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
}

impl SpLabelsView {
    pub fn from_map(labels: &LabelMap<'_>) -> Self {
        SpLabelsView {
            data: labels.as_ptr(),
            width: labels.width(),
            height: labels.height(),
            stride: labels.stride(),
        }
    }

    /// # Safety
    /// `data` must satisfy the contract of [`LabelMap::wrap`] for `'a`.
    pub unsafe fn as_map<'a>(&self) -> Result<LabelMap<'a>> {
        LabelMap::wrap(self.data, self.width, self.height, self.stride)
    }
}

/// Label map allocated by the library. It stays owned by the library until it is handed
/// to the library's `release_labels` exactly once.
#[repr(C)]
#[derive(Debug)]
pub struct SpLabels {
    pub data: *mut i32,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub count: u32,
}

impl SpLabels {
    pub const fn empty() -> Self {
        SpLabels {
            data: std::ptr::null_mut(),
            width: 0,
            height: 0,
            stride: 0,
            count: 0,
        }
    }
}

impl Default for SpLabels {
    fn default() -> Self {
        Self::empty()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SpParams {
    pub num_superpixels: u32,
    pub compactness: f32,
    pub iterations: u32,
    pub min_size_factor: f32,
    pub subsample_stride: u32,
    pub distance_metric: u32,
}

impl From<&SegmentationParams> for SpParams {
    fn from(params: &SegmentationParams) -> Self {
        SpParams {
            num_superpixels: params.num_superpixels,
            compactness: params.compactness,
            iterations: params.iterations,
            min_size_factor: params.min_size_factor,
            subsample_stride: params.subsample_stride as u32,
            distance_metric: params.distance_metric as u32,
        }
    }
}

impl TryFrom<&SpParams> for SegmentationParams {
    type Error = BridgeError;

    fn try_from(params: &SpParams) -> Result<Self> {
        Ok(SegmentationParams {
            num_superpixels: params.num_superpixels,
            compactness: params.compactness,
            iterations: params.iterations,
            min_size_factor: params.min_size_factor,
            subsample_stride: params.subsample_stride.min(u8::MAX as u32) as u8,
            distance_metric: DistanceMetric::from_code(params.distance_metric)?,
            statistics: false,
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SpMetrics {
    pub boundary_recall: f64,
    pub undersegmentation_error: f64,
    pub achievable_segmentation_accuracy: f64,
    pub explained_variation: f64,
    pub compactness: f64,
    pub superpixels: u32,
}

impl From<engine::metrics::Metrics> for SpMetrics {
    fn from(m: engine::metrics::Metrics) -> Self {
        SpMetrics {
            boundary_recall: m.boundary_recall,
            undersegmentation_error: m.undersegmentation_error,
            achievable_segmentation_accuracy: m.achievable_segmentation_accuracy,
            explained_variation: m.explained_variation,
            compactness: m.compactness,
            superpixels: m.superpixels,
        }
    }
}

/// Per-call status out-parameter.
#[repr(C)]
pub struct SpStatus {
    pub code: i32,
    /// NUL-terminated, truncated to fit.
    pub message: [c_char; SP_STATUS_MESSAGE_LEN],
}

impl SpStatus {
    pub fn new() -> Self {
        SpStatus {
            code: SP_OK,
            message: [0; SP_STATUS_MESSAGE_LEN],
        }
    }

    pub fn set(&mut self, code: i32, message: &str) {
        self.code = code;
        self.message = [0; SP_STATUS_MESSAGE_LEN];
        let mut end = message.len().min(SP_STATUS_MESSAGE_LEN - 1);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        for (out, byte) in self.message.iter_mut().zip(&message.as_bytes()[..end]) {
            *out = *byte as c_char;
        }
    }

    pub fn message(&self) -> String {
        let bytes: Vec<u8> = self
            .message
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Default for SpStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SegmentFn = unsafe extern "C" fn(
    image: *const SpImage,
    params: *const SpParams,
    out: *mut SpLabels,
    status: *mut SpStatus,
) -> i32;

pub type BenchmarkFn = unsafe extern "C" fn(
    image: *const SpImage,
    labels: *const SpLabelsView,
    ground_truth: *const SpLabelsView,
    out: *mut SpMetrics,
    status: *mut SpStatus,
) -> i32;

pub type ReleaseLabelsFn = unsafe extern "C" fn(labels: *mut SpLabels);

/// Function table of one native library.
#[derive(Clone, Copy)]
pub struct NativeApi {
    pub segment: SegmentFn,
    pub benchmark: BenchmarkFn,
    pub release_labels: ReleaseLabelsFn,
}

impl NativeApi {
    /// The backend compiled into this crate.
    pub const fn bundled() -> Self {
        NativeApi {
            segment: sp_bundled_segment,
            benchmark: sp_bundled_benchmark,
            release_labels: sp_bundled_release_labels,
        }
    }

    /// The externally built `superpixel_benchmark_c` library.
    #[cfg(feature = "system-library")]
    pub const fn system() -> Self {
        NativeApi {
            segment: system::sp_segment,
            benchmark: system::sp_benchmark,
            release_labels: system::sp_release_labels,
        }
    }
}

impl Default for NativeApi {
    fn default() -> Self {
        Self::bundled()
    }
}

impl std::fmt::Debug for NativeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeApi")
            .field("segment", &(self.segment as usize as *const ()))
            .field("benchmark", &(self.benchmark as usize as *const ()))
            .field("release_labels", &(self.release_labels as usize as *const ()))
            .finish()
    }
}

#[cfg(feature = "system-library")]
mod system {
    use super::{SpImage, SpLabels, SpLabelsView, SpMetrics, SpParams, SpStatus};

    #[link(name = "superpixel_benchmark_c")]
    extern "C" {
        pub fn sp_segment(
            image: *const SpImage,
            params: *const SpParams,
            out: *mut SpLabels,
            status: *mut SpStatus,
        ) -> i32;
        pub fn sp_benchmark(
            image: *const SpImage,
            labels: *const SpLabelsView,
            ground_truth: *const SpLabelsView,
            out: *mut SpMetrics,
            status: *mut SpStatus,
        ) -> i32;
        pub fn sp_release_labels(labels: *mut SpLabels);
    }
}

/// Ownership of one native label allocation.
///
/// Whoever holds the token is the only party allowed to release the memory; it is
/// released exactly once, when the token is dropped (or [`OwnershipToken::release`]d).
/// Moving the token moves the obligation.
pub struct OwnershipToken {
    raw: SpLabels,
    release: ReleaseLabelsFn,
}

// SAFETY: the token is the unique owner of the allocation.
unsafe impl Send for OwnershipToken {}

impl OwnershipToken {
    /// # Safety
    /// `raw` must have been produced by the library whose release function is `release`, and
    /// no other party may release it.
    pub unsafe fn from_raw(raw: SpLabels, release: ReleaseLabelsFn) -> Self {
        OwnershipToken { raw, release }
    }

    /// Gives up ownership without releasing, e.g. to pass it across a C boundary. The
    /// receiver must eventually call `release` on the returned labels exactly once.
    pub fn into_raw(self) -> (SpLabels, ReleaseLabelsFn) {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so `raw` is moved out exactly once.
        let raw = unsafe { std::ptr::read(&this.raw) };
        (raw, this.release)
    }

    pub fn raw(&self) -> &SpLabels {
        &self.raw
    }

    pub fn release(self) {
        drop(self)
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        if self.raw.data.is_null() {
            return;
        }
        // SAFETY: guaranteed by `from_raw`; drop runs once.
        unsafe { (self.release)(&mut self.raw) };
        self.raw.data = std::ptr::null_mut();
        tracing::trace!(
            width = self.raw.width,
            height = self.raw.height,
            "released native label map"
        );
    }
}

/// Label map owned through an [`OwnershipToken`], with its layout already validated.
pub struct NativeLabels {
    token: OwnershipToken,
    ptr: NonNull<i32>,
}

// SAFETY: `ptr` points into memory the token owns exclusively; shared access only reads.
unsafe impl Send for NativeLabels {}
unsafe impl Sync for NativeLabels {}

impl NativeLabels {
    /// Validates the layout of the token's labels. On failure the token is dropped, which
    /// releases the memory.
    pub fn new(token: OwnershipToken) -> Result<Self> {
        let raw = token.raw();
        // SAFETY: the token owns `raw.data` until it is dropped, which outlives the check.
        unsafe { LabelMap::wrap(raw.data, raw.width, raw.height, raw.stride) }?;
        let ptr = NonNull::new(raw.data).ok_or(BridgeError::NullPointer)?;
        Ok(NativeLabels { token, ptr })
    }

    pub fn as_map(&self) -> LabelMap<'_> {
        let raw = self.token.raw();
        // SAFETY: layout validated in `new`; the memory lives as long as the token.
        unsafe { LabelMap::from_parts(self.ptr, raw.width, raw.height, raw.stride) }
    }

    pub fn width(&self) -> usize {
        self.token.raw().width
    }

    pub fn height(&self) -> usize {
        self.token.raw().height
    }

    /// Superpixel count the library declared.
    pub fn count(&self) -> u32 {
        self.token.raw().count
    }

    pub fn into_token(self) -> OwnershipToken {
        self.token
    }

    pub fn release(self) {
        self.token.release()
    }
}

impl std::fmt::Debug for NativeLabels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLabels")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("count", &self.count())
            .finish()
    }
}

type Failure = (i32, String);

fn invalid(err: BridgeError) -> Failure {
    (SP_ERR_INVALID_ARGUMENT, err.to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Runs `f`, turning its error or panic into a status code written to `status`.
pub(crate) fn guard<F>(status: *mut SpStatus, f: F) -> i32
where
    F: FnOnce() -> std::result::Result<(), Failure>,
{
    let (code, message) = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => (SP_OK, String::new()),
        Ok(Err(failure)) => failure,
        Err(payload) => (SP_ERR_INTERNAL, panic_message(payload.as_ref())),
    };
    // SAFETY: callers pass either null or a valid, exclusive status pointer.
    if let Some(status) = unsafe { status.as_mut() } {
        status.set(code, &message);
    }
    code
}

fn labels_into_raw(labels: Labels, count: u32) -> SpLabels {
    let width = labels.width();
    let height = labels.height();
    let boxed: Box<[i32]> = labels.as_slice().into();
    SpLabels {
        data: Box::into_raw(boxed) as *mut i32,
        width,
        height,
        stride: width * std::mem::size_of::<i32>(),
        count,
    }
}

/// Segments `image`; on success `out` owns a new label map that must be passed to
/// [`sp_bundled_release_labels`]. `out` is left untouched on failure.
///
/// # Safety
/// Pointers must be null or valid; `image` must describe readable memory.
#[no_mangle]
pub unsafe extern "C" fn sp_bundled_segment(
    image: *const SpImage,
    params: *const SpParams,
    out: *mut SpLabels,
    status: *mut SpStatus,
) -> i32 {
    guard(status, || {
        // SAFETY: forwarded from the caller contract.
        let (image, params, out) = unsafe { (image.as_ref(), params.as_ref(), out.as_mut()) };
        let (Some(image), Some(params), Some(out)) = (image, params, out) else {
            return Err(invalid(BridgeError::NullPointer));
        };
        // SAFETY: the descriptor vouches for its memory.
        let handle = unsafe { image.as_handle() }.map_err(invalid)?;
        let params = SegmentationParams::try_from(params).map_err(invalid)?;
        let (labels, count) = engine::segment(&handle, &params).map_err(invalid)?;
        *out = labels_into_raw(labels, count);
        Ok(())
    })
}

/// Computes the benchmark measures of `labels` against `ground_truth`.
///
/// # Safety
/// Pointers must be null or valid; descriptors must describe readable memory.
#[no_mangle]
pub unsafe extern "C" fn sp_bundled_benchmark(
    image: *const SpImage,
    labels: *const SpLabelsView,
    ground_truth: *const SpLabelsView,
    out: *mut SpMetrics,
    status: *mut SpStatus,
) -> i32 {
    guard(status, || {
        // SAFETY: forwarded from the caller contract.
        let (image, labels, ground_truth, out) = unsafe {
            (
                image.as_ref(),
                labels.as_ref(),
                ground_truth.as_ref(),
                out.as_mut(),
            )
        };
        let (Some(image), Some(labels), Some(ground_truth), Some(out)) =
            (image, labels, ground_truth, out)
        else {
            return Err(invalid(BridgeError::NullPointer));
        };
        // SAFETY: the descriptors vouch for their memory.
        let (handle, labels, ground_truth) = unsafe {
            (
                image.as_handle().map_err(invalid)?,
                labels.as_map().map_err(invalid)?,
                ground_truth.as_map().map_err(invalid)?,
            )
        };
        labels.validate_against(&handle).map_err(invalid)?;
        ground_truth.validate_against(&handle).map_err(invalid)?;
        *out = engine::metrics::benchmark(&handle, &labels, &ground_truth).into();
        Ok(())
    })
}

/// Frees a label map returned by [`sp_bundled_segment`] and nulls its data pointer.
/// Null pointers are ignored.
///
/// # Safety
/// `labels` must be null or point at labels produced by `sp_bundled_segment`.
#[no_mangle]
pub unsafe extern "C" fn sp_bundled_release_labels(labels: *mut SpLabels) {
    // SAFETY: see the function contract.
    let Some(labels) = (unsafe { labels.as_mut() }) else {
        return;
    };
    if labels.data.is_null() {
        return;
    }
    let len = labels.stride / std::mem::size_of::<i32>() * labels.height;
    // SAFETY: the allocation was a boxed slice of exactly `len` labels.
    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(labels.data, len)) });
    labels.data = std::ptr::null_mut();
}
