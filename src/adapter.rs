//! Calls into the native library.
//!
//! The adapter holds nothing but an immutable [`NativeApi`] table, so one adapter can serve
//! any number of threads. Every call allocates its own descriptors and status block.

use crate::common::SegmentationParams;
use crate::error::{BridgeError, Result};
use crate::image_handle::ImageHandle;
use crate::label_map::{LabelMap, UNLABELED};
use crate::native::{
    NativeApi, NativeLabels, OwnershipToken, SpImage, SpLabels, SpLabelsView, SpMetrics,
    SpParams, SpStatus, SP_ERR_CONTRACT, SP_OK,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, warn};

/// One segmentation call: the image and its parameter blob.
#[derive(Debug, Clone)]
pub struct SegmentationRequest<'a> {
    pub image: ImageHandle<'a>,
    pub params: SegmentationParams,
}

/// Per-superpixel statistics computed from the returned labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperpixelStats {
    pub label: i32,
    pub area: u64,
    /// `(x, y)`
    pub centroid: [f64; 2],
    /// `[x_min, y_min, x_max, y_max]`, inclusive.
    pub bbox: [usize; 4],
    /// Mean of every channel, in the image's sample range.
    pub mean: Vec<f64>,
}

#[derive(Debug)]
pub struct SegmentationResult {
    pub labels: NativeLabels,
    pub superpixels: u32,
    pub statistics: Option<Vec<SuperpixelStats>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub boundary_recall: f64,
    pub undersegmentation_error: f64,
    pub achievable_segmentation_accuracy: f64,
    pub explained_variation: f64,
    pub compactness: f64,
    pub superpixels: u32,
}

impl From<SpMetrics> for MetricsReport {
    fn from(m: SpMetrics) -> Self {
        MetricsReport {
            boundary_recall: m.boundary_recall,
            undersegmentation_error: m.undersegmentation_error,
            achievable_segmentation_accuracy: m.achievable_segmentation_accuracy,
            explained_variation: m.explained_variation,
            compactness: m.compactness,
            superpixels: m.superpixels,
        }
    }
}

fn native_error(code: i32, status: &SpStatus) -> BridgeError {
    let mut message = status.message();
    if message.is_empty() {
        message = "native call failed without a message".to_string();
    }
    BridgeError::NativeLibraryError { code, message }
}

fn contract(err: BridgeError) -> BridgeError {
    BridgeError::NativeLibraryError {
        code: SP_ERR_CONTRACT,
        message: format!("library output broke the label contract: {err}"),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Adapter {
    api: NativeApi,
}

impl Adapter {
    pub fn new(api: NativeApi) -> Self {
        Self { api }
    }

    pub fn bundled() -> Self {
        Self::new(NativeApi::bundled())
    }

    #[cfg(feature = "system-library")]
    pub fn system() -> Self {
        Self::new(NativeApi::system())
    }

    pub fn api(&self) -> &NativeApi {
        &self.api
    }

    pub fn segment(
        &self,
        image: &ImageHandle<'_>,
        params: &SegmentationParams,
    ) -> Result<SegmentationResult> {
        self.run(SegmentationRequest {
            image: *image,
            params: params.clone(),
        })
    }

    /// Segments the request's image.
    ///
    /// The returned labels are checked before they are handed out: same size as the image,
    /// a count of at least one, and values in `[-1, count)`. A failed check releases the
    /// native memory and reports `SP_ERR_CONTRACT`.
    pub fn run(&self, request: SegmentationRequest<'_>) -> Result<SegmentationResult> {
        let SegmentationRequest { image, params } = request;
        let _span = debug_span!(
            "segment",
            width = image.width(),
            height = image.height(),
            channels = image.channels(),
            element_type = %image.element_type(),
        )
        .entered();

        let sp_image = SpImage::from_handle(&image);
        let sp_params = SpParams::from(&params);
        let mut raw = SpLabels::empty();
        let mut status = SpStatus::new();
        // SAFETY: every descriptor points at live memory for the duration of the call.
        let code = unsafe { (self.api.segment)(&sp_image, &sp_params, &mut raw, &mut status) };
        // SAFETY: whatever the library put into `raw` is ours to release, success or not.
        let token = unsafe { OwnershipToken::from_raw(raw, self.api.release_labels) };
        if code != SP_OK {
            drop(token);
            let err = native_error(code, &status);
            warn!(%err, "segmentation failed");
            return Err(err);
        }

        let labels = NativeLabels::new(token).map_err(contract)?;
        let superpixels = labels.count();
        let statistics = {
            let map = labels.as_map();
            map.validate_against(&image).map_err(contract)?;
            if superpixels == 0 {
                return Err(contract(BridgeError::InvalidShape(
                    "superpixel count is zero".to_string(),
                )));
            }
            map.validate_labels(superpixels).map_err(contract)?;
            params
                .statistics
                .then(|| superpixel_stats(&image, &map, superpixels))
        };
        debug!(superpixels, "segmentation finished");
        Ok(SegmentationResult {
            labels,
            superpixels,
            statistics,
        })
    }

    /// Scores `labels` against `ground_truth`. Both must match the image's size; this is
    /// checked before the library is called.
    pub fn benchmark(
        &self,
        image: &ImageHandle<'_>,
        labels: &LabelMap<'_>,
        ground_truth: &LabelMap<'_>,
    ) -> Result<MetricsReport> {
        let _span =
            debug_span!("benchmark", width = image.width(), height = image.height()).entered();
        labels.validate_against(image)?;
        ground_truth.validate_against(image)?;
        labels.validate_min()?;
        ground_truth.validate_min()?;

        let sp_image = SpImage::from_handle(image);
        let sp_labels = SpLabelsView::from_map(labels);
        let sp_ground_truth = SpLabelsView::from_map(ground_truth);
        let mut out = SpMetrics::default();
        let mut status = SpStatus::new();
        // SAFETY: every descriptor points at live memory for the duration of the call.
        let code = unsafe {
            (self.api.benchmark)(
                &sp_image,
                &sp_labels,
                &sp_ground_truth,
                &mut out,
                &mut status,
            )
        };
        if code != SP_OK {
            let err = native_error(code, &status);
            warn!(%err, "benchmark failed");
            return Err(err);
        }
        let report = MetricsReport::from(out);
        debug!(?report, "benchmark finished");
        Ok(report)
    }
}

#[derive(Clone)]
struct Accumulator {
    area: u64,
    sum_x: u64,
    sum_y: u64,
    bbox: [usize; 4],
    sums: Vec<f64>,
}

/// Area, centroid, bounding box and mean color of every non-empty superpixel.
pub fn superpixel_stats(
    image: &ImageHandle<'_>,
    labels: &LabelMap<'_>,
    count: u32,
) -> Vec<SuperpixelStats> {
    let channels = image.channels();
    let empty = Accumulator {
        area: 0,
        sum_x: 0,
        sum_y: 0,
        bbox: [usize::MAX, usize::MAX, 0, 0],
        sums: vec![0.0; channels],
    };
    let mut acc = vec![empty; count as usize];
    for y in 0..labels.height() {
        for (x, label) in labels.row(y).iter().enumerate() {
            if *label == UNLABELED {
                continue;
            }
            let a = &mut acc[*label as usize];
            a.area += 1;
            a.sum_x += x as u64;
            a.sum_y += y as u64;
            a.bbox = [a.bbox[0].min(x), a.bbox[1].min(y), a.bbox[2].max(x), a.bbox[3].max(y)];
            for (c, sum) in a.sums.iter_mut().enumerate() {
                *sum += image.sample(x, y, c) as f64;
            }
        }
    }
    acc.into_iter()
        .enumerate()
        .filter(|(_, a)| a.area > 0)
        .map(|(label, a)| {
            let n = a.area as f64;
            SuperpixelStats {
                label: label as i32,
                area: a.area,
                centroid: [a.sum_x as f64 / n, a.sum_y as f64 / n],
                bbox: a.bbox,
                mean: a.sums.iter().map(|s| s / n).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label_map::Labels;
    use crate::native::{
        guard, sp_bundled_release_labels, SpImage, SpParams, SP_ERR_INTERNAL,
        SP_ERR_INVALID_ARGUMENT,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gray(width: usize, height: usize) -> Vec<u8> {
        (0..width * height).map(|i| (i % width * 20) as u8).collect()
    }

    #[test]
    fn bundled_segment_with_statistics() {
        let pixels = gray(12, 8);
        let image = ImageHandle::from_slice(&pixels, 12, 8, 1, 12).unwrap();
        let params = SegmentationParams {
            num_superpixels: 4,
            statistics: true,
            ..SegmentationParams::default()
        };
        let result = Adapter::bundled().segment(&image, &params).unwrap();
        let stats = result.statistics.unwrap();
        assert_eq!(stats.len(), result.superpixels as usize);
        assert_eq!(stats.iter().map(|s| s.area).sum::<u64>(), 96);
        for s in &stats {
            assert!(s.bbox[0] <= s.bbox[2] && s.bbox[1] <= s.bbox[3]);
            assert!(s.centroid[0] >= s.bbox[0] as f64 && s.centroid[0] <= s.bbox[2] as f64);
            assert_eq!(s.mean.len(), 1);
        }
    }

    #[test]
    fn statistics_of_known_labels() {
        let pixels = [10u8, 20, 30, 40];
        let image = ImageHandle::from_slice(&pixels, 2, 2, 1, 2).unwrap();
        let labels = Labels::from_vec(vec![0, 0, -1, 1], 2, 2).unwrap();
        let stats = superpixel_stats(&image, &labels.as_map(), 3);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].area, 2);
        assert_eq!(stats[0].centroid, [0.5, 0.0]);
        assert_eq!(stats[0].mean, vec![15.0]);
        assert_eq!(stats[1].bbox, [1, 1, 1, 1]);
    }

    #[test]
    fn benchmark_rejects_mismatched_labels_before_calling() {
        let pixels = vec![0u8; 64 * 48];
        let image = ImageHandle::from_slice(&pixels, 64, 48, 1, 64).unwrap();
        let small = Labels::new(32, 48, 0);
        let full = Labels::new(64, 48, 0);
        let err = Adapter::bundled()
            .benchmark(&image, &small.as_map(), &full.as_map())
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::DimensionMismatch {
                expected_width: 64,
                expected_height: 48,
                width: 32,
                height: 48
            }
        );
    }

    unsafe extern "C" fn unreachable_benchmark(
        _image: *const SpImage,
        _labels: *const SpLabelsView,
        _ground_truth: *const SpLabelsView,
        _out: *mut SpMetrics,
        status: *mut SpStatus,
    ) -> i32 {
        guard(status, || panic!("library must not be called"))
    }

    #[test]
    fn benchmark_rejects_labels_below_unlabeled_before_calling() {
        let pixels = gray(2, 2);
        let image = ImageHandle::from_slice(&pixels, 2, 2, 1, 2).unwrap();
        let adapter = Adapter::new(NativeApi {
            benchmark: unreachable_benchmark,
            ..NativeApi::bundled()
        });
        let bad = Labels::from_vec(vec![-5, -5, 0, 0], 2, 2).unwrap();
        let good = Labels::from_vec(vec![0, 0, 1, -1], 2, 2).unwrap();
        for (labels, ground_truth) in [(&bad, &good), (&good, &bad)] {
            assert!(matches!(
                adapter.benchmark(&image, &labels.as_map(), &ground_truth.as_map()),
                Err(BridgeError::LabelOutOfRange { value: -5, x: 0, y: 0, .. })
            ));
        }
    }

    unsafe extern "C" fn panicking_segment(
        _image: *const SpImage,
        _params: *const SpParams,
        _out: *mut SpLabels,
        status: *mut SpStatus,
    ) -> i32 {
        guard(status, || panic!("cluster table corrupted"))
    }

    unsafe extern "C" fn failing_segment(
        _image: *const SpImage,
        _params: *const SpParams,
        _out: *mut SpLabels,
        status: *mut SpStatus,
    ) -> i32 {
        guard(status, || {
            Err((SP_ERR_INVALID_ARGUMENT, "stride is not supported".to_string()))
        })
    }

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_release(labels: *mut SpLabels) {
        RELEASED.fetch_add(1, Ordering::SeqCst);
        unsafe { sp_bundled_release_labels(labels) };
    }

    /// Claims one superpixel but writes label 5.
    unsafe extern "C" fn lying_segment(
        image: *const SpImage,
        _params: *const SpParams,
        out: *mut SpLabels,
        status: *mut SpStatus,
    ) -> i32 {
        guard(status, || {
            let image = unsafe { &*image };
            let len = image.width * image.height;
            let data: Box<[i32]> = vec![5; len].into_boxed_slice();
            let out = unsafe { &mut *out };
            *out = SpLabels {
                data: Box::into_raw(data) as *mut i32,
                width: image.width,
                height: image.height,
                stride: image.width * 4,
                count: 1,
            };
            Ok(())
        })
    }

    fn api_with(segment: crate::native::SegmentFn) -> NativeApi {
        NativeApi {
            segment,
            ..NativeApi::bundled()
        }
    }

    #[test]
    fn panics_become_native_errors() {
        let pixels = gray(4, 4);
        let image = ImageHandle::from_slice(&pixels, 4, 4, 1, 4).unwrap();
        let adapter = Adapter::new(api_with(panicking_segment));
        match adapter.segment(&image, &SegmentationParams::default()) {
            Err(BridgeError::NativeLibraryError { code, message }) => {
                assert_eq!(code, SP_ERR_INTERNAL);
                assert!(message.contains("cluster table corrupted"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn native_codes_and_messages_pass_through() {
        let pixels = gray(4, 4);
        let image = ImageHandle::from_slice(&pixels, 4, 4, 1, 4).unwrap();
        let adapter = Adapter::new(api_with(failing_segment));
        assert_eq!(
            adapter.segment(&image, &SegmentationParams::default()).unwrap_err(),
            BridgeError::NativeLibraryError {
                code: SP_ERR_INVALID_ARGUMENT,
                message: "stride is not supported".to_string()
            }
        );
    }

    #[test]
    fn contract_violations_release_native_memory() {
        let pixels = gray(4, 4);
        let image = ImageHandle::from_slice(&pixels, 4, 4, 1, 4).unwrap();
        let adapter = Adapter::new(NativeApi {
            segment: lying_segment,
            release_labels: counting_release,
            ..NativeApi::bundled()
        });
        let before = RELEASED.load(Ordering::SeqCst);
        match adapter.segment(&image, &SegmentationParams::default()) {
            Err(BridgeError::NativeLibraryError { code, .. }) => assert_eq!(code, SP_ERR_CONTRACT),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(RELEASED.load(Ordering::SeqCst), before + 1);
    }
}
