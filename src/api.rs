//! The two caller entry points, over caller arrays.

use crate::adapter::{Adapter, MetricsReport, SuperpixelStats};
use crate::common::SegmentationParams;
use crate::error::Result;
use crate::marshal::{
    from_caller_array, hand_over, label_map_from_caller_array, ArrayDescriptor, CallerArray,
    HandoverPolicy,
};

/// Labels copied into a `(h, w)` `int32` caller array.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub labels: CallerArray,
    pub superpixels: u32,
    pub statistics: Option<Vec<SuperpixelStats>>,
}

/// Segments a caller image with the bundled backend.
pub fn segment(image: &ArrayDescriptor<'_>, params: &SegmentationParams) -> Result<Segmentation> {
    segment_with(&Adapter::default(), image, params)
}

pub fn segment_with(
    adapter: &Adapter,
    image: &ArrayDescriptor<'_>,
    params: &SegmentationParams,
) -> Result<Segmentation> {
    let handle = from_caller_array(image)?;
    let result = adapter.segment(&handle, params)?;
    let labels = hand_over(result.labels, HandoverPolicy::Copy).into_caller_array();
    Ok(Segmentation {
        labels,
        superpixels: result.superpixels,
        statistics: result.statistics,
    })
}

/// Scores caller label arrays with the bundled backend.
pub fn benchmark(
    image: &ArrayDescriptor<'_>,
    labels: &ArrayDescriptor<'_>,
    ground_truth: &ArrayDescriptor<'_>,
) -> Result<MetricsReport> {
    benchmark_with(&Adapter::default(), image, labels, ground_truth)
}

pub fn benchmark_with(
    adapter: &Adapter,
    image: &ArrayDescriptor<'_>,
    labels: &ArrayDescriptor<'_>,
    ground_truth: &ArrayDescriptor<'_>,
) -> Result<MetricsReport> {
    let handle = from_caller_array(image)?;
    let labels = label_map_from_caller_array(labels)?;
    let ground_truth = label_map_from_caller_array(ground_truth)?;
    adapter.benchmark(&handle, &labels, &ground_truth)
}
