use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Type of spatial distance, if it's Manhattan distance ([wikipedia](https://en.wikipedia.org/wiki/Taxicab_geometry))
/// or Euclidean distance ([wikipedia](https://en.wikipedia.org/wiki/Euclidean_distance)).
///
/// Color distance is always Manhattan (sum of absolute differences in Lab).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum DistanceMetric {
    /// Manhattan distance for spatial and color space.
    Manhattan = 0,
    /// Euclidean distance for spatial and Manhattan for color space.
    #[default]
    EuclideanSpatial = 1,
}

impl DistanceMetric {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(DistanceMetric::Manhattan),
            1 => Ok(DistanceMetric::EuclideanSpatial),
            other => Err(BridgeError::InvalidParameter(format!(
                "distance metric code {other}"
            ))),
        }
    }
}

/// Parameters of a segmentation call, the opaque configuration blob handed to the native
/// library.
///
/// Zero (or non-positive) numeric fields mean "use the library default", so an all-zero
/// blob is a valid request. Use [`SegmentationParams::resolved`] to see the effective values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationParams {
    /// Requested number of superpixels. This directly influences search region size (_S_)
    ///
    /// Which is calculated using: _S = sqrt((image width * height) / num_superpixels)_
    pub num_superpixels: u32,
    /// Higher means more compact superpixels -> this is about trading color accuracy for
    /// locality.
    pub compactness: f32,
    /// Number of assign/update rounds before the final full assignment.
    pub iterations: u32,
    /// Components smaller than _S² * min_size_factor_ are merged into a neighbour.
    pub min_size_factor: f32,
    /// By how much we advance on image row in the assignment rounds. 1 is no subsampling.
    pub subsample_stride: u8,
    pub distance_metric: DistanceMetric,
    /// Compute per-superpixel statistics after segmentation. Not forwarded to the library.
    pub statistics: bool,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            num_superpixels: 400,
            compactness: 10.0,
            iterations: 10,
            min_size_factor: 0.25,
            subsample_stride: 1,
            distance_metric: DistanceMetric::EuclideanSpatial,
            statistics: false,
        }
    }
}

impl SegmentationParams {
    /// All numeric fields zero: every value falls back to the library default.
    pub fn zeroed() -> Self {
        Self {
            num_superpixels: 0,
            compactness: 0.0,
            iterations: 0,
            min_size_factor: 0.0,
            subsample_stride: 0,
            distance_metric: DistanceMetric::Manhattan,
            statistics: false,
        }
    }

    /// Replaces unset fields with defaults.
    pub fn resolved(&self) -> Self {
        let defaults = Self::default();
        let positive = |v: f32, d: f32| if v.is_finite() && v > 0.0 { v } else { d };
        Self {
            num_superpixels: if self.num_superpixels == 0 {
                defaults.num_superpixels
            } else {
                self.num_superpixels
            },
            compactness: positive(self.compactness, defaults.compactness),
            iterations: if self.iterations == 0 {
                defaults.iterations
            } else {
                self.iterations
            },
            min_size_factor: positive(self.min_size_factor, defaults.min_size_factor),
            subsample_stride: self.subsample_stride.max(1),
            distance_metric: self.distance_metric,
            statistics: self.statistics,
        }
    }

    pub fn from_json(blob: &str) -> serde_json::Result<Self> {
        serde_json::from_str(blob)
    }
}
