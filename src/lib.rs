//! Native buffer bridge for superpixel segmentation and benchmarking.
//!
//! This crate sits between a caller holding dense 2D arrays and a native library that
//! segments images into superpixels and scores label maps against ground truth. It wraps
//! caller memory without copying, validates shapes, strides and element types before any
//! native call, translates native failures into [`BridgeError`], and makes ownership of
//! label memory explicit: returned labels are either copied into caller memory or handed
//! over with an [`OwnershipToken`](native::OwnershipToken) that releases them exactly once.
//!
//! A SLIC backend (module [`engine`]) is bundled behind the same C ABI an external library
//! would implement, so the crate works on its own. With the `system-library` feature the
//! adapter can also be pointed at an externally built `superpixel_benchmark_c`.
//!
//! The following example segments a packed RGB image held in a caller array:
//!
//! ```rust
//! use superpixel_bridge::api;
//! use superpixel_bridge::common::SegmentationParams;
//! use superpixel_bridge::marshal::ArrayDescriptor;
//!
//! fn main() {
//!     let (width, height) = (32, 24);
//!     let pixels: Vec<u8> = (0..width * height * 3).map(|i| (i % 251) as u8).collect();
//!     let image = ArrayDescriptor::from_slice(&pixels, &[height, width, 3]).unwrap();
//!     let mut params = SegmentationParams::default();
//!     params.num_superpixels = 12;
//!     let result = api::segment(&image, &params).unwrap();
//!     assert_eq!(result.labels.shape(), &[height, width]);
//!     // the labels live in caller memory now; nothing is left to release
//!     let labels = result.labels.as_i32().unwrap();
//!     assert!(labels.iter().all(|l| (*l as u32) < result.superpixels));
//! }
//! ```
//!
//! Calls are synchronous and keep no state between them. Handles are plain read views: the
//! caller must not mutate wrapped memory while a call is using it.
//!
//! Panics inside the bundled backend are caught at the C boundary and reported as
//! `SP_ERR_INTERNAL`. A native abort cannot be intercepted and ends the process.

pub mod adapter;
pub mod api;
pub mod arrays;
pub mod common;
pub mod engine;
pub mod error;
pub mod image_handle;
pub mod label_map;
pub mod marshal;
pub mod native;
pub mod raster;

pub use error::{BridgeError, Result};
