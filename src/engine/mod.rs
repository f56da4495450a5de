//! Bundled reference backend behind the native ABI.
//!
//! This is a SLIC implementation (CIELAB color, grid seeding, windowed assign/update,
//! connectivity enforcement) plus the superpixel benchmark measures. The bridge only ever
//! reaches it through the `extern "C"` entry points in [`crate::native`], the same way it
//! would reach an external library.

pub mod cielab;
pub mod connectivity;
pub mod metrics;
pub mod slic;

use crate::arrays::LabImage;
use crate::common::SegmentationParams;
use crate::error::Result;
use crate::image_handle::ImageHandle;
use crate::label_map::Labels;
use slic::{iterate, search_region_size, Clusters};

/// Segments `image`, returning contiguous labels `0..count` and `count`.
///
/// Zero parameters are replaced by defaults and the requested number of superpixels is
/// clamped to the number of pixels. Images with more pixels than a `u32` index can address
/// fail with `InvalidShape` before any work is done.
pub fn segment(image: &ImageHandle<'_>, params: &SegmentationParams) -> Result<(Labels, u32)> {
    connectivity::pixel_count(image.width(), image.height())?;
    let params = params.resolved();
    let lab = LabImage::from_handle(image);
    let num_clusters = (params.num_superpixels as usize).clamp(1, lab.width * lab.height);
    let s = search_region_size(lab.width, lab.height, num_clusters);
    let mut clusters = Clusters::initialize_clusters(&lab, num_clusters);
    iterate(&lab, &params, &mut clusters, s);
    let min_size = ((s * s) as f32 * params.min_size_factor).round() as usize;
    connectivity::enforce_connectivity(&clusters.assignments, num_clusters, min_size)
}

#[cfg(test)]
mod tests {
    use super::segment;
    use crate::common::SegmentationParams;
    use crate::image_handle::ImageHandle;

    fn gradient(width: usize, height: usize) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| {
                let (x, y) = (i % width, i / width);
                [(x * 255 / width) as u8, (y * 255 / height) as u8, 128]
            })
            .collect()
    }

    #[test]
    fn labels_are_contiguous() {
        let pixels = gradient(64, 48);
        let image = ImageHandle::from_slice(&pixels, 64, 48, 3, 64 * 3).unwrap();
        let params = SegmentationParams {
            num_superpixels: 24,
            ..SegmentationParams::default()
        };
        let (labels, count) = segment(&image, &params).unwrap();
        assert!(count >= 1 && count <= 24);
        let mut seen = vec![false; count as usize];
        for label in labels.as_slice() {
            assert!(*label >= 0 && (*label as u32) < count);
            seen[*label as usize] = true;
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn tiny_image_with_zero_params() {
        let pixels = vec![0u8; 10 * 10 * 3];
        let image = ImageHandle::from_slice(&pixels, 10, 10, 3, 30).unwrap();
        let (labels, count) = segment(&image, &SegmentationParams::zeroed()).unwrap();
        assert_eq!((labels.width(), labels.height()), (10, 10));
        assert!(count >= 1);
        assert!(labels.as_slice().iter().all(|l| *l >= 0 && (*l as u32) < count));
    }

    #[test]
    fn single_pixel() {
        let pixels = [7u8];
        let image = ImageHandle::from_slice(&pixels, 1, 1, 1, 1).unwrap();
        let (labels, count) = segment(&image, &SegmentationParams::default()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(labels.as_slice(), &[0]);
    }
}
