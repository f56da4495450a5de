//! Superpixel benchmark measures.
//!
//! Overlap based measures skip pixels that are unlabeled in either map.

use crate::image_handle::ImageHandle;
use crate::label_map::{LabelMap, UNLABELED};
use std::collections::BTreeMap;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub boundary_recall: f64,
    pub undersegmentation_error: f64,
    pub achievable_segmentation_accuracy: f64,
    pub explained_variation: f64,
    pub compactness: f64,
    pub superpixels: u32,
}

/// Computes every measure. All three inputs must have the same dimensions.
pub fn benchmark(image: &ImageHandle<'_>, labels: &LabelMap<'_>, ground_truth: &LabelMap<'_>) -> Metrics {
    let overlap = Overlap::new(labels, ground_truth);
    Metrics {
        boundary_recall: boundary_recall(labels, ground_truth),
        undersegmentation_error: overlap.undersegmentation_error(),
        achievable_segmentation_accuracy: overlap.achievable_segmentation_accuracy(),
        explained_variation: explained_variation(image, labels),
        compactness: compactness(labels),
        superpixels: count_superpixels(labels),
    }
}

pub fn count_superpixels(labels: &LabelMap<'_>) -> u32 {
    let mut seen: Vec<i32> = (0..labels.height())
        .flat_map(|y| labels.row(y).iter().copied())
        .filter(|l| *l != UNLABELED)
        .collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len() as u32
}

fn is_boundary(labels: &LabelMap<'_>, x: usize, y: usize) -> bool {
    let value = labels.get(x, y);
    (x > 0 && labels.get(x - 1, y) != value)
        || (x + 1 < labels.width() && labels.get(x + 1, y) != value)
        || (y > 0 && labels.get(x, y - 1) != value)
        || (y + 1 < labels.height() && labels.get(x, y + 1) != value)
}

/// Fraction of ground truth boundary pixels with a superpixel boundary pixel within a
/// Chebyshev distance of `max(1, round(0.0025 * diagonal))`.
pub fn boundary_recall(labels: &LabelMap<'_>, ground_truth: &LabelMap<'_>) -> f64 {
    let width = labels.width();
    let height = labels.height();
    let diagonal = ((width * width + height * height) as f64).sqrt();
    let r = ((0.0025 * diagonal).round() as usize).max(1);

    // summed-area table of superpixel boundary pixels
    let mut integral = vec![0u32; (width + 1) * (height + 1)];
    for y in 0..height {
        let mut row_sum = 0u32;
        for x in 0..width {
            row_sum += is_boundary(labels, x, y) as u32;
            integral[(y + 1) * (width + 1) + x + 1] = integral[y * (width + 1) + x + 1] + row_sum;
        }
    }
    let window_sum = |x0: usize, y0: usize, x1: usize, y1: usize| -> u32 {
        let at = |x: usize, y: usize| integral[y * (width + 1) + x];
        at(x1, y1) + at(x0, y0) - at(x0, y1) - at(x1, y0)
    };

    let mut true_positives = 0u64;
    let mut false_negatives = 0u64;
    for y in 0..height {
        for x in 0..width {
            if !is_boundary(ground_truth, x, y) {
                continue;
            }
            let x0 = x.saturating_sub(r);
            let y0 = y.saturating_sub(r);
            let x1 = (x + r + 1).min(width);
            let y1 = (y + r + 1).min(height);
            if window_sum(x0, y0, x1, y1) > 0 {
                true_positives += 1;
            } else {
                false_negatives += 1;
            }
        }
    }
    if true_positives + false_negatives == 0 {
        return 1.0;
    }
    true_positives as f64 / (true_positives + false_negatives) as f64
}

struct Overlap {
    intersections: BTreeMap<(i32, i32), u64>,
    superpixel_sizes: BTreeMap<i32, u64>,
    pixels: u64,
}

impl Overlap {
    fn new(labels: &LabelMap<'_>, ground_truth: &LabelMap<'_>) -> Self {
        let mut overlap = Overlap {
            intersections: BTreeMap::new(),
            superpixel_sizes: BTreeMap::new(),
            pixels: 0,
        };
        for y in 0..labels.height() {
            for (s, g) in labels.row(y).iter().zip(ground_truth.row(y)) {
                if *s == UNLABELED || *g == UNLABELED {
                    continue;
                }
                *overlap.intersections.entry((*s, *g)).or_default() += 1;
                *overlap.superpixel_sizes.entry(*s).or_default() += 1;
                overlap.pixels += 1;
            }
        }
        overlap
    }

    /// Neubert and Protzel's formulation: every superpixel overlapping a ground truth
    /// segment contributes the smaller of its inside and outside parts.
    fn undersegmentation_error(&self) -> f64 {
        if self.pixels == 0 {
            return 0.0;
        }
        let leak: u64 = self
            .intersections
            .iter()
            .map(|((s, _), inside)| (*inside).min(self.superpixel_sizes[s] - inside))
            .sum();
        leak as f64 / self.pixels as f64
    }

    fn achievable_segmentation_accuracy(&self) -> f64 {
        if self.pixels == 0 {
            return 0.0;
        }
        let mut best: BTreeMap<i32, u64> = BTreeMap::new();
        for ((s, _), inside) in &self.intersections {
            let entry = best.entry(*s).or_default();
            *entry = (*entry).max(*inside);
        }
        best.values().sum::<u64>() as f64 / self.pixels as f64
    }
}

/// Share of the image's color variance explained by the superpixel means.
pub fn explained_variation(image: &ImageHandle<'_>, labels: &LabelMap<'_>) -> f64 {
    let channels = image.channels();
    let mut sums: BTreeMap<i32, (u64, Vec<f64>)> = BTreeMap::new();
    let mut total = vec![0f64; channels];
    let mut pixels = 0u64;
    for y in 0..image.height() {
        for (x, label) in labels.row(y).iter().enumerate() {
            if *label == UNLABELED {
                continue;
            }
            let entry = sums
                .entry(*label)
                .or_insert_with(|| (0, vec![0f64; channels]));
            entry.0 += 1;
            for c in 0..channels {
                let v = image.sample(x, y, c) as f64;
                entry.1[c] += v;
                total[c] += v;
            }
            pixels += 1;
        }
    }
    if pixels == 0 {
        return 0.0;
    }
    let mean: Vec<f64> = total.iter().map(|t| t / pixels as f64).collect();
    let mut denominator = 0f64;
    for y in 0..image.height() {
        for (x, label) in labels.row(y).iter().enumerate() {
            if *label == UNLABELED {
                continue;
            }
            for (c, m) in mean.iter().enumerate() {
                let d = image.sample(x, y, c) as f64 - m;
                denominator += d * d;
            }
        }
    }
    if denominator == 0.0 {
        return 1.0;
    }
    let numerator: f64 = sums
        .values()
        .map(|(size, sum)| {
            let n = *size as f64;
            sum.iter()
                .zip(&mean)
                .map(|(s, m)| {
                    let d = s / n - m;
                    n * d * d
                })
                .sum::<f64>()
        })
        .sum();
    numerator / denominator
}

/// Area weighted isoperimetric quotient `4πA / P²` of the superpixels.
pub fn compactness(labels: &LabelMap<'_>) -> f64 {
    let width = labels.width();
    let height = labels.height();
    let mut shapes: BTreeMap<i32, (u64, u64)> = BTreeMap::new();
    let mut pixels = 0u64;
    for y in 0..height {
        for x in 0..width {
            let value = labels.get(x, y);
            if value == UNLABELED {
                continue;
            }
            let differs = |nx: Option<usize>, ny: Option<usize>| match (nx, ny) {
                (Some(nx), Some(ny)) if nx < width && ny < height => labels.get(nx, ny) != value,
                _ => true,
            };
            let perimeter = differs(x.checked_sub(1), Some(y)) as u64
                + differs(Some(x + 1), Some(y)) as u64
                + differs(Some(x), y.checked_sub(1)) as u64
                + differs(Some(x), Some(y + 1)) as u64;
            let entry = shapes.entry(value).or_default();
            entry.0 += 1;
            entry.1 += perimeter;
            pixels += 1;
        }
    }
    if pixels == 0 {
        return 0.0;
    }
    shapes
        .values()
        .map(|(area, perimeter)| {
            let area = *area as f64;
            let perimeter = *perimeter as f64;
            (area / pixels as f64) * (4.0 * PI * area) / (perimeter * perimeter)
        })
        .sum()
}
