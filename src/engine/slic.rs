use crate::arrays::{Array2D, LabImage};
use crate::common::{DistanceMetric, SegmentationParams};
use crate::engine::cielab::tables::OUTPUT_SHIFT;
use assume::assume;
use multiversion::multiversion;
use rayon::prelude::*;

/// Assignment of a pixel no cluster has claimed yet.
pub const UNASSIGNED: u32 = u32::MAX;

/// Struct of SLIC cluster/superpixel.
///
/// Fields `x`, `y`, `l`, `a`, `b`, `num_members` are updated by `slic::update()`.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    /// x position of center (number of column (starting from 0))
    pub x: usize,
    /// y position of center
    pub y: usize,
    /// Average L color of cluster
    pub l: u8,
    /// Average a color of cluster
    pub a: u8,
    /// Average b color of cluster
    pub b: u8,
    /// Number of cluster (used in assignment)
    pub number: u32,
    /// Number of pixels inside cluster
    pub num_members: u32,
}

/// Convenient struct for passing values around.
pub struct Clusters {
    /// For every pixel in image this stores to which cluster it belongs (see `Cluster.number`).
    pub assignments: Array2D<u32>,
    pub clusters: Vec<Cluster>,
}

impl Clusters {
    /// Seeds `num_clusters` clusters on a regular grid.
    ///
    /// Rows get `num_clusters / rows` seeds each and the remainder is spread over every
    /// other row. Seeds that do not fit the grid are put in the image center.
    pub fn initialize_clusters(image: &LabImage, num_clusters: usize) -> Clusters {
        assert!(num_clusters > 0);
        let mut clusters = Clusters {
            assignments: Array2D::from_fill(UNASSIGNED, image.width, image.height),
            clusters: Vec::with_capacity(num_clusters),
        };
        let n_y = ((num_clusters as f32).sqrt() as usize).max(1);
        let mut n_xs: Vec<usize> = vec![num_clusters / n_y; n_y];
        let mut remainder = num_clusters % n_y;
        let mut row = 0;
        while remainder > 0 {
            n_xs[row] += 1;
            row += 2;
            if row >= n_y {
                row = 1;
            }
            remainder -= 1;
        }
        let h = image.height.div_ceil(n_y);
        let push = |x: usize, y: usize, clusters: &mut Clusters| {
            let p = image.get_pixel(x, y);
            let number = clusters.clusters.len() as u32;
            clusters.clusters.push(Cluster {
                x,
                y,
                l: p[0],
                a: p[1],
                b: p[2],
                number,
                ..Cluster::default()
            });
        };
        'rows: for i in (0..image.height).step_by(h) {
            let w = image.width.div_ceil(n_xs[(i / h).min(n_y - 1)]);
            for j in (0..image.width).step_by(w) {
                if clusters.clusters.len() >= num_clusters {
                    break 'rows;
                }
                let center_y = (i + h / 2).min(image.height - 1);
                let center_x = (j + w / 2).min(image.width - 1);
                push(center_x, center_y, &mut clusters);
            }
        }
        while clusters.clusters.len() < num_clusters {
            push(image.width / 2, image.height / 2, &mut clusters);
        }
        debug_assert_eq!(clusters.clusters.len(), num_clusters);
        clusters
    }
}

/// Grid spacing _S_ for `num_clusters` seeds, at least one pixel.
pub fn search_region_size(width: usize, height: usize, num_clusters: usize) -> usize {
    (((width * height) as f32 / num_clusters as f32).sqrt() as usize).max(1)
}

/// This function computes LUT for spatial distances over the `(2S+1)²` search window.
pub fn compute_spatial_lut(params: &SegmentationParams, search_region_size: usize) -> Array2D<u32> {
    let s = search_region_size;
    let coef = (params.compactness / s as f32) * (1 << OUTPUT_SHIFT) as f32;
    let size = 2 * s + 1;
    let mut lut: Array2D<u32> = Array2D::from_fill(u32::MAX, size, size);
    for i in 0..size {
        for j in 0..size {
            let (dx, dy) = (s.abs_diff(j) as f32, s.abs_diff(i) as f32);
            let distance = match params.distance_metric {
                DistanceMetric::Manhattan => dx + dy,
                DistanceMetric::EuclideanSpatial => dx.hypot(dy),
            };
            lut[(j, i)] = (coef * distance) as u32;
        }
    }
    lut
}

/// This function is the main loop.
///
/// The steps are:
/// - N iterations
///     - assign (every `subsample_stride`-th row, starting one row later each iteration)
///     - update
/// - full assign
///
/// Connectivity is enforced separately, see `connectivity::enforce_connectivity`.
pub fn iterate(
    image: &LabImage,
    params: &SegmentationParams,
    clusters: &mut Clusters,
    search_region_size: usize,
) {
    let lut = compute_spatial_lut(params, search_region_size);
    let mut min_distances = Array2D::from_fill(u32::MAX, image.width, image.height);
    let stride = (params.subsample_stride as usize).max(1);
    let mut subsample_start = 0;
    for _ in 0..params.iterations {
        assign(
            image,
            clusters,
            &mut min_distances,
            &lut,
            search_region_size,
            stride,
            subsample_start,
        );
        update(clusters, image, stride, subsample_start);
        subsample_start = (subsample_start + 1) % stride;
    }
    assign(
        image,
        clusters,
        &mut min_distances,
        &lut,
        search_region_size,
        1,
        0,
    );
}

/// This function implements the assign step in SLIC algorithm.
///
/// Rows are processed in parallel. Within a row, clusters are visited in order of their
/// number and a pixel only changes owner on a strictly smaller distance, so the result does
/// not depend on the number of threads.
pub fn assign(
    image: &LabImage,
    clusters: &mut Clusters,
    min_distances: &mut Array2D<u32>,
    spatial_distance_lut: &Array2D<u32>,
    search_region_size: usize,
    subsample_stride: usize,
    subsample_start: usize,
) {
    assert!(
        subsample_stride > 0,
        "Subsample stride must be higher than zero."
    );
    let Clusters {
        assignments,
        clusters,
    } = clusters;
    let clusters: &[Cluster] = clusters;
    let width = image.width;
    assignments
        .as_mut_slice()
        .par_chunks_mut(width)
        .zip(min_distances.as_mut_slice().par_chunks_mut(width))
        .enumerate()
        .filter(|(y, _)| *y >= subsample_start && (*y - subsample_start) % subsample_stride == 0)
        .for_each(|(y, (assignment_row, distance_row))| {
            distance_row.fill(u32::MAX);
            assign_row(
                y,
                image,
                clusters,
                assignment_row,
                distance_row,
                spatial_distance_lut,
                search_region_size,
            );
        });
}

#[multiversion(targets = "simd")]
fn assign_row(
    y: usize,
    image: &LabImage,
    clusters: &[Cluster],
    assignment_row: &mut [u32],
    distance_row: &mut [u32],
    spatial_distance_lut: &Array2D<u32>,
    search_region_size: usize,
) {
    let s = search_region_size;
    let image_row = image.get_row(y);
    for cluster in clusters.iter().filter(|c| c.y.abs_diff(y) <= s) {
        let lut_y = y + s - cluster.y;
        assume!(unsafe: lut_y < spatial_distance_lut.height, "lut row {lut_y}");
        let lut_row = spatial_distance_lut.get_row(lut_y);
        let left = cluster.x.saturating_sub(s);
        let right = (cluster.x + s).min(image.width - 1);
        let lut_left = left + s - cluster.x;
        let pixels = image_row[left * 4..(right + 1) * 4].chunks_exact(4);
        for (((pixel, spatial), distance), assignment) in pixels
            .zip(&lut_row[lut_left..])
            .zip(&mut distance_row[left..=right])
            .zip(&mut assignment_row[left..=right])
        {
            let color = pixel[0].abs_diff(cluster.l) as u32
                + pixel[1].abs_diff(cluster.a) as u32
                + pixel[2].abs_diff(cluster.b) as u32;
            let d = color + spatial;
            if d < *distance {
                *distance = d;
                *assignment = cluster.number;
            }
        }
    }
}

/// This function does the update step.
///
/// Instead of median, average is used. Only the rows the preceding assign step visited are
/// accumulated.
#[multiversion(targets = "simd")]
pub fn update(
    clusters: &mut Clusters,
    image: &LabImage,
    subsample_stride: usize,
    subsample_start: usize,
) {
    let num_clusters = clusters.clusters.len();
    let assignments = &clusters.assignments;
    // per cluster: members, sum y, sum x, sum L, sum a, sum b
    let totals: Vec<[u64; 6]> = (subsample_start..image.height)
        .into_par_iter()
        .step_by(subsample_stride)
        .fold(
            || vec![[0u64; 6]; num_clusters],
            |mut acc, row| {
                let image_row = image.get_row(row);
                for (column, (pixel, assignment)) in image_row
                    .chunks_exact(4)
                    .zip(assignments.get_row(row))
                    .enumerate()
                {
                    if *assignment == UNASSIGNED {
                        continue;
                    }
                    let entry = &mut acc[*assignment as usize];
                    entry[0] += 1;
                    entry[1] += row as u64;
                    entry[2] += column as u64;
                    entry[3] += pixel[0] as u64;
                    entry[4] += pixel[1] as u64;
                    entry[5] += pixel[2] as u64;
                }
                acc
            },
        )
        .reduce(
            || vec![[0u64; 6]; num_clusters],
            |mut left, right| {
                for (l, r) in left.iter_mut().zip(right) {
                    for (a, b) in l.iter_mut().zip(r) {
                        *a += b;
                    }
                }
                left
            },
        );

    for cluster in clusters.clusters.iter_mut() {
        let total = &totals[cluster.number as usize];
        let members = total[0];
        if members == 0 {
            continue;
        }
        let half = members / 2;
        cluster.num_members = members as u32;
        cluster.y = ((total[1] + half) / members) as usize;
        cluster.x = ((total[2] + half) / members) as usize;
        cluster.l = ((total[3] + half) / members) as u8;
        cluster.a = ((total[4] + half) / members) as u8;
        cluster.b = ((total[5] + half) / members) as u8;
        debug_assert!(cluster.x < image.width && cluster.y < image.height);
    }
}

#[cfg(test)]
mod tests {
    use super::{compute_spatial_lut, iterate, search_region_size, Clusters, UNASSIGNED};
    use crate::arrays::LabImage;
    use crate::common::{DistanceMetric, SegmentationParams};

    fn two_tone(width: usize, height: usize) -> LabImage {
        let rgb: Vec<u8> = (0..width * height)
            .flat_map(|i| {
                if i % width < width / 2 {
                    [220u8, 30, 30]
                } else {
                    [20u8, 40, 200]
                }
            })
            .collect();
        LabImage::from_srgb(&rgb, width, height)
    }

    #[test]
    fn grid_seeding_places_every_cluster() {
        let image = two_tone(40, 30);
        for k in [1usize, 2, 7, 12, 50] {
            let clusters = Clusters::initialize_clusters(&image, k);
            assert_eq!(clusters.clusters.len(), k);
            for (i, c) in clusters.clusters.iter().enumerate() {
                assert_eq!(c.number as usize, i);
                assert!(c.x < 40 && c.y < 30);
            }
        }
    }

    #[test]
    fn spatial_lut_is_symmetric_with_zero_center() {
        let mut params = SegmentationParams::default();
        for metric in [DistanceMetric::Manhattan, DistanceMetric::EuclideanSpatial] {
            params.distance_metric = metric;
            let lut = compute_spatial_lut(&params, 4);
            assert_eq!(lut.width, 9);
            assert_eq!(lut[(4, 4)], 0);
            assert_eq!(lut[(0, 4)], lut[(8, 4)]);
            assert_eq!(lut[(4, 0)], lut[(4, 8)]);
            assert!(lut[(0, 0)] >= lut[(1, 1)]);
        }
    }

    #[test]
    fn iterate_assigns_every_pixel_and_splits_colors() {
        let image = two_tone(40, 20);
        let params = SegmentationParams {
            num_superpixels: 2,
            ..SegmentationParams::default()
        };
        let mut clusters = Clusters::initialize_clusters(&image, 2);
        let s = search_region_size(40, 20, 2);
        iterate(&image, &params, &mut clusters, s);
        let assignments = clusters.assignments.as_slice();
        assert!(assignments.iter().all(|a| *a != UNASSIGNED));
        for y in 0..20 {
            assert_ne!(clusters.assignments[(0, y)], clusters.assignments[(39, y)]);
        }
    }
}
