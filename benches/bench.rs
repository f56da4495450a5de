use criterion::*;
use std::time::Duration;
use superpixel_bridge::adapter::Adapter;
use superpixel_bridge::arrays::{Array2D, LabImage};
use superpixel_bridge::common::SegmentationParams;
use superpixel_bridge::engine::connectivity::enforce_connectivity;
use superpixel_bridge::engine::slic::{
    assign, compute_spatial_lut, iterate, search_region_size, update, Clusters,
};
use superpixel_bridge::image_handle::OwnedImage;
use superpixel_bridge::marshal::{hand_over, HandoverPolicy};

/// Smooth color ramps with a few hard edges, close enough to a photo for timing.
fn synthetic_rgb(width: usize, height: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            let block = ((x / 97) + (y / 61)) % 3;
            rgb.push((x * 255 / width) as u8 ^ (block as u8 * 40));
            rgb.push((y * 255 / height) as u8);
            rgb.push(((x + y) % 256) as u8 / (block as u8 + 1));
        }
    }
    rgb
}

fn bench_lab_image_from_rgb(c: &mut Criterion) {
    sas::init();
    let (width, height) = (1920, 1080);
    let rgb = synthetic_rgb(width, height);
    let image = OwnedImage::from_u8(&rgb, width, height, 3).unwrap();
    c.bench_function("rgb_to_lab", |b| {
        b.iter(|| {
            let _ = black_box(LabImage::from_handle(&image.as_handle()));
        });
    });
}

fn bench_assign(c: &mut Criterion) {
    sas::init();
    let (width, height) = (1920, 1080);
    let image = LabImage::from_srgb(&synthetic_rgb(width, height), width, height);
    let params = SegmentationParams::default();
    let num_clusters = params.num_superpixels as usize;
    let s = search_region_size(width, height, num_clusters);
    let lut = compute_spatial_lut(&params, s);
    let mut clusters = Clusters::initialize_clusters(&image, num_clusters);
    let mut min_distances = Array2D::from_fill(u32::MAX, width, height);
    let mut group = c.benchmark_group("SLIC assign");
    for subsample_stride in 1..5 {
        group.bench_with_input(
            BenchmarkId::new("assign", subsample_stride),
            &subsample_stride,
            |b, &subsample_stride| {
                b.iter(|| {
                    assign(
                        &image,
                        &mut clusters,
                        &mut min_distances,
                        &lut,
                        s,
                        subsample_stride,
                        0,
                    );
                    black_box(&clusters.assignments);
                });
            },
        );
    }
    group.finish();
}

fn bench_update(c: &mut Criterion) {
    sas::init();
    let (width, height) = (1920, 1080);
    let image = LabImage::from_srgb(&synthetic_rgb(width, height), width, height);
    let params = SegmentationParams::default();
    let num_clusters = params.num_superpixels as usize;
    let s = search_region_size(width, height, num_clusters);
    let lut = compute_spatial_lut(&params, s);
    let mut clusters = Clusters::initialize_clusters(&image, num_clusters);
    let mut min_distances = Array2D::from_fill(u32::MAX, width, height);
    assign(&image, &mut clusters, &mut min_distances, &lut, s, 1, 0);
    c.bench_function("update", |b| {
        b.iter(|| {
            update(&mut clusters, &image, 1, 0);
            black_box(&clusters.clusters);
        });
    });
}

fn bench_connectivity(c: &mut Criterion) {
    sas::init();
    let (width, height) = (1920, 1080);
    let image = LabImage::from_srgb(&synthetic_rgb(width, height), width, height);
    let params = SegmentationParams::default();
    let num_clusters = params.num_superpixels as usize;
    let s = search_region_size(width, height, num_clusters);
    let mut clusters = Clusters::initialize_clusters(&image, num_clusters);
    iterate(&image, &params, &mut clusters, s);
    let min_size = ((s * s) as f32 * params.min_size_factor).round() as usize;
    c.bench_function("enforce_connectivity", |b| {
        b.iter(|| {
            let _ = black_box(enforce_connectivity(
                &clusters.assignments,
                num_clusters,
                min_size,
            ));
        });
    });
}

fn bench_bridge_segment(c: &mut Criterion, name: &str, width: usize, height: usize) {
    sas::init();
    let rgb = synthetic_rgb(width, height);
    let image = OwnedImage::from_u8(&rgb, width, height, 3).unwrap();
    let adapter = Adapter::default();
    let params = SegmentationParams::default();
    let mut group = c.benchmark_group(name);
    group.sample_size(10);
    for policy in [HandoverPolicy::Copy, HandoverPolicy::Transfer] {
        group.bench_with_input(
            BenchmarkId::new("segment", format!("{policy:?}")),
            &policy,
            |b, &policy| {
                b.iter(|| {
                    let result = adapter.segment(&image.as_handle(), &params).unwrap();
                    let _ = black_box(hand_over(result.labels, policy));
                });
            },
        );
    }
    group.finish();
}

fn bench_segment_fhd(c: &mut Criterion) {
    bench_bridge_segment(c, "bridge segment FHD", 1920, 1080);
}

fn bench_segment_hd(c: &mut Criterion) {
    bench_bridge_segment(c, "bridge segment HD", 1280, 720);
}

fn bench_segment_sd(c: &mut Criterion) {
    bench_bridge_segment(c, "bridge segment SD", 640, 480);
}

fn bench_metrics(c: &mut Criterion) {
    sas::init();
    let (width, height) = (640, 480);
    let rgb = synthetic_rgb(width, height);
    let image = OwnedImage::from_u8(&rgb, width, height, 3).unwrap();
    let adapter = Adapter::default();
    let params = SegmentationParams::default();
    let labels = adapter.segment(&image.as_handle(), &params).unwrap().labels;
    let coarse = SegmentationParams {
        num_superpixels: 20,
        ..params
    };
    let ground_truth = adapter.segment(&image.as_handle(), &coarse).unwrap().labels;
    c.bench_function("benchmark metrics", |b| {
        b.iter(|| {
            let _ = black_box(
                adapter
                    .benchmark(&image.as_handle(), &labels.as_map(), &ground_truth.as_map())
                    .unwrap(),
            );
        });
    });
}

criterion_group!(name = benches;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_lab_image_from_rgb);
criterion_group!(name = benches1;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_assign);
criterion_group!(name = benches2;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_update);
criterion_group!(name = benches3;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_connectivity);
criterion_group!(name = benches4;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_segment_fhd, bench_segment_hd, bench_segment_sd);
criterion_group!(name = benches5;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_metrics);
criterion_main!(benches, benches1, benches2, benches3, benches4, benches5);
