use std::sync::atomic::{AtomicUsize, Ordering};
use superpixel_bridge::adapter::Adapter;
use superpixel_bridge::api;
use superpixel_bridge::common::SegmentationParams;
use superpixel_bridge::image_handle::{ElementType, ImageHandle, OwnedImage};
use superpixel_bridge::label_map::{LabelMap, Labels};
use superpixel_bridge::marshal::{
    from_caller_array, hand_over, image_to_caller_array, to_caller_array, ArrayDescriptor,
    CallerArray, Handover, HandoverPolicy,
};
use superpixel_bridge::native::{
    sp_bundled_release_labels, NativeApi, NativeLabels, OwnershipToken, SpLabels,
};
use superpixel_bridge::raster;
use superpixel_bridge::BridgeError;

fn scene(width: usize, height: usize) -> Vec<u8> {
    (0..width * height)
        .flat_map(|i| {
            let (x, y) = (i % width, i / width);
            if x < width / 2 {
                [200, 30, 30]
            } else if y < height / 2 {
                [30, 200, 30]
            } else {
                [30, 30, (x * 4 % 256) as u8]
            }
        })
        .collect()
}

#[test]
fn wrap_round_trips_metadata_for_valid_buffers() {
    for (width, height, channels) in [(1, 1, 1), (7, 3, 3), (64, 48, 4), (5, 9, 2)] {
        for element_type in [ElementType::U8, ElementType::F32] {
            let row = width * channels * element_type.size();
            let stride = row + 8;
            let buffer = vec![0u8; stride * height];
            let handle = unsafe {
                ImageHandle::wrap(buffer.as_ptr(), width, height, channels, element_type, stride)
            }
            .unwrap();
            assert_eq!(handle.width(), width);
            assert_eq!(handle.height(), height);
            assert_eq!(handle.channels(), channels);
            assert_eq!(handle.element_type(), element_type);
            assert_eq!(handle.stride(), stride);
            assert_eq!(handle.as_ptr(), buffer.as_ptr());
        }
    }
}

#[test]
fn short_strides_are_rejected() {
    let buffer = vec![0u8; 1024];
    for stride in [0, 1, 29] {
        let result = unsafe {
            ImageHandle::wrap(buffer.as_ptr(), 10, 3, 3, ElementType::U8, stride)
        };
        assert_eq!(
            result.unwrap_err(),
            BridgeError::InvalidStride { stride, min: 30 }
        );
    }
    let result = unsafe { ImageHandle::wrap(buffer.as_ptr(), 10, 3, 3, ElementType::F32, 119) };
    assert_eq!(
        result.unwrap_err(),
        BridgeError::InvalidStride {
            stride: 119,
            min: 120
        }
    );
}

#[test]
fn label_maps_match_their_image() {
    let pixels = vec![0u8; 64 * 48];
    let image = ImageHandle::from_slice(&pixels, 64, 48, 1, 64).unwrap();
    let same = Labels::new(64, 48, 0);
    let narrow = Labels::new(32, 48, 0);
    assert!(same.as_map().validate_against(&image).is_ok());
    assert!(matches!(
        narrow.as_map().validate_against(&image),
        Err(BridgeError::DimensionMismatch { width: 32, .. })
    ));
}

#[test]
fn caller_arrays_round_trip() {
    let gray: Vec<u8> = (0..12).collect();
    let color: Vec<u8> = (0..60).map(|i| (i * 3) as u8).collect();
    let floats: Vec<f32> = (0..24).map(|i| i as f32 * 0.04).collect();
    let arrays = [
        CallerArray::from_elements(&gray, &[3, 4]).unwrap(),
        CallerArray::from_elements(&color, &[4, 5, 3]).unwrap(),
        CallerArray::from_elements(&floats, &[2, 3, 4]).unwrap(),
    ];
    for array in arrays {
        let handle = from_caller_array(&array.descriptor()).unwrap();
        assert_eq!(image_to_caller_array(&handle), array);
    }
}

#[test]
fn segmentation_is_deterministic() {
    let pixels = scene(48, 32);
    let image = ArrayDescriptor::from_slice(&pixels, &[32, 48, 3]).unwrap();
    let params = SegmentationParams {
        num_superpixels: 30,
        subsample_stride: 2,
        ..SegmentationParams::default()
    };
    let first = api::segment(&image, &params).unwrap();
    let second = api::segment(&image, &params).unwrap();
    assert_eq!(first, second);
}

#[test]
fn copies_do_not_alias_native_memory() {
    let pixels = scene(16, 16);
    let image = ImageHandle::from_slice(&pixels, 16, 16, 3, 48).unwrap();
    let result = Adapter::default()
        .segment(&image, &SegmentationParams::default())
        .unwrap();
    let (raw, release) = result.labels.into_token().into_raw();
    let before = unsafe { std::slice::from_raw_parts(raw.data, 16 * 16) }.to_vec();
    let map = unsafe { LabelMap::wrap(raw.data, raw.width, raw.height, raw.stride) }.unwrap();
    let copy = to_caller_array(&map);
    // scribble over the native buffer
    unsafe { std::slice::from_raw_parts_mut(raw.data, 16 * 16) }.fill(-7);
    assert_eq!(copy.as_i32().unwrap(), before.as_slice());
    drop(unsafe { OwnershipToken::from_raw(raw, release) });
}

#[test]
fn zero_parameters_on_small_color_image() {
    let pixels: Vec<u8> = (0..10 * 10 * 3).map(|i| (i * 37 % 256) as u8).collect();
    let image = ArrayDescriptor::from_slice(&pixels, &[10, 10, 3]).unwrap();
    let result = api::segment(&image, &SegmentationParams::zeroed()).unwrap();
    assert_eq!(result.labels.shape(), &[10, 10]);
    assert!(result.superpixels >= 1);
    let labels = result.labels.as_i32().unwrap();
    assert!(labels.iter().all(|l| *l >= 0 && (*l as u32) < result.superpixels));
}

static RELEASED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counting_release(labels: *mut SpLabels) {
    RELEASED.fetch_add(1, Ordering::SeqCst);
    unsafe { sp_bundled_release_labels(labels) };
}

fn counting_adapter() -> Adapter {
    Adapter::new(NativeApi {
        release_labels: counting_release,
        ..NativeApi::bundled()
    })
}

// One test drives every release path so the shared counter is never raced.
#[test]
fn native_labels_are_released_exactly_once() {
    let pixels = scene(20, 20);
    let image = ImageHandle::from_slice(&pixels, 20, 20, 3, 60).unwrap();
    let adapter = counting_adapter();
    let params = SegmentationParams::default();
    let released = || RELEASED.load(Ordering::SeqCst);
    let start = released();

    // copy policy releases right away
    let labels = adapter.segment(&image, &params).unwrap().labels;
    let copied = hand_over(labels, HandoverPolicy::Copy);
    assert!(matches!(copied, Handover::Copied(_)));
    assert_eq!(released(), start + 1);
    drop(copied);
    assert_eq!(released(), start + 1);

    // transfer keeps the memory alive until the caller lets go
    let labels = adapter.segment(&image, &params).unwrap().labels;
    let owned = hand_over(labels, HandoverPolicy::Transfer);
    assert_eq!(released(), start + 1);
    assert_eq!((owned.width(), owned.height()), (20, 20));
    let Handover::Owned(labels) = owned else {
        panic!("transfer must hand over the token");
    };
    labels.release();
    assert_eq!(released(), start + 2);

    // tokens survive a trip through raw parts
    let token = adapter.segment(&image, &params).unwrap().labels.into_token();
    let (raw, release) = token.into_raw();
    assert_eq!(released(), start + 2);
    let labels = NativeLabels::new(unsafe { OwnershipToken::from_raw(raw, release) }).unwrap();
    let array = Handover::Owned(labels).into_caller_array();
    assert_eq!(array.shape(), &[20, 20]);
    assert_eq!(released(), start + 3);

    // moving a result between threads moves the obligation with it
    let result = adapter.segment(&image, &params).unwrap();
    std::thread::spawn(move || drop(result)).join().unwrap();
    assert_eq!(released(), start + 4);
}

#[test]
fn adapter_is_shared_across_threads() {
    let pixels = scene(32, 32);
    let adapter = Adapter::default();
    let params = SegmentationParams {
        num_superpixels: 16,
        ..SegmentationParams::default()
    };
    let image = ImageHandle::from_slice(&pixels, 32, 32, 3, 96).unwrap();
    let expected = to_caller_array(&adapter.segment(&image, &params).unwrap().labels.as_map());
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let result = adapter.segment(&image, &params).unwrap();
                assert_eq!(to_caller_array(&result.labels.as_map()), expected);
            });
        }
    });
}

#[test]
fn segment_benchmark_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let (width, height) = (40, 30);
    let pixels = scene(width, height);
    let source = OwnedImage::from_u8(&pixels, width, height, 3).unwrap();
    let image_path = dir.path().join("scene.png");
    raster::save_image(&source.as_handle(), &image_path).unwrap();

    let image = raster::load_image(&image_path).unwrap();
    let adapter = Adapter::default();
    let params = SegmentationParams {
        num_superpixels: 24,
        ..SegmentationParams::default()
    };
    let result = adapter.segment(&image.as_handle(), &params).unwrap();
    let labels_path = dir.path().join("labels.png");
    raster::save_labels_png(&result.labels.as_map(), &labels_path).unwrap();
    let labels = raster::load_labels_png(&labels_path).unwrap();
    assert_eq!(labels, result.labels.as_map().to_labels());

    let ground_truth: Vec<i32> = (0..width * height)
        .map(|i| {
            let (x, y) = (i % width, i / width);
            if x < width / 2 {
                0
            } else if y < height / 2 {
                1
            } else {
                2
            }
        })
        .collect();
    let gt_path = dir.path().join("gt.csv");
    let ground_truth = Labels::from_vec(ground_truth, width, height).unwrap();
    raster::write_labels_csv(&ground_truth.as_map(), &gt_path).unwrap();
    let ground_truth = raster::read_labels_csv(&gt_path).unwrap();

    let report = adapter
        .benchmark(&image.as_handle(), &labels.as_map(), &ground_truth.as_map())
        .unwrap();
    assert!((0.0..=1.0).contains(&report.boundary_recall));
    assert!((0.0..=1.0).contains(&report.achievable_segmentation_accuracy));
    assert!(report.undersegmentation_error >= 0.0);
    assert_eq!(report.superpixels, result.superpixels);
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"boundary_recall\""));

    let overlay = raster::draw_contours(&image.as_handle(), &labels.as_map(), [0, 0, 255]).unwrap();
    assert_eq!(overlay.channels(), 3);
    raster::save_image(&overlay.as_handle(), dir.path().join("contours.png")).unwrap();
}
