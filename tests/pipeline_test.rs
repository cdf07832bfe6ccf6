use ndarray::prelude::*;
use ndarray::IxDyn;

use cell_seg_rs::mocks::{
    test_config, InMemoryImageSink, InMemoryObjectSink, MockAccelerator, MockModelLoader,
};
use cell_seg_rs::{
    CellSegError, ChannelPair, Config, DenoiseFamily, ModelFamily, SegmentationPipeline,
    SourceImage,
};

fn pipeline(config: Config) -> (SegmentationPipeline<MockModelLoader, MockAccelerator>, MockModelLoader, MockAccelerator) {
    let loader = MockModelLoader::new();
    let accelerator = MockAccelerator::new();
    let handle = loader.clone();
    let accel_handle = accelerator.clone();
    (
        SegmentationPipeline::new(config, loader, accelerator),
        handle,
        accel_handle,
    )
}

fn plane(shape: (usize, usize)) -> SourceImage {
    SourceImage::planar("cells", Array2::from_elem(shape, 0.5))
}

#[test]
fn automatic_diameter_reaches_the_model_unset() {
    let mut config = test_config();
    config.diameter = 0;
    let (pipeline, loader, _) = pipeline(config);

    pipeline.process(&plane((32, 32)), None).unwrap();

    let requests = loader.requests();
    let requests = requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].diameter, None);
}

#[test]
fn automatic_diameter_is_rejected_for_fixed_size_families() {
    let mut config = test_config();
    config.diameter = 0;
    config.model = ModelFamily::LivecellCp3;
    let (pipeline, loader, _) = pipeline(config);

    let err = pipeline.process(&plane((32, 32)), None).unwrap_err();
    assert!(matches!(err, CellSegError::Configuration { .. }));
    // Rejected before any model load.
    assert_eq!(loader.counters().segmenter_loads(), 0);
}

#[test]
fn automatic_diameter_is_rejected_in_3d_mode() {
    let mut config = test_config();
    config.diameter = 0;
    config.do_3d = true;
    let (pipeline, _, _) = pipeline(config);

    let volume = SourceImage::volumetric(
        "cells",
        Array3::from_elem((4, 16, 16), 0.5),
        vec![2.0, 0.5, 0.5],
    );
    assert!(matches!(
        pipeline.process(&volume, None),
        Err(CellSegError::Configuration { .. })
    ));
}

#[test]
fn auxiliary_run_composes_channels_and_collapses_after_upsampling() {
    let mut config = test_config();
    config.diameter = 15;
    config.denoise = Some(DenoiseFamily::UpsampleCyto3);
    config.remove_edge_masks = false;
    let (pipeline, loader, _) = pipeline(config);

    let primary = plane((40, 40));
    let nuclei = SourceImage::planar("dapi", Array2::from_elem((40, 40), 0.25));
    pipeline.process(&primary, Some(&nuclei)).unwrap();

    // The denoiser saw the synthetic three-plane layout.
    let denoise_calls = loader.denoise_calls();
    let denoise_calls = denoise_calls.lock();
    assert_eq!(denoise_calls.len(), 1);
    assert_eq!(denoise_calls[0], (Some(15.0), ChannelPair::COMPOSED));

    // The segmenter saw the collapsed pair and the native diameter.
    let requests = loader.requests();
    let requests = requests.lock();
    assert_eq!(requests[0].channels, ChannelPair::DENOISED);
    assert_eq!(requests[0].diameter, Some(30.0));
    // Upsampled 40 -> 80 with the zero plane gone.
    assert_eq!(requests[0].tensor.shape(), &[80, 80, 2]);
}

#[test]
fn composed_tensor_has_exactly_one_extra_axis() {
    let mut config = test_config();
    config.remove_edge_masks = false;
    let (pipeline, loader, _) = pipeline(config);

    let primary = plane((24, 32));
    let nuclei = SourceImage::planar("dapi", Array2::from_elem((24, 32), 0.25));
    pipeline.process(&primary, Some(&nuclei)).unwrap();

    let requests = loader.requests();
    let requests = requests.lock();
    assert_eq!(requests[0].tensor.ndim(), primary.pixels.ndim() + 1);
    assert_eq!(requests[0].channels, ChannelPair::COMPOSED);
}

#[test]
fn nuclei_model_ignores_the_auxiliary_image() {
    let mut config = test_config();
    config.model = ModelFamily::Nuclei;
    let (pipeline, loader, _) = pipeline(config);

    let primary = plane((24, 24));
    let nuclei = SourceImage::planar("dapi", Array2::from_elem((24, 24), 0.25));
    pipeline.process(&primary, Some(&nuclei)).unwrap();

    let requests = loader.requests();
    let requests = requests.lock();
    assert_eq!(requests[0].channels, ChannelPair::GRAYSCALE);
    assert_eq!(requests[0].tensor.shape(), &[24, 24]);
}

#[test]
fn upsample_round_trip_restores_source_resolution() {
    let mut config = test_config();
    config.diameter = 15;
    config.denoise = Some(DenoiseFamily::UpsampleCyto3);
    let (pipeline, loader, _) = pipeline(config);

    // The model works at 80x80 after the 2x upsample; place an interior
    // object there so edge removal leaves it alone.
    let mut working = ArrayD::<u32>::zeros(IxDyn(&[80, 80]));
    for y in 30..50 {
        for x in 30..50 {
            working[[y, x]] = 1;
        }
    }
    loader.set_labels(working);

    let artifacts = pipeline.process(&plane((40, 40)), None).unwrap();
    assert_eq!(artifacts.labels.shape(), &[40, 40]);
    assert!(artifacts.labels.iter().any(|&id| id == 1));
}

#[test]
fn repeated_invocations_reuse_the_loaded_model() {
    let (pipeline, loader, _) = pipeline(test_config());

    pipeline.process(&plane((16, 16)), None).unwrap();
    pipeline.process(&plane((16, 16)), None).unwrap();
    pipeline.process(&plane((16, 16)), None).unwrap();

    assert_eq!(loader.counters().segmenter_loads(), 1);
}

#[test]
fn anisotropy_is_computed_from_physical_spacing() {
    let mut config = test_config();
    config.do_3d = true;
    let (pipeline, loader, _) = pipeline(config);

    let volume = SourceImage::volumetric(
        "cells",
        Array3::from_elem((4, 16, 16), 0.5),
        vec![2.0, 0.5, 0.5],
    );
    pipeline.process(&volume, None).unwrap();

    let requests = loader.requests();
    let requests = requests.lock();
    assert_eq!(requests[0].anisotropy, 4.0);
    assert!(requests[0].do_3d);
}

#[test]
fn stitching_and_3d_are_mutually_exclusive() {
    let mut config = test_config();
    config.do_3d = true;
    config.stitch_threshold = 0.7;
    let (pipeline, loader, _) = pipeline(config);

    let volume = SourceImage::volumetric(
        "cells",
        Array3::from_elem((4, 16, 16), 0.5),
        vec![1.0, 1.0, 1.0],
    );
    pipeline.process(&volume, None).unwrap();

    let requests = loader.requests();
    let requests = requests.lock();
    assert!(requests[0].do_3d);
    assert_eq!(requests[0].stitch_threshold, 0.0);
}

#[test]
fn stitch_threshold_passes_through_outside_3d() {
    let mut config = test_config();
    config.stitch_threshold = 0.7;
    let (pipeline, loader, _) = pipeline(config);

    let stack = SourceImage {
        name: "stack".to_string(),
        pixels: ArrayD::from_elem(IxDyn(&[4, 16, 16]), 0.5),
        spacing: vec![1.0, 1.0, 1.0],
        multichannel: false,
        volumetric: true,
        parent: None,
    };
    pipeline.process(&stack, None).unwrap();

    let requests = loader.requests();
    let requests = requests.lock();
    assert!(!requests[0].do_3d);
    assert_eq!(requests[0].stitch_threshold, 0.7);
}

#[test]
fn edge_touching_objects_are_removed_on_request() {
    let mut config = test_config();
    config.remove_edge_masks = true;
    let (pipeline, loader, _) = pipeline(config);

    let mut labels = ArrayD::<u32>::zeros(IxDyn(&[16, 16]));
    labels[[0, 5]] = 7;
    labels[[0, 6]] = 7;
    labels[[8, 8]] = 4;
    loader.set_labels(labels);

    let artifacts = pipeline.process(&plane((16, 16)), None).unwrap();
    assert!(artifacts.labels.iter().all(|&id| id != 7));
    assert_eq!(artifacts.labels[[8, 8]], 4);
}

#[test]
fn multichannel_primary_fails_before_any_inference() {
    let (pipeline, loader, _) = pipeline(test_config());

    let mut primary = plane((16, 16));
    primary.multichannel = true;
    let err = pipeline.process(&primary, None).unwrap_err();
    assert!(matches!(err, CellSegError::Configuration { .. }));
    assert_eq!(loader.counters().segmenter_loads(), 0);
    assert!(loader.requests().lock().is_empty());
}

#[test]
fn accelerator_is_released_on_success_and_on_failure() {
    let mut config = test_config();
    config.use_gpu = true;
    let (pipeline, loader, accelerator) = pipeline(config);

    pipeline.process(&plane((16, 16)), None).unwrap();
    assert_eq!(accelerator.reserve_count(), 1);
    assert_eq!(accelerator.release_count(), 1);

    loader.fail_segmentation(true);
    let err = pipeline.process(&plane((16, 16)), None).unwrap_err();
    assert!(matches!(err, CellSegError::Inference { .. }));
    // Release ran on the error path too.
    assert_eq!(accelerator.release_count(), 2);
}

#[test]
fn release_failures_never_fail_the_invocation() {
    let mut config = test_config();
    config.use_gpu = true;
    let (pipeline, _, accelerator) = pipeline(config);

    accelerator.fail_release(true);
    assert!(pipeline.process(&plane((16, 16)), None).is_ok());
    assert_eq!(accelerator.release_count(), 1);
}

#[test]
fn probabilities_are_resampled_to_the_label_shape_and_published() {
    let mut config = test_config();
    config.save_probabilities = true;
    let (pipeline, _, _) = pipeline(config.clone());

    let mut primary = plane((20, 20));
    primary.parent = Some("raw".to_string());
    let artifacts = pipeline.process(&primary, None).unwrap();
    let probabilities = artifacts.probabilities.as_ref().unwrap();
    assert_eq!(probabilities.shape(), artifacts.labels.shape());

    let mut objects = InMemoryObjectSink::default();
    let mut images = InMemoryImageSink::default();
    artifacts
        .publish(
            &config.object_name,
            &config.probabilities_name,
            &mut objects,
            &mut images,
        )
        .unwrap();

    assert_eq!(objects.objects.len(), 1);
    assert_eq!(objects.objects[0].name, "Objects");
    assert_eq!(objects.objects[0].parent.as_deref(), Some("raw"));
    assert_eq!(images.images.len(), 1);
    assert_eq!(images.images[0].name, "Probabilities");
    assert_eq!(images.images[0].dimensions, 2);
}

#[test]
fn custom_model_path_resolves_when_the_file_exists() {
    let dir = tempfile::TempDir::new().unwrap();
    let model_path = dir.path().join("my_model.onnx");
    std::fs::write(&model_path, b"dummy").unwrap();

    let mut config = test_config();
    config.model = ModelFamily::Custom;
    config.model_path = Some(model_path);
    let (pipeline, loader, _) = pipeline(config);

    pipeline.process(&plane((16, 16)), None).unwrap();
    assert_eq!(loader.counters().segmenter_loads(), 1);
}

#[test]
fn missing_custom_model_fails_before_any_load() {
    let mut config = test_config();
    config.model = ModelFamily::Custom;
    config.model_path = Some(std::path::PathBuf::from("/definitely/not/here.onnx"));
    let (pipeline, loader, _) = pipeline(config);

    let err = pipeline.process(&plane((16, 16)), None).unwrap_err();
    assert!(matches!(err, CellSegError::Configuration { .. }));
    assert_eq!(loader.counters().segmenter_loads(), 0);
}

#[test]
fn denoiser_is_reused_across_invocations() {
    let mut config = test_config();
    config.denoise = Some(DenoiseFamily::DenoiseCyto3);
    let (pipeline, loader, _) = pipeline(config);
    pipeline.process(&plane((16, 16)), None).unwrap();
    pipeline.process(&plane((16, 16)), None).unwrap();
    assert_eq!(loader.counters().denoiser_loads(), 1);
}
