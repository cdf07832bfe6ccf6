use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use image::{ImageBuffer, ImageFormat, Luma};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use nshare::AsNdarray2;
use rayon::prelude::*;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use cell_seg_rs::{
    Config, ImageSink, LabeledObjects, ObjectSink, ProbabilityImage, SegmentationArtifacts,
    SegmentationPipeline, SourceImage,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::new();
    // Fail on an unresolvable custom model before anything is loaded.
    config.model_spec()?;
    ensure!(config.input.exists(), "Input path does not exist");
    fs::create_dir_all(&config.output_dir)?;

    let pipeline = SegmentationPipeline::with_onnx_backend(config.clone());

    if config.input.is_file() {
        let primary = load_image(&config.input, &config)?;
        let nuclei = config
            .nuclei_image
            .as_deref()
            .map(|path| load_image(path, &config))
            .transpose()?;
        let artifacts = pipeline.process(&primary, nuclei.as_ref())?;
        return publish(artifacts, &config, &config.input);
    }

    ensure!(
        config.nuclei_image.is_none(),
        "--nuclei-image is only supported for single-file input"
    );

    let image_paths = WalkDir::new(&config.input)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file() && ImageFormat::from_path(e.path()).is_ok())
        .map(|e| e.into_path())
        .collect::<Vec<_>>();
    ensure!(!image_paths.is_empty(), "No supported images found in input directory");

    let progress_bar = ProgressBar::new(image_paths.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    image_paths
        .par_iter()
        .progress_with(progress_bar.clone())
        .try_for_each(|path| -> Result<()> {
            let primary = load_image(path, &config)?;
            let artifacts = pipeline.process(&primary, None)?;
            publish(artifacts, &config, path)
        })?;

    progress_bar.finish();

    Ok(())
}

fn load_image(path: &Path, config: &Config) -> Result<SourceImage> {
    let img = image::open(path).with_context(|| format!("Failed to open image: {}", path.display()))?;
    let multichannel = img.color().has_color();
    let pixels = img.to_luma32f().as_ndarray2().to_owned();

    Ok(SourceImage {
        name: file_stem(path),
        pixels: pixels.into_dyn(),
        spacing: config.spacing.clone(),
        multichannel,
        volumetric: false,
        parent: None,
    })
}

fn publish(artifacts: SegmentationArtifacts, config: &Config, input: &Path) -> Result<()> {
    let mut objects = FileObjectSink {
        dir: config.output_dir.clone(),
        stem: file_stem(input),
    };
    let mut images = FileImageSink {
        dir: config.output_dir.clone(),
        stem: file_stem(input),
    };
    artifacts.publish(
        &config.object_name,
        &config.probabilities_name,
        &mut objects,
        &mut images,
    )?;
    Ok(())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

struct FileObjectSink {
    dir: PathBuf,
    stem: String,
}

impl ObjectSink for FileObjectSink {
    fn add_objects(&mut self, objects: LabeledObjects) -> cell_seg_rs::Result<()> {
        for (suffix, plane) in planes(&objects.labels) {
            let path = self.dir.join(format!("{}_{}{}.png", self.stem, objects.name, suffix));
            save_label_plane(plane.view(), &path)?;
        }
        Ok(())
    }
}

struct FileImageSink {
    dir: PathBuf,
    stem: String,
}

impl ImageSink for FileImageSink {
    fn add_image(&mut self, image: ProbabilityImage) -> cell_seg_rs::Result<()> {
        for (suffix, plane) in planes(&image.pixels) {
            let path = self.dir.join(format!("{}_{}{}.png", self.stem, image.name, suffix));
            save_continuous_plane(plane.view(), &path)?;
        }
        Ok(())
    }
}

/// Split an output into 2D planes: the array itself, or one slice per Z for
/// volumetric results (the image crate has no multi-page writer).
fn planes<T: Copy>(array: &ArrayD<T>) -> Vec<(String, Array2<T>)> {
    match array.ndim() {
        2 => array
            .view()
            .into_dimensionality::<Ix2>()
            .map(|plane| vec![(String::new(), plane.to_owned())])
            .unwrap_or_default(),
        3 => (0..array.shape()[0])
            .filter_map(|z| {
                array
                    .index_axis(Axis(0), z)
                    .into_dimensionality::<Ix2>()
                    .ok()
                    .map(|plane| (format!("_z{z:03}"), plane.to_owned()))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn save_label_plane(labels: ArrayView2<u32>, path: &Path) -> cell_seg_rs::Result<()> {
    let (height, width) = labels.dim();
    let mut buffer = ImageBuffer::<Luma<u16>, Vec<u16>>::new(width as u32, height as u32);
    for ((y, x), &id) in labels.indexed_iter() {
        buffer.put_pixel(x as u32, y as u32, Luma([id.min(u32::from(u16::MAX)) as u16]));
    }
    buffer.save(path)?;
    Ok(())
}

fn save_continuous_plane(pixels: ArrayView2<f32>, path: &Path) -> cell_seg_rs::Result<()> {
    let low = pixels.iter().copied().fold(f32::INFINITY, f32::min);
    let high = pixels.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = (high - low).max(f32::EPSILON);

    let (height, width) = pixels.dim();
    let mut buffer = ImageBuffer::<Luma<u16>, Vec<u16>>::new(width as u32, height as u32);
    for ((y, x), &value) in pixels.indexed_iter() {
        let scaled = ((value - low) / range * f32::from(u16::MAX)).round() as u16;
        buffer.put_pixel(x as u32, y as u32, Luma([scaled]));
    }
    buffer.save(path)?;
    Ok(())
}
