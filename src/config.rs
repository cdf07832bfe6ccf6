use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::errors::{CellSegError, Result};
use crate::family::{DenoiseFamily, ModelFamily, ModelSpec};

#[derive(Parser, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Input image file or directory of images
    pub input: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    /// Detection model family
    #[arg(short, long, value_enum, default_value_t = ModelFamily::Cyto3)]
    pub model: ModelFamily,

    /// Pre-trained model file, required when --model custom
    #[arg(long)]
    pub model_path: Option<PathBuf>,

    /// Directory holding the pretrained model files
    #[arg(long, default_value = "models")]
    pub model_dir: PathBuf,

    /// Expected object diameter in pixels, 0 attempts automatic detection
    #[arg(short, long, default_value_t = 30)]
    pub diameter: u32,

    #[arg(long)]
    pub use_gpu: bool,

    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// Fraction of accelerator memory reserved for this process
    #[arg(long, default_value_t = 0.1, value_parser = check_memory_share)]
    pub gpu_memory_share: f64,

    /// Invert and renormalize images before detection
    #[arg(long)]
    pub invert: bool,

    /// Auxiliary nuclear-stain image to assist whole-cell segmentation
    #[arg(long)]
    pub nuclei_image: Option<PathBuf>,

    /// Name for the published object set
    #[arg(long, default_value = "Objects")]
    pub object_name: String,

    /// Record the model's probability scores as an image
    #[arg(long)]
    pub save_probabilities: bool,

    #[arg(long, default_value = "Probabilities")]
    pub probabilities_name: String,

    /// Maximum allowed flow error per mask
    #[arg(long, default_value_t = 0.4, value_parser = check_non_negative)]
    pub flow_threshold: f64,

    /// Pixels with probability above this threshold are kept for masks
    #[arg(long, default_value_t = 0.0, value_parser = check_cellprob)]
    pub cellprob_threshold: f64,

    /// Merge plane masks across a stack when IoU meets this threshold
    #[arg(long, default_value_t = 0.0, value_parser = check_non_negative)]
    pub stitch_threshold: f64,

    /// Minimum number of pixels per mask, -1 disables the filter
    #[arg(long, default_value_t = 15, value_parser = check_min_size)]
    pub min_size: i64,

    /// Discard objects touching the image boundary
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub remove_edge_masks: bool,

    /// Clean the input with a restoration model before segmentation
    #[arg(long, value_enum)]
    pub denoise: Option<DenoiseFamily>,

    #[arg(long = "do-3d")]
    pub do_3d: bool,

    /// Physical voxel spacing, leading axis first (e.g. 2.0,0.5,0.5)
    #[arg(long, value_delimiter = ',', default_values_t = [1.0, 1.0, 1.0])]
    pub spacing: Vec<f64>,
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    /// Resolve the configured model choice, validating that a custom model
    /// file actually exists. Runs ahead of any inference so a bad path is a
    /// definite configuration failure, never a mid-run surprise.
    pub fn model_spec(&self) -> Result<ModelSpec> {
        if self.model != ModelFamily::Custom {
            return Ok(ModelSpec::Pretrained(self.model));
        }
        let path = self.model_path.as_ref().ok_or_else(|| {
            CellSegError::configuration("--model custom requires --model-path")
        })?;
        if !path.exists() {
            return Err(CellSegError::configuration(format!(
                "Failed to open model: {}",
                path.display()
            )));
        }
        Ok(ModelSpec::Custom(path.clone()))
    }

    /// Denoise family to apply, or None when preprocessing is disabled.
    pub fn denoise_family(&self) -> Option<DenoiseFamily> {
        self.denoise
    }
}

fn check_memory_share(s: &str) -> std::result::Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    if value <= 0.0 || value > 1.0 {
        return Err(format!("memory share must be in (0, 1], got {value}"));
    }
    Ok(value)
}

fn check_cellprob(s: &str) -> std::result::Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    if !(-6.0..=6.0).contains(&value) {
        return Err(format!("cell probability threshold must be in [-6, 6], got {value}"));
    }
    Ok(value)
}

fn check_non_negative(s: &str) -> std::result::Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    if value < 0.0 {
        return Err(format!("threshold must not be negative, got {value}"));
    }
    Ok(value)
}

fn check_min_size(s: &str) -> std::result::Result<i64, String> {
    let value: i64 = s.parse().map_err(|_| format!("`{s}` is not an integer"))?;
    if value < -1 {
        return Err(format!("minimum size must be >= -1, got {value}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_requires_a_path() {
        let mut config = crate::mocks::test_config();
        config.model = ModelFamily::Custom;
        config.model_path = None;
        assert!(matches!(
            config.model_spec(),
            Err(CellSegError::Configuration { .. })
        ));
    }

    #[test]
    fn missing_custom_model_file_is_a_configuration_error() {
        let mut config = crate::mocks::test_config();
        config.model = ModelFamily::Custom;
        config.model_path = Some(PathBuf::from("/definitely/not/here.onnx"));
        let err = config.model_spec().unwrap_err();
        assert!(err.to_string().contains("Failed to open model"));
    }

    #[test]
    fn pretrained_model_spec_roundtrip() {
        let config = crate::mocks::test_config();
        assert_eq!(
            config.model_spec().unwrap(),
            ModelSpec::Pretrained(ModelFamily::Cyto3)
        );
    }

    #[test]
    fn range_checks() {
        assert!(check_memory_share("0.1").is_ok());
        assert!(check_memory_share("0").is_err());
        assert!(check_memory_share("1.5").is_err());
        assert!(check_cellprob("-6").is_ok());
        assert!(check_cellprob("7").is_err());
        assert!(check_min_size("-1").is_ok());
        assert!(check_min_size("-2").is_err());
    }
}
