pub mod cache;
pub mod channels;
pub mod config;
pub mod diameter;
pub mod errors;
pub mod family;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod traits;
pub mod workspace;

pub mod mocks;

pub use channels::ChannelPair;
pub use config::Config;
pub use errors::{CellSegError, Result};
pub use family::{DenoiseFamily, DenoiseKey, ModelFamily, ModelKey, ModelSpec};
pub use model::{DeviceAccelerator, OnnxModelLoader};
pub use pipeline::SegmentationPipeline;
pub use traits::*;
pub use workspace::{
    ImageSink, LabeledObjects, ObjectSink, ProbabilityImage, SegmentationArtifacts, SourceImage,
};

/// Pipeline wired to the ONNX runtime backend, the configuration the CLI
/// runs with.
impl SegmentationPipeline<OnnxModelLoader, DeviceAccelerator> {
    pub fn with_onnx_backend(config: Config) -> Self {
        let loader = OnnxModelLoader::new(config.model_dir.clone(), config.device_id);
        Self::new(config, loader, DeviceAccelerator)
    }
}
