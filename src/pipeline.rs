use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::ModelCache;
use crate::channels::{self, ChannelPair};
use crate::config::Config;
use crate::diameter;
use crate::errors::{CellSegError, Result};
use crate::family::{DenoiseFamily, DenoiseKey, ModelFamily, ModelKey};
use crate::postprocess;
use crate::traits::{
    Accelerator, DenoiseModel, ModelLoader, SegmentationModel, SegmentationRequest,
};
use crate::workspace::{SegmentationArtifacts, SourceImage};

/// Orchestrates one segmentation invocation end to end: channel composition,
/// model resolution through the cache, the optional denoise pass, the
/// segmentation pass, and post-processing.
///
/// Each invocation is synchronous and runs on the calling thread. The only
/// state shared between invocations is the model cache; it sits behind a
/// mutex so the CLI can drive one pipeline from parallel workers without
/// racing the compare-and-reload sequence.
pub struct SegmentationPipeline<L: ModelLoader, A: Accelerator> {
    config: Config,
    cache: Mutex<ModelCache<L>>,
    accelerator: A,
}

impl<L: ModelLoader, A: Accelerator> SegmentationPipeline<L, A> {
    pub fn new(config: Config, loader: L, accelerator: A) -> Self {
        Self {
            config,
            cache: Mutex::new(ModelCache::new(loader)),
            accelerator,
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Run segmentation for one primary image and an optional auxiliary
    /// nuclear image. Returns the finished artifacts; nothing is retained by
    /// the pipeline afterwards.
    pub fn process(
        &self,
        primary: &SourceImage,
        nuclei: Option<&SourceImage>,
    ) -> Result<SegmentationArtifacts> {
        let config = &self.config;
        let spec = config.model_spec()?;

        let anisotropy = if config.do_3d {
            anisotropy_ratio(&primary.spacing)?
        } else {
            0.0
        };

        let mut diam = diameter::resolve(config.diameter, &spec, config.do_3d)?;

        // The dedicated nuclei model is single-channel by definition; an
        // auxiliary image only makes sense for whole-cell families.
        let nuclei = if spec.family() == Some(ModelFamily::Nuclei) {
            None
        } else {
            nuclei
        };
        let with_nuclei = nuclei.is_some();

        let (mut tensor, mut channel_pair) = channels::compose(primary, nuclei, config.do_3d)?;

        let mut cache = self.cache.lock();

        if config.use_gpu {
            self.accelerator.reserve(config.gpu_memory_share)?;
        }
        // Released on every exit path below, including inference errors.
        let _guard = AcceleratorGuard {
            accelerator: &self.accelerator,
            active: config.use_gpu,
        };

        if let Some(family) = config.denoise_family() {
            let key = DenoiseKey {
                family,
                gpu: config.use_gpu,
                with_nuclei,
            };
            let denoiser = cache.denoiser(&key)?;
            debug!(%family, "running denoise pass");
            tensor = denoiser.eval(&tensor, diam, channel_pair)?;
            diam = diameter::after_denoise(diam, family);
            // The denoiser output contains only the requested planes, not
            // the synthetic zero plane.
            if with_nuclei {
                channel_pair = ChannelPair::DENOISED;
            }
        } else {
            cache.clear_denoiser();
        }

        let segmenter = cache.segmenter(&ModelKey {
            spec,
            gpu: config.use_gpu,
        })?;

        let request = SegmentationRequest {
            tensor,
            channels: channel_pair,
            diameter: diam,
            do_3d: config.do_3d,
            anisotropy,
            flow_threshold: config.flow_threshold,
            cellprob_threshold: config.cellprob_threshold,
            // Stitching works on independently segmented planes and is
            // mutually exclusive with native 3D segmentation.
            stitch_threshold: if config.do_3d {
                0.0
            } else {
                config.stitch_threshold
            },
            min_size: config.min_size,
            invert: config.invert,
        };

        debug!(
            diameter = ?request.diameter,
            do_3d = request.do_3d,
            anisotropy = request.anisotropy,
            "running segmentation pass"
        );
        let output = segmenter.eval(&request)?;

        let mut labels = output.labels;
        let upsampled = config
            .denoise_family()
            .is_some_and(DenoiseFamily::is_upsampling);
        if upsampled {
            // Back to source resolution before edge detection, so edges are
            // judged against the final image bounds.
            labels = postprocess::resize_labels(&labels, primary.pixels.shape())?;
        }
        if config.remove_edge_masks {
            labels = postprocess::remove_edge_masks(labels);
        }

        let probabilities = if config.save_probabilities {
            Some(postprocess::resize_probabilities(
                &output.probabilities,
                labels.shape(),
            )?)
        } else {
            None
        };

        Ok(SegmentationArtifacts {
            labels,
            probabilities,
            parent: primary.parent.clone(),
        })
    }
}

/// Anisotropy for non-cubic voxels: physical depth spacing over in-plane
/// spacing, taken from the first two components of the spacing vector.
fn anisotropy_ratio(spacing: &[f64]) -> Result<f64> {
    match spacing {
        [depth, plane, ..] if *plane > 0.0 => Ok(depth / plane),
        _ => Err(CellSegError::Validation {
            field: "spacing".to_string(),
            reason: format!("3D mode needs at least two positive spacing components, got {spacing:?}"),
        }),
    }
}

/// Best-effort accelerator cleanup on every exit path. Failures are logged
/// and swallowed; by the time this runs the result is already decided.
struct AcceleratorGuard<'a, A: Accelerator> {
    accelerator: &'a A,
    active: bool,
}

impl<A: Accelerator> Drop for AcceleratorGuard<'_, A> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.accelerator.release() {
            warn!("unable to release accelerator memory: {err}");
        }
    }
}
