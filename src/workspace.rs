use ndarray::prelude::*;

use crate::errors::Result;

/// A named greyscale image as supplied by the host workspace.
///
/// Pixel data is an N-dimensional tensor: `(Y, X)` for planar images, with a
/// leading `Z` axis for volumetric input. The spacing vector holds physical
/// voxel sizes, leading axis first, and feeds the 3D anisotropy computation.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub name: String,
    pub pixels: ArrayD<f32>,
    pub spacing: Vec<f64>,
    /// Set when the source carries a native channel axis. The pipeline only
    /// accepts greyscale input, so this is rejected up front.
    pub multichannel: bool,
    pub volumetric: bool,
    /// Opaque back-reference to a parent image, propagated to outputs.
    pub parent: Option<String>,
}

impl SourceImage {
    pub fn planar(name: impl Into<String>, pixels: Array2<f32>) -> Self {
        Self {
            name: name.into(),
            pixels: pixels.into_dyn(),
            spacing: vec![1.0, 1.0],
            multichannel: false,
            volumetric: false,
            parent: None,
        }
    }

    pub fn volumetric(name: impl Into<String>, pixels: Array3<f32>, spacing: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            pixels: pixels.into_dyn(),
            spacing,
            multichannel: false,
            volumetric: true,
            parent: None,
        }
    }
}

/// Final labeled objects handed to the host.
#[derive(Debug, Clone)]
pub struct LabeledObjects {
    pub name: String,
    pub labels: ArrayD<u32>,
    pub parent: Option<String>,
}

/// Continuous-valued probability image handed to the host.
#[derive(Debug, Clone)]
pub struct ProbabilityImage {
    pub name: String,
    pub pixels: ArrayD<f32>,
    pub parent: Option<String>,
    pub dimensions: usize,
}

/// Receives the labeled-object map produced by a run.
pub trait ObjectSink {
    fn add_objects(&mut self, objects: LabeledObjects) -> Result<()>;
}

/// Receives optional image outputs (the probability map).
pub trait ImageSink {
    fn add_image(&mut self, image: ProbabilityImage) -> Result<()>;
}

/// Everything a successful invocation produces, before publishing.
///
/// Either the complete set is published or the invocation has already failed
/// with nothing published; there are no partial results.
#[derive(Debug, Clone)]
pub struct SegmentationArtifacts {
    pub labels: ArrayD<u32>,
    pub probabilities: Option<ArrayD<f32>>,
    pub parent: Option<String>,
}

impl SegmentationArtifacts {
    pub fn publish(
        self,
        object_name: &str,
        probabilities_name: &str,
        objects: &mut dyn ObjectSink,
        images: &mut dyn ImageSink,
    ) -> Result<()> {
        let parent = self.parent;
        if let Some(pixels) = self.probabilities {
            let dimensions = pixels.ndim();
            images.add_image(ProbabilityImage {
                name: probabilities_name.to_string(),
                pixels,
                parent: parent.clone(),
                dimensions,
            })?;
        }
        objects.add_objects(LabeledObjects {
            name: object_name.to_string(),
            labels: self.labels,
            parent,
        })
    }
}
