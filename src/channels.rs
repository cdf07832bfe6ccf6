use ndarray::prelude::*;
use ndarray::stack;

use crate::errors::{CellSegError, Result};
use crate::workspace::SourceImage;

/// Channel indices handed to the inference layer, in its 1-indexed
/// convention: the first entry locates the segmentation-relevant signal,
/// the second the auxiliary nuclear signal. 0 means greyscale / absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPair(pub u32, pub u32);

impl ChannelPair {
    /// Single-channel greyscale input.
    pub const GRAYSCALE: Self = Self(0, 0);
    /// Synthetic three-plane layout: zero plane, then signal, then nuclei.
    pub const COMPOSED: Self = Self(2, 3);
    /// Layout after a denoiser consumed the composed tensor; its output
    /// carries only the originally requested planes, no zero plane.
    pub const DENOISED: Self = Self(0, 1);
}

/// Build the tensor actually sent to inference.
///
/// Without an auxiliary image the primary passes through untouched. With
/// one, a three-plane image is synthesized: an all-zero plane, the primary
/// signal, and the nuclear stain, stacked on a new channel axis placed after
/// the leading depth axis in 3D mode or trailing in 2D mode.
pub fn compose(
    primary: &SourceImage,
    nuclei: Option<&SourceImage>,
    do_3d: bool,
) -> Result<(ArrayD<f32>, ChannelPair)> {
    if primary.multichannel {
        return Err(CellSegError::configuration(
            "Color images are not currently supported. Please provide greyscale images.",
        ));
    }

    let Some(nuclei) = nuclei else {
        return Ok((primary.pixels.clone(), ChannelPair::GRAYSCALE));
    };

    if nuclei.pixels.shape() != primary.pixels.shape() {
        return Err(CellSegError::Validation {
            field: "nuclei_image".to_string(),
            reason: format!(
                "shape {:?} does not match primary image shape {:?}",
                nuclei.pixels.shape(),
                primary.pixels.shape()
            ),
        });
    }

    let zeros = ArrayD::<f32>::zeros(primary.pixels.raw_dim());
    // Channel axis goes right after Z for volumes, trailing for planes.
    let axis = if do_3d {
        Axis(1)
    } else {
        Axis(primary.pixels.ndim())
    };
    let composed = stack(
        axis,
        &[zeros.view(), primary.pixels.view(), nuclei.pixels.view()],
    )?;

    Ok((composed, ChannelPair::COMPOSED))
}
