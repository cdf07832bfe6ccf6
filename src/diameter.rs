use crate::errors::{CellSegError, Result};
use crate::family::{DenoiseFamily, ModelSpec};

/// Resolve the diameter handed to inference.
///
/// A requested value of 0 means "detect automatically" and maps to `None`.
/// Automatic sizing only exists for sized model families and never in 3D
/// mode, so those combinations are rejected here, before any model is
/// loaded.
pub fn resolve(requested: u32, spec: &ModelSpec, do_3d: bool) -> Result<Option<f64>> {
    if requested > 0 {
        return Ok(Some(f64::from(requested)));
    }
    if do_3d {
        return Err(CellSegError::configuration(
            "automatic object diameter is not available in 3D mode; set an explicit diameter",
        ));
    }
    if !spec.is_sized() {
        return Err(CellSegError::configuration(format!(
            "model `{spec}` does not support automatic object diameter; set an explicit diameter",
        )));
    }
    Ok(None)
}

/// Diameter correction after a denoise pre-pass.
///
/// Upsampling variants have already resampled the image so that objects
/// match the variant's native training diameter; the segmentation pass must
/// use that constant instead of the user's original value. Non-upsampling
/// variants leave the diameter untouched.
pub fn after_denoise(current: Option<f64>, family: DenoiseFamily) -> Option<f64> {
    match family.upsample_target() {
        Some(native) => Some(native),
        None => current,
    }
}
