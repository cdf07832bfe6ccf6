use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;

/// Pretrained segmentation model families.
///
/// A closed enumeration instead of free-form model name strings, so the
/// sizing rules below are total functions over the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ModelFamily {
    #[value(name = "cyto3")]
    Cyto3,
    #[value(name = "nuclei")]
    Nuclei,
    #[value(name = "cyto2_cp3")]
    Cyto2Cp3,
    #[value(name = "tissuenet_cp3")]
    TissuenetCp3,
    #[value(name = "livecell_cp3")]
    LivecellCp3,
    #[value(name = "yeast_PhC_cp3")]
    YeastPhcCp3,
    #[value(name = "yeast_BF_cp3")]
    YeastBfCp3,
    #[value(name = "bact_phase_cp3")]
    BactPhaseCp3,
    #[value(name = "bact_fluor_cp3")]
    BactFluorCp3,
    #[value(name = "deepbacs_cp3")]
    DeepbacsCp3,
    #[value(name = "cyto2")]
    Cyto2,
    #[value(name = "cyto")]
    Cyto,
    /// User-supplied model file, configured separately.
    #[value(name = "custom")]
    Custom,
}

impl ModelFamily {
    /// Whether the family's inference entry point accepts an automatic
    /// diameter and performs its own size scaling. Every other family,
    /// including custom models, requires an explicit diameter.
    pub const fn is_sized(self) -> bool {
        matches!(self, Self::Cyto3 | Self::Cyto2 | Self::Cyto | Self::Nuclei)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Cyto3 => "cyto3",
            Self::Nuclei => "nuclei",
            Self::Cyto2Cp3 => "cyto2_cp3",
            Self::TissuenetCp3 => "tissuenet_cp3",
            Self::LivecellCp3 => "livecell_cp3",
            Self::YeastPhcCp3 => "yeast_PhC_cp3",
            Self::YeastBfCp3 => "yeast_BF_cp3",
            Self::BactPhaseCp3 => "bact_phase_cp3",
            Self::BactFluorCp3 => "bact_fluor_cp3",
            Self::DeepbacsCp3 => "deepbacs_cp3",
            Self::Cyto2 => "cyto2",
            Self::Cyto => "cyto",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully resolved segmentation model choice: either a pretrained family or
/// a custom model file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelSpec {
    Pretrained(ModelFamily),
    Custom(PathBuf),
}

impl ModelSpec {
    pub fn is_sized(&self) -> bool {
        matches!(self, Self::Pretrained(family) if family.is_sized())
    }

    pub fn family(&self) -> Option<ModelFamily> {
        match self {
            Self::Pretrained(family) => Some(*family),
            Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretrained(family) => family.fmt(f),
            Self::Custom(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Image-restoration model families used for the optional denoise pre-pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum DenoiseFamily {
    #[value(name = "denoise_cyto3")]
    DenoiseCyto3,
    #[value(name = "deblur_cyto3")]
    DeblurCyto3,
    #[value(name = "upsample_cyto3")]
    UpsampleCyto3,
    #[value(name = "denoise_nuclei")]
    DenoiseNuclei,
    #[value(name = "deblur_nuclei")]
    DeblurNuclei,
    #[value(name = "upsample_nuclei")]
    UpsampleNuclei,
}

impl DenoiseFamily {
    /// Upsampling variants resample the image so that objects match the
    /// segmentation model's native training diameter. The constant is a
    /// property of the variant, independent of the user-requested diameter.
    pub const fn upsample_target(self) -> Option<f64> {
        match self {
            Self::UpsampleCyto3 => Some(30.0),
            Self::UpsampleNuclei => Some(17.0),
            _ => None,
        }
    }

    pub const fn is_upsampling(self) -> bool {
        self.upsample_target().is_some()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::DenoiseCyto3 => "denoise_cyto3",
            Self::DeblurCyto3 => "deblur_cyto3",
            Self::UpsampleCyto3 => "upsample_cyto3",
            Self::DenoiseNuclei => "denoise_nuclei",
            Self::DeblurNuclei => "deblur_nuclei",
            Self::UpsampleNuclei => "upsample_nuclei",
        }
    }
}

impl fmt::Display for DenoiseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a loaded segmentation model. Two invocations with equal keys
/// must reuse the same loaded handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub spec: ModelSpec,
    pub gpu: bool,
}

/// Identity of a loaded denoising model, tracked independently of the
/// segmentation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DenoiseKey {
    pub family: DenoiseFamily,
    pub gpu: bool,
    /// Whether the composed input carries an auxiliary nuclear channel.
    pub with_nuclei: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_families_match_size_scaling_support() {
        for family in [
            ModelFamily::Cyto3,
            ModelFamily::Cyto2,
            ModelFamily::Cyto,
            ModelFamily::Nuclei,
        ] {
            assert!(family.is_sized(), "{family} should support auto sizing");
        }
        for family in [
            ModelFamily::Cyto2Cp3,
            ModelFamily::TissuenetCp3,
            ModelFamily::LivecellCp3,
            ModelFamily::BactPhaseCp3,
            ModelFamily::Custom,
        ] {
            assert!(!family.is_sized(), "{family} should require a diameter");
        }
    }

    #[test]
    fn custom_spec_is_never_sized() {
        let spec = ModelSpec::Custom(PathBuf::from("/models/my_model.onnx"));
        assert!(!spec.is_sized());
        assert_eq!(spec.family(), None);
    }

    #[test]
    fn upsample_targets() {
        assert_eq!(DenoiseFamily::UpsampleCyto3.upsample_target(), Some(30.0));
        assert_eq!(DenoiseFamily::UpsampleNuclei.upsample_target(), Some(17.0));
        assert_eq!(DenoiseFamily::DenoiseCyto3.upsample_target(), None);
        assert!(!DenoiseFamily::DeblurNuclei.is_upsampling());
    }
}
