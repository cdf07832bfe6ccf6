use tracing::{debug, info};

use crate::errors::Result;
use crate::family::{DenoiseKey, ModelKey};
use crate::traits::ModelLoader;

/// Process-local cache holding at most one loaded segmentation model and one
/// loaded denoising model.
///
/// Models reload only when the identity key changes; repeated invocations
/// with unchanged settings reuse the existing handles. Replacing a handle
/// drops the previous one, which releases whatever external resources its
/// loader acquired.
pub struct ModelCache<L: ModelLoader> {
    loader: L,
    segmenter: Option<(ModelKey, L::Segmenter)>,
    denoiser: Option<(DenoiseKey, L::Denoiser)>,
}

impl<L: ModelLoader> ModelCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            segmenter: None,
            denoiser: None,
        }
    }

    /// Return the segmentation model for `key`, loading it only when the
    /// cached identity differs.
    pub fn segmenter(&mut self, key: &ModelKey) -> Result<&L::Segmenter> {
        if self.segmenter.as_ref().map_or(true, |(cached, _)| cached != key) {
            info!(model = %key.spec, gpu = key.gpu, "loading segmentation model");
            let handle = self.loader.load_segmenter(key)?;
            if self.segmenter.replace((key.clone(), handle)).is_some() {
                debug!("replaced previously cached segmentation model");
            }
        }
        let (_, model) = self
            .segmenter
            .as_ref()
            .expect("cache entry populated above");
        Ok(model)
    }

    /// Return the denoising model for `key`, loading it only when the cached
    /// identity differs. Tracked independently of the segmentation model.
    pub fn denoiser(&mut self, key: &DenoiseKey) -> Result<&L::Denoiser> {
        if self.denoiser.as_ref().map_or(true, |(cached, _)| cached != key) {
            info!(denoiser = %key.family, gpu = key.gpu, "loading denoising model");
            let handle = self.loader.load_denoiser(key)?;
            if self.denoiser.replace((*key, handle)).is_some() {
                debug!("replaced previously cached denoising model");
            }
        }
        let (_, model) = self.denoiser.as_ref().expect("cache entry populated above");
        Ok(model)
    }

    /// Drop the cached denoiser, used when preprocessing is switched off.
    pub fn clear_denoiser(&mut self) {
        if self.denoiser.take().is_some() {
            debug!("released cached denoising model");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{DenoiseFamily, ModelFamily, ModelSpec};
    use crate::mocks::MockModelLoader;

    fn key(gpu: bool) -> ModelKey {
        ModelKey {
            spec: ModelSpec::Pretrained(ModelFamily::Cyto3),
            gpu,
        }
    }

    #[test]
    fn identical_keys_do_not_reload() {
        let loader = MockModelLoader::new();
        let counters = loader.counters();
        let mut cache = ModelCache::new(loader);

        cache.segmenter(&key(false)).unwrap();
        cache.segmenter(&key(false)).unwrap();

        assert_eq!(counters.segmenter_loads(), 1);
    }

    #[test]
    fn changing_the_accelerator_flag_reloads_exactly_once() {
        let loader = MockModelLoader::new();
        let counters = loader.counters();
        let mut cache = ModelCache::new(loader);

        cache.segmenter(&key(false)).unwrap();
        cache.segmenter(&key(true)).unwrap();
        cache.segmenter(&key(true)).unwrap();

        assert_eq!(counters.segmenter_loads(), 2);
    }

    #[test]
    fn changing_the_model_spec_reloads() {
        let loader = MockModelLoader::new();
        let counters = loader.counters();
        let mut cache = ModelCache::new(loader);

        cache.segmenter(&key(false)).unwrap();
        cache
            .segmenter(&ModelKey {
                spec: ModelSpec::Pretrained(ModelFamily::Nuclei),
                gpu: false,
            })
            .unwrap();

        assert_eq!(counters.segmenter_loads(), 2);
    }

    #[test]
    fn denoiser_cache_is_independent() {
        let loader = MockModelLoader::new();
        let counters = loader.counters();
        let mut cache = ModelCache::new(loader);

        let den = DenoiseKey {
            family: DenoiseFamily::DenoiseCyto3,
            gpu: false,
            with_nuclei: false,
        };
        cache.denoiser(&den).unwrap();
        cache.denoiser(&den).unwrap();
        // Reloading the segmenter must not disturb the cached denoiser.
        cache.segmenter(&key(false)).unwrap();
        cache.denoiser(&den).unwrap();

        assert_eq!(counters.denoiser_loads(), 1);

        // A changed nuclei flag is a different identity.
        cache
            .denoiser(&DenoiseKey {
                with_nuclei: true,
                ..den
            })
            .unwrap();
        assert_eq!(counters.denoiser_loads(), 2);
    }

    #[test]
    fn clearing_the_denoiser_forces_a_reload() {
        let loader = MockModelLoader::new();
        let counters = loader.counters();
        let mut cache = ModelCache::new(loader);

        let den = DenoiseKey {
            family: DenoiseFamily::DeblurNuclei,
            gpu: false,
            with_nuclei: false,
        };
        cache.denoiser(&den).unwrap();
        cache.clear_denoiser();
        cache.denoiser(&den).unwrap();

        assert_eq!(counters.denoiser_loads(), 2);
    }
}
