use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::prelude::*;
use ndarray::{IxDyn, Slice};
use parking_lot::Mutex;

use crate::channels::ChannelPair;
use crate::config::Config;
use crate::errors::{CellSegError, Result};
use crate::family::{DenoiseFamily, DenoiseKey, ModelFamily, ModelKey};
use crate::postprocess;
use crate::traits::{
    Accelerator, DenoiseModel, ModelLoader, SegmentationModel, SegmentationOutput,
    SegmentationRequest,
};
use crate::workspace::{ImageSink, LabeledObjects, ObjectSink, ProbabilityImage};

/// テスト用のロード回数カウンタ（ローダーと共有）
#[derive(Debug, Clone, Default)]
pub struct LoadCounters {
    segmenter: Arc<AtomicUsize>,
    denoiser: Arc<AtomicUsize>,
}

impl LoadCounters {
    pub fn segmenter_loads(&self) -> usize {
        self.segmenter.load(Ordering::SeqCst)
    }

    pub fn denoiser_loads(&self) -> usize {
        self.denoiser.load(Ordering::SeqCst)
    }
}

/// テスト用のモックモデルローダー
///
/// ロード回数を記録し、生成したモデルはリクエストを共有バッファに残す
#[derive(Debug, Clone, Default)]
pub struct MockModelLoader {
    counters: LoadCounters,
    requests: Arc<Mutex<Vec<SegmentationRequest>>>,
    denoise_calls: Arc<Mutex<Vec<(Option<f64>, ChannelPair)>>>,
    labels_override: Arc<Mutex<Option<ArrayD<u32>>>>,
    fail_eval: Arc<AtomicBool>,
}

impl MockModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> LoadCounters {
        self.counters.clone()
    }

    /// セグメンテーションモデルが受け取ったリクエストの記録
    pub fn requests(&self) -> Arc<Mutex<Vec<SegmentationRequest>>> {
        Arc::clone(&self.requests)
    }

    /// 復元モデルが受け取った（直径、チャンネル）の記録
    pub fn denoise_calls(&self) -> Arc<Mutex<Vec<(Option<f64>, ChannelPair)>>> {
        Arc::clone(&self.denoise_calls)
    }

    /// モックが返すラベルマップを固定する
    pub fn set_labels(&self, labels: ArrayD<u32>) {
        *self.labels_override.lock() = Some(labels);
    }

    /// セグメンテーション推論を失敗させる
    pub fn fail_segmentation(&self, fail: bool) {
        self.fail_eval.store(fail, Ordering::SeqCst);
    }
}

impl ModelLoader for MockModelLoader {
    type Segmenter = MockSegmenter;
    type Denoiser = MockDenoiser;

    fn load_segmenter(&self, _key: &ModelKey) -> Result<Self::Segmenter> {
        self.counters.segmenter.fetch_add(1, Ordering::SeqCst);
        Ok(MockSegmenter {
            requests: Arc::clone(&self.requests),
            labels_override: Arc::clone(&self.labels_override),
            fail_eval: Arc::clone(&self.fail_eval),
        })
    }

    fn load_denoiser(&self, key: &DenoiseKey) -> Result<Self::Denoiser> {
        self.counters.denoiser.fetch_add(1, Ordering::SeqCst);
        Ok(MockDenoiser {
            family: key.family,
            calls: Arc::clone(&self.denoise_calls),
        })
    }
}

/// テスト用のモックセグメンテーションモデル
///
/// リクエストを記録し、入力の空間形状に合わせたラベルマップを返す
#[derive(Debug, Clone)]
pub struct MockSegmenter {
    requests: Arc<Mutex<Vec<SegmentationRequest>>>,
    labels_override: Arc<Mutex<Option<ArrayD<u32>>>>,
    fail_eval: Arc<AtomicBool>,
}

impl SegmentationModel for MockSegmenter {
    fn eval(&self, request: &SegmentationRequest) -> Result<SegmentationOutput> {
        self.requests.lock().push(request.clone());
        if self.fail_eval.load(Ordering::SeqCst) {
            return Err(CellSegError::Inference {
                operation: "segmentation eval".to_string(),
                source: Box::new(std::io::Error::other("injected inference failure")),
            });
        }
        let labels = match self.labels_override.lock().clone() {
            Some(labels) => labels,
            None => ArrayD::<u32>::zeros(IxDyn(&spatial_shape(request))),
        };
        let probabilities = ArrayD::<f32>::zeros(labels.raw_dim());
        Ok(SegmentationOutput {
            labels,
            probabilities,
        })
    }
}

/// 合成テンソルからチャンネル軸を除いた空間形状
fn spatial_shape(request: &SegmentationRequest) -> Vec<usize> {
    let shape = request.tensor.shape();
    if request.channels == ChannelPair::GRAYSCALE {
        return shape.to_vec();
    }
    let channel_axis = if request.do_3d { 1 } else { shape.len() - 1 };
    let mut spatial = shape.to_vec();
    spatial.remove(channel_axis);
    spatial
}

/// テスト用のモック復元モデル
///
/// 合成ゼロプレーンを取り除き、アップサンプリング系ではネイティブ直径に
/// 合わせて空間解像度をスケールする（2Dのみの簡易実装）
#[derive(Debug, Clone)]
pub struct MockDenoiser {
    family: DenoiseFamily,
    calls: Arc<Mutex<Vec<(Option<f64>, ChannelPair)>>>,
}

impl DenoiseModel for MockDenoiser {
    fn eval(
        &self,
        tensor: &ArrayD<f32>,
        diameter: Option<f64>,
        channels: ChannelPair,
    ) -> Result<ArrayD<f32>> {
        self.calls.lock().push((diameter, channels));

        // 出力には要求されたプレーンのみが含まれる
        let restored = if channels == ChannelPair::COMPOSED {
            let channel_axis = Axis(tensor.ndim() - 1);
            tensor
                .slice_axis(channel_axis, Slice::from(1..))
                .to_owned()
        } else {
            tensor.clone()
        };

        let scale = match (self.family.upsample_target(), diameter) {
            (Some(native), Some(diameter)) if diameter > 0.0 => native / diameter,
            _ => 1.0,
        };
        if (scale - 1.0).abs() < f64::EPSILON {
            return Ok(restored);
        }

        let mut shape = restored.shape().to_vec();
        let spatial_dims = if channels == ChannelPair::COMPOSED {
            shape.len() - 1
        } else {
            shape.len()
        };
        for extent in shape.iter_mut().take(spatial_dims) {
            *extent = (*extent as f64 * scale).round() as usize;
        }
        postprocess::resize_probabilities(&restored, &shape)
    }
}

/// テスト用のモックアクセラレータ
///
/// 予約・解放の回数を記録し、解放失敗を注入できる
#[derive(Debug, Clone, Default)]
pub struct MockAccelerator {
    state: Arc<MockAcceleratorState>,
}

#[derive(Debug, Default)]
struct MockAcceleratorState {
    reserves: AtomicUsize,
    releases: AtomicUsize,
    fail_release: AtomicBool,
}

impl MockAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve_count(&self) -> usize {
        self.state.reserves.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    pub fn fail_release(&self, fail: bool) {
        self.state.fail_release.store(fail, Ordering::SeqCst);
    }
}

impl Accelerator for MockAccelerator {
    fn reserve(&self, _memory_fraction: f64) -> Result<()> {
        self.state.reserves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_release.load(Ordering::SeqCst) {
            return Err(CellSegError::Inference {
                operation: "accelerator cache clear".to_string(),
                source: Box::new(std::io::Error::other("injected release failure")),
            });
        }
        Ok(())
    }
}

/// テスト用のインメモリ出力シンク
#[derive(Debug, Default)]
pub struct InMemoryObjectSink {
    pub objects: Vec<LabeledObjects>,
}

impl ObjectSink for InMemoryObjectSink {
    fn add_objects(&mut self, objects: LabeledObjects) -> Result<()> {
        self.objects.push(objects);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryImageSink {
    pub images: Vec<ProbabilityImage>,
}

impl ImageSink for InMemoryImageSink {
    fn add_image(&mut self, image: ProbabilityImage) -> Result<()> {
        self.images.push(image);
        Ok(())
    }
}

/// テスト用のデフォルト設定（CLIの既定値と同じ）
pub fn test_config() -> Config {
    Config {
        input: PathBuf::from("input"),
        output_dir: PathBuf::from("output"),
        model: ModelFamily::Cyto3,
        model_path: None,
        model_dir: PathBuf::from("models"),
        diameter: 30,
        use_gpu: false,
        device_id: 0,
        gpu_memory_share: 0.1,
        invert: false,
        nuclei_image: None,
        object_name: "Objects".to_string(),
        save_probabilities: false,
        probabilities_name: "Probabilities".to_string(),
        flow_threshold: 0.4,
        cellprob_threshold: 0.0,
        stitch_threshold: 0.0,
        min_size: 15,
        remove_edge_masks: true,
        denoise: None,
        do_3d: false,
        spacing: vec![1.0, 1.0, 1.0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_loader_counts_loads() {
        let loader = MockModelLoader::new();
        let counters = loader.counters();
        let key = ModelKey {
            spec: crate::family::ModelSpec::Pretrained(ModelFamily::Cyto3),
            gpu: false,
        };
        loader.load_segmenter(&key).unwrap();
        loader.load_segmenter(&key).unwrap();
        assert_eq!(counters.segmenter_loads(), 2);
    }

    #[test]
    fn mock_denoiser_strips_the_zero_plane() {
        let loader = MockModelLoader::new();
        let denoiser = loader
            .load_denoiser(&DenoiseKey {
                family: DenoiseFamily::DenoiseCyto3,
                gpu: false,
                with_nuclei: true,
            })
            .unwrap();
        let composed = ArrayD::<f32>::zeros(IxDyn(&[10, 10, 3]));
        let restored = denoiser
            .eval(&composed, Some(30.0), ChannelPair::COMPOSED)
            .unwrap();
        assert_eq!(restored.shape(), &[10, 10, 2]);
    }

    #[test]
    fn mock_upsampler_scales_to_native_diameter() {
        let loader = MockModelLoader::new();
        let denoiser = loader
            .load_denoiser(&DenoiseKey {
                family: DenoiseFamily::UpsampleCyto3,
                gpu: false,
                with_nuclei: false,
            })
            .unwrap();
        let plane = ArrayD::<f32>::zeros(IxDyn(&[100, 100]));
        let restored = denoiser
            .eval(&plane, Some(15.0), ChannelPair::GRAYSCALE)
            .unwrap();
        assert_eq!(restored.shape(), &[200, 200]);
    }
}
