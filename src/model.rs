use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::prelude::*;
use ndarray::Slice;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::debug;

use crate::channels::ChannelPair;
use crate::errors::{CellSegError, Result};
use crate::family::{DenoiseKey, ModelKey, ModelSpec};
use crate::traits::{
    Accelerator, DenoiseModel, ModelLoader, SegmentationModel, SegmentationOutput,
    SegmentationRequest,
};

/// Loads ONNX exports of the segmentation and restoration models.
///
/// Pretrained families resolve to `<model_dir>/<name>.onnx`; custom models
/// use their configured path directly.
pub struct OnnxModelLoader {
    model_dir: PathBuf,
    device_id: i32,
}

impl OnnxModelLoader {
    pub fn new(model_dir: impl Into<PathBuf>, device_id: i32) -> Self {
        Self {
            model_dir: model_dir.into(),
            device_id,
        }
    }

    fn pretrained_path(&self, name: &str) -> Result<PathBuf> {
        let path = self.model_dir.join(format!("{name}.onnx"));
        if !path.exists() {
            return Err(CellSegError::configuration(format!(
                "Failed to open model: {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

impl ModelLoader for OnnxModelLoader {
    type Segmenter = OnnxSegmenter;
    type Denoiser = OnnxDenoiser;

    fn load_segmenter(&self, key: &ModelKey) -> Result<Self::Segmenter> {
        let path = match &key.spec {
            ModelSpec::Pretrained(family) => self.pretrained_path(family.name())?,
            ModelSpec::Custom(path) => path.clone(),
        };
        let session = build_session(&path, key.gpu, self.device_id)?;
        let with_parameters = declares_input(&session, "diameter");
        Ok(OnnxSegmenter {
            session: Mutex::new(session),
            with_parameters,
        })
    }

    fn load_denoiser(&self, key: &DenoiseKey) -> Result<Self::Denoiser> {
        let path = self.pretrained_path(key.family.name())?;
        let session = build_session(&path, key.gpu, self.device_id)?;
        let with_parameters = declares_input(&session, "diameter");
        Ok(OnnxDenoiser {
            session: Mutex::new(session),
            with_parameters,
        })
    }
}

fn build_session(model_path: &Path, gpu: bool, device_id: i32) -> Result<Session> {
    let builder = SessionBuilder::new().map_err(|e| CellSegError::Inference {
        operation: "session builder initialization".to_string(),
        source: Box::new(e),
    })?;

    let builder = if gpu {
        builder
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| CellSegError::Inference {
                operation: "execution provider setup".to_string(),
                source: Box::new(e),
            })?
    } else {
        builder
    };

    builder
        .with_memory_pattern(true)
        .map_err(|e| CellSegError::Inference {
            operation: "memory pattern setup".to_string(),
            source: Box::new(e),
        })?
        .commit_from_file(model_path)
        .map_err(|e| CellSegError::Inference {
            operation: format!("model file load: {}", model_path.display()),
            source: Box::new(e),
        })
}

fn declares_input(session: &Session, name: &str) -> bool {
    session.inputs.iter().any(|input| input.name == name)
}

/// Segmentation backend running an ONNX export plane by plane.
///
/// The network itself is a black box: it consumes a two-channel input
/// (signal, auxiliary) and emits an instance label map plus the pixel
/// probability map. This wrapper owns the channel arrangement, per-plane
/// iteration, cross-plane stitching and the minimum-size filter.
pub struct OnnxSegmenter {
    session: Mutex<Session>,
    /// Whether the export declares scalar parameter inputs alongside `img`.
    with_parameters: bool,
}

impl SegmentationModel for OnnxSegmenter {
    fn eval(&self, request: &SegmentationRequest) -> Result<SegmentationOutput> {
        let slices = channel_slices(&request.tensor, request.channels, request.do_3d)?;
        let stacked = slices.stacked;

        let mut label_planes: Vec<Array2<u32>> = Vec::with_capacity(slices.pairs.len());
        let mut prob_planes: Vec<Array2<f32>> = Vec::with_capacity(slices.pairs.len());

        for (signal, auxiliary) in slices.pairs {
            let signal = normalize_plane(signal, request.invert);
            let auxiliary = normalize_plane(auxiliary, false);
            let input = model_input(&signal, &auxiliary)?;
            let (labels, probabilities) = self.run_plane(&input, request)?;
            label_planes.push(labels);
            prob_planes.push(probabilities);
        }

        let mut labels = if stacked {
            offset_plane_ids(&mut label_planes);
            if request.stitch_threshold > 0.0 {
                label_planes = stitch_planes(label_planes, request.stitch_threshold);
            }
            stack_planes(&label_planes)?
        } else {
            label_planes.remove(0).into_dyn()
        };
        let probabilities = if stacked {
            stack_planes(&prob_planes)?
        } else {
            prob_planes.remove(0).into_dyn()
        };

        labels = filter_small_objects(labels, request.min_size);

        Ok(SegmentationOutput {
            labels,
            probabilities,
        })
    }
}

impl OnnxSegmenter {
    fn run_plane(
        &self,
        input: &Array4<f32>,
        request: &SegmentationRequest,
    ) -> Result<(Array2<u32>, Array2<f32>)> {
        let mut session = self.session.lock();
        let outputs = if self.with_parameters {
            // 0 requests the export's own size estimation.
            let diameter = Array1::from_elem(1, request.diameter.unwrap_or(0.0) as f32);
            let flow = Array1::from_elem(1, request.flow_threshold as f32);
            let cellprob = Array1::from_elem(1, request.cellprob_threshold as f32);
            session.run(ort::inputs![
                "img" => TensorRef::from_array_view(input)?,
                "diameter" => TensorRef::from_array_view(&diameter)?,
                "flow_threshold" => TensorRef::from_array_view(&flow)?,
                "cellprob_threshold" => TensorRef::from_array_view(&cellprob)?,
            ])?
        } else {
            session.run(ort::inputs!["img" => TensorRef::from_array_view(input)?])?
        };

        let labels = outputs["masks"]
            .try_extract_array::<i64>()?
            .into_dimensionality::<Ix3>()?
            .index_axis(Axis(0), 0)
            .mapv(|id| u32::try_from(id).unwrap_or(0));
        let probabilities = outputs["cellprob"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?
            .index_axis(Axis(0), 0)
            .to_owned();
        Ok((labels, probabilities))
    }
}

/// Restoration backend mirroring the segmenter's input arrangement.
pub struct OnnxDenoiser {
    session: Mutex<Session>,
    with_parameters: bool,
}

impl DenoiseModel for OnnxDenoiser {
    fn eval(
        &self,
        tensor: &ArrayD<f32>,
        diameter: Option<f64>,
        channels: ChannelPair,
    ) -> Result<ArrayD<f32>> {
        // Rank-4 input is either (Z, C, Y, X) from 3D composition or
        // (Z, Y, X, C) from a plane stack composed for stitching; the
        // three-plane channel axis disambiguates.
        let volumetric = tensor.ndim() == 4 && tensor.shape()[1] == 3;
        let slices = channel_slices(tensor, channels, volumetric)?;
        let with_auxiliary = channels != ChannelPair::GRAYSCALE;

        let mut restored: Vec<ArrayD<f32>> = Vec::with_capacity(slices.pairs.len());
        for (signal, auxiliary) in slices.pairs {
            let input = model_input(&signal, &auxiliary)?;
            let output = self.run_plane(&input, diameter)?;
            restored.push(assemble_restored(output, with_auxiliary, volumetric)?);
        }

        if slices.stacked {
            let views: Vec<_> = restored.iter().map(ArrayD::view).collect();
            Ok(ndarray::stack(Axis(0), &views)?)
        } else {
            // Single plane; drop the temporary stack structure.
            Ok(restored.remove(0))
        }
    }
}

impl OnnxDenoiser {
    fn run_plane(&self, input: &Array4<f32>, diameter: Option<f64>) -> Result<Array4<f32>> {
        let mut session = self.session.lock();
        let outputs = if self.with_parameters {
            let diameter = Array1::from_elem(1, diameter.unwrap_or(0.0) as f32);
            session.run(ort::inputs![
                "img" => TensorRef::from_array_view(input)?,
                "diameter" => TensorRef::from_array_view(&diameter)?,
            ])?
        } else {
            session.run(ort::inputs!["img" => TensorRef::from_array_view(input)?])?
        };
        Ok(outputs["img"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

/// Rebuild one restored slice from the network's `(1, C, H, W)` output,
/// restoring the channel-axis convention of the composed input: trailing for
/// planar tensors, right after the batch position for volumetric ones.
fn assemble_restored(
    output: Array4<f32>,
    with_auxiliary: bool,
    volumetric: bool,
) -> Result<ArrayD<f32>> {
    let output = output.index_axis_move(Axis(0), 0);
    if !with_auxiliary {
        return Ok(output.index_axis_move(Axis(0), 0).into_dyn());
    }
    if output.shape()[0] < 2 {
        return Err(CellSegError::Inference {
            operation: "restoration output extraction".to_string(),
            source: Box::new(std::io::Error::other(
                "model returned a single channel for a two-channel input",
            )),
        });
    }
    let pair = output.slice_axis(Axis(0), Slice::from(..2)).to_owned();
    if volumetric {
        Ok(pair.into_dyn())
    } else {
        Ok(pair.permuted_axes([1, 2, 0]).into_dyn())
    }
}

struct ChannelSlices {
    pairs: Vec<(Array2<f32>, Array2<f32>)>,
    /// Whether the input carried a leading depth/stack axis.
    stacked: bool,
}

/// Split the composed tensor into per-plane (signal, auxiliary) pairs using
/// the 1-indexed channel convention: index 0 selects greyscale for the
/// signal slot and "absent" for the auxiliary slot; index k selects plane
/// k-1 of the channel axis.
fn channel_slices(
    tensor: &ArrayD<f32>,
    channels: ChannelPair,
    do_3d: bool,
) -> Result<ChannelSlices> {
    let composed = channels != ChannelPair::GRAYSCALE;
    let mut pairs = Vec::new();
    let stacked;

    match (composed, tensor.ndim()) {
        (false, 2) => {
            stacked = false;
            let plane = tensor
                .to_owned()
                .into_dimensionality::<Ix2>()?
                .insert_axis(Axis(0));
            pairs.push(split_channels(plane.view(), channels)?);
        }
        (false, 3) => {
            stacked = true;
            for z in 0..tensor.shape()[0] {
                let plane = tensor
                    .index_axis(Axis(0), z)
                    .to_owned()
                    .into_dimensionality::<Ix2>()?
                    .insert_axis(Axis(0));
                pairs.push(split_channels(plane.view(), channels)?);
            }
        }
        (true, 3) => {
            // (Y, X, C) with a trailing channel axis.
            stacked = false;
            let plane = tensor
                .view()
                .permuted_axes(vec![2, 0, 1])
                .to_owned()
                .into_dimensionality::<Ix3>()?;
            pairs.push(split_channels(plane.view(), channels)?);
        }
        (true, 4) if do_3d => {
            // (Z, C, Y, X): channel axis right after depth.
            stacked = true;
            for z in 0..tensor.shape()[0] {
                let plane = tensor
                    .index_axis(Axis(0), z)
                    .to_owned()
                    .into_dimensionality::<Ix3>()?;
                pairs.push(split_channels(plane.view(), channels)?);
            }
        }
        (true, 4) => {
            // (Z, Y, X, C): a plane stack composed for stitching.
            stacked = true;
            for z in 0..tensor.shape()[0] {
                let plane = tensor
                    .index_axis(Axis(0), z)
                    .permuted_axes(vec![2, 0, 1])
                    .to_owned()
                    .into_dimensionality::<Ix3>()?;
                pairs.push(split_channels(plane.view(), channels)?);
            }
        }
        (_, ndim) => {
            return Err(CellSegError::Validation {
                field: "tensor".to_string(),
                reason: format!("unsupported input rank {ndim} for channels {channels:?}"),
            });
        }
    }

    Ok(ChannelSlices { pairs, stacked })
}

fn split_channels(
    plane: ArrayView3<f32>,
    channels: ChannelPair,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let signal = match channels.0 {
        0 => plane.mean_axis(Axis(0)).ok_or_else(|| CellSegError::Validation {
            field: "tensor".to_string(),
            reason: "empty channel axis".to_string(),
        })?,
        index => channel_plane(plane, index)?,
    };
    let auxiliary = match channels.1 {
        0 => Array2::zeros(signal.raw_dim()),
        index => channel_plane(plane, index)?,
    };
    Ok((signal, auxiliary))
}

fn channel_plane(plane: ArrayView3<f32>, index: u32) -> Result<Array2<f32>> {
    let offset = index as usize - 1;
    if offset >= plane.shape()[0] {
        return Err(CellSegError::Validation {
            field: "channels".to_string(),
            reason: format!(
                "channel index {index} exceeds the {} available planes",
                plane.shape()[0]
            ),
        });
    }
    Ok(plane.index_axis(Axis(0), offset).to_owned())
}

/// Rescale to the 1st..99th percentile range, optionally inverting.
fn normalize_plane(mut plane: Array2<f32>, invert: bool) -> Array2<f32> {
    let mut values: Vec<f32> = plane.iter().copied().collect();
    values.sort_by(f32::total_cmp);
    let low = percentile(&values, 1.0);
    let high = percentile(&values, 99.0);
    let range = (high - low).max(f32::EPSILON);
    plane.mapv_inplace(|v| {
        let scaled = ((v - low) / range).clamp(0.0, 1.0);
        if invert {
            1.0 - scaled
        } else {
            scaled
        }
    });
    plane
}

fn percentile(sorted: &[f32], pct: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = (pct / 100.0 * (sorted.len() - 1) as f32).round() as usize;
    sorted[position.min(sorted.len() - 1)]
}

fn model_input(signal: &Array2<f32>, auxiliary: &Array2<f32>) -> Result<Array4<f32>> {
    let stacked = ndarray::stack(Axis(0), &[signal.view(), auxiliary.view()])?;
    Ok(stacked.insert_axis(Axis(0)))
}

/// Make plane-local ids unique across the whole stack.
fn offset_plane_ids(planes: &mut [Array2<u32>]) {
    let mut offset = 0u32;
    for plane in planes.iter_mut() {
        let highest = plane.iter().copied().max().unwrap_or(0);
        if offset > 0 {
            plane.mapv_inplace(|id| if id == 0 { 0 } else { id + offset });
        }
        offset += highest;
    }
}

/// Merge object identities across adjacent planes wherever the overlap
/// fraction (intersection over union) with the previous plane's object meets
/// the threshold. Each object adopts at most one id: its best match.
fn stitch_planes(mut planes: Vec<Array2<u32>>, threshold: f64) -> Vec<Array2<u32>> {
    for z in 1..planes.len() {
        let (done, rest) = planes.split_at_mut(z);
        let previous = &done[z - 1];
        let current = &mut rest[0];

        let mut intersection: HashMap<(u32, u32), f64> = HashMap::new();
        let mut current_area: HashMap<u32, f64> = HashMap::new();
        let mut previous_area: HashMap<u32, f64> = HashMap::new();
        for (&cur, &prev) in current.iter().zip(previous.iter()) {
            if cur != 0 {
                *current_area.entry(cur).or_default() += 1.0;
            }
            if prev != 0 {
                *previous_area.entry(prev).or_default() += 1.0;
            }
            if cur != 0 && prev != 0 {
                *intersection.entry((cur, prev)).or_default() += 1.0;
            }
        }

        // Best IoU per current-plane object.
        let mut adopted: HashMap<u32, (u32, f64)> = HashMap::new();
        for (&(cur, prev), &overlap) in &intersection {
            let union = current_area[&cur] + previous_area[&prev] - overlap;
            let iou = overlap / union;
            if iou < threshold {
                continue;
            }
            let entry = adopted.entry(cur).or_insert((prev, iou));
            if iou > entry.1 {
                *entry = (prev, iou);
            }
        }
        if adopted.is_empty() {
            continue;
        }
        current.mapv_inplace(|id| adopted.get(&id).map_or(id, |&(prev, _)| prev));
    }
    planes
}

fn stack_planes<T: Copy>(planes: &[Array2<T>]) -> Result<ArrayD<T>> {
    let views: Vec<_> = planes.iter().map(Array2::view).collect();
    Ok(ndarray::stack(Axis(0), &views)?.into_dyn())
}

/// Drop objects smaller than `min_size` pixels; -1 disables the filter.
fn filter_small_objects(mut labels: ArrayD<u32>, min_size: i64) -> ArrayD<u32> {
    if min_size < 0 {
        return labels;
    }
    let mut areas: HashMap<u32, i64> = HashMap::new();
    for &id in labels.iter() {
        if id != 0 {
            *areas.entry(id).or_default() += 1;
        }
    }
    areas.retain(|_, area| *area < min_size);
    if areas.is_empty() {
        return labels;
    }
    labels.mapv_inplace(|id| if areas.contains_key(&id) { 0 } else { id });
    labels
}

/// Best-effort accelerator hooks for the ONNX runtime backend.
///
/// ORT only returns device memory when a session is dropped; the model cache
/// replacing a stale handle is what actually frees it, so release here is a
/// logged no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceAccelerator;

impl Accelerator for DeviceAccelerator {
    fn reserve(&self, memory_fraction: f64) -> Result<()> {
        debug!(memory_fraction, "reserving accelerator memory share");
        Ok(())
    }

    fn release(&self) -> Result<()> {
        debug!("releasing cached accelerator memory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_channels_greyscale_and_absent_auxiliary() {
        let plane = Array3::from_shape_fn((1, 3, 3), |(_, y, x)| (y * 3 + x) as f32);
        let (signal, auxiliary) = split_channels(plane.view(), ChannelPair::GRAYSCALE).unwrap();
        assert_eq!(signal[[1, 1]], 4.0);
        assert!(auxiliary.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn split_channels_composed_selects_one_indexed_planes() {
        let mut plane = Array3::zeros((3, 2, 2));
        plane.index_axis_mut(Axis(0), 1).fill(0.5);
        plane.index_axis_mut(Axis(0), 2).fill(0.25);
        let (signal, auxiliary) = split_channels(plane.view(), ChannelPair::COMPOSED).unwrap();
        assert!(signal.iter().all(|&v| v == 0.5));
        assert!(auxiliary.iter().all(|&v| v == 0.25));
    }

    #[test]
    fn out_of_range_channel_index_is_rejected() {
        let plane = Array3::<f32>::zeros((2, 2, 2));
        assert!(channel_plane(plane.view(), 3).is_err());
    }

    #[test]
    fn normalization_clamps_to_unit_range_and_inverts() {
        let plane = Array2::from_shape_fn((10, 10), |(y, x)| (y * 10 + x) as f32);
        let normalized = normalize_plane(plane.clone(), false);
        assert!(normalized.iter().all(|&v| (0.0..=1.0).contains(&v)));
        let inverted = normalize_plane(plane, true);
        assert_eq!(inverted[[0, 0]], 1.0);
    }

    #[test]
    fn plane_ids_become_unique_across_a_stack() {
        let mut planes = vec![
            ndarray::array![[1u32, 0], [0, 2]],
            ndarray::array![[1u32, 1], [0, 0]],
        ];
        offset_plane_ids(&mut planes);
        assert_eq!(planes[0], ndarray::array![[1, 0], [0, 2]]);
        assert_eq!(planes[1], ndarray::array![[3, 3], [0, 0]]);
    }

    #[test]
    fn stitching_merges_overlapping_objects() {
        // Object 3 overlaps object 1 perfectly; object 4 has no overlap.
        let planes = vec![
            ndarray::array![[1u32, 1, 0, 0], [1, 1, 0, 0]],
            ndarray::array![[3u32, 3, 0, 4], [3, 3, 0, 4]],
        ];
        let stitched = stitch_planes(planes, 0.5);
        assert_eq!(stitched[1][[0, 0]], 1);
        assert_eq!(stitched[1][[0, 3]], 4);
    }

    #[test]
    fn stitching_respects_the_threshold() {
        // IoU here is 1/7, well under 0.5: ids stay separate.
        let planes = vec![
            ndarray::array![[1u32, 1, 1, 1], [0, 0, 0, 0]],
            ndarray::array![[3u32, 0, 0, 0], [3, 3, 3, 0]],
        ];
        let stitched = stitch_planes(planes, 0.5);
        assert_eq!(stitched[1][[0, 0]], 3);
    }

    #[test]
    fn small_objects_are_filtered() {
        let labels = ndarray::array![[5u32, 5, 0], [0, 8, 0], [0, 0, 0]].into_dyn();
        let filtered = filter_small_objects(labels, 2);
        assert!(filtered.iter().all(|&id| id != 8));
        assert_eq!(filtered[[0, 0]], 5);
    }

    #[test]
    fn min_size_minus_one_disables_the_filter() {
        let labels = ndarray::array![[9u32, 0], [0, 0]].into_dyn();
        let filtered = filter_small_objects(labels.clone(), -1);
        assert_eq!(filtered, labels);
    }

    #[test]
    fn channel_slices_iterates_stack_planes() {
        let stack = ArrayD::<f32>::zeros(ndarray::IxDyn(&[4, 8, 8]));
        let slices = channel_slices(&stack, ChannelPair::GRAYSCALE, false).unwrap();
        assert!(slices.stacked);
        assert_eq!(slices.pairs.len(), 4);
        assert_eq!(slices.pairs[0].0.shape(), &[8, 8]);
    }
}
