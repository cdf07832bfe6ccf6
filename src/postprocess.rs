use std::collections::HashSet;

use ndarray::prelude::*;
use ndarray::IxDyn;
use num_traits::{Float, Zero};

use crate::errors::{CellSegError, Result};

/// Resize a label map to `shape` with nearest-neighbour sampling.
///
/// Labels are categorical, so only label-preserving interpolation is valid
/// here; smoothing would invent ids that never existed.
pub fn resize_labels(labels: &ArrayD<u32>, shape: &[usize]) -> Result<ArrayD<u32>> {
    check_rank("labels", labels.ndim(), shape)?;
    Ok(resize_nearest(labels, shape))
}

/// Resize a continuous-valued map (the probability image) to `shape` with
/// multilinear interpolation.
pub fn resize_probabilities(probabilities: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    check_rank("probabilities", probabilities.ndim(), shape)?;
    Ok(resize_linear(probabilities, shape))
}

/// Discard every object whose footprint touches any boundary face of the
/// (possibly volumetric) label map. Surviving objects keep their ids and
/// removed ids never reappear; no relabeling happens.
pub fn remove_edge_masks(labels: ArrayD<u32>) -> ArrayD<u32> {
    let mut edge_ids: HashSet<u32> = HashSet::new();
    for axis in 0..labels.ndim() {
        let extent = labels.shape()[axis];
        if extent == 0 {
            continue;
        }
        for &id in labels.index_axis(Axis(axis), 0).iter() {
            if id != 0 {
                edge_ids.insert(id);
            }
        }
        if extent > 1 {
            for &id in labels.index_axis(Axis(axis), extent - 1).iter() {
                if id != 0 {
                    edge_ids.insert(id);
                }
            }
        }
    }
    if edge_ids.is_empty() {
        return labels;
    }
    let mut labels = labels;
    labels.mapv_inplace(|id| if edge_ids.contains(&id) { 0 } else { id });
    labels
}

fn check_rank(field: &str, ndim: usize, shape: &[usize]) -> Result<()> {
    if ndim != shape.len() {
        return Err(CellSegError::Validation {
            field: field.to_string(),
            reason: format!(
                "cannot resize a {ndim}-d array to a {}-d shape {shape:?}",
                shape.len()
            ),
        });
    }
    Ok(())
}

/// Map an output index to its source coordinate, pixel centers aligned.
fn source_position(index: usize, scale: f64, limit: usize) -> f64 {
    ((index as f64 + 0.5) * scale - 0.5).clamp(0.0, (limit - 1) as f64)
}

fn resize_nearest<T: Copy + Zero>(input: &ArrayD<T>, shape: &[usize]) -> ArrayD<T> {
    if input.shape() == shape {
        return input.clone();
    }
    let scales: Vec<f64> = shape
        .iter()
        .zip(input.shape())
        .map(|(&out, &src)| src as f64 / out as f64)
        .collect();

    let mut source = vec![0usize; shape.len()];
    let mut output = ArrayD::<T>::zeros(IxDyn(shape));
    for (index, value) in output.indexed_iter_mut() {
        for (d, &i) in index.slice().iter().enumerate() {
            source[d] = source_position(i, scales[d], input.shape()[d]).round() as usize;
        }
        *value = input[IxDyn(&source)];
    }
    output
}

fn resize_linear<T: Float>(input: &ArrayD<T>, shape: &[usize]) -> ArrayD<T> {
    if input.shape() == shape {
        return input.clone();
    }
    let ndim = shape.len();
    let scales: Vec<f64> = shape
        .iter()
        .zip(input.shape())
        .map(|(&out, &src)| src as f64 / out as f64)
        .collect();

    let mut lower = vec![0usize; ndim];
    let mut fraction = vec![0.0f64; ndim];
    let mut corner = vec![0usize; ndim];
    let mut output = ArrayD::<T>::zeros(IxDyn(shape));
    for (index, value) in output.indexed_iter_mut() {
        for (d, &i) in index.slice().iter().enumerate() {
            let position = source_position(i, scales[d], input.shape()[d]);
            lower[d] = position.floor() as usize;
            fraction[d] = position - position.floor();
        }
        // Weighted sum over the 2^ndim surrounding grid points.
        let mut accumulated = 0.0f64;
        for bits in 0..(1usize << ndim) {
            let mut weight = 1.0f64;
            for d in 0..ndim {
                if bits >> d & 1 == 1 {
                    corner[d] = (lower[d] + 1).min(input.shape()[d] - 1);
                    weight *= fraction[d];
                } else {
                    corner[d] = lower[d];
                    weight *= 1.0 - fraction[d];
                }
            }
            if weight > 0.0 {
                accumulated += weight * input[IxDyn(&corner)].to_f64().unwrap_or(0.0);
            }
        }
        *value = T::from(accumulated).unwrap_or_else(T::zero);
    }
    output
}
