use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use ndarray::{concatenate, Array3, ArrayView3, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::WindowSample;
use crate::features::labels_for_mtl;
use crate::heads::{HeadSpec, HeadTensors};
use crate::model::ForecastInput;

/// Tensors for one optimizer step. Every asset of every sample in the batch
/// becomes one row of the batch axis.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: ForecastInput,
    /// Raw decoder targets, `[rows, 1, features]`.
    pub targets: Tensor,
    pub labels: HeadTensors,
}

impl Batch {
    pub fn rows(&self) -> candle_core::Result<usize> {
        self.features.input.dim(0)
    }
}

pub fn array_to_tensor(arr: &Array3<f64>, device: &Device) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = arr.iter().map(|v| *v as f32).collect();
    Tensor::from_vec(data, arr.shape(), device)
}

fn stack_samples<'s>(
    samples: impl Iterator<Item = ArrayView3<'s, f64>>,
) -> Result<Array3<f64>> {
    let views: Vec<_> = samples.collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Builds a [`Batch`] from a group of samples.
pub fn make_batch(
    samples: &[&WindowSample],
    names: &[String],
    heads: &[HeadSpec],
    device: &Device,
) -> Result<Batch> {
    ensure!(!samples.is_empty(), "cannot build an empty batch");
    let input = stack_samples(samples.iter().map(|s| s.input.view()))?;
    let output = stack_samples(samples.iter().map(|s| s.output.view()))?;
    let target = stack_samples(samples.iter().map(|s| s.target.view()))?;

    let labels = labels_for_mtl(names, &target, heads)?
        .into_iter()
        .map(|(name, arr)| Ok((name, array_to_tensor(&arr, device)?)))
        .collect::<Result<HeadTensors>>()?;

    Ok(Batch {
        features: ForecastInput {
            input: array_to_tensor(&input, device)?,
            output: array_to_tensor(&output, device)?,
        },
        targets: array_to_tensor(&target, device)?,
        labels,
    })
}

/// Walks a sample slice in groups of `batch_size`, optionally in a seeded
/// random order.
#[derive(Debug, Clone)]
pub struct Batcher<'a> {
    samples: &'a [WindowSample],
    names: &'a [String],
    heads: &'a [HeadSpec],
    device: Device,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl<'a> Batcher<'a> {
    pub fn new(
        samples: &'a [WindowSample],
        names: &'a [String],
        heads: &'a [HeadSpec],
        batch_size: usize,
        device: &Device,
    ) -> Self {
        Self {
            samples,
            names,
            heads,
            device: device.clone(),
            order: (0..samples.len()).collect(),
            batch_size: batch_size.max(1),
            position: 0,
        }
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }
}

impl Iterator for Batcher<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let group: Vec<&WindowSample> = self.order[self.position..end]
            .iter()
            .map(|&i| &self.samples[i])
            .collect();
        self.position = end;
        Some(make_batch(&group, self.names, self.heads, &self.device))
    }
}
