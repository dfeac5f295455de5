//! Multi-task prediction heads sitting on the decoder output.
use std::collections::HashMap;

use candle_core::{Result, Tensor, D};
use candle_nn::{Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::HiddenAct;
use crate::transformer::{FeedForward, OutputActivation};

/// Probabilities are clipped to `[EPS, 1 - EPS]` before the log.
const CROSS_ENTROPY_EPS: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadKind {
    Regression,
    /// Two-way softmax over (positive, non-positive).
    Classification,
}

/// Scales a head's per-sample loss by the absolute value of one label column
/// of another head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossWeight {
    pub head: String,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadSpec {
    pub name: String,
    pub dim: usize,
    pub kind: HeadKind,
    /// Label feature columns this head is trained against.
    pub sources: Vec<String>,
    #[serde(default)]
    pub loss_weight: Option<LossWeight>,
}

impl HeadSpec {
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            HeadKind::Regression if self.sources.len() != self.dim => candle_core::bail!(
                "regression head {} has dim {} but {} sources",
                self.name,
                self.dim,
                self.sources.len()
            ),
            HeadKind::Classification if self.dim != 2 || self.sources.len() != 1 => candle_core::bail!(
                "classification head {} needs dim 2 and a single source",
                self.name
            ),
            _ => Ok(()),
        }
    }
}

/// Head outputs or labels keyed by head name.
pub type HeadTensors = HashMap<String, Tensor>;

pub struct PredictionHead {
    pub spec: HeadSpec,
    ff: FeedForward,
}

impl PredictionHead {
    pub fn load(vb: VarBuilder, spec: &HeadSpec, dim_in: usize, hidden: usize) -> Result<Self> {
        spec.validate()?;
        let output_act = match spec.kind {
            HeadKind::Regression => OutputActivation::Linear,
            HeadKind::Classification => OutputActivation::Softmax,
        };
        let ff = FeedForward::load(vb, dim_in, hidden, spec.dim, HiddenAct::Relu, output_act)?;
        Ok(Self {
            spec: spec.clone(),
            ff,
        })
    }
}

impl Module for PredictionHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.ff.forward(xs)
    }
}

/// `-sum(labels * log(probs))` over the last axis.
pub fn categorical_cross_entropy(labels: &Tensor, probs: &Tensor) -> Result<Tensor> {
    let log_probs = probs
        .clamp(CROSS_ENTROPY_EPS, 1.0 - CROSS_ENTROPY_EPS)?
        .log()?;
    (labels * log_probs)?.sum(D::Minus1)?.neg()
}

/// Per-head mean losses plus their sum.
pub struct MtlLoss {
    pub total: Tensor,
    pub per_head: Vec<(String, Tensor)>,
}

impl MtlLoss {
    pub fn scalars(&self) -> Result<Vec<(String, f32)>> {
        self.per_head
            .iter()
            .map(|(name, loss)| Ok((name.clone(), loss.to_scalar::<f32>()?)))
            .collect()
    }
}

pub fn head_loss(spec: &HeadSpec, pred: &Tensor, labels: &HeadTensors) -> Result<Tensor> {
    let Some(target) = labels.get(&spec.name) else {
        candle_core::bail!("no labels for head {}", spec.name)
    };
    match spec.kind {
        HeadKind::Regression => candle_nn::loss::mse(pred, target),
        HeadKind::Classification => {
            let ce = categorical_cross_entropy(target, pred)?;
            let ce = match &spec.loss_weight {
                Some(weight) => {
                    let Some(source) = labels.get(&weight.head) else {
                        candle_core::bail!("head {} is weighted by missing labels {}", spec.name, weight.head)
                    };
                    let w = source.narrow(D::Minus1, weight.column, 1)?.squeeze(D::Minus1)?.abs()?;
                    (ce * w)?
                }
                None => ce,
            };
            ce.mean_all()
        }
    }
}

pub fn mtl_loss(specs: &[HeadSpec], preds: &HeadTensors, labels: &HeadTensors) -> Result<MtlLoss> {
    let mut per_head = Vec::with_capacity(specs.len());
    let mut total: Option<Tensor> = None;
    for spec in specs {
        let Some(pred) = preds.get(&spec.name) else {
            candle_core::bail!("no prediction for head {}", spec.name)
        };
        let loss = head_loss(spec, pred, labels)?;
        total = Some(match total {
            Some(acc) => (acc + &loss)?,
            None => loss.clone(),
        });
        per_head.push((spec.name.clone(), loss));
    }
    let Some(total) = total else {
        candle_core::bail!("no prediction heads configured")
    };
    Ok(MtlLoss { total, per_head })
}
