//! Optimisation loop with best-by-holdout weight tracking.
use candle_core::{Result, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::batcher::{Batch, Batcher};
use crate::config::TrainConfig;
use crate::dataset::WindowDataset;
use crate::heads::HeadTensors;
use crate::model::{ForecastInput, TsModel, WeightSnapshot};

/// Holdout loss every fresh trainer has to beat.
pub const INITIAL_BEST_LOSS: f64 = 100_000.0;

/// Head trained by [`Trainer::finetune_mtl`].
pub const FINETUNE_HEAD: &str = "pos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TrainMode {
    /// Decoder output regressed onto the raw targets.
    Single,
    #[default]
    Mtl,
    /// Only the direction head, with encoder and decoder frozen.
    Finetune,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutcome {
    pub loss: f64,
    pub steps: usize,
    pub improved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub steps: usize,
    pub evaluations: usize,
    pub best_loss: f64,
    pub stopped_early: bool,
}

fn adam(vars: Vec<candle_core::Var>, lr: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr,
        weight_decay: 0.0,
        ..Default::default()
    };
    AdamW::new(vars, params)
}

fn format_losses(losses: &[(String, f32)]) -> String {
    losses
        .iter()
        .map(|(name, loss)| format!("{name}={loss:.6}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Trainer {
    model: TsModel,
    config: TrainConfig,
    /// Shared by single-output and multi-task steps.
    optimizer: AdamW,
    /// Built on the first fine-tune step and dropped by any full step, so
    /// each fine-tuning phase starts from fresh moments.
    finetune_optimizer: Option<AdamW>,
    best_loss: f64,
    eval_count: usize,
    best: WeightSnapshot,
}

impl Trainer {
    pub fn new(model: TsModel, config: TrainConfig) -> Result<Self> {
        let lr = config.learning_rate;
        let optimizer = adam(model.all_vars(), lr)?;
        let best = model.snapshot()?;
        tracing::info!(
            parameters = model.num_parameters(),
            lr,
            "initialised trainer"
        );
        Ok(Self {
            model,
            config,
            optimizer,
            finetune_optimizer: None,
            best_loss: INITIAL_BEST_LOSS,
            eval_count: 0,
            best,
        })
    }

    pub fn model(&self) -> &TsModel {
        &self.model
    }

    pub fn into_model(self) -> TsModel {
        self.model
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn eval_count(&self) -> usize {
        self.eval_count
    }

    pub fn best_snapshot(&self) -> &WeightSnapshot {
        &self.best
    }

    pub(crate) fn set_best_snapshot(&mut self, snapshot: WeightSnapshot) {
        self.best = snapshot;
    }

    /// One step of the single-output objective. Only encoder and decoder
    /// receive gradients.
    pub fn train(&mut self, features: &ForecastInput, labels: &Tensor) -> Result<f32> {
        let loss = self.model.loss_single(features, labels, true)?;
        self.finetune_optimizer = None;
        self.optimizer.backward_step(&loss)?;
        loss.to_scalar::<f32>()
    }

    /// One step on the summed head losses over every weight. Returns the
    /// per-head losses.
    pub fn train_mtl(&mut self, features: &ForecastInput, labels: &HeadTensors) -> Result<Vec<(String, f32)>> {
        let loss = self.model.loss_mtl(features, labels, true)?;
        self.finetune_optimizer = None;
        self.optimizer.backward_step(&loss.total)?;
        loss.scalars()
    }

    /// One step on the direction head alone.
    pub fn finetune_mtl(&mut self, features: &ForecastInput, labels: &HeadTensors) -> Result<f32> {
        let loss = self.model.loss_head(features, labels, FINETUNE_HEAD, true)?;
        let optimizer = match &mut self.finetune_optimizer {
            Some(optimizer) => optimizer,
            empty => {
                tracing::debug!(head = FINETUNE_HEAD, "starting fine-tune phase");
                empty.insert(adam(self.model.head_vars(FINETUNE_HEAD)?, self.config.learning_rate)?)
            }
        };
        optimizer.backward_step(&loss)?;
        loss.to_scalar::<f32>()
    }

    fn record(&mut self, total: f64, steps: usize) -> Result<EvalOutcome> {
        if steps == 0 {
            candle_core::bail!("no holdout batches to evaluate")
        }
        let loss = total / steps as f64;
        let improved = loss < self.best_loss;
        if improved {
            self.best_loss = loss;
            self.eval_count = 0;
            self.best = self.model.snapshot()?;
        } else {
            self.eval_count += 1;
        }
        tracing::info!(loss, steps, improved, stale = self.eval_count, "eval loss");
        Ok(EvalOutcome { loss, steps, improved })
    }

    /// Mean single-output holdout loss over at most `steps` batches.
    pub fn evaluate<I>(&mut self, batches: I, steps: Option<usize>) -> anyhow::Result<EvalOutcome>
    where
        I: IntoIterator<Item = anyhow::Result<Batch>>,
    {
        let (mut total, mut count) = (0.0, 0);
        for batch in batches.into_iter().take(steps.unwrap_or(usize::MAX)) {
            let batch = batch?;
            let loss = self.model.loss_single(&batch.features, &batch.targets, false)?;
            total += f64::from(loss.to_scalar::<f32>()?);
            count += 1;
        }
        Ok(self.record(total, count)?)
    }

    /// Mean multi-task holdout loss over at most `steps` batches.
    pub fn evaluate_mtl<I>(&mut self, batches: I, steps: Option<usize>) -> anyhow::Result<EvalOutcome>
    where
        I: IntoIterator<Item = anyhow::Result<Batch>>,
    {
        let (mut total, mut count) = (0.0, 0);
        for batch in batches.into_iter().take(steps.unwrap_or(usize::MAX)) {
            let batch = batch?;
            let loss = self.model.loss_mtl(&batch.features, &batch.labels, false)?;
            total += f64::from(loss.total.to_scalar::<f32>()?);
            count += 1;
        }
        Ok(self.record(total, count)?)
    }

    /// Puts the best weights back into the model and starts a fresh
    /// evaluation round.
    pub fn weight_to_optim(&mut self) -> Result<()> {
        self.model.restore(&self.best)?;
        self.best_loss = INITIAL_BEST_LOSS;
        self.eval_count = 0;
        Ok(())
    }

    pub fn should_stop(&self, patience: usize) -> bool {
        patience > 0 && self.eval_count >= patience
    }

    fn step(&mut self, batch: &Batch, mode: TrainMode) -> Result<Vec<(String, f32)>> {
        match mode {
            TrainMode::Single => Ok(vec![("single".to_string(), self.train(&batch.features, &batch.targets)?)]),
            TrainMode::Mtl => self.train_mtl(&batch.features, &batch.labels),
            TrainMode::Finetune => Ok(vec![(
                FINETUNE_HEAD.to_string(),
                self.finetune_mtl(&batch.features, &batch.labels)?,
            )]),
        }
    }

    fn holdout(&mut self, holdout: &WindowDataset, mode: TrainMode) -> anyhow::Result<EvalOutcome> {
        let heads = self.model.config().heads.clone();
        let device = self.model.device.clone();
        let batches = Batcher::new(&holdout.samples, &holdout.names, &heads, self.config.batch_size, &device);
        match mode {
            TrainMode::Single => self.evaluate(batches, self.config.eval_steps),
            TrainMode::Mtl | TrainMode::Finetune => self.evaluate_mtl(batches, self.config.eval_steps),
        }
    }

    /// Trains for the configured number of epochs, evaluating on `holdout`
    /// every `eval_interval` steps and stopping after `patience` evaluations
    /// without improvement. The best weights are in the model on return.
    pub fn fit(&mut self, train: &WindowDataset, holdout: &WindowDataset, mode: TrainMode) -> anyhow::Result<FitSummary> {
        anyhow::ensure!(!train.is_empty(), "training split is empty");
        let holdout = if holdout.is_empty() {
            tracing::warn!("holdout split is empty, evaluating on the training split");
            train
        } else {
            holdout
        };
        let heads = self.model.config().heads.clone();
        let device = self.model.device.clone();
        let interval = self.config.eval_interval.max(1);

        let mut steps = 0;
        let mut evaluations = 0;
        let mut stopped_early = false;
        'epochs: for epoch in 0..self.config.epochs {
            let mut batches = Batcher::new(&train.samples, &train.names, &heads, self.config.batch_size, &device);
            if self.config.shuffle {
                batches = batches.shuffled(self.config.seed.wrapping_add(epoch as u64));
            }
            for batch in batches {
                let losses = self.step(&batch?, mode)?;
                steps += 1;
                tracing::debug!(epoch, step = steps, "{}", format_losses(&losses));

                if steps % interval == 0 {
                    self.holdout(holdout, mode)?;
                    evaluations += 1;
                    if self.should_stop(self.config.patience) {
                        tracing::info!(epoch, step = steps, "early stopping");
                        stopped_early = true;
                        break 'epochs;
                    }
                }
            }
            tracing::info!(epoch, step = steps, "epoch finished");
        }
        if !stopped_early {
            self.holdout(holdout, mode)?;
            evaluations += 1;
        }

        let best_loss = self.best_loss;
        self.weight_to_optim()?;
        tracing::info!(steps, evaluations, best_loss, "training finished");
        Ok(FitSummary {
            steps,
            evaluations,
            best_loss,
            stopped_early,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{random_input, tiny_config};
    use candle_core::Device;

    fn mtl_labels(model: &TsModel, batch: usize) -> Result<HeadTensors> {
        let device = &model.device;
        let mut labels = HeadTensors::new();
        for spec in &model.config().heads {
            let t = match spec.kind {
                crate::heads::HeadKind::Regression => Tensor::randn(0f32, 0.1, (batch, 1, spec.dim), device)?,
                crate::heads::HeadKind::Classification => {
                    Tensor::new(&[1f32, 0.], device)?.broadcast_as((batch, 1, 2))?.contiguous()?
                }
            };
            labels.insert(spec.name.clone(), t);
        }
        Ok(labels)
    }

    fn trainer() -> Result<Trainer> {
        let model = TsModel::new(&tiny_config(), &Device::Cpu)?;
        let config = TrainConfig {
            learning_rate: 1e-2,
            ..Default::default()
        };
        Trainer::new(model, config)
    }

    #[test]
    fn mtl_training_reduces_loss_on_a_fixed_batch() -> Result<()> {
        let mut trainer = trainer()?;
        let config = tiny_config();
        let features = random_input(8, &config, &Device::Cpu)?;
        let labels = mtl_labels(trainer.model(), 8)?;
        let before = trainer.model().loss_mtl(&features, &labels, false)?.total.to_scalar::<f32>()?;
        for _ in 0..30 {
            trainer.train_mtl(&features, &labels)?;
        }
        let after = trainer.model().loss_mtl(&features, &labels, false)?.total.to_scalar::<f32>()?;
        assert!(after < before, "{after} >= {before}");
        Ok(())
    }

    #[test]
    fn finetune_only_touches_direction_head() -> Result<()> {
        let mut trainer = trainer()?;
        let config = tiny_config();
        let features = random_input(4, &config, &Device::Cpu)?;
        let labels = mtl_labels(trainer.model(), 4)?;
        let before = trainer.model().snapshot()?;
        trainer.finetune_mtl(&features, &labels)?;
        let after = trainer.model().snapshot()?;

        let mut pos_changed = false;
        for (name, value) in &before {
            let diff = (value - &after[name])?.abs()?.sum_all()?.to_scalar::<f32>()?;
            if name.starts_with("predictor.pos.") {
                pos_changed |= diff > 0.0;
            } else {
                assert_eq!(diff, 0.0, "{name} changed");
            }
        }
        assert!(pos_changed);
        Ok(())
    }

    #[test]
    fn each_finetune_phase_gets_a_fresh_optimizer() -> Result<()> {
        let mut trainer = trainer()?;
        let config = tiny_config();
        let features = random_input(4, &config, &Device::Cpu)?;
        let labels = mtl_labels(trainer.model(), 4)?;
        assert!(trainer.finetune_optimizer.is_none());

        trainer.finetune_mtl(&features, &labels)?;
        trainer.finetune_mtl(&features, &labels)?;
        assert!(trainer.finetune_optimizer.is_some());

        // a full step updates the heads through the shared optimizer and ends the phase
        let before = trainer.model().snapshot()?;
        trainer.train_mtl(&features, &labels)?;
        assert!(trainer.finetune_optimizer.is_none());
        let after = trainer.model().snapshot()?;
        let moved = |prefix: &str| -> Result<bool> {
            for (name, value) in before.iter().filter(|(n, _)| n.starts_with(prefix)) {
                if (value - &after[name])?.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0 {
                    return Ok(true);
                }
            }
            Ok(false)
        };
        assert!(moved("encoder.")?);
        assert!(moved("predictor.ret.")?);

        trainer.finetune_mtl(&features, &labels)?;
        assert!(trainer.finetune_optimizer.is_some());
        Ok(())
    }

    #[test]
    fn best_weights_survive_later_training() -> Result<()> {
        let mut trainer = trainer()?;
        let config = tiny_config();
        let features = random_input(4, &config, &Device::Cpu)?;
        let labels = mtl_labels(trainer.model(), 4)?;
        let best = trainer.model().predict(&features)?.flatten_all()?.to_vec1::<f32>()?;

        trainer.record(0.5, 1)?;
        assert_eq!(trainer.best_loss(), 0.5);
        for _ in 0..5 {
            trainer.train_mtl(&features, &labels)?;
        }
        let outcome = trainer.record(2.0, 1)?;
        assert!(!outcome.improved);
        assert_eq!(trainer.eval_count(), 1);
        assert!(trainer.should_stop(1));

        trainer.weight_to_optim()?;
        let restored = trainer.model().predict(&features)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(best, restored);
        assert_eq!(trainer.best_loss(), INITIAL_BEST_LOSS);
        assert_eq!(trainer.eval_count(), 0);
        Ok(())
    }

    #[test]
    fn empty_holdout_is_an_error() -> Result<()> {
        let mut trainer = trainer()?;
        assert!(trainer.evaluate_mtl(std::iter::empty(), None).is_err());
        Ok(())
    }
}
