//! Trading policies driven by the forecaster.
use std::collections::HashMap;

use candle_core::{Result, Tensor};

use crate::distribution::{DiagonalGaussian, GaussianParams};
use crate::evaluation::head_column;
use crate::model::{ForecastInput, TsModel};

/// Diagnostics returned next to an action, keyed by name, one value per asset.
pub type ActionInfo = HashMap<String, Vec<f64>>;

pub trait Policy {
    type Observation;

    /// Position per asset for `observation`.
    fn get_action(&mut self, observation: &Self::Observation) -> Result<(Vec<f64>, ActionInfo)>;

    fn reset(&mut self) {}
}

/// Long (1.0) where the `pos` head is above `threshold`, flat otherwise.
pub struct ForecastPolicy<'a> {
    model: &'a TsModel,
    threshold: f64,
    exploration_std: Option<f64>,
    previous: Option<Vec<f64>>,
}

impl<'a> ForecastPolicy<'a> {
    pub fn new(model: &'a TsModel, threshold: f64) -> Self {
        Self {
            model,
            threshold,
            exploration_std: None,
            previous: None,
        }
    }

    /// Adds Gaussian noise with standard deviation `std` to every action; the
    /// noisy positions are clamped to `[0, 1]`.
    pub fn with_exploration(mut self, std: f64) -> Self {
        self.exploration_std = Some(std);
        self
    }

    fn explore(&self, actions: Vec<f64>, std: f64) -> Result<Vec<f64>> {
        let device = &self.model.device;
        let n = actions.len();
        let mean = Tensor::from_vec(actions.iter().map(|&a| a as f32).collect::<Vec<_>>(), (1, n), device)?;
        let log_std = Tensor::full(std.max(1e-8).ln() as f32, (1, n), device)?;
        let params = GaussianParams { mean, log_std };
        let sampled = DiagonalGaussian::new(n).sample(&params)?.clamp(0f32, 1f32)?;
        Ok(sampled.flatten_all()?.to_vec1::<f32>()?.into_iter().map(f64::from).collect())
    }
}

impl Policy for ForecastPolicy<'_> {
    type Observation = ForecastInput;

    fn get_action(&mut self, observation: &ForecastInput) -> Result<(Vec<f64>, ActionInfo)> {
        let preds = self.model.predict_mtl(observation)?;
        let pos_prob = head_column(&preds, "pos", 0)?;
        let ret = head_column(&preds, "ret", 0)?;
        let mut actions: Vec<f64> = pos_prob
            .iter()
            .map(|&p| if p > self.threshold { 1.0 } else { 0.0 })
            .collect();
        if let Some(std) = self.exploration_std {
            actions = self.explore(actions, std)?;
        }

        let turnover = match &self.previous {
            Some(prev) if prev.len() == actions.len() => {
                actions.iter().zip(prev).map(|(a, p)| (a - p).abs()).collect()
            }
            _ => actions.iter().map(|a| a.abs()).collect(),
        };
        self.previous = Some(actions.clone());

        let mut info = ActionInfo::new();
        info.insert("pos_prob".into(), pos_prob);
        info.insert("ret".into(), ret);
        info.insert("turnover".into(), turnover);
        Ok((actions, info))
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{random_input, tiny_config};
    use candle_core::Device;

    #[test]
    fn actions_follow_threshold() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let model = TsModel::new(&config, &device)?;
        let features = random_input(4, &config, &device)?;

        let mut always_long = ForecastPolicy::new(&model, -1.0);
        let (actions, info) = always_long.get_action(&features)?;
        assert_eq!(actions, vec![1.0; 4]);
        assert_eq!(info["pos_prob"].len(), 4);
        assert_eq!(info["turnover"], vec![1.0; 4]);

        let (_, info) = always_long.get_action(&features)?;
        assert_eq!(info["turnover"], vec![0.0; 4]);

        always_long.reset();
        let (_, info) = always_long.get_action(&features)?;
        assert_eq!(info["turnover"], vec![1.0; 4]);

        let mut never_long = ForecastPolicy::new(&model, 2.0);
        assert_eq!(never_long.get_action(&features)?.0, vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn exploration_stays_in_unit_range() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let model = TsModel::new(&config, &device)?;
        let mut policy = ForecastPolicy::new(&model, 0.5).with_exploration(0.5);
        let (actions, _) = policy.get_action(&random_input(8, &config, &device)?)?;
        assert_eq!(actions.len(), 8);
        assert!(actions.iter().all(|a| (0.0..=1.0).contains(a)));
        Ok(())
    }
}
