use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::features::{FeatureSpec, WindowParams};
use crate::heads::{HeadKind, HeadSpec, LossWeight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    Gelu,
    #[default]
    Relu,
}

/// Architecture of the encoder-decoder and its heads.
///
/// There is no input embedding: the feature vector of every timestep is fed
/// directly, so `embedding_size` is the number of features per step and must
/// match `model_hidden_size` for the residual connections to line up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub embedding_size: usize,
    pub model_hidden_size: usize,
    pub ffn_hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_layers: usize,
    pub max_sequence_length_in: usize,
    pub max_sequence_length_out: usize,
    pub dropout: f64,
    pub layer_norm_eps: f64,
    pub hidden_act: HiddenAct,
    pub head_hidden_size: usize,
    pub heads: Vec<HeadSpec>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_size: 16,
            model_hidden_size: 16,
            ffn_hidden_size: 64,
            num_attention_heads: 4,
            num_layers: 2,
            max_sequence_length_in: 12,
            max_sequence_length_out: 1,
            dropout: 0.2,
            layer_norm_eps: 1e-6,
            hidden_act: HiddenAct::Relu,
            head_hidden_size: 64,
            heads: Self::default_heads(),
        }
    }
}

impl ModelConfig {
    /// Return, direction, volatility, drawdown and spectral heads, fed from the
    /// label columns produced by [`FeatureSpec::default`].
    pub fn default_heads() -> Vec<HeadSpec> {
        let regression = |name: &str, sources: &[&str]| HeadSpec {
            name: name.to_string(),
            dim: sources.len(),
            kind: HeadKind::Regression,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            loss_weight: None,
        };
        let classification = |name: &str, source: &str, column: usize| HeadSpec {
            name: name.to_string(),
            dim: 2,
            kind: HeadKind::Classification,
            sources: vec![source.to_string()],
            loss_weight: Some(LossWeight {
                head: "ret".to_string(),
                column,
            }),
        };
        vec![
            regression("ret", &["logy_1", "logy_20", "logy_60", "logy_120"]),
            classification("pos", "pos_1", 0),
            classification("pos20", "pos_20", 1),
            regression("std", &["std_20", "std_60", "std_120"]),
            regression("mdd", &["mdd_20", "mdd_60"]),
            regression("fft", &["fft_3", "fft_100"]),
        ]
    }

    pub fn head(&self, name: &str) -> Option<&HeadSpec> {
        self.heads.iter().find(|h| h.name == name)
    }

    pub fn validate(&self) -> candle_core::Result<()> {
        if self.embedding_size == 0 || self.model_hidden_size == 0 {
            candle_core::bail!("embedding_size and model_hidden_size must be non-zero");
        }
        if self.embedding_size != self.model_hidden_size {
            candle_core::bail!(
                "embedding_size ({}) must equal model_hidden_size ({}) for the residual sublayers",
                self.embedding_size,
                self.model_hidden_size
            );
        }
        if self.num_attention_heads == 0 || self.model_hidden_size % self.num_attention_heads != 0 {
            candle_core::bail!(
                "model_hidden_size ({}) is not divisible by num_attention_heads ({})",
                self.model_hidden_size,
                self.num_attention_heads
            );
        }
        if self.max_sequence_length_in == 0 || self.max_sequence_length_out == 0 {
            candle_core::bail!("sequence lengths must be non-zero");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            candle_core::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        for head in &self.heads {
            head.validate()?;
            if let Some(weight) = &head.loss_weight {
                let Some(source) = self.head(&weight.head) else {
                    candle_core::bail!("head {} is weighted by unknown head {}", head.name, weight.head);
                };
                if weight.column >= source.dim {
                    candle_core::bail!(
                        "head {} is weighted by column {} of {} which only has {} columns",
                        head.name,
                        weight.column,
                        weight.head,
                        source.dim
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    /// Evaluate on the holdout split every this many training steps.
    pub eval_interval: usize,
    /// Maximum holdout batches per evaluation; `None` uses the whole split.
    pub eval_steps: Option<usize>,
    /// Stop once this many evaluations in a row fail to improve.
    pub patience: usize,
    pub seed: u64,
    pub shuffle: bool,
    pub checkpoint_path: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            batch_size: 4,
            epochs: 20,
            eval_interval: 50,
            eval_steps: None,
            patience: 10,
            seed: 42,
            shuffle: true,
            checkpoint_path: PathBuf::from("out/model.safetensors"),
            output_dir: PathBuf::from("out"),
        }
    }
}

/// Where the price panel comes from and how windows are cut from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Parquet file or directory of parquet files; `None` generates a
    /// synthetic random-walk panel.
    pub path: Option<PathBuf>,
    pub m_days: usize,
    pub k_days: usize,
    pub sampling_days: usize,
    pub calc_length: usize,
    /// Extra rows between the decision point and the start of the horizon.
    pub delayed_days: usize,
    /// Distance in rows between consecutive windows.
    pub stride: usize,
    pub train_fraction: f64,
    pub validation_fraction: f64,
    pub features: FeatureSpec,
    pub synthetic_assets: usize,
    pub synthetic_timesteps: usize,
    pub start_date: Option<chrono::NaiveDate>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: None,
            m_days: 60,
            k_days: 5,
            sampling_days: 5,
            calc_length: 120,
            delayed_days: 0,
            stride: 5,
            train_fraction: 0.7,
            validation_fraction: 0.15,
            features: FeatureSpec::default(),
            synthetic_assets: 40,
            synthetic_timesteps: 1500,
            start_date: None,
        }
    }
}

impl DataConfig {
    pub fn window_params(&self) -> WindowParams {
        WindowParams {
            m_days: self.m_days,
            k_days: self.k_days,
            sampling_days: self.sampling_days,
            calc_length: self.calc_length,
            delayed_days: self.delayed_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub data: DataConfig,
}

impl AppConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Checks the model against itself and against the feature layout the data
    /// section will produce.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.model.validate()?;
        let names = self.data.features.names();
        if names.len() != self.model.embedding_size {
            anyhow::bail!(
                "feature spec yields {} features but embedding_size is {}",
                names.len(),
                self.model.embedding_size
            );
        }
        for head in &self.model.heads {
            for source in &head.sources {
                if !names.contains(source) {
                    anyhow::bail!("head {} reads unknown feature {}", head.name, source);
                }
            }
        }
        let steps = self.data.window_params().input_steps();
        if steps != self.model.max_sequence_length_in {
            anyhow::bail!(
                "m_days / sampling_days = {} but max_sequence_length_in is {}",
                steps,
                self.model.max_sequence_length_in
            );
        }
        Ok(())
    }
}
