//! Sequence-to-sequence forecaster: a transformer encoder over the input
//! window, a decoder over the forecast steps and one prediction head per task.
use std::collections::HashMap;

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::{Module, VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::heads::{mtl_loss, HeadTensors, MtlLoss, PredictionHead};
use crate::transformer::{positional_encoding, Decoder, Dropout, Encoder, DTYPE};

/// One batch of model input.
#[derive(Debug, Clone)]
pub struct ForecastInput {
    /// Encoder sequence, `[batch, steps_in, embedding]`.
    pub input: Tensor,
    /// Decoder sequence, `[batch, steps_out, embedding]`.
    pub output: Tensor,
}

/// Named copy of every weight, grouped per component.
pub type WeightSnapshot = HashMap<String, Tensor>;

/// Variables of one model component; kept separate so the optimizer can be
/// pointed at a subset of the network.
pub struct ComponentVars {
    pub name: String,
    pub varmap: VarMap,
}

impl ComponentVars {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            varmap: VarMap::new(),
        }
    }

    fn builder(&self, device: &Device) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, DTYPE, device)
    }
}

pub struct TsModel {
    config: ModelConfig,
    position_encode_in: Tensor,
    position_encode_out: Tensor,
    encoder: Encoder,
    decoder: Decoder,
    heads: Vec<PredictionHead>,
    dropout: Dropout,
    encoder_vars: ComponentVars,
    decoder_vars: ComponentVars,
    head_vars: Vec<ComponentVars>,
    pub device: Device,
    span: tracing::Span,
}

impl TsModel {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let encoder_vars = ComponentVars::new("encoder");
        let decoder_vars = ComponentVars::new("decoder");
        let encoder = Encoder::load(encoder_vars.builder(device), config)?;
        let decoder = Decoder::load(decoder_vars.builder(device), config)?;

        let mut heads = Vec::with_capacity(config.heads.len());
        let mut head_vars = Vec::with_capacity(config.heads.len());
        for spec in &config.heads {
            let vars = ComponentVars::new(format!("predictor.{}", spec.name));
            heads.push(PredictionHead::load(
                vars.builder(device),
                spec,
                config.embedding_size,
                config.head_hidden_size,
            )?);
            head_vars.push(vars);
        }

        tracing::debug!(
            heads = heads.len(),
            layers = config.num_layers,
            "built seq2seq model"
        );
        Ok(Self {
            config: config.clone(),
            position_encode_in: positional_encoding(
                config.embedding_size,
                config.max_sequence_length_in,
                device,
            )?,
            position_encode_out: positional_encoding(
                config.embedding_size,
                config.max_sequence_length_out,
                device,
            )?,
            encoder,
            decoder,
            heads,
            dropout: Dropout::new(config.dropout),
            encoder_vars,
            decoder_vars,
            head_vars,
            device: device.clone(),
            span: tracing::span!(tracing::Level::TRACE, "ts-model"),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn add_position(xs: &Tensor, table: &Tensor, what: &str) -> Result<Tensor> {
        let (_, steps, _) = xs.dims3()?;
        let max = table.dim(0)?;
        if steps > max {
            candle_core::bail!("{what} sequence has {steps} steps, positional table holds {max}");
        }
        xs.broadcast_add(&table.narrow(0, 0, steps)?)
    }

    /// Decoder output for a batch; dropout is only applied when `train`.
    pub fn forward(&self, features: &ForecastInput, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x_embed = Self::add_position(&features.input, &self.position_encode_in, "input")?;
        let y_embed = Self::add_position(&features.output, &self.position_encode_out, "output")?;
        let encoder_output = self.encoder.forward(&x_embed, &self.dropout, train)?;
        self.decoder
            .forward(&y_embed, &encoder_output, &self.dropout, train)
    }

    pub fn forward_mtl(&self, features: &ForecastInput, train: bool) -> Result<HeadTensors> {
        let decoded = self.forward(features, train)?;
        self.heads
            .iter()
            .map(|head| Ok((head.spec.name.clone(), head.forward(&decoded)?)))
            .collect()
    }

    pub fn predict(&self, features: &ForecastInput) -> Result<Tensor> {
        self.forward(features, false)
    }

    pub fn predict_mtl(&self, features: &ForecastInput) -> Result<HeadTensors> {
        self.forward_mtl(features, false)
    }

    /// Single-output objective: MSE between decoder output and labels.
    pub fn loss_single(&self, features: &ForecastInput, labels: &Tensor, train: bool) -> Result<Tensor> {
        let predict = self.forward(features, train)?;
        candle_nn::loss::mse(&predict, labels)
    }

    pub fn loss_mtl(&self, features: &ForecastInput, labels: &HeadTensors, train: bool) -> Result<MtlLoss> {
        let preds = self.forward_mtl(features, train)?;
        mtl_loss(&self.config.heads, &preds, labels)
    }

    /// Loss of a single head, used when fine-tuning that head alone.
    pub fn loss_head(&self, features: &ForecastInput, labels: &HeadTensors, head: &str, train: bool) -> Result<Tensor> {
        let Some(index) = self.heads.iter().position(|h| h.spec.name == head) else {
            candle_core::bail!("unknown head {head}")
        };
        let decoded = self.forward(features, train)?;
        let pred = self.heads[index].forward(&decoded)?;
        crate::heads::head_loss(&self.heads[index].spec, &pred, labels)
    }

    pub fn encoder_decoder_vars(&self) -> Vec<Var> {
        let mut vars = self.encoder_vars.varmap.all_vars();
        vars.extend(self.decoder_vars.varmap.all_vars());
        vars
    }

    pub fn all_vars(&self) -> Vec<Var> {
        let mut vars = self.encoder_decoder_vars();
        for head in &self.head_vars {
            vars.extend(head.varmap.all_vars());
        }
        vars
    }

    pub fn head_vars(&self, head: &str) -> Result<Vec<Var>> {
        let name = format!("predictor.{head}");
        match self.head_vars.iter().find(|c| c.name == name) {
            Some(component) => Ok(component.varmap.all_vars()),
            None => candle_core::bail!("unknown head {head}"),
        }
    }

    fn components(&self) -> impl Iterator<Item = &ComponentVars> {
        [&self.encoder_vars, &self.decoder_vars]
            .into_iter()
            .chain(self.head_vars.iter())
    }

    /// Deep copy of every weight, named `<component>.<var path>`.
    pub fn snapshot(&self) -> Result<WeightSnapshot> {
        let mut out = WeightSnapshot::new();
        for component in self.components() {
            let data = component
                .varmap
                .data()
                .lock()
                .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;
            for (name, var) in data.iter() {
                out.insert(format!("{}.{name}", component.name), var.as_tensor().copy()?);
            }
        }
        Ok(out)
    }

    /// Writes a snapshot back into the live variables. Every variable must be
    /// present with a matching shape.
    pub fn restore(&self, snapshot: &WeightSnapshot) -> Result<()> {
        for component in self.components() {
            let data = component
                .varmap
                .data()
                .lock()
                .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;
            for (name, var) in data.iter() {
                let key = format!("{}.{name}", component.name);
                let Some(value) = snapshot.get(&key) else {
                    candle_core::bail!("snapshot is missing {key}")
                };
                var.set(&value.to_device(&self.device)?.to_dtype(DTYPE)?)?;
            }
        }
        Ok(())
    }

    /// Last-layer encoder attention for `features`. Maps are only captured
    /// during this call; ordinary inference passes leave them alone.
    pub fn attention_map(&self, features: &ForecastInput) -> Result<Option<Vec<Vec<f32>>>> {
        self.encoder.record_attention(true);
        let pass = self.predict(features);
        self.encoder.record_attention(false);
        pass?;
        Ok(self.encoder.attention_map())
    }

    pub fn num_parameters(&self) -> usize {
        self.all_vars().iter().map(|v| v.as_tensor().elem_count()).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::heads::HeadKind;
    use candle_core::DType;

    pub(crate) fn tiny_config() -> ModelConfig {
        ModelConfig {
            embedding_size: 16,
            model_hidden_size: 16,
            ffn_hidden_size: 32,
            num_attention_heads: 4,
            num_layers: 1,
            max_sequence_length_in: 6,
            max_sequence_length_out: 1,
            dropout: 0.1,
            head_hidden_size: 8,
            ..Default::default()
        }
    }

    pub(crate) fn random_input(batch: usize, config: &ModelConfig, device: &Device) -> Result<ForecastInput> {
        Ok(ForecastInput {
            input: Tensor::randn(0f32, 0.1, (batch, config.max_sequence_length_in, config.embedding_size), device)?,
            output: Tensor::randn(0f32, 0.1, (batch, config.max_sequence_length_out, config.embedding_size), device)?,
        })
    }

    #[test]
    fn heads_produce_expected_shapes() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let model = TsModel::new(&config, &device)?;
        let preds = model.predict_mtl(&random_input(5, &config, &device)?)?;
        assert_eq!(preds.len(), config.heads.len());
        for spec in &config.heads {
            let pred = &preds[&spec.name];
            assert_eq!(pred.dims(), &[5, 1, spec.dim]);
            if spec.kind == HeadKind::Classification {
                let sums = pred.sum(2)?.flatten_all()?.to_vec1::<f32>()?;
                assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
            }
        }
        Ok(())
    }

    #[test]
    fn snapshot_restore_round_trips_weights() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let model = TsModel::new(&config, &device)?;
        let features = random_input(2, &config, &device)?;
        let before = model.predict(&features)?.flatten_all()?.to_vec1::<f32>()?;
        let snapshot = model.snapshot()?;

        for var in model.all_vars() {
            var.set(&var.as_tensor().zeros_like()?)?;
        }
        let zeroed = model.predict(&features)?.flatten_all()?.to_vec1::<f32>()?;
        assert_ne!(before, zeroed);

        model.restore(&snapshot)?;
        let after = model.predict(&features)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn snapshot_names_are_grouped_by_component() -> Result<()> {
        let model = TsModel::new(&tiny_config(), &Device::Cpu)?;
        let snapshot = model.snapshot()?;
        assert!(snapshot.keys().any(|k| k.starts_with("encoder.")));
        assert!(snapshot.keys().any(|k| k.starts_with("decoder.")));
        assert!(snapshot.keys().any(|k| k.starts_with("predictor.pos.")));
        assert_eq!(snapshot.len(), model.all_vars().len());
        Ok(())
    }

    #[test]
    fn attention_is_captured_only_on_request() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let model = TsModel::new(&config, &device)?;
        let features = random_input(2, &config, &device)?;
        model.predict(&features)?;
        assert!(model.encoder.attention_map().is_none());

        let map = model.attention_map(&features)?.expect("map for the requested pass");
        assert_eq!(map.len(), config.max_sequence_length_in);
        assert!(map.iter().all(|row| (row.iter().sum::<f32>() - 1.0).abs() < 1e-4));

        let other = random_input(2, &config, &device)?;
        model.predict(&other)?;
        assert_eq!(model.encoder.attention_map(), Some(map));
        Ok(())
    }

    #[test]
    fn rejects_overlong_input() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let model = TsModel::new(&config, &device)?;
        let features = ForecastInput {
            input: Tensor::zeros((1, 7, 16), DType::F32, &device)?,
            output: Tensor::zeros((1, 1, 16), DType::F32, &device)?,
        };
        assert!(model.predict(&features).is_err());
        Ok(())
    }
}
