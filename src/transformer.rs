//! Encoder-decoder transformer over continuous feature vectors.
//!
//! "Attention Is All You Need" layout with two differences: there is no token
//! embedding (each timestep's feature vector is used as-is) and the layer
//! norm carries no trainable scale/shift.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::with_tracing::{linear, Linear};

use crate::config::{HiddenAct, ModelConfig};

pub const DTYPE: DType = DType::F32;

/// Score given to future positions under the causal mask.
const MASK_FILL: f32 = -4_294_967_295.0;

/// Fixed sinusoid table of shape `[length, dim]`.
///
/// The angle of `(pos, i)` is `pos / 10000^(2i/dim)`; cells at even positions
/// of the row-major flattening take the sine, odd ones the cosine.
pub fn positional_encoding(dim: usize, length: usize, device: &Device) -> Result<Tensor> {
    let mut table = Vec::with_capacity(dim * length);
    for pos in 0..length {
        for i in 0..dim {
            let angle = pos as f64 / 10000f64.powf(2.0 * i as f64 / dim as f64);
            let flat = pos * dim + i;
            let value = if flat % 2 == 0 { angle.sin() } else { angle.cos() };
            table.push(value as f32);
        }
    }
    Tensor::from_vec(table, (length, dim), device)
}

/// `(x - mean) / (std + eps)` over the last axis, population std.
pub fn layer_norm(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = xs.mean_keepdim(D::Minus1)?;
    let centered = xs.broadcast_sub(&mean)?;
    let std = centered.sqr()?.mean_keepdim(D::Minus1)?.sqrt()?;
    centered.broadcast_div(&std.affine(1.0, eps)?)
}

#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    pr: f64,
}

impl Dropout {
    pub fn new(pr: f64) -> Self {
        Self { pr }
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.pr > 0.0 {
            candle_nn::ops::dropout(xs, self.pr as f32)
        } else {
            Ok(xs.clone())
        }
    }
}

/// Residual sublayer: `LayerNorm(x + Dropout(sublayer(x)))`.
pub fn sublayer_connection(
    xs: &Tensor,
    sublayer: &Tensor,
    dropout: &Dropout,
    train: bool,
    eps: f64,
) -> Result<Tensor> {
    let sublayer = dropout.forward(sublayer, train)?;
    layer_norm(&(xs + sublayer)?, eps)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputActivation {
    Linear,
    Softmax,
}

#[derive(Clone)]
struct ActivationLayer {
    act: HiddenAct,
    span: tracing::Span,
}

impl ActivationLayer {
    fn new(act: HiddenAct) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "hidden-act");
        Self { act, span }
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        match self.act {
            HiddenAct::Gelu => xs.gelu_erf(),
            HiddenAct::Relu => xs.relu(),
        }
    }
}

/// Two dense layers: activated hidden layer, then a linear or softmax output.
#[derive(Clone)]
pub struct FeedForward {
    hidden: Linear,
    act: ActivationLayer,
    output: Linear,
    output_act: OutputActivation,
    span: tracing::Span,
}

impl FeedForward {
    pub fn load(
        vb: VarBuilder,
        dim_in: usize,
        num_units: usize,
        dim_out: usize,
        act: HiddenAct,
        output_act: OutputActivation,
    ) -> Result<Self> {
        let hidden = linear(dim_in, num_units, vb.pp("in"))?;
        let output = linear(num_units, dim_out, vb.pp("out"))?;
        Ok(Self {
            hidden,
            act: ActivationLayer::new(act),
            output,
            output_act,
            span: tracing::span!(tracing::Level::TRACE, "feed-forward"),
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let hidden = self.act.forward(&self.hidden.forward(xs)?)?;
        let ys = self.output.forward(&hidden)?;
        match self.output_act {
            OutputActivation::Linear => Ok(ys),
            OutputActivation::Softmax => candle_nn::ops::softmax(&ys, D::Minus1),
        }
    }
}

/// Causal mask of shape `[q_len, k_len]`, 1 where the key lies in the future.
fn causal_mask(q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..q_len)
        .flat_map(|i| (0..k_len).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_slice(&mask, (q_len, k_len), device)
}

/// Multi-head attention with relu-activated projections.
///
/// While recording is switched on, the attention map of each inference pass
/// (first batch element, first head) is kept for inspection.
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_size: usize,
    record: AtomicBool,
    attention_map: Mutex<Option<Vec<Vec<f32>>>>,
    span: tracing::Span,
    span_softmax: tracing::Span,
}

impl MultiHeadAttention {
    pub fn load(vb: VarBuilder, dim_in: usize, num_units: usize, num_heads: usize) -> Result<Self> {
        if num_heads == 0 || num_units % num_heads != 0 {
            candle_core::bail!("{num_units} attention units cannot be split into {num_heads} heads");
        }
        Ok(Self {
            query: linear(dim_in, num_units, vb.pp("query"))?,
            key: linear(dim_in, num_units, vb.pp("key"))?,
            value: linear(dim_in, num_units, vb.pp("value"))?,
            output: linear(num_units, num_units, vb.pp("output"))?,
            num_heads,
            head_size: num_units / num_heads,
            record: AtomicBool::new(false),
            attention_map: Mutex::new(None),
            span: tracing::span!(tracing::Level::TRACE, "multi-head-attn"),
            span_softmax: tracing::span!(tracing::Level::TRACE, "softmax"),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq, _) = xs.dims3()?;
        xs.reshape((b, seq, self.num_heads, self.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor, masked: bool, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let q = self.split_heads(&self.query.forward(query)?.relu()?)?;
        let k = self.split_heads(&self.key.forward(key)?.relu()?)?;
        let v = self.split_heads(&self.value.forward(value)?.relu()?)?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? / (self.head_size as f64).sqrt())?;
        let scores = if masked {
            let (_, _, q_len, k_len) = scores.dims4()?;
            let mask = causal_mask(q_len, k_len, scores.device())?.broadcast_as(scores.shape())?;
            let fill = Tensor::new(MASK_FILL, scores.device())?
                .to_dtype(scores.dtype())?
                .broadcast_as(scores.shape())?;
            mask.where_cond(&fill, &scores)?
        } else {
            scores
        };
        let probs = {
            let _enter_sm = self.span_softmax.enter();
            candle_nn::ops::softmax(&scores, D::Minus1)?
        };
        if !train && self.record.load(Ordering::Relaxed) {
            let map = probs.i((0, 0))?.to_vec2::<f32>()?;
            if let Ok(mut slot) = self.attention_map.lock() {
                *slot = Some(map);
            }
        }

        let context = probs.matmul(&v)?.transpose(1, 2)?.contiguous()?;
        let context = context.flatten_from(D::Minus2)?;
        self.output.forward(&context)?.relu()
    }

    pub fn set_recording(&self, on: bool) {
        self.record.store(on, Ordering::Relaxed);
    }

    pub fn attention_map(&self) -> Option<Vec<Vec<f32>>> {
        self.attention_map.lock().ok().and_then(|slot| slot.clone())
    }
}

struct EncoderLayer {
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
}

pub struct Encoder {
    layers: Vec<EncoderLayer>,
    eps: f64,
    span: tracing::Span,
}

impl Encoder {
    pub fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|index| {
                let vb = vb.pp(format!("layer.{index}"));
                Ok(EncoderLayer {
                    attention: MultiHeadAttention::load(
                        vb.pp("attention"),
                        config.embedding_size,
                        config.model_hidden_size,
                        config.num_attention_heads,
                    )?,
                    feed_forward: FeedForward::load(
                        vb.pp("ff"),
                        config.model_hidden_size,
                        config.ffn_hidden_size,
                        config.embedding_size,
                        config.hidden_act,
                        OutputActivation::Linear,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            eps: config.layer_norm_eps,
            span: tracing::span!(tracing::Level::TRACE, "encoder"),
        })
    }

    pub fn forward(&self, xs: &Tensor, dropout: &Dropout, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = xs.clone();
        for layer in &self.layers {
            let attn = layer.attention.forward(&xs, &xs, &xs, false, train)?;
            xs = sublayer_connection(&xs, &attn, dropout, train, self.eps)?;
            let ff = layer.feed_forward.forward(&xs)?;
            xs = sublayer_connection(&xs, &ff, dropout, train, self.eps)?;
        }
        Ok(xs)
    }

    /// Turns attention recording on or off for the last layer.
    pub fn record_attention(&self, on: bool) {
        if let Some(layer) = self.layers.last() {
            layer.attention.set_recording(on);
        }
    }

    /// Attention map of the last layer from the most recent recorded pass.
    pub fn attention_map(&self) -> Option<Vec<Vec<f32>>> {
        self.layers.last().and_then(|l| l.attention.attention_map())
    }
}

struct DecoderLayer {
    self_attention: MultiHeadAttention,
    cross_attention: MultiHeadAttention,
    feed_forward: FeedForward,
}

pub struct Decoder {
    layers: Vec<DecoderLayer>,
    logit: Linear,
    eps: f64,
    span: tracing::Span,
}

impl Decoder {
    pub fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|index| {
                let vb = vb.pp(format!("layer.{index}"));
                let attention = |name: &str| {
                    MultiHeadAttention::load(
                        vb.pp(name),
                        config.embedding_size,
                        config.model_hidden_size,
                        config.num_attention_heads,
                    )
                };
                Ok(DecoderLayer {
                    self_attention: attention("masked_attention")?,
                    cross_attention: attention("attention")?,
                    feed_forward: FeedForward::load(
                        vb.pp("ff"),
                        config.model_hidden_size,
                        config.ffn_hidden_size,
                        config.embedding_size,
                        config.hidden_act,
                        OutputActivation::Linear,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let logit = linear(config.embedding_size, config.embedding_size, vb.pp("logit"))?;
        Ok(Self {
            layers,
            logit,
            eps: config.layer_norm_eps,
            span: tracing::span!(tracing::Level::TRACE, "decoder"),
        })
    }

    pub fn forward(&self, xs: &Tensor, encoder_output: &Tensor, dropout: &Dropout, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = xs.clone();
        for layer in &self.layers {
            let attn = layer.self_attention.forward(&xs, &xs, &xs, true, train)?;
            xs = sublayer_connection(&xs, &attn, dropout, train, self.eps)?;
            let attn = layer
                .cross_attention
                .forward(&xs, encoder_output, encoder_output, false, train)?;
            xs = sublayer_connection(&xs, &attn, dropout, train, self.eps)?;
            let ff = layer.feed_forward.forward(&xs)?;
            xs = sublayer_connection(&xs, &ff, dropout, train, self.eps)?;
        }
        self.logit.forward(&xs)
    }
}
