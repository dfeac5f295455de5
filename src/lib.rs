//! Multi-task sequence-to-sequence transformer for multi-horizon financial
//! time-series forecasting.
//!
//! The crate is organised bottom-up:
//! - [`features`] / [`indicators`] turn price panels into feature windows,
//! - [`dataset`] / [`batcher`] slice those windows into training batches,
//! - [`transformer`], [`heads`] and [`model`] define the encoder-decoder and
//!   its prediction heads on top of candle,
//! - [`trainer`] / [`checkpoint`] run the multi-task loop and keep the best
//!   weights by holdout loss,
//! - [`evaluation`] / [`plot`] backtest the predictions and draw the curves,
//! - [`policy`] turns forecasts into positions, with [`distribution`] for
//!   exploration noise.

pub mod batcher;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distribution;
pub mod evaluation;
pub mod features;
pub mod heads;
pub mod indicators;
pub mod model;
pub mod plot;
pub mod policy;
pub mod trainer;
pub mod transformer;

pub use config::{AppConfig, ModelConfig, TrainConfig};
pub use model::{ForecastInput, TsModel};
pub use trainer::Trainer;
