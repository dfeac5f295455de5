use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use candle_mtl_time_series::dataset::{inspect_parquet_file, load_prices, synthetic_panel, DatasetSplits, WindowDataset};
use candle_mtl_time_series::evaluation::{
    quintile_variants, sample_features, score_periods, threshold_backtest, timing_backtest, timing_points, EvalSignal,
    PerformanceMetrics,
};
use candle_mtl_time_series::plot;
use candle_mtl_time_series::trainer::TrainMode;
use candle_mtl_time_series::{AppConfig, Trainer, TsModel};

const TRADING_DAYS: f64 = 252.0;

#[derive(Parser, Debug)]
#[command(version, about = "Multi-task transformer for multi-horizon return forecasting")]
struct Cli {
    /// JSON config; defaults are used for anything it leaves out.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Default log filter, overridden by RUST_LOG.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit the model, keep the best weights and write evaluation figures.
    Train {
        /// Parquet file or directory; synthetic prices when absent.
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = TrainMode::Mtl)]
        mode: TrainMode,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = EvalSignal::Pos)]
        signal: EvalSignal,
    },
    /// Backtest a saved checkpoint on the test split.
    Evaluate {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = EvalSignal::Pos)]
        signal: EvalSignal,
        #[arg(long, default_value_t = 5)]
        n_tile: usize,
        /// Asset used for the single-name timing test.
        #[arg(long, default_value_t = 0)]
        asset: usize,
        /// Cost charged on every position change in the timing test.
        #[arg(long, default_value_t = 0.0)]
        cost_rate: f64,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Log the schema and head of a parquet file.
    Inspect {
        path: PathBuf,
        #[arg(long, default_value_t = 5)]
        rows: u32,
    },
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_json_file(path),
        None => Ok(AppConfig::default()),
    }
}

fn load_splits(config: &AppConfig) -> Result<DatasetSplits> {
    let data = &config.data;
    let panel = match &data.path {
        Some(path) => load_prices(path)?,
        None => {
            tracing::info!(
                assets = data.synthetic_assets,
                timesteps = data.synthetic_timesteps,
                "no data path given, generating synthetic prices"
            );
            synthetic_panel(data.synthetic_assets, data.synthetic_timesteps, config.train.seed, data.start_date)?
        }
    };
    let dataset = WindowDataset::build(&panel, &data.features, data.window_params(), data.stride)?;
    dataset.split(data.train_fraction, data.validation_fraction)
}

#[derive(Clone, Copy)]
struct EvalOptions<'a> {
    signal: EvalSignal,
    n_tile: usize,
    asset: usize,
    cost_rate: f64,
    periods_per_year: f64,
    output_dir: &'a Path,
}

fn evaluate_and_plot(model: &TsModel, splits: &DatasetSplits, opts: &EvalOptions) -> Result<()> {
    let EvalOptions {
        signal,
        n_tile,
        asset,
        cost_rate,
        periods_per_year,
        output_dir,
    } = *opts;
    let periods = score_periods(model, &splits.test.samples, signal)?;
    let variants = quintile_variants(model, &splits.test.samples, signal, n_tile)?;
    let quintile = &variants.main;
    let threshold = threshold_backtest(&periods, signal.threshold())?;

    for (name, returns) in [
        ("universe", quintile.universe.clone()),
        ("long-short", quintile.long_short()),
        ("long", quintile.tiles[0].clone()),
        ("threshold long-short", threshold.long_short()),
    ] {
        let metrics = PerformanceMetrics::from_returns(&returns, periods_per_year)?;
        tracing::info!(
            book = name,
            total_return = metrics.total_return,
            annualized_return = metrics.annualized_return,
            sharpe = metrics.sharpe_ratio,
            max_drawdown = metrics.max_drawdown,
            win_rate = metrics.win_rate,
            "backtest"
        );
    }

    let title = format!("signal {}", signal.as_str());
    plot::plot_quintile_variants(
        output_dir.join(format!("quintile_{}.png", signal.as_str())),
        &title,
        quintile,
        variants.ori.as_ref(),
        variants.cap.as_ref(),
        false,
    )?;
    plot::plot_threshold(output_dir.join(format!("threshold_{}.png", signal.as_str())), &title, &threshold, false)?;

    let points = timing_points(model, &splits.test.samples, asset)?;
    let timing = timing_backtest(&points, cost_rate);
    tracing::info!(
        asset,
        accuracy_pos = timing.pos_stats.accuracy,
        accuracy_ret = timing.ret_stats.accuracy,
        n_pos = timing.n_pos,
        n_neg = timing.n_neg,
        "timing"
    );
    plot::plot_timing(output_dir.join(format!("timing_{asset}.png")), &format!("asset {asset}"), &timing)?;

    if let Some(sample) = splits.test.samples.first() {
        if let Some(map) = model.attention_map(&sample_features(sample, &model.device)?)? {
            plot::plot_attention(output_dir.join("attention.png"), &map)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let device = Device::cuda_if_available(0)?;
    tracing::info!(?device, "selected device");

    let mut config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Inspect { path, rows } => {
            inspect_parquet_file(path, rows)?;
        }
        Command::Train {
            data,
            mode,
            epochs,
            batch_size,
            learning_rate,
            checkpoint,
            output_dir,
            signal,
        } => {
            if data.is_some() {
                config.data.path = data;
            }
            if let Some(epochs) = epochs {
                config.train.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.train.batch_size = batch_size;
            }
            if let Some(lr) = learning_rate {
                config.train.learning_rate = lr;
            }
            if let Some(path) = checkpoint {
                config.train.checkpoint_path = path;
            }
            if let Some(dir) = output_dir {
                config.train.output_dir = dir;
            }
            config.validate()?;

            let splits = load_splits(&config)?;
            let model = TsModel::new(&config.model, &device)?;
            tracing::info!(parameters = model.num_parameters(), "model ready");
            let mut trainer = Trainer::new(model, config.train.clone())?;
            let summary = trainer.fit(&splits.train, &splits.validation, mode)?;
            tracing::info!(?summary, "fit done");
            trainer.save_model(&config.train.checkpoint_path)?;

            let opts = EvalOptions {
                signal,
                n_tile: 5,
                asset: 0,
                cost_rate: 0.0,
                periods_per_year: TRADING_DAYS / config.data.stride as f64,
                output_dir: &config.train.output_dir,
            };
            evaluate_and_plot(trainer.model(), &splits, &opts)?;
        }
        Command::Evaluate {
            checkpoint,
            data,
            signal,
            n_tile,
            asset,
            cost_rate,
            output_dir,
        } => {
            if data.is_some() {
                config.data.path = data;
            }
            config.validate()?;
            let splits = load_splits(&config)?;
            let mut trainer = Trainer::new(TsModel::new(&config.model, &device)?, config.train.clone())?;
            trainer
                .load_model(&checkpoint)
                .with_context(|| format!("evaluating {}", checkpoint.display()))?;
            let output_dir = output_dir.unwrap_or_else(|| config.train.output_dir.clone());
            let opts = EvalOptions {
                signal,
                n_tile,
                asset,
                cost_rate,
                periods_per_year: TRADING_DAYS / config.data.stride as f64,
                output_dir: &output_dir,
            };
            evaluate_and_plot(trainer.model(), &splits, &opts)?;
        }
    }
    Ok(())
}
