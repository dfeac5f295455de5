//! Price panels and the rolling feature windows cut from them.
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use chrono::{Duration, NaiveDate};
use ndarray::{concatenate, s, Array2, Array3, Axis};
use polars::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use crate::features::{build_window, FeatureSpec, LabelMode, WindowParams};

/// Days between 0001-01-01 and 1970-01-01, used to turn polars `Date`
/// values into [`NaiveDate`].
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Logs the column layout of a parquet file and returns its first `rows` rows.
pub fn inspect_parquet_file(path: impl AsRef<Path>, rows: u32) -> Result<DataFrame> {
    let path = path.as_ref();
    let head = LazyFrame::scan_parquet(path, Default::default())
        .with_context(|| format!("failed to scan {}", path.display()))?
        .limit(rows)
        .collect()
        .with_context(|| format!("failed to read {}", path.display()))?;

    tracing::info!(path = %path.display(), columns = head.width(), "parquet schema");
    for (name, dtype) in head.get_column_names().iter().zip(head.dtypes()) {
        tracing::info!(column = %name, %dtype);
    }
    tracing::info!("first {} rows:\n{head}", head.height());
    Ok(head)
}

/// `[time, assets]` price matrix with optional per-row dates and market caps.
#[derive(Debug, Clone)]
pub struct PricePanel {
    pub assets: Vec<String>,
    pub dates: Option<Vec<NaiveDate>>,
    pub prices: Array2<f64>,
    pub caps: Option<Array2<f64>>,
}

impl PricePanel {
    pub fn timesteps(&self) -> usize {
        self.prices.nrows()
    }

    pub fn num_assets(&self) -> usize {
        self.prices.ncols()
    }

    pub fn date(&self, row: usize) -> Option<NaiveDate> {
        self.dates.as_ref().and_then(|d| d.get(row).copied())
    }
}

fn is_date_column(dtype: &DataType) -> bool {
    matches!(dtype, DataType::Date | DataType::Datetime(_, _))
}

fn column_dates(col: &Column) -> Result<Vec<NaiveDate>> {
    let days = col
        .cast(&DataType::Date)?
        .cast(&DataType::Int32)?;
    days.i32()?
        .iter()
        .map(|d| {
            let d = d.context("null value in date column")?;
            NaiveDate::from_num_days_from_ce_opt(d + UNIX_EPOCH_DAYS_FROM_CE)
                .with_context(|| format!("date offset {d} out of range"))
        })
        .collect()
}

fn column_values(col: &Column) -> Result<Vec<Option<f64>>> {
    let values = match col.dtype() {
        DataType::Float64 => col.f64()?.iter().collect(),
        DataType::Float32 => col.f32()?.iter().map(|v| v.map(f64::from)).collect(),
        DataType::Int64 => col.i64()?.iter().map(|v| v.map(|x| x as f64)).collect(),
        _ => {
            let casted = col.cast(&DataType::Float64)?;
            casted.f64()?.iter().collect()
        }
    };
    Ok(values)
}

/// Carries the last valid value forward. Returns `None` when the series
/// starts with a gap, since there is nothing to carry.
fn forward_fill(values: &[Option<f64>]) -> Option<Vec<f64>> {
    let mut last = None;
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        match v.filter(|x| x.is_finite()) {
            Some(x) => {
                last = Some(x);
                out.push(x);
            }
            None => out.push(last?),
        }
    }
    Some(out)
}

/// Loads a wide parquet file: one optional date column, every other column is
/// the price series of one asset. Nulls are forward-filled; assets whose
/// history starts with nulls are dropped.
pub fn load_price_panel(path: impl AsRef<Path>) -> Result<PricePanel> {
    let path = path.as_ref();
    let df = LazyFrame::scan_parquet(path, Default::default())
        .with_context(|| format!("failed to scan {}", path.display()))?
        .collect()
        .context("failed to collect LazyFrame")?;
    tracing::info!(
        path = %path.display(),
        rows = df.height(),
        columns = df.width(),
        "loaded parquet"
    );

    let mut dates = None;
    let mut assets = Vec::new();
    let mut series = Vec::new();
    for col in df.get_columns() {
        if is_date_column(col.dtype()) {
            dates = Some(column_dates(col)?);
            continue;
        }
        let values = column_values(col)
            .with_context(|| format!("column {} is not numeric", col.name()))?;
        match forward_fill(&values) {
            Some(filled) => {
                assets.push(col.name().to_string());
                series.push(filled);
            }
            None => tracing::warn!(asset = %col.name(), "dropping asset with leading nulls"),
        }
    }
    ensure!(!assets.is_empty(), "{} holds no usable price columns", path.display());

    let rows = df.height();
    let prices = Array2::from_shape_fn((rows, assets.len()), |(t, a)| series[a][t]);
    Ok(PricePanel {
        assets,
        dates,
        prices,
        caps: None,
    })
}

/// Loads every `*.parquet` under `dir` (sorted by path) and joins the panels
/// side by side. All files must cover the same number of rows.
pub fn load_price_dir(dir: impl AsRef<Path>) -> Result<PricePanel> {
    let dir = dir.as_ref();
    let mut files: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    files.sort();
    ensure!(!files.is_empty(), "no parquet files under {}", dir.display());

    let panels = files
        .par_iter()
        .map(load_price_panel)
        .collect::<Result<Vec<_>>>()?;

    let rows = panels[0].timesteps();
    if let Some(bad) = panels.iter().position(|p| p.timesteps() != rows) {
        bail!(
            "{} has {} rows, expected {rows}",
            files[bad].display(),
            panels[bad].timesteps()
        );
    }
    let views: Vec<_> = panels.iter().map(|p| p.prices.view()).collect();
    let prices = concatenate(Axis(1), &views)?;
    let dates = panels.iter().find_map(|p| p.dates.clone());
    let assets = panels.into_iter().flat_map(|p| p.assets).collect();
    Ok(PricePanel {
        assets,
        dates,
        prices,
        caps: None,
    })
}

/// Loads a single file or a directory of files.
pub fn load_prices(path: impl AsRef<Path>) -> Result<PricePanel> {
    let path = path.as_ref();
    if path.is_dir() {
        load_price_dir(path)
    } else {
        load_price_panel(path)
    }
}

/// Geometric random walk with per-asset drift and volatility. Market caps are
/// price times a fixed random share count.
pub fn synthetic_panel(
    assets: usize,
    timesteps: usize,
    seed: u64,
    start_date: Option<NaiveDate>,
) -> Result<PricePanel> {
    ensure!(assets > 0 && timesteps > 1, "synthetic panel needs assets and at least two rows");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0)?;
    let drifts: Vec<f64> = (0..assets).map(|_| rng.gen_range(-2e-4..6e-4)).collect();
    let vols: Vec<f64> = (0..assets).map(|_| rng.gen_range(0.008..0.03)).collect();
    let shares: Vec<f64> = (0..assets).map(|_| rng.gen_range(1.0..10.0)).collect();

    let mut prices = Array2::zeros((timesteps, assets));
    for a in 0..assets {
        prices[[0, a]] = rng.gen_range(20.0..200.0);
    }
    for t in 1..timesteps {
        for a in 0..assets {
            let shock = drifts[a] - 0.5 * vols[a] * vols[a] + vols[a] * normal.sample(&mut rng);
            prices[[t, a]] = prices[[t - 1, a]] * shock.exp();
        }
    }
    let caps = Array2::from_shape_fn((timesteps, assets), |(t, a)| prices[[t, a]] * shares[a]);
    let dates = start_date.map(|d| (0..timesteps).map(|t| d + Duration::days(t as i64)).collect());

    tracing::debug!(assets, timesteps, seed, "generated synthetic panel");
    Ok(PricePanel {
        assets: (0..assets).map(|a| format!("asset_{a:03}")).collect(),
        dates,
        prices,
        caps: Some(caps),
    })
}

/// One cross-section of encoder/decoder tensors for every asset.
#[derive(Debug, Clone)]
pub struct WindowSample {
    /// First panel row of the window.
    pub start: usize,
    /// Panel row of the last observed price.
    pub decision_row: usize,
    pub date: Option<NaiveDate>,
    /// `[assets, input_steps, features]`
    pub input: Array3<f64>,
    /// Decoder input, a copy of the last encoder step: `[assets, 1, features]`.
    pub output: Array3<f64>,
    /// `[assets, 1, features]`
    pub target: Array3<f64>,
    /// Simple return of each asset over the forecast horizon.
    pub realized: Vec<f64>,
    /// Market caps at the decision row, when the panel carries them.
    pub caps: Option<Vec<f64>>,
}

impl WindowSample {
    pub fn num_assets(&self) -> usize {
        self.input.shape()[0]
    }
}

#[derive(Debug, Clone)]
pub struct WindowDataset {
    pub names: Vec<String>,
    pub params: WindowParams,
    pub stride: usize,
    pub samples: Vec<WindowSample>,
}

impl WindowDataset {
    /// Cuts a trainable window every `stride` rows of the panel.
    pub fn build(panel: &PricePanel, spec: &FeatureSpec, params: WindowParams, stride: usize) -> Result<Self> {
        ensure!(stride > 0, "stride must be positive");
        let required = params.required_rows(LabelMode::Trainable);
        ensure!(
            panel.timesteps() >= required,
            "panel has {} rows but a window needs {required}",
            panel.timesteps()
        );
        let starts: Vec<usize> = (0..=panel.timesteps() - required).step_by(stride).collect();

        let samples = starts
            .par_iter()
            .map(|&start| build_sample(panel, spec, &params, start))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            samples = samples.len(),
            assets = panel.num_assets(),
            features = spec.names().len(),
            "built window dataset"
        );
        Ok(Self {
            names: spec.names(),
            params,
            stride,
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn subset(&self, samples: &[WindowSample]) -> Self {
        Self {
            names: self.names.clone(),
            params: self.params,
            stride: self.stride,
            samples: samples.to_vec(),
        }
    }

    /// Chronological train/validation/test split. Samples whose horizon
    /// reaches into the next split are dropped at each boundary.
    pub fn split(&self, train_fraction: f64, validation_fraction: f64) -> Result<DatasetSplits> {
        ensure!(
            train_fraction > 0.0 && validation_fraction >= 0.0 && train_fraction + validation_fraction < 1.0,
            "invalid split fractions {train_fraction} / {validation_fraction}"
        );
        let (train_end, val_end, _) = split_points(self.len(), train_fraction, validation_fraction);
        let purge = self.params.horizon().div_ceil(self.stride);

        let train = &self.samples[..train_end.saturating_sub(purge)];
        let validation = &self.samples[train_end..val_end.saturating_sub(purge).max(train_end)];
        let test = &self.samples[val_end..];
        ensure!(
            !train.is_empty() && !test.is_empty(),
            "{} samples are too few to split (purge gap {purge})",
            self.len()
        );
        tracing::info!(
            train = train.len(),
            validation = validation.len(),
            test = test.len(),
            purge,
            "split dataset"
        );
        Ok(DatasetSplits {
            train: self.subset(train),
            validation: self.subset(validation),
            test: self.subset(test),
        })
    }
}

/// Index boundaries `(train_end, validation_end, test_len)` for `total` items.
pub fn split_points(total: usize, train_fraction: f64, validation_fraction: f64) -> (usize, usize, usize) {
    let train_end = (total as f64 * train_fraction) as usize;
    let val_end = ((total as f64 * (train_fraction + validation_fraction)) as usize).max(train_end);
    (train_end, val_end, total - val_end)
}

#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: WindowDataset,
    pub validation: WindowDataset,
    pub test: WindowDataset,
}

fn build_sample(panel: &PricePanel, spec: &FeatureSpec, params: &WindowParams, start: usize) -> Result<WindowSample> {
    let required = params.required_rows(LabelMode::Trainable);
    let prices = panel.prices.slice(s![start..start + required, ..]);
    let window = build_window(prices, spec, params, LabelMode::Trainable, &[])
        .with_context(|| format!("window starting at row {start}"))?;
    let Some(labels) = window.labels else {
        bail!("trainable window at row {start} has no labels")
    };

    // [steps, assets, features] -> [assets, steps, features]
    let input = window.data.permuted_axes([1, 0, 2]).as_standard_layout().to_owned();
    let steps = input.shape()[1];
    let output = input.slice(s![.., steps - 1..steps, ..]).to_owned();
    let target = labels
        .slice(s![1..2, .., ..])
        .permuted_axes([1, 0, 2])
        .as_standard_layout()
        .to_owned();

    let decision_row = start + params.calc_length + params.m_days;
    let exit_row = decision_row + params.horizon();
    let realized = (0..panel.num_assets())
        .map(|a| panel.prices[[exit_row, a]] / panel.prices[[decision_row, a]] - 1.0)
        .collect();
    let caps = panel
        .caps
        .as_ref()
        .map(|caps| caps.row(decision_row).to_vec());

    Ok(WindowSample {
        start,
        decision_row,
        date: panel.date(decision_row),
        input,
        output,
        target,
        realized,
        caps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureFamily, FeatureGroup};

    fn small_params() -> WindowParams {
        WindowParams {
            m_days: 20,
            k_days: 5,
            sampling_days: 5,
            calc_length: 20,
            delayed_days: 0,
        }
    }

    fn small_spec() -> FeatureSpec {
        FeatureSpec {
            groups: vec![
                FeatureGroup { family: FeatureFamily::Logy, horizons: vec![1, 5] },
                FeatureGroup { family: FeatureFamily::Std, horizons: vec![5] },
                FeatureGroup { family: FeatureFamily::Cslogy, horizons: vec![5] },
            ],
        }
    }

    #[test]
    fn synthetic_panel_is_seeded_and_positive() -> Result<()> {
        let a = synthetic_panel(5, 100, 7, NaiveDate::from_ymd_opt(2020, 1, 1))?;
        let b = synthetic_panel(5, 100, 7, None)?;
        assert_eq!(a.prices, b.prices);
        assert!(a.prices.iter().all(|p| *p > 0.0));
        assert_eq!(a.date(1), NaiveDate::from_ymd_opt(2020, 1, 2));
        assert!(b.dates.is_none());
        Ok(())
    }

    #[test]
    fn forward_fill_carries_last_value() {
        let values = [Some(1.0), None, Some(f64::NAN), Some(3.0)];
        assert_eq!(forward_fill(&values), Some(vec![1.0, 1.0, 1.0, 3.0]));
        assert_eq!(forward_fill(&[None, Some(1.0)]), None);
    }

    #[test]
    fn windows_have_expected_shapes() -> Result<()> {
        let panel = synthetic_panel(6, 200, 1, None)?;
        let params = small_params();
        let dataset = WindowDataset::build(&panel, &small_spec(), params, 5)?;
        let required = params.required_rows(LabelMode::Trainable);
        assert_eq!(dataset.len(), (200 - required) / 5 + 1);

        let sample = &dataset.samples[0];
        assert_eq!(sample.input.shape(), &[6, 4, 4]);
        assert_eq!(sample.output.shape(), &[6, 1, 4]);
        assert_eq!(sample.target.shape(), &[6, 1, 4]);
        assert_eq!(sample.output.slice(s![.., 0, ..]), sample.input.slice(s![.., 3, ..]));
        assert_eq!(sample.realized.len(), 6);
        assert_eq!(sample.caps.as_ref().map(Vec::len), Some(6));

        let expected = panel.prices[[sample.decision_row + 5, 2]] / panel.prices[[sample.decision_row, 2]] - 1.0;
        assert!((sample.realized[2] - expected).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn split_is_chronological_and_purged() -> Result<()> {
        let panel = synthetic_panel(3, 400, 2, None)?;
        let dataset = WindowDataset::build(&panel, &small_spec(), small_params(), 5)?;
        let splits = dataset.split(0.7, 0.15)?;
        let last_train = splits.train.samples.last().map(|s| s.decision_row).unwrap_or_default();
        let first_val = splits.validation.samples[0].decision_row;
        let first_test = splits.test.samples[0].decision_row;
        assert!(last_train + small_params().horizon() <= first_val);
        assert!(first_val < first_test);
        assert!(splits.train.len() + splits.validation.len() + splits.test.len() < dataset.len());
        Ok(())
    }

    #[test]
    fn split_points_follow_fractions() {
        assert_eq!(split_points(100, 0.7, 0.15), (70, 85, 15));
    }

    #[test]
    fn short_panel_is_rejected() -> Result<()> {
        let panel = synthetic_panel(2, 30, 3, None)?;
        assert!(WindowDataset::build(&panel, &small_spec(), small_params(), 5).is_err());
        Ok(())
    }

    #[test]
    fn synthetic_returns_have_configured_scale() -> Result<()> {
        let panel = synthetic_panel(1, 5000, 11, None)?;
        let log_returns: Vec<f64> = panel
            .prices
            .column(0)
            .windows(2)
            .into_iter()
            .map(|w| (w[1] / w[0]).ln())
            .collect();
        let mean = log_returns.iter().sum::<f64>() / log_returns.len() as f64;
        let std = (log_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / log_returns.len() as f64).sqrt();
        // per-asset volatility is drawn from [0.008, 0.03)
        assert!(std > 0.006 && std < 0.032, "daily std {std}");
        Ok(())
    }

    fn write_parquet(path: &Path, mut df: DataFrame) -> Result<()> {
        let file = std::fs::File::create(path)?;
        ParquetWriter::new(file).finish(&mut df)?;
        Ok(())
    }

    fn price_frame(names: [&str; 2]) -> Result<DataFrame> {
        // 18262 days after the unix epoch is 2020-01-01
        let date = Column::new("date".into(), [18262i32, 18263, 18264, 18265]).cast(&DataType::Date)?;
        let gappy = Column::new(names[0].into(), [Some(10.0f64), None, Some(12.0), None]);
        let full = Column::new(names[1].into(), [1.0f64, 2.0, 3.0, 4.0]);
        let late = Column::new("late".into(), [None, Some(5.0f64), Some(6.0), Some(7.0)]);
        Ok(DataFrame::new(vec![date, gappy, full, late])?)
    }

    #[test]
    fn parquet_panel_keeps_order_and_fills_gaps() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prices.parquet");
        write_parquet(&path, price_frame(["zeta", "alpha"])?)?;

        let panel = load_price_panel(&path)?;
        assert_eq!(panel.assets, vec!["zeta".to_string(), "alpha".to_string()]);
        assert_eq!(panel.prices.dim(), (4, 2));
        assert_eq!(panel.prices.column(0).to_vec(), vec![10.0, 10.0, 12.0, 12.0]);
        assert_eq!(panel.prices.column(1).to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(panel.date(0), NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(panel.date(3), NaiveDate::from_ymd_opt(2020, 1, 4));
        assert!(panel.caps.is_none());

        let head = inspect_parquet_file(&path, 2)?;
        assert_eq!(head.height(), 2);
        assert_eq!(head.width(), 4);
        Ok(())
    }

    #[test]
    fn parquet_directory_is_joined_by_path_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_parquet(&dir.path().join("b.parquet"), price_frame(["b1", "b2"])?)?;
        write_parquet(&dir.path().join("a.parquet"), price_frame(["a1", "a2"])?)?;
        std::fs::write(dir.path().join("notes.txt"), "ignored")?;

        let panel = load_prices(dir.path())?;
        assert_eq!(panel.assets, ["a1", "a2", "b1", "b2"].map(String::from).to_vec());
        assert_eq!(panel.prices.dim(), (4, 4));
        assert!(panel.dates.is_some());

        let mut short = DataFrame::new(vec![Column::new("c1".into(), [1.0f64, 2.0])])?;
        let file = std::fs::File::create(dir.path().join("c.parquet"))?;
        ParquetWriter::new(file).finish(&mut short)?;
        assert!(load_prices(dir.path()).is_err());
        Ok(())
    }
}
