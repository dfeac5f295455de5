//! Feature engineering on `[time, assets]` price panels.
//!
//! Every window is rebased to its first row in log space, then each feature
//! family is evaluated per horizon and stacked along a trailing feature axis,
//! giving `[time, assets, features]` arrays. Horizon labels are taken from the
//! same families so the decoder sees features and targets in one layout.

use anyhow::{bail, ensure, Result};
use ndarray::{stack, Array1, Array2, Array3, ArrayView2, Axis};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::heads::{HeadKind, HeadSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureFamily {
    /// Log return over the horizon.
    Logy,
    /// Sign of the log return over the horizon.
    Pos,
    /// Rolling std of simple daily returns.
    Std,
    /// Log distance from the rolling maximum.
    Mdd,
    /// Low-pass Fourier reconstruction keeping `n` components.
    Fft,
    /// Cross-sectional rank of `logy`.
    Cslogy,
    /// Cross-sectional rank of `std`.
    Csstd,
}

impl FeatureFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logy => "logy",
            Self::Pos => "pos",
            Self::Std => "std",
            Self::Mdd => "mdd",
            Self::Fft => "fft",
            Self::Cslogy => "cslogy",
            Self::Csstd => "csstd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub family: FeatureFamily,
    pub horizons: Vec<usize>,
}

/// Ordered list of feature families and horizons. Column names are
/// `<family>_<horizon>` in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub groups: Vec<FeatureGroup>,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        let group = |family, horizons: &[usize]| FeatureGroup {
            family,
            horizons: horizons.to_vec(),
        };
        Self {
            groups: vec![
                group(FeatureFamily::Logy, &[1, 20, 60, 120]),
                group(FeatureFamily::Pos, &[1, 20]),
                group(FeatureFamily::Std, &[20, 60, 120]),
                group(FeatureFamily::Mdd, &[20, 60]),
                group(FeatureFamily::Fft, &[3, 100]),
                group(FeatureFamily::Cslogy, &[1, 20]),
                group(FeatureFamily::Csstd, &[20]),
            ],
        }
    }
}

impl FeatureSpec {
    pub fn names(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.horizons.iter().map(move |n| format!("{}_{n}", g.family.as_str())))
            .collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names().iter().position(|n| n == name)
    }
}

/// Window geometry, in rows of the price panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub m_days: usize,
    pub k_days: usize,
    pub sampling_days: usize,
    pub calc_length: usize,
    pub delayed_days: usize,
}

impl WindowParams {
    pub fn horizon(&self) -> usize {
        self.k_days + self.delayed_days
    }

    /// Rows of history a window needs, including the horizon when labels are
    /// requested.
    pub fn required_rows(&self, mode: LabelMode) -> usize {
        match mode {
            LabelMode::FeaturesOnly => self.calc_length + self.m_days + 1,
            LabelMode::Trainable | LabelMode::Test => {
                self.calc_length + self.m_days + self.horizon() + 1
            }
        }
    }

    pub fn input_steps(&self) -> usize {
        self.m_days / self.sampling_days.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMode {
    FeaturesOnly,
    /// Labels for every feature column: row 0 at the last input step, row 1
    /// at the horizon.
    Trainable,
    /// A single `logy_<k_days>` label for realised-return evaluation.
    Test,
}

#[derive(Debug, Clone)]
pub struct FeatureWindow {
    pub names: Vec<String>,
    /// `[input_steps, assets, features]`
    pub data: Array3<f64>,
    /// `[2, assets, features]` (`[2, assets, 1]` in test mode)
    pub labels: Option<Array3<f64>>,
}

pub fn log_y_nd(log_p: &Array2<f64>, n: usize) -> Array2<f64> {
    let rows = log_p.nrows();
    let mut out = Array2::zeros(log_p.raw_dim());
    for t in 0..rows {
        let base = if t < n { 0 } else { t - n };
        let row = &log_p.row(t) - &log_p.row(base);
        out.row_mut(t).assign(&row);
    }
    out
}

/// Rolling population std of simple returns over rows `t-n ..= t`.
pub fn std_nd(log_p: &Array2<f64>, n: usize) -> Array2<f64> {
    let y = log_y_nd(log_p, 1).mapv(|v| v.exp() - 1.0);
    let mut out = Array2::zeros(y.raw_dim());
    for t in 1..y.nrows() {
        let window = y.slice(ndarray::s![t.saturating_sub(n)..=t, ..]);
        let std = window.std_axis(Axis(0), 0.0);
        out.row_mut(t).assign(&std);
    }
    out
}

/// Distance of each value below the peak of the trailing `n + 1` rows. The
/// peak is shared by the whole cross-section: it is the maximum over every
/// asset in the window, not a per-asset maximum.
pub fn mdd_nd(log_p: &Array2<f64>, n: usize) -> Array2<f64> {
    let mut out = Array2::zeros(log_p.raw_dim());
    for t in 0..log_p.nrows() {
        let window = log_p.slice(ndarray::s![t.saturating_sub(n)..=t, ..]);
        let peak = window.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        out.row_mut(t).assign(&log_p.row(t).mapv(|v| v - peak));
    }
    out
}

/// Fits the spectrum on the first `m_days + 1` rows, keeps `n` low
/// frequencies and reconstructs over `m_days + k_days + 1` rows, returning as
/// many rows as the input has.
pub fn fft_lowpass(log_p: &Array2<f64>, n: usize, m_days: usize, k_days: usize) -> Result<Array2<f64>> {
    let rows = log_p.nrows();
    ensure!(
        rows == m_days + k_days + 1 || rows == m_days + 1,
        "fft input has {rows} rows, expected {} or {}",
        m_days + k_days + 1,
        m_days + 1
    );
    let fit_len = m_days + 1;
    let out_len = m_days + k_days + 1;
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(fit_len);
    let inverse = planner.plan_fft_inverse(out_len);

    let mut out = Array2::zeros((rows, log_p.ncols()));
    for (j, column) in log_p.axis_iter(Axis(1)).enumerate() {
        let mut spectrum: Vec<Complex<f64>> = column
            .iter()
            .take(fit_len)
            .map(|&v| Complex::new(v, 0.0))
            .collect();
        forward.process(&mut spectrum);
        if n > 0 && 2 * n < fit_len {
            for c in &mut spectrum[n..fit_len - n] {
                *c = Complex::new(0.0, 0.0);
            }
        }
        spectrum.resize(out_len, Complex::new(0.0, 0.0));
        inverse.process(&mut spectrum);
        for (t, c) in spectrum.iter().take(rows).enumerate() {
            out[[t, j]] = c.re / out_len as f64;
        }
    }
    Ok(out)
}

/// Per row, the rank of each asset scaled to `[0, 1]`.
pub fn cross_sectional_rank(arr: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros(arr.raw_dim());
    let denom = arr.ncols().saturating_sub(1);
    for (t, row) in arr.axis_iter(Axis(0)).enumerate() {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));
        for (rank, &asset) in order.iter().enumerate() {
            out[[t, asset]] = if denom == 0 { 0.0 } else { rank as f64 / denom as f64 };
        }
    }
    out
}

/// Per row z-score using the sample std.
pub fn cross_sectional_normal(arr: &Array2<f64>) -> Array2<f64> {
    let mut out = arr.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let mean = row.mean().unwrap_or(0.0);
        let std = if row.len() > 1 { row.std(1.0) } else { 0.0 };
        row.mapv_inplace(|v| if std > 0.0 { (v - mean) / std } else { 0.0 });
    }
    out
}

/// Column z-score; statistics come from the first `m` rows when given.
pub fn normalize(arr: &Array2<f64>, eps: f64, m: Option<usize>) -> Array2<f64> {
    let rows = m.unwrap_or(arr.nrows()).min(arr.nrows());
    let head = arr.slice(ndarray::s![..rows, ..]);
    let mean = head.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(arr.ncols()));
    let std = head.std_axis(Axis(0), 0.0) + eps;
    (arr - &mean) / &std
}

/// Linear-interpolated percentile, `q` in `[0, 100]`.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn rows(arr: &Array2<f64>, from: usize, len: usize) -> Array2<f64> {
    arr.slice(ndarray::s![from..from + len, ..]).to_owned()
}

fn pick(arr: &Array2<f64>, indices: &[usize]) -> Array2<f64> {
    arr.select(Axis(0), indices)
}

fn rebase(arr: &Array2<f64>) -> Array2<f64> {
    let first = arr.row(0).to_owned();
    arr - &first
}

/// Builds one `[input_steps, assets, features]` window from `prices`, which
/// must hold exactly [`WindowParams::required_rows`] rows of strictly positive
/// prices.
pub fn build_window(
    prices: ArrayView2<f64>,
    spec: &FeatureSpec,
    params: &WindowParams,
    mode: LabelMode,
    additional: &[(String, Array2<f64>)],
) -> Result<FeatureWindow> {
    let required = params.required_rows(mode);
    ensure!(
        prices.nrows() == required,
        "window has {} rows, expected {required}",
        prices.nrows()
    );
    ensure!(params.sampling_days > 0, "sampling_days must be positive");
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        bail!("window contains non-positive or non-finite prices");
    }

    let WindowParams {
        m_days,
        k_days,
        calc_length,
        ..
    } = *params;
    let k_adj = params.horizon();

    let log_p = rebase(&prices.mapv(f64::ln));
    let wo_calc_len = match mode {
        LabelMode::FeaturesOnly => m_days + 1,
        _ => m_days + k_adj + 1,
    };
    let log_p_wo_calc = rebase(&rows(&log_p, calc_length, wo_calc_len));

    let mut names = Vec::new();
    let mut data_columns = Vec::new();
    let mut label_columns = Vec::new();
    for group in &spec.groups {
        for &n in &group.horizons {
            names.push(format!("{}_{n}", group.family.as_str()));
            data_columns.push(feature_rows(group.family, &log_p, &log_p_wo_calc, n, params)?);
            if mode == LabelMode::Trainable {
                let n_freq = k_days.min(n) + params.delayed_days;
                label_columns.push(label_rows(group.family, &log_p, &log_p_wo_calc, n, n_freq, params)?);
            }
        }
    }

    for (name, series) in additional {
        ensure!(
            series.nrows() >= calc_length + m_days + k_adj + 1 || mode == LabelMode::FeaturesOnly,
            "additional series {name} is too short"
        );
        let data_raw = rows(series, calc_length, m_days + 1);
        let flat: Vec<f64> = data_raw.iter().copied().collect();
        let (lo, hi) = (percentile(&flat, 1.0), percentile(&flat, 99.0));
        let winsorized = data_raw.mapv(|v| v.clamp(lo, hi));
        let mean = winsorized.mean().unwrap_or(0.0);
        let std = if winsorized.len() > 1 { winsorized.std(1.0) } else { 1.0 };
        let scale = |v: f64| if std > 0.0 { (v - mean) / std } else { 0.0 };
        names.push(name.clone());
        data_columns.push(winsorized.mapv(scale));
        if mode == LabelMode::Trainable {
            let label_raw = pick(series, &[calc_length + m_days, calc_length + m_days + k_adj]);
            label_columns.push(label_raw.mapv(|v| scale(v.clamp(lo, hi))));
        }
    }

    let views: Vec<_> = data_columns.iter().map(|c| c.view()).collect();
    let full = stack(Axis(2), &views)?;
    let sampled: Vec<usize> = (params.sampling_days..=m_days)
        .step_by(params.sampling_days)
        .collect();
    let data = full.select(Axis(0), &sampled);

    let labels = match mode {
        LabelMode::FeaturesOnly => None,
        LabelMode::Trainable => {
            let views: Vec<_> = label_columns.iter().map(|c| c.view()).collect();
            Some(stack(Axis(2), &views)?)
        }
        LabelMode::Test => {
            let logy = log_y_nd(&log_p, k_days);
            let label = pick(&logy, &[calc_length + m_days, calc_length + m_days + k_adj]);
            Some(label.insert_axis(Axis(2)))
        }
    };

    Ok(FeatureWindow { names, data, labels })
}

fn feature_rows(
    family: FeatureFamily,
    log_p: &Array2<f64>,
    log_p_wo_calc: &Array2<f64>,
    n: usize,
    params: &WindowParams,
) -> Result<Array2<f64>> {
    let (calc, m) = (params.calc_length, params.m_days);
    let out = match family {
        FeatureFamily::Logy => rows(&log_y_nd(log_p, n), calc, m + 1),
        FeatureFamily::Pos => rows(&log_y_nd(log_p, n), calc, m + 1).mapv(sign),
        FeatureFamily::Std => rows(&std_nd(log_p, n), calc, m + 1),
        FeatureFamily::Mdd => rows(&mdd_nd(log_p_wo_calc, n), 0, m + 1),
        FeatureFamily::Fft => rows(&fft_lowpass(log_p_wo_calc, n, m, params.horizon())?, 0, m + 1),
        FeatureFamily::Cslogy => cross_sectional_rank(&rows(&log_y_nd(log_p, n), calc, m + 1)),
        FeatureFamily::Csstd => cross_sectional_rank(&rows(&std_nd(log_p, n), calc, m + 1)),
    };
    Ok(out)
}

fn label_rows(
    family: FeatureFamily,
    log_p: &Array2<f64>,
    log_p_wo_calc: &Array2<f64>,
    n: usize,
    n_freq: usize,
    params: &WindowParams,
) -> Result<Array2<f64>> {
    let now = params.calc_length + params.m_days;
    let ahead = [now, now + n_freq];
    let local = [params.m_days, params.m_days + params.horizon()];
    let out = match family {
        FeatureFamily::Logy => pick(&log_y_nd(log_p, n), &ahead),
        FeatureFamily::Pos => pick(&log_y_nd(log_p, n), &ahead).mapv(sign),
        FeatureFamily::Std => pick(&std_nd(log_p, n), &ahead),
        FeatureFamily::Mdd => pick(&mdd_nd(log_p_wo_calc, n), &local),
        FeatureFamily::Fft => pick(
            &fft_lowpass(log_p_wo_calc, n, params.m_days, params.horizon())?,
            &local,
        ),
        FeatureFamily::Cslogy => cross_sectional_rank(&pick(&log_y_nd(log_p, n), &ahead)),
        FeatureFamily::Csstd => cross_sectional_rank(&pick(&std_nd(log_p, n), &ahead)),
    };
    Ok(out)
}

/// Per-head label arrays from `[batch, steps, features]` labels: regression
/// heads stack their source columns, classification heads one-hot encode
/// `(value > 0, value <= 0)`.
pub fn labels_for_mtl(
    names: &[String],
    labels: &Array3<f64>,
    heads: &[HeadSpec],
) -> Result<Vec<(String, Array3<f64>)>> {
    let column = |name: &str| -> Result<usize> {
        names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| anyhow::anyhow!("label feature {name} not found"))
    };
    heads
        .iter()
        .map(|head| {
            let out = match head.kind {
                HeadKind::Regression => {
                    let indices = head
                        .sources
                        .iter()
                        .map(|s| column(s))
                        .collect::<Result<Vec<_>>>()?;
                    labels.select(Axis(2), &indices)
                }
                HeadKind::Classification => {
                    let Some(source) = head.sources.first() else {
                        bail!("classification head {} has no source", head.name)
                    };
                    let values = labels.index_axis(Axis(2), column(source)?);
                    let up = values.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                    let down = values.mapv(|v| if v > 0.0 { 0.0 } else { 1.0 });
                    stack(Axis(2), &[up.view(), down.view()])?
                }
            };
            Ok((head.name.clone(), out))
        })
        .collect()
}

fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Whole-history features over a price panel, sampled every `sampling_freq`
/// rows.
pub struct FeatureCalculator {
    sampling_freq: usize,
    log_cum_y: Array2<f64>,
    y_1d: Array2<f64>,
    log_y: Array2<f64>,
}

impl FeatureCalculator {
    pub fn new(prices: &Array2<f64>, sampling_freq: usize) -> Result<Self> {
        ensure!(prices.nrows() > 1, "need at least two rows of prices");
        ensure!(sampling_freq > 0, "sampling_freq must be positive");
        let log_cum_y = rebase(&prices.mapv(f64::ln));
        let y_1d = Self::daily_returns(&log_cum_y, 1e-6);
        let mut calc = Self {
            sampling_freq,
            log_cum_y,
            y_1d,
            log_y: Array2::zeros((0, 0)),
        };
        calc.log_y = calc.moving_average(sampling_freq);
        Ok(calc)
    }

    fn daily_returns(log_cum_y: &Array2<f64>, eps: f64) -> Array2<f64> {
        let mut out = Array2::zeros(log_cum_y.raw_dim());
        out.row_mut(0).assign(&log_cum_y.row(0));
        for t in 1..log_cum_y.nrows() {
            let row = (&log_cum_y.row(t) - &log_cum_y.row(t - 1)).mapv(|d| (d + eps).exp() - 1.0);
            out.row_mut(t).assign(&row);
        }
        out
    }

    fn sample(&self, arr: &Array2<f64>) -> Array2<f64> {
        let indices: Vec<usize> = (0..arr.nrows()).step_by(self.sampling_freq).collect();
        pick(arr, &indices)
    }

    pub fn moving_average(&self, n: usize) -> Array2<f64> {
        self.sample(&log_y_nd(&self.log_cum_y, n))
    }

    pub fn positive(&self) -> Array2<f64> {
        self.log_y.mapv(|v| if v >= 0.0 { 1.0 } else { -1.0 })
    }

    pub fn std(&self, n: usize) -> Array2<f64> {
        let mut out = Array2::zeros(self.y_1d.raw_dim());
        for t in 1..self.y_1d.nrows() {
            let window = self.y_1d.slice(ndarray::s![t.saturating_sub(n)..=t, ..]);
            out.row_mut(t).assign(&window.std_axis(Axis(0), 0.0));
        }
        self.sample(&out)
    }

    pub fn mdd(&self, n: usize) -> Array2<f64> {
        self.sample(&mdd_nd(&self.log_cum_y, n))
    }

    /// Ordered feature map with the redundant first row removed.
    pub fn generate_features(&self) -> Vec<(String, Array2<f64>)> {
        let mut features = vec![
            ("log_y".to_string(), self.log_y.clone()),
            ("log_cum_y".to_string(), self.sample(&self.log_cum_y)),
            ("positive".to_string(), self.positive()),
        ];
        for n in [20, 60, 120] {
            features.push((format!("y_{n}d"), self.moving_average(n)));
            features.push((format!("std{n}d"), self.std(n)));
            features.push((format!("mdd{n}d"), self.mdd(n)));
        }
        features
            .into_iter()
            .map(|(name, arr)| {
                let trimmed = arr.slice(ndarray::s![1.., ..]).to_owned();
                (name, trimmed)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn log_y_uses_first_row_before_horizon() {
        let log_p = array![[0.0], [1.0], [3.0], [6.0]];
        let y = log_y_nd(&log_p, 2);
        assert_eq!(y.column(0).to_vec(), vec![0.0, 1.0, 3.0, 5.0]);
    }

    #[test]
    fn mdd_is_distance_from_rolling_peak() {
        let log_p = array![[0.0], [2.0], [1.0], [0.5], [3.0]];
        let mdd = mdd_nd(&log_p, 2);
        assert_eq!(mdd.column(0).to_vec(), vec![0.0, 0.0, -1.0, -1.5, 0.0]);
    }

    #[test]
    fn mdd_peak_spans_all_assets() {
        let log_p = array![[2.0, 0.0], [1.0, 0.0]];
        let mdd = mdd_nd(&log_p, 1);
        assert_eq!(mdd.row(0).to_vec(), vec![0.0, -2.0]);
        assert_eq!(mdd.row(1).to_vec(), vec![-1.0, -2.0]);
    }

    #[test]
    fn std_of_constant_prices_is_zero() {
        let log_p = Array2::zeros((10, 3));
        assert!(std_nd(&log_p, 5).iter().all(|v| approx(*v, 0.0)));
    }

    #[test]
    fn fft_without_filter_reproduces_input() -> Result<()> {
        let log_p = array![[0.0], [0.3], [-0.2], [0.5], [0.1]];
        let out = fft_lowpass(&log_p, 0, 4, 0)?;
        for (a, b) in out.iter().zip(log_p.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn fft_keeps_constant_signal() -> Result<()> {
        let log_p = Array2::from_elem((7, 2), 0.4);
        let out = fft_lowpass(&log_p, 1, 6, 0)?;
        assert!(out.iter().all(|v| (v - 0.4).abs() < 1e-9));
        Ok(())
    }

    #[test]
    fn rank_scales_to_unit_interval() {
        let arr = array![[3.0, 1.0, 2.0]];
        let ranks = cross_sectional_rank(&arr);
        assert_eq!(ranks.row(0).to_vec(), vec![1.0, 0.0, 0.5]);
    }

    #[test]
    fn percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!(approx(percentile(&v, 50.0), 3.0));
        assert!(approx(percentile(&v, 80.0), 4.2));
        assert!(approx(percentile(&v, 100.0), 5.0));
    }

    #[test]
    fn default_spec_has_sixteen_columns() {
        let spec = FeatureSpec::default();
        assert_eq!(spec.names().len(), 16);
        assert_eq!(spec.index_of("pos_20"), Some(5));
    }

    #[test]
    fn window_shapes_and_label_alignment() -> Result<()> {
        let params = WindowParams {
            m_days: 20,
            k_days: 5,
            sampling_days: 5,
            calc_length: 10,
            delayed_days: 0,
        };
        let spec = FeatureSpec {
            groups: vec![
                FeatureGroup { family: FeatureFamily::Logy, horizons: vec![1, 5] },
                FeatureGroup { family: FeatureFamily::Mdd, horizons: vec![5] },
            ],
        };
        let rows = params.required_rows(LabelMode::Trainable);
        let prices = Array2::from_shape_fn((rows, 3), |(t, a)| 100.0 * (1.0 + 0.01 * (t as f64) * (a as f64 + 1.0)));
        let window = build_window(prices.view(), &spec, &params, LabelMode::Trainable, &[])?;
        assert_eq!(window.names, vec!["logy_1", "logy_5", "mdd_5"]);
        assert_eq!(window.data.shape(), &[4, 3, 3]);
        let labels = window.labels.expect("trainable labels");
        assert_eq!(labels.shape(), &[2, 3, 3]);
        // the first label row is the feature value at the last input step
        for a in 0..3 {
            for f in 0..2 {
                assert!(approx(labels[[0, a, f]], window.data[[3, a, f]]));
            }
        }
        Ok(())
    }

    #[test]
    fn window_rejects_non_positive_prices() {
        let params = WindowParams {
            m_days: 4,
            k_days: 1,
            sampling_days: 1,
            calc_length: 0,
            delayed_days: 0,
        };
        let prices = Array2::from_elem((5, 2), 0.0);
        let spec = FeatureSpec::default();
        assert!(build_window(prices.view(), &spec, &params, LabelMode::FeaturesOnly, &[]).is_err());
    }

    #[test]
    fn calculator_drops_first_row() -> Result<()> {
        let prices = Array2::from_shape_fn((130, 2), |(t, _)| 100.0 + t as f64);
        let calc = FeatureCalculator::new(&prices, 1)?;
        let features = calc.generate_features();
        assert_eq!(features[0].0, "log_y");
        assert_eq!(features.len(), 12);
        assert!(features.iter().all(|(_, arr)| arr.nrows() == 129));
        assert!(calc.positive().iter().all(|v| *v == 1.0));
        Ok(())
    }

    #[test]
    fn mtl_labels_follow_head_sources() -> Result<()> {
        let names: Vec<String> = FeatureSpec::default().names();
        let mut labels = Array3::zeros((2, 1, names.len()));
        labels[[0, 0, 0]] = 0.05; // logy_1
        labels[[1, 0, 0]] = -0.02;
        labels[[0, 0, 4]] = 1.0; // pos_1
        labels[[1, 0, 4]] = -1.0;
        let heads = crate::config::ModelConfig::default_heads();
        let out = labels_for_mtl(&names, &labels, &heads)?;
        let get = |name: &str| out.iter().find(|(n, _)| n == name).map(|(_, a)| a.clone()).expect("head");
        let ret = get("ret");
        assert_eq!(ret.shape(), &[2, 1, 4]);
        assert!(approx(ret[[0, 0, 0]], 0.05));
        let pos = get("pos");
        assert_eq!(pos.shape(), &[2, 1, 2]);
        assert_eq!(pos.slice(ndarray::s![0, 0, ..]).to_vec(), vec![1.0, 0.0]);
        assert_eq!(pos.slice(ndarray::s![1, 0, ..]).to_vec(), vec![0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn normalize_uses_leading_rows() {
        let arr = array![[1.0], [3.0], [100.0]];
        let out = normalize(&arr, 0.0, Some(2));
        assert!(approx(out[[0, 0]], -1.0));
        assert!(approx(out[[1, 0]], 1.0));
    }
}
