//! Classic technical indicators and fractional differencing on a single
//! price series. Undefined leading values are `NaN`.

/// Mean over the trailing `n` values; `NaN` until `n` values are available.
pub fn rolling_mean(values: &[f64], n: usize) -> Vec<f64> {
    rolling(values, n, |w| w.iter().sum::<f64>() / w.len() as f64)
}

/// Sample std (ddof = 1) over the trailing `n` values.
pub fn rolling_std(values: &[f64], n: usize) -> Vec<f64> {
    rolling(values, n, |w| {
        if w.len() < 2 {
            return f64::NAN;
        }
        let mean = w.iter().sum::<f64>() / w.len() as f64;
        let var = w.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (w.len() - 1) as f64;
        var.sqrt()
    })
}

fn rolling(values: &[f64], n: usize, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    (0..values.len())
        .map(|t| {
            if n == 0 || t + 1 < n {
                f64::NAN
            } else {
                f(&values[t + 1 - n..=t])
            }
        })
        .collect()
}

/// Bias-adjusted exponentially weighted mean with smoothing factor `alpha`:
/// every output is the weighted average of all inputs so far with weights
/// `(1 - alpha)^age`.
pub fn ewm_mean(values: &[f64], alpha: f64) -> Vec<f64> {
    let decay = 1.0 - alpha;
    let (mut num, mut den) = (0.0, 0.0);
    values
        .iter()
        .map(|&v| {
            num = v + decay * num;
            den = 1.0 + decay * den;
            num / den
        })
        .collect()
}

pub fn ewm_span(values: &[f64], span: f64) -> Vec<f64> {
    ewm_mean(values, 2.0 / (span + 1.0))
}

pub fn ewm_com(values: &[f64], com: f64) -> Vec<f64> {
    ewm_mean(values, 1.0 / (1.0 + com))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TechnicalIndicators {
    pub ma7: Vec<f64>,
    pub ma21: Vec<f64>,
    pub ema26: Vec<f64>,
    pub ema12: Vec<f64>,
    pub macd: Vec<f64>,
    pub sd20: Vec<f64>,
    pub upper_band: Vec<f64>,
    pub lower_band: Vec<f64>,
    pub ema: Vec<f64>,
    pub momentum: Vec<f64>,
}

impl TechnicalIndicators {
    pub fn compute(prices: &[f64]) -> Self {
        let ma21 = rolling_mean(prices, 21);
        let ema26 = ewm_span(prices, 26.0);
        let ema12 = ewm_span(prices, 12.0);
        let sd20 = rolling_std(prices, 20);
        let macd = ema12.iter().zip(&ema26).map(|(a, b)| a - b).collect();
        let band = |sign: f64| -> Vec<f64> { ma21.iter().zip(&sd20).map(|(m, s)| m + sign * 2.0 * s).collect() };
        Self {
            ma7: rolling_mean(prices, 7),
            upper_band: band(1.0),
            lower_band: band(-1.0),
            ma21,
            ema26,
            ema12,
            macd,
            sd20,
            ema: ewm_com(prices, 0.5),
            momentum: prices.iter().map(|p| p - 1.0).collect(),
        }
    }

    /// Indicator columns in a fixed order, for stacking next to prices.
    pub fn columns(&self) -> Vec<(&'static str, &[f64])> {
        vec![
            ("ma7", self.ma7.as_slice()),
            ("ma21", self.ma21.as_slice()),
            ("26ema", self.ema26.as_slice()),
            ("12ema", self.ema12.as_slice()),
            ("MACD", self.macd.as_slice()),
            ("20sd", self.sd20.as_slice()),
            ("upper_band", self.upper_band.as_slice()),
            ("lower_band", self.lower_band.as_slice()),
            ("ema", self.ema.as_slice()),
            ("momentum", self.momentum.as_slice()),
        ]
    }
}

/// Fractional differencing weights, oldest lag first, newest (always 1) last.
pub fn frac_diff_weights(d: f64, size: usize) -> Vec<f64> {
    let mut w = Vec::with_capacity(size);
    if size == 0 {
        return w;
    }
    w.push(1.0);
    for k in 1..size {
        let prev = w[k - 1];
        w.push(-prev / k as f64 * (d - k as f64 + 1.0));
    }
    w.reverse();
    w
}

/// Expanding-window fractional difference of order `d`. Gaps are
/// forward-filled; the leading points whose weights carry more than
/// `threshold` of the total absolute weight are `NaN`, as are points where
/// the raw series is not finite.
pub fn frac_diff(series: &[f64], d: f64, threshold: f64) -> Vec<f64> {
    let n = series.len();
    let w = frac_diff_weights(d, n);
    let total: f64 = w.iter().map(|v| v.abs()).sum();
    let mut cum = 0.0;
    let skip = w
        .iter()
        .filter(|v| {
            cum += v.abs();
            cum / total > threshold
        })
        .count();

    let mut filled = Vec::with_capacity(n);
    let mut last = f64::NAN;
    for &v in series {
        if v.is_finite() {
            last = v;
        }
        filled.push(last);
    }

    (0..n)
        .map(|i| {
            if i < skip || !series[i].is_finite() {
                return f64::NAN;
            }
            let weights = &w[n - (i + 1)..];
            weights
                .iter()
                .zip(&filled[..=i])
                .filter(|(_, x)| x.is_finite())
                .map(|(w, x)| w * x)
                .sum()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_mean_waits_for_full_window() {
        let out = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert_eq!(&out[2..], &[2.0, 3.0]);
    }

    #[test]
    fn rolling_std_is_sample_std() {
        let out = rolling_std(&[1.0, 3.0], 2);
        assert!((out[1] - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn adjusted_ewm_matches_closed_form() {
        // alpha = 2/3: second value = (2 + 1/3 * 1) / (1 + 1/3)
        let out = ewm_com(&[1.0, 2.0], 0.5);
        assert_eq!(out[0], 1.0);
        assert!((out[1] - 1.75).abs() < 1e-12);
    }

    #[test]
    fn indicators_on_constant_series() {
        let prices = vec![10.0; 30];
        let ind = TechnicalIndicators::compute(&prices);
        assert!(ind.macd.iter().all(|v| v.abs() < 1e-12));
        assert_eq!(ind.upper_band[25], 10.0);
        assert_eq!(ind.momentum[0], 9.0);
        assert_eq!(ind.columns().len(), 10);
    }

    #[test]
    fn first_difference_weights() {
        assert_eq!(frac_diff_weights(1.0, 3), vec![0.0, -1.0, 1.0]);
        // the zero-weight lag is below any threshold, the other two are kept
        let out = frac_diff(&[1.0, 3.0, 6.0], 1.0, 0.0);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert_eq!(out[2], 3.0);
    }

    #[test]
    fn frac_diff_skips_heavy_prefix() {
        let series: Vec<f64> = (1..=50).map(f64::from).collect();
        let out = frac_diff(&series, 0.4, 0.5);
        let first = out.iter().position(|v| v.is_finite()).unwrap_or(out.len());
        assert!(first > 0 && first < 50);
    }
}
