//! Cross-sectional and timing backtests driven by the head outputs.
use anyhow::{ensure, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::batcher::array_to_tensor;
use crate::dataset::WindowSample;
use crate::features::percentile;
use crate::heads::HeadTensors;
use crate::model::{ForecastInput, TsModel};

/// How a head output is turned into a per-asset score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EvalSignal {
    /// Probability of a positive next-horizon return.
    Pos,
    Pos20,
    /// Predicted next-horizon return.
    Ret,
    /// Predicted 20-step return over predicted 20-step volatility.
    Ir20,
    Ir60,
    Ir120,
}

impl EvalSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pos => "pos",
            Self::Pos20 => "pos20",
            Self::Ret => "ret",
            Self::Ir20 => "ir20",
            Self::Ir60 => "ir60",
            Self::Ir120 => "ir120",
        }
    }

    /// Long/short boundary for the threshold backtest.
    pub fn threshold(&self) -> f64 {
        match self {
            Self::Pos | Self::Pos20 => 0.5,
            _ => 0.0,
        }
    }

    pub fn score(&self, preds: &HeadTensors) -> candle_core::Result<Vec<f64>> {
        match self {
            Self::Pos => head_column(preds, "pos", 0),
            Self::Pos20 => head_column(preds, "pos20", 0),
            Self::Ret => head_column(preds, "ret", 0),
            Self::Ir20 => information_ratio(preds, 1, 0),
            Self::Ir60 => information_ratio(preds, 2, 1),
            Self::Ir120 => information_ratio(preds, 3, 2),
        }
    }
}

fn information_ratio(preds: &HeadTensors, ret_col: usize, std_col: usize) -> candle_core::Result<Vec<f64>> {
    let ret = head_column(preds, "ret", ret_col)?;
    let std = head_column(preds, "std", std_col)?;
    Ok(ret.iter().zip(&std).map(|(r, s)| r / s.abs()).collect())
}

/// Column `col` of the first decoder step of `head`, one value per row.
pub fn head_column(preds: &HeadTensors, head: &str, col: usize) -> candle_core::Result<Vec<f64>> {
    let Some(t) = preds.get(head) else {
        candle_core::bail!("model has no {head} head")
    };
    let values = t.narrow(1, 0, 1)?.narrow(2, col, 1)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(values.into_iter().map(f64::from).collect())
}

/// Scores and realised returns of one cross-section.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodScores {
    pub date: Option<NaiveDate>,
    pub scores: Vec<f64>,
    pub returns: Vec<f64>,
    pub caps: Option<Vec<f64>>,
}

pub fn sample_features(sample: &WindowSample, device: &candle_core::Device) -> candle_core::Result<ForecastInput> {
    Ok(ForecastInput {
        input: array_to_tensor(&sample.input, device)?,
        output: array_to_tensor(&sample.output, device)?,
    })
}

/// Runs the model over every sample and scores each cross-section.
pub fn score_periods(model: &TsModel, samples: &[WindowSample], signal: EvalSignal) -> Result<Vec<PeriodScores>> {
    score_periods_shifted(model, samples, signal, DecoderShift::Raw)
}

/// Per-asset offset added to every feature of the decoder step before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderShift {
    Raw,
    /// Cross-sectional z-score of log market cap.
    Size,
    /// Market cap as a share of the cross-section's total cap.
    Cap,
}

impl DecoderShift {
    pub fn offsets(&self, caps: &[f64]) -> Vec<f64> {
        match self {
            Self::Raw => vec![0.0; caps.len()],
            Self::Size => {
                let logs: Vec<f64> = caps.iter().map(|c| c.max(f64::MIN_POSITIVE).ln()).collect();
                let m = mean(logs.iter().copied());
                let sd = (mean(logs.iter().map(|v| (v - m).powi(2)))).sqrt();
                if sd > 0.0 {
                    logs.iter().map(|v| (v - m) / sd).collect()
                } else {
                    vec![0.0; caps.len()]
                }
            }
            Self::Cap => {
                let total: f64 = caps.iter().sum();
                if total > 0.0 {
                    caps.iter().map(|c| c / total).collect()
                } else {
                    vec![0.0; caps.len()]
                }
            }
        }
    }
}

/// Like [`score_periods`], with the decoder step shifted per asset. Shifts
/// other than `Raw` need market caps on every sample.
pub fn score_periods_shifted(
    model: &TsModel,
    samples: &[WindowSample],
    signal: EvalSignal,
    shift: DecoderShift,
) -> Result<Vec<PeriodScores>> {
    samples
        .iter()
        .map(|sample| {
            let mut features = sample_features(sample, &model.device)?;
            if shift != DecoderShift::Raw {
                let Some(caps) = sample.caps.as_deref() else {
                    anyhow::bail!("{shift:?} shift needs market caps")
                };
                let offsets: Vec<f32> = shift.offsets(caps).into_iter().map(|v| v as f32).collect();
                let offsets = candle_core::Tensor::from_vec(offsets, (caps.len(), 1, 1), &model.device)?;
                features.output = features.output.broadcast_add(&offsets)?;
            }
            let preds = model.predict_mtl(&features)?;
            Ok(PeriodScores {
                date: sample.date,
                scores: signal.score(&preds)?,
                returns: sample.realized.clone(),
                caps: sample.caps.clone(),
            })
        })
        .collect()
}

/// Quintile books for the size-adjusted decoder input, plus the raw (`ori`)
/// and cap-adjusted (`cap`) ones. Without market caps only the raw book is
/// built and it becomes `main`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuintileVariants {
    pub main: QuintileBacktest,
    pub ori: Option<QuintileBacktest>,
    pub cap: Option<QuintileBacktest>,
}

pub fn quintile_variants(
    model: &TsModel,
    samples: &[WindowSample],
    signal: EvalSignal,
    n_tile: usize,
) -> Result<QuintileVariants> {
    let raw = quintile_backtest(&score_periods(model, samples, signal)?, n_tile)?;
    if samples.is_empty() || samples.iter().any(|s| s.caps.is_none()) {
        return Ok(QuintileVariants { main: raw, ori: None, cap: None });
    }
    let run = |shift| -> Result<QuintileBacktest> {
        quintile_backtest(&score_periods_shifted(model, samples, signal, shift)?, n_tile)
    };
    Ok(QuintileVariants {
        main: run(DecoderShift::Size)?,
        ori: Some(raw),
        cap: Some(run(DecoderShift::Cap)?),
    })
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn weighted_mean(returns: &[f64], weights: &[f64], members: &[usize]) -> f64 {
    let total: f64 = members.iter().map(|&i| weights[i]).sum();
    if total <= 0.0 {
        return 0.0;
    }
    members.iter().map(|&i| returns[i] * weights[i]).sum::<f64>() / total
}

/// `cumprod(1 + r)` with a leading 1.
pub fn cumulative_curve(returns: &[f64]) -> Vec<f64> {
    let mut curve = Vec::with_capacity(returns.len() + 1);
    let mut level = 1.0;
    curve.push(level);
    for r in returns {
        level *= 1.0 + r;
        curve.push(level);
    }
    curve
}

/// `cumsum(ln(1 + r))` over the returns.
pub fn cumulative_log_curve(returns: &[f64]) -> Vec<f64> {
    returns
        .iter()
        .scan(0.0, |acc, r| {
            *acc += (1.0 + r).ln();
            Some(*acc)
        })
        .collect()
}

/// Asset indices per score tile, best tile first. The top tile includes its
/// upper bound; the others are half open.
pub fn tile_members(scores: &[f64], n_tile: usize) -> Vec<Vec<usize>> {
    (0..n_tile)
        .map(|i| {
            let low_q = 100.0 * (1.0 - (i as f64 + 1.0) / n_tile as f64);
            let high_q = 100.0 * (1.0 - i as f64 / n_tile as f64);
            let low = percentile(scores, low_q);
            let high = percentile(scores, high_q);
            scores
                .iter()
                .enumerate()
                .filter(|(_, v)| if i == 0 { **v >= low } else { **v >= low && **v < high })
                .map(|(a, _)| a)
                .collect()
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuintileBacktest {
    pub n_tile: usize,
    pub dates: Vec<Option<NaiveDate>>,
    /// Per-period returns, `[periods]` for the universe and
    /// `[n_tile][periods]` for the tiles.
    pub universe: Vec<f64>,
    pub universe_mw: Vec<f64>,
    pub tiles: Vec<Vec<f64>>,
    pub tiles_mw: Vec<Vec<f64>>,
}

impl QuintileBacktest {
    fn spread(tiles: &[Vec<f64>], width: usize) -> Vec<f64> {
        let n = tiles.len();
        let periods = tiles.first().map_or(0, Vec::len);
        (0..periods)
            .map(|t| mean(tiles[..width].iter().map(|c| c[t])) - mean(tiles[n - width..].iter().map(|c| c[t])))
            .collect()
    }

    /// Top tile minus bottom tile.
    pub fn long_short(&self) -> Vec<f64> {
        Self::spread(&self.tiles, 1)
    }

    /// Top two tiles minus bottom two.
    pub fn long_short2(&self) -> Vec<f64> {
        Self::spread(&self.tiles, 2.min(self.n_tile))
    }

    pub fn long_short_mw(&self) -> Vec<f64> {
        Self::spread(&self.tiles_mw, 1)
    }

    pub fn long_short2_mw(&self) -> Vec<f64> {
        Self::spread(&self.tiles_mw, 2.min(self.n_tile))
    }
}

/// Buckets every period's assets into `n_tile` score tiles and tracks the
/// equal- and cap-weighted return of each. Empty tiles earn zero; periods
/// without caps fall back to equal weights.
pub fn quintile_backtest(periods: &[PeriodScores], n_tile: usize) -> Result<QuintileBacktest> {
    ensure!(n_tile >= 2, "need at least two tiles, got {n_tile}");
    let mut out = QuintileBacktest {
        n_tile,
        dates: Vec::with_capacity(periods.len()),
        universe: Vec::with_capacity(periods.len()),
        universe_mw: Vec::with_capacity(periods.len()),
        tiles: vec![Vec::with_capacity(periods.len()); n_tile],
        tiles_mw: vec![Vec::with_capacity(periods.len()); n_tile],
    };
    for period in periods {
        ensure!(
            period.scores.len() == period.returns.len(),
            "period has {} scores for {} returns",
            period.scores.len(),
            period.returns.len()
        );
        let equal = vec![1.0; period.returns.len()];
        let weights = period.caps.as_deref().unwrap_or(&equal);
        ensure!(weights.len() == equal.len(), "period has {} caps for {} assets", weights.len(), equal.len());
        let everyone: Vec<usize> = (0..period.returns.len()).collect();

        out.dates.push(period.date);
        out.universe.push(mean(period.returns.iter().copied()));
        out.universe_mw.push(weighted_mean(&period.returns, weights, &everyone));
        for (i, members) in tile_members(&period.scores, n_tile).iter().enumerate() {
            out.tiles[i].push(mean(members.iter().map(|&a| period.returns[a])));
            out.tiles_mw[i].push(weighted_mean(&period.returns, weights, members));
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdBacktest {
    pub crit: f64,
    pub universe: Vec<f64>,
    /// Mean return of assets scored above / below `crit`.
    pub long: Vec<f64>,
    pub short: Vec<f64>,
    /// Share of the universe held long / short.
    pub long_weight: Vec<f64>,
    pub short_weight: Vec<f64>,
    /// Summed long / short returns divided by the universe size.
    pub long_adj: Vec<f64>,
    pub short_adj: Vec<f64>,
    pub quintiles: QuintileBacktest,
}

impl ThresholdBacktest {
    pub fn long_short(&self) -> Vec<f64> {
        self.long.iter().zip(&self.short).map(|(l, s)| l - s).collect()
    }

    pub fn long_short_adj(&self) -> Vec<f64> {
        self.long_adj.iter().zip(&self.short_adj).map(|(l, s)| l - s).collect()
    }
}

/// Goes long every asset scored above `crit` and short every asset below it.
pub fn threshold_backtest(periods: &[PeriodScores], crit: f64) -> Result<ThresholdBacktest> {
    let quintiles = quintile_backtest(periods, 5)?;
    let mut out = ThresholdBacktest {
        crit,
        universe: quintiles.universe.clone(),
        long: Vec::new(),
        short: Vec::new(),
        long_weight: Vec::new(),
        short_weight: Vec::new(),
        long_adj: Vec::new(),
        short_adj: Vec::new(),
        quintiles,
    };
    for period in periods {
        let n = period.returns.len().max(1) as f64;
        let side = |keep: &dyn Fn(f64) -> bool| -> (f64, f64, f64) {
            let picked: Vec<f64> = period
                .scores
                .iter()
                .zip(&period.returns)
                .filter(|(s, _)| keep(**s))
                .map(|(_, r)| *r)
                .collect();
            if picked.is_empty() {
                return (0.0, 0.0, 0.0);
            }
            let sum: f64 = picked.iter().sum();
            (sum / picked.len() as f64, picked.len() as f64 / n, sum / n)
        };
        let (l, lw, la) = side(&|s: f64| s > crit);
        let (s, sw, sa) = side(&|s: f64| s < crit);
        out.long.push(l);
        out.long_weight.push(lw);
        out.long_adj.push(la);
        out.short.push(s);
        out.short_weight.push(sw);
        out.short_adj.push(sa);
    }
    Ok(out)
}

/// One step of a single-asset timing test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingPoint {
    pub pred_ret: f64,
    /// Predicted probability of a positive return.
    pub pred_pos: f64,
    pub realized: f64,
}

/// Accuracy, recall and precision of a sign forecast for both classes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DirectionStats {
    pub accuracy: f64,
    pub recall_pos: f64,
    pub recall_neg: f64,
    pub precision_pos: f64,
    pub precision_neg: f64,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl DirectionStats {
    pub fn from_signs(pred: &[f64], real: &[f64]) -> Self {
        let count = |f: &dyn Fn(f64, f64) -> bool| pred.iter().zip(real).filter(|(p, r)| f(**p, **r)).count();
        Self {
            accuracy: ratio(count(&|p: f64, r: f64| (p > 0.0) == (r > 0.0)), pred.len()),
            recall_pos: ratio(count(&|p: f64, r: f64| p > 0.0 && r > 0.0), real.iter().filter(|r| **r > 0.0).count()),
            recall_neg: ratio(count(&|p: f64, r: f64| p < 0.0 && r < 0.0), real.iter().filter(|r| **r < 0.0).count()),
            precision_pos: ratio(count(&|p: f64, r: f64| p > 0.0 && r > 0.0), pred.iter().filter(|p| **p > 0.0).count()),
            precision_neg: ratio(count(&|p: f64, r: f64| p < 0.0 && r < 0.0), pred.iter().filter(|p| **p < 0.0).count()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingBacktest {
    /// Per-step returns of buy-and-hold and the four timing rules.
    pub true_y: Vec<f64>,
    pub pred_y: Vec<f64>,
    pub pred_pos: Vec<f64>,
    pub pred_both: Vec<f64>,
    pub pred_avg: Vec<f64>,
    pub pos_stats: DirectionStats,
    pub ret_stats: DirectionStats,
    pub n_pos: usize,
    pub n_neg: usize,
}

impl TimingBacktest {
    pub fn curves(&self) -> Vec<(&'static str, Vec<f64>)> {
        vec![
            ("true_y", cumulative_log_curve(&self.true_y)),
            ("pred_both", cumulative_log_curve(&self.pred_both)),
            ("pred_pos", cumulative_log_curve(&self.pred_pos)),
            ("pred_y", cumulative_log_curve(&self.pred_y)),
            ("pred_avg", cumulative_log_curve(&self.pred_avg)),
        ]
    }
}

/// Holds the asset only while a rule says long, paying `cost_rate` on every
/// change of position.
struct TimingRule {
    held: bool,
}

impl TimingRule {
    fn step(&mut self, long: bool, realized: f64, cost_rate: f64) -> f64 {
        let prev = if self.held { 1.0 } else { 0.0 };
        self.held = long;
        if long {
            realized - cost_rate * (1.0 - prev)
        } else {
            -cost_rate * prev
        }
    }
}

pub fn timing_backtest(points: &[TimingPoint], cost_rate: f64) -> TimingBacktest {
    let mut by_ret = TimingRule { held: false };
    let mut by_pos = TimingRule { held: false };
    let mut by_both = TimingRule { held: false };
    let mut out = TimingBacktest {
        true_y: Vec::with_capacity(points.len()),
        pred_y: Vec::with_capacity(points.len()),
        pred_pos: Vec::with_capacity(points.len()),
        pred_both: Vec::with_capacity(points.len()),
        pred_avg: Vec::with_capacity(points.len()),
        pos_stats: DirectionStats::default(),
        ret_stats: DirectionStats::default(),
        n_pos: points.iter().filter(|p| p.realized > 0.0).count(),
        n_neg: points.iter().filter(|p| p.realized < 0.0).count(),
    };
    for p in points {
        let ret_long = p.pred_ret > 0.0;
        let pos_long = p.pred_pos > 0.5;
        let y = by_ret.step(ret_long, p.realized, cost_rate);
        let pos = by_pos.step(pos_long, p.realized, cost_rate);
        out.true_y.push(p.realized);
        out.pred_y.push(y);
        out.pred_pos.push(pos);
        out.pred_both.push(by_both.step(ret_long && pos_long, p.realized, cost_rate));
        out.pred_avg.push((y + pos) / 2.0);
    }
    let real: Vec<f64> = points.iter().map(|p| p.realized).collect();
    let pos_pred: Vec<f64> = points.iter().map(|p| p.pred_pos - 0.5).collect();
    let ret_pred: Vec<f64> = points.iter().map(|p| p.pred_ret).collect();
    out.pos_stats = DirectionStats::from_signs(&pos_pred, &real);
    out.ret_stats = DirectionStats::from_signs(&ret_pred, &real);
    out
}

/// Timing inputs for one asset across consecutive samples.
pub fn timing_points(model: &TsModel, samples: &[WindowSample], asset: usize) -> Result<Vec<TimingPoint>> {
    samples
        .iter()
        .map(|sample| {
            ensure!(asset < sample.num_assets(), "asset {asset} out of range");
            let preds = model.predict_mtl(&sample_features(sample, &model.device)?)?;
            Ok(TimingPoint {
                pred_ret: head_column(&preds, "ret", 0)?[asset],
                pred_pos: head_column(&preds, "pos", 0)?[asset],
                realized: sample.realized[asset],
            })
        })
        .collect()
}

/// Summary statistics of a periodic return series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_duration: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub periods: usize,
}

impl PerformanceMetrics {
    pub fn from_returns(returns: &[f64], periods_per_year: f64) -> Result<Self> {
        ensure!(!returns.is_empty(), "insufficient data for metrics calculation");
        let curve = cumulative_curve(returns);
        let total_return = curve[curve.len() - 1] - 1.0;
        let periods = returns.len();
        let annualized_return = (1.0 + total_return).powf(periods_per_year / periods as f64) - 1.0;

        let mean_return = mean(returns.iter().copied());
        let return_std = (returns.iter().map(|r| (r - mean_return).powi(2)).sum::<f64>() / periods as f64).sqrt();
        let sharpe_ratio = if return_std > 0.0 {
            mean_return / return_std * periods_per_year.sqrt()
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = max_drawdown(&curve);
        let win_rate = ratio(returns.iter().filter(|r| **r > 0.0).count(), periods);
        let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
        let gross_loss: f64 = returns.iter().filter(|r| **r < 0.0).sum();
        let profit_factor = if gross_loss < 0.0 {
            gross_profit / gross_loss.abs()
        } else {
            f64::INFINITY
        };

        Ok(Self {
            total_return,
            annualized_return,
            sharpe_ratio,
            max_drawdown,
            max_drawdown_duration,
            win_rate,
            profit_factor,
            periods,
        })
    }
}

/// Largest peak-to-trough fall of a value curve and the number of periods
/// from that peak to the trough.
pub fn max_drawdown(values: &[f64]) -> (f64, usize) {
    let Some(&first) = values.first() else {
        return (0.0, 0);
    };
    let mut max_dd = 0.0;
    let mut max_dd_duration = 0;
    let mut peak = first;
    let mut peak_at = 0;
    for (i, &value) in values.iter().enumerate() {
        if value > peak {
            peak = value;
            peak_at = i;
        } else if peak > 0.0 {
            let dd = (peak - value) / peak;
            if dd > max_dd {
                max_dd = dd;
                max_dd_duration = i - peak_at;
            }
        }
    }
    (max_dd, max_dd_duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period(scores: &[f64], returns: &[f64]) -> PeriodScores {
        PeriodScores {
            date: None,
            scores: scores.to_vec(),
            returns: returns.to_vec(),
            caps: None,
        }
    }

    #[test]
    fn tiles_partition_the_universe() {
        let scores: Vec<f64> = (0..10).map(f64::from).collect();
        let tiles = tile_members(&scores, 5);
        assert_eq!(tiles[0], vec![8, 9]);
        assert_eq!(tiles[4], vec![0, 1]);
        let total: usize = tiles.iter().map(Vec::len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn perfect_scores_rank_tiles_in_order() -> Result<()> {
        let returns: Vec<f64> = (0..10).map(|i| f64::from(i) / 100.0).collect();
        let periods = vec![period(&returns, &returns); 3];
        let bt = quintile_backtest(&periods, 5)?;
        assert!((bt.tiles[0][0] - 0.085).abs() < 1e-12);
        assert!((bt.tiles[4][0] - 0.005).abs() < 1e-12);
        assert!(bt.long_short().iter().all(|v| (v - 0.08).abs() < 1e-12));
        assert_eq!(bt.universe_mw, bt.universe);
        let curve = cumulative_curve(&bt.long_short());
        assert_eq!(curve.len(), 4);
        assert_eq!(curve[0], 1.0);
        assert!((curve[3] - 1.08f64.powi(3)).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn cap_weighting_uses_caps() -> Result<()> {
        let mut p = period(&[1.0, 0.0], &[0.1, -0.1]);
        p.caps = Some(vec![3.0, 1.0]);
        let bt = quintile_backtest(&[p], 2)?;
        assert!((bt.universe_mw[0] - 0.05).abs() < 1e-12);
        assert!(bt.universe[0].abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn threshold_splits_long_and_short() -> Result<()> {
        let p = period(&[0.9, 0.7, 0.2, 0.1], &[0.04, 0.02, -0.01, -0.03]);
        let bt = threshold_backtest(&[p], 0.5)?;
        assert!((bt.long[0] - 0.03).abs() < 1e-12);
        assert!((bt.short[0] + 0.02).abs() < 1e-12);
        assert!((bt.long_weight[0] - 0.5).abs() < 1e-12);
        assert!((bt.long_adj[0] - 0.015).abs() < 1e-12);
        assert!((bt.long_short()[0] - 0.05).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn threshold_with_no_longs_earns_zero() -> Result<()> {
        let p = period(&[0.1, 0.2], &[0.05, 0.01]);
        let bt = threshold_backtest(&[p], 0.5)?;
        assert_eq!(bt.long[0], 0.0);
        assert_eq!(bt.long_weight[0], 0.0);
        Ok(())
    }

    #[test]
    fn timing_charges_cost_on_position_changes() {
        let points = [
            TimingPoint { pred_ret: 0.01, pred_pos: 0.7, realized: 0.02 },
            TimingPoint { pred_ret: 0.01, pred_pos: 0.7, realized: -0.01 },
            TimingPoint { pred_ret: -0.01, pred_pos: 0.3, realized: 0.03 },
        ];
        let bt = timing_backtest(&points, 0.001);
        assert!((bt.pred_y[0] - 0.019).abs() < 1e-12);
        assert!((bt.pred_y[1] + 0.01).abs() < 1e-12);
        assert!((bt.pred_y[2] + 0.001).abs() < 1e-12);
        assert_eq!(bt.n_pos, 2);
        assert!((bt.ret_stats.accuracy - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(bt.curves().len(), 5);
    }

    #[test]
    fn drawdown_and_metrics() -> Result<()> {
        let (dd, duration) = max_drawdown(&[1.0, 1.2, 0.9, 1.0, 1.3]);
        assert!((dd - 0.25).abs() < 1e-12);
        assert_eq!(duration, 1);

        let metrics = PerformanceMetrics::from_returns(&[0.1, -0.05, 0.02], 52.0)?;
        assert!((metrics.total_return - (1.1 * 0.95 * 1.02 - 1.0)).abs() < 1e-12);
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert!(PerformanceMetrics::from_returns(&[], 52.0).is_err());
        Ok(())
    }

    #[test]
    fn decoder_shift_offsets() {
        let caps = [1.0, std::f64::consts::E.powi(2)];
        assert_eq!(DecoderShift::Raw.offsets(&caps), vec![0.0, 0.0]);
        let size = DecoderShift::Size.offsets(&caps);
        assert!((size[0] + 1.0).abs() < 1e-12 && (size[1] - 1.0).abs() < 1e-12);
        let cap = DecoderShift::Cap.offsets(&[1.0, 3.0]);
        assert_eq!(cap, vec![0.25, 0.75]);
        assert_eq!(DecoderShift::Size.offsets(&[5.0, 5.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn signal_thresholds() {
        assert_eq!(EvalSignal::Pos.threshold(), 0.5);
        assert_eq!(EvalSignal::Ir20.threshold(), 0.0);
    }
}
