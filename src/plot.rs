//! PNG charts for the backtests and attention maps.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::evaluation::{cumulative_curve, QuintileBacktest, ThresholdBacktest, TimingBacktest};

type Area<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

/// Named line on a chart.
pub type Series = (String, Vec<f64>);

const FONT: &str = "sans-serif";

fn series(label: &str, values: Vec<f64>) -> Series {
    (label.to_string(), values)
}

/// `out.png` -> `out_ori.png`
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_else(|| "png".into());
    path.with_file_name(format!("{stem}{suffix}.{ext}"))
}

fn prepare(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Values to draw on a log2 axis: the exponent, with non-positive levels
/// clamped to a tiny positive value.
pub fn to_log2(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| v.max(1e-12).log2()).collect()
}

fn bounds(lines: &[Series]) -> (f64, f64) {
    let (lo, hi) = lines
        .iter()
        .flat_map(|(_, v)| v.iter().copied())
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let pad = if hi > lo { (hi - lo) * 0.05 } else { 0.5 };
    (lo - pad, hi + pad)
}

/// Draws `lines` into `area`. With `log2` the y-axis is logarithmic in base
/// two and ticks show the untransformed levels.
fn draw_lines(area: &Area, title: &str, lines: &[Series], log2: bool, y_range: Option<(f64, f64)>) -> Result<()> {
    let lines: Vec<Series> = if log2 {
        lines.iter().map(|(l, v)| (l.clone(), to_log2(v))).collect()
    } else {
        lines.to_vec()
    };
    let len = lines.iter().map(|(_, v)| v.len()).max().unwrap_or(0).max(2);
    let (lo, hi) = y_range.unwrap_or_else(|| bounds(&lines));

    let mut chart = ChartBuilder::on(area)
        .caption(title, (FONT, 18))
        .margin(8)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(0..len, lo..hi)?;
    let formatter = |v: &f64| {
        if log2 {
            format!("{:.2}", v.exp2())
        } else {
            format!("{v:.2}")
        }
    };
    chart.configure_mesh().y_label_formatter(&formatter).draw()?;

    for (i, (label, values)) in lines.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(LineSeries::new(
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| v.is_finite())
                    .map(|(t, v)| (t, *v)),
                color.stroke_width(2),
            ))?
            .label(label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    Ok(())
}

/// A single multi-series line chart.
pub fn plot_lines(path: impl AsRef<Path>, title: &str, lines: &[Series], log2: bool) -> Result<PathBuf> {
    let path = path.as_ref();
    prepare(path)?;
    let root = BitMapBackend::new(path, (1200, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    draw_lines(&root, title, lines, log2, None)?;
    root.present()?;
    tracing::info!(path = %path.display(), "figure saved");
    Ok(path.to_path_buf())
}

fn tile_lines(tiles: &[Vec<f64>], suffix: &str) -> Vec<Series> {
    tiles
        .iter()
        .enumerate()
        .map(|(i, t)| (format!("q{}{suffix}", i + 1), cumulative_curve(t)))
        .collect()
}

/// Equal-weighted (top row) and cap-weighted (bottom row) quintile curves.
/// The left panels show the long-short books, the right ones every tile on
/// a log2 axis.
pub fn plot_quintile(path: impl AsRef<Path>, title: &str, bt: &QuintileBacktest, ylog: bool) -> Result<PathBuf> {
    let path = path.as_ref();
    prepare(path)?;
    let root = BitMapBackend::new(path, (1600, 1000)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.titled(title, (FONT, 24))?;
    let panels = root.split_evenly((2, 2));

    let last = bt.n_tile - 1;
    let top = cumulative_curve(&bt.tiles[0]);
    let bottom = cumulative_curve(&bt.tiles[last]);
    let equal_books = vec![
        series("true_y", cumulative_curve(&bt.universe)),
        series("long-short", cumulative_curve(&bt.long_short())),
        series("long-short2", cumulative_curve(&bt.long_short2())),
        series("long", top),
        series("short", bottom),
    ];
    let mut equal_tiles = vec![series("true_y", cumulative_curve(&bt.universe))];
    equal_tiles.extend(tile_lines(&bt.tiles, ""));

    let cap_books = vec![
        series("true_y(mw)", cumulative_curve(&bt.universe_mw)),
        series("long-short", cumulative_curve(&bt.long_short_mw())),
        series("long-short2", cumulative_curve(&bt.long_short2_mw())),
        series("long", cumulative_curve(&bt.tiles_mw[0])),
        series("short", cumulative_curve(&bt.tiles_mw[last])),
    ];
    let mut cap_tiles = vec![series("true_y(mw)", cumulative_curve(&bt.universe_mw))];
    cap_tiles.extend(tile_lines(&bt.tiles_mw, ""));

    draw_lines(&panels[0], "equal weight", &equal_books, ylog, None)?;
    draw_lines(&panels[1], "equal weight tiles", &equal_tiles, true, None)?;
    draw_lines(&panels[2], "cap weight", &cap_books, ylog, None)?;
    draw_lines(&panels[3], "cap weight tiles", &cap_tiles, true, None)?;
    root.present()?;
    tracing::info!(path = %path.display(), "figure saved");
    Ok(path.to_path_buf())
}

/// Writes the main quintile figure and, when given, the `_ori` and `_cap`
/// variants next to it.
pub fn plot_quintile_variants(
    path: impl AsRef<Path>,
    title: &str,
    main: &QuintileBacktest,
    ori: Option<&QuintileBacktest>,
    cap: Option<&QuintileBacktest>,
    ylog: bool,
) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let mut written = vec![plot_quintile(path, title, main, ylog)?];
    if let Some(bt) = ori {
        written.push(plot_quintile(with_suffix(path, "_ori"), title, bt, ylog)?);
    }
    if let Some(bt) = cap {
        written.push(plot_quintile(with_suffix(path, "_cap"), title, bt, ylog)?);
    }
    Ok(written)
}

/// Long/short books, weight-adjusted books, quintiles and the long weight,
/// stacked top to bottom.
pub fn plot_threshold(path: impl AsRef<Path>, title: &str, bt: &ThresholdBacktest, ylog: bool) -> Result<PathBuf> {
    let path = path.as_ref();
    prepare(path)?;
    let root = BitMapBackend::new(path, (1200, 1600)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.titled(title, (FONT, 24))?;
    let panels = root.split_evenly((4, 1));

    let true_y = series("true_y", cumulative_curve(&bt.universe));
    let books = vec![
        true_y.clone(),
        series("long-short", cumulative_curve(&bt.long_short())),
        series("long", cumulative_curve(&bt.long)),
        series("short", cumulative_curve(&bt.short)),
    ];
    let adjusted = vec![
        true_y.clone(),
        series("long-short(adj)", cumulative_curve(&bt.long_short_adj())),
        series("long(adj)", cumulative_curve(&bt.long_adj)),
        series("short(adj)", cumulative_curve(&bt.short_adj)),
    ];
    let mut tiles = vec![true_y];
    tiles.extend(tile_lines(&bt.quintiles.tiles, ""));
    let weight = vec![series("long_wgt", bt.long_weight.clone())];

    draw_lines(&panels[0], "threshold books", &books, ylog, None)?;
    draw_lines(&panels[1], "weight adjusted", &adjusted, ylog, None)?;
    draw_lines(&panels[2], "quintiles", &tiles, true, None)?;
    draw_lines(&panels[3], "long weight", &weight, false, Some((0.0, 1.0)))?;
    root.present()?;
    tracing::info!(path = %path.display(), "figure saved");
    Ok(path.to_path_buf())
}

pub fn plot_timing(path: impl AsRef<Path>, title: &str, bt: &TimingBacktest) -> Result<PathBuf> {
    let lines: Vec<Series> = bt.curves().into_iter().map(|(l, v)| series(l, v)).collect();
    plot_lines(path, title, &lines, false)
}

/// Heatmap of an attention map, queries down and keys across.
pub fn plot_attention(path: impl AsRef<Path>, map: &[Vec<f32>]) -> Result<PathBuf> {
    let path = path.as_ref();
    prepare(path)?;
    let rows = map.len().max(1);
    let cols = map.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let peak = map
        .iter()
        .flatten()
        .fold(f32::MIN_POSITIVE, |a, &b| a.max(b));

    let root = BitMapBackend::new(path, (800, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("encoder attention", (FONT, 24))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(0..cols, 0..rows)?;
    chart.configure_mesh().disable_mesh().x_desc("key").y_desc("query").draw()?;
    chart.draw_series(map.iter().enumerate().flat_map(|(q, row)| {
        row.iter().enumerate().map(move |(k, &w)| {
            let shade = f64::from(w / peak).clamp(0.0, 1.0);
            let color = HSLColor(0.6, 0.8, 1.0 - 0.7 * shade);
            Rectangle::new([(k, rows - 1 - q), (k + 1, rows - q)], color.filled())
        })
    }))?;
    root.present()?;
    tracing::info!(path = %path.display(), "figure saved");
    Ok(path.to_path_buf())
}
