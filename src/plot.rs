//! Scatter and fitted-curve rendering. A pure reporting sink: nothing here
//! feeds back into the pipeline.

use std::path::Path;

use plotters::prelude::*;

use crate::error::{Error, Result};

/// One scatter group (a factor level) with its points.
#[derive(Debug, Clone)]
pub struct PointGroup {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

/// A fitted curve evaluated on a covariate grid. Emphasized curves are the
/// population-level fits; thin curves are per-animal conditional fits.
#[derive(Debug, Clone)]
pub struct FitCurve {
    pub label: String,
    pub points: Vec<(f64, f64)>,
    pub emphasized: bool,
    /// Palette slot shared with the scatter group this curve belongs to, so
    /// a population fit and its conditional curves all render in the group's
    /// color.
    pub color_index: usize,
}

const COLORS: [RGBColor; 6] = [BLUE, RED, GREEN, MAGENTA, CYAN, BLACK];

fn color_for(index: usize) -> RGBColor {
    COLORS[index % COLORS.len()]
}

fn bounds(groups: &[PointGroup], curves: &[FitCurve]) -> ((f64, f64), (f64, f64)) {
    let mut x = (f64::INFINITY, f64::NEG_INFINITY);
    let mut y = (f64::INFINITY, f64::NEG_INFINITY);
    let all = groups
        .iter()
        .flat_map(|g| g.points.iter())
        .chain(curves.iter().flat_map(|c| c.points.iter()));
    for (px, py) in all {
        x = (x.0.min(*px), x.1.max(*px));
        y = (y.0.min(*py), y.1.max(*py));
    }
    if !x.0.is_finite() {
        x = (0.0, 1.0);
        y = (0.0, 1.0);
    }
    let pad = |(lo, hi): (f64, f64)| {
        let span = (hi - lo).max(1e-6);
        (lo - 0.05 * span, hi + 0.05 * span)
    };
    (pad(x), pad(y))
}

/// Render raw data colored by factor level with fitted-curve overlays.
pub fn scatter_with_fit(
    path: &Path,
    title: &str,
    x_label: &str,
    y_label: &str,
    groups: &[PointGroup],
    curves: &[FitCurve],
) -> Result<()> {
    let ((x_min, x_max), (y_min, y_max)) = bounds(groups, curves);
    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| Error::Plot(e.to_string()))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(12)
        .x_label_area_size(46)
        .y_label_area_size(64)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(|e| Error::Plot(e.to_string()))?;

    chart
        .configure_mesh()
        .x_desc(x_label)
        .y_desc(y_label)
        .draw()
        .map_err(|e| Error::Plot(e.to_string()))?;

    for (i, group) in groups.iter().enumerate() {
        let color = color_for(i);
        chart
            .draw_series(
                group
                    .points
                    .iter()
                    .map(|(x, y)| Circle::new((*x, *y), 4, color.mix(0.6).filled())),
            )
            .map_err(|e| Error::Plot(e.to_string()))?
            .label(group.label.clone())
            .legend(move |(x, y)| Circle::new((x + 10, y), 4, color.filled()));
    }

    for curve in curves {
        let color = color_for(curve.color_index);
        let style = if curve.emphasized {
            color.stroke_width(3)
        } else {
            color.mix(0.3).stroke_width(1)
        };
        let series = chart
            .draw_series(LineSeries::new(curve.points.iter().copied(), style))
            .map_err(|e| Error::Plot(e.to_string()))?;
        if curve.emphasized {
            series
                .label(curve.label.clone())
                .legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(3))
                });
        }
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(|e| Error::Plot(e.to_string()))?;

    root.present().map_err(|e| Error::Plot(e.to_string()))?;
    Ok(())
}

/// Regular grid over a covariate range, inclusive of both ends.
pub fn covariate_grid(min: f64, max: f64, steps: usize) -> Vec<f64> {
    let steps = steps.max(2);
    let span = max - min;
    (0..steps)
        .map(|i| min + span * i as f64 / (steps - 1) as f64)
        .collect()
}
