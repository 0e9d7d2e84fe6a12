//! Log-linear trend curves per segment.
//!
//! Yield-vs-maturity curves are concave, so each segment is fitted as
//!
//! ```text
//! yield = m * ln(x) + b
//! ```
//!
//! with ordinary least squares on `(ln x, yield)`. The trend is emitted once per
//! distinct X observed in the filtered input, so instruments sharing an X do not
//! stack duplicate points on the chart.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::instrument::InstrumentSnapshot;
use crate::segments::{CurveSegmentGroup, DomainWindow, SegmentFilter, XAxis};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendPoint {
    pub x: f64,
    pub fitted_y: f64,
}

/// Fitted `yield = slope * ln(x) + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendLine {
    pub slope: f64,
    pub intercept: f64,
    pub n: usize,
}

impl TrendLine {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x.ln() + self.intercept
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DegenerateFit {
    #[error("need at least 2 usable points, got {0}")]
    TooFewPoints(usize),
    #[error("all X values are equal")]
    ZeroVariance,
}

/// Fit the trend for `segment_filter` over `records` using `x_axis`.
///
/// Returns an empty vector when no trend is available.
pub fn fit(
    records: &[InstrumentSnapshot],
    segment_filter: &SegmentFilter,
    x_axis: XAxis,
) -> Vec<TrendPoint> {
    fit_in_window(records, segment_filter, x_axis, &DomainWindow::unbounded())
}

pub fn fit_in_window(
    records: &[InstrumentSnapshot],
    segment_filter: &SegmentFilter,
    x_axis: XAxis,
    window: &DomainWindow,
) -> Vec<TrendPoint> {
    let filtered: Vec<&InstrumentSnapshot> = records
        .iter()
        .filter(|record| segment_filter.matches(record) && window.admits(record, x_axis))
        .collect();

    let observations: Vec<(f64, f64)> = filtered
        .iter()
        .filter_map(|record| record.curve_coordinates(x_axis))
        .collect();

    let line = match fit_line(&observations) {
        Ok(line) => line,
        Err(reason) => {
            debug!(
                component = "curve",
                event = "curve.fit.degenerate",
                filter = ?segment_filter,
                x_axis = ?x_axis,
                reason = %reason
            );
            return Vec::new();
        }
    };

    distinct_positive_x(filtered.iter().filter_map(|record| record.x_value(x_axis)))
        .into_iter()
        .map(|x| TrendPoint {
            x,
            fitted_y: line.eval(x),
        })
        .collect()
}

/// OLS of `y` on `ln(x)` over raw `(x, y)` observations.
///
/// Callers must pass only finite `y` and finite, strictly positive `x`.
pub fn fit_line(observations: &[(f64, f64)]) -> Result<TrendLine, DegenerateFit> {
    let n = observations.len();
    if n < 2 {
        return Err(DegenerateFit::TooFewPoints(n));
    }

    let first_x = observations[0].0;
    if observations.iter().all(|(x, _)| *x == first_x) {
        return Err(DegenerateFit::ZeroVariance);
    }

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for &(x, y) in observations {
        let lx = x.ln();
        sum_x += lx;
        sum_y += y;
        sum_xy += lx * y;
        sum_xx += lx * lx;
    }

    let nf = n as f64;
    let denom = nf * sum_xx - sum_x * sum_x;
    if !denom.is_finite() || denom.abs() <= f64::EPSILON * nf * sum_xx.abs() {
        return Err(DegenerateFit::ZeroVariance);
    }

    let slope = (nf * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / nf;
    if !(slope.is_finite() && intercept.is_finite()) {
        return Err(DegenerateFit::ZeroVariance);
    }

    Ok(TrendLine {
        slope,
        intercept,
        n,
    })
}

fn distinct_positive_x(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut xs: Vec<f64> = values.filter(|x| x.is_finite() && *x > 0.0).collect();
    xs.sort_by(f64::total_cmp);
    xs.dedup();
    xs
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurveObservation {
    pub ticker: String,
    pub x: f64,
    pub y: f64,
}

/// Everything a chart needs to draw one segment group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentCurve {
    pub group: String,
    pub x_axis: XAxis,
    pub observations: Vec<CurveObservation>,
    pub trend: Vec<TrendPoint>,
    pub line: Option<TrendLine>,
}

pub fn segment_curve(
    records: &[InstrumentSnapshot],
    group: &CurveSegmentGroup,
    window: &DomainWindow,
) -> SegmentCurve {
    let filter = group.filter();
    let mut observations: Vec<CurveObservation> = records
        .iter()
        .filter(|record| filter.matches(record) && window.admits(record, group.x_axis))
        .filter_map(|record| {
            record
                .curve_coordinates(group.x_axis)
                .map(|(x, y)| CurveObservation {
                    ticker: record.ticker.clone(),
                    x,
                    y,
                })
        })
        .collect();
    observations.sort_by(|a, b| a.x.total_cmp(&b.x).then_with(|| a.ticker.cmp(&b.ticker)));

    let pairs: Vec<(f64, f64)> = observations.iter().map(|obs| (obs.x, obs.y)).collect();
    let line = fit_line(&pairs).ok();
    let trend = fit_in_window(records, &filter, group.x_axis, window);

    SegmentCurve {
        group: group.name.clone(),
        x_axis: group.x_axis,
        observations,
        trend,
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_line_recovers_exact_log_line() {
        let obs: Vec<(f64, f64)> = [1.0_f64, 2.0, 5.0, 10.0]
            .iter()
            .map(|&x| (x, 0.5 * x.ln() - 0.25))
            .collect();
        let line = fit_line(&obs).unwrap();
        assert!((line.slope - 0.5).abs() < 1e-12);
        assert!((line.intercept + 0.25).abs() < 1e-12);
        assert_eq!(line.n, 4);
    }

    #[test]
    fn fit_line_rejects_degenerate_input() {
        assert_eq!(fit_line(&[]), Err(DegenerateFit::TooFewPoints(0)));
        assert_eq!(fit_line(&[(3.0, 0.1)]), Err(DegenerateFit::TooFewPoints(1)));
        assert_eq!(
            fit_line(&[(30.0, 0.1), (30.0, 0.2), (30.0, 0.3)]),
            Err(DegenerateFit::ZeroVariance)
        );
    }

    #[test]
    fn distinct_x_sorted_and_deduplicated() {
        let xs = distinct_positive_x([90.0, 30.0, 90.0, -5.0, 0.0, f64::NAN, 200.0].into_iter());
        assert_eq!(xs, vec![30.0, 90.0, 200.0]);
    }
}
