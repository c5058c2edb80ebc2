//! # Climatology & Anomalies
//!
//! A climatology is the ensemble mean forecast averaged over all
//! initializations inside a year window, grouped by the calendar month of
//! initialization. Months without any initialization in the window are
//! absent from the result rather than filled with zeros.
//!
//! Daily climatologies are noisy, so they are smoothed along `lead` with a
//! cyclic moving average ([`smooth_cyclic`]).

use crate::calendar::{month_of, year_of};
use crate::dataset::{Dataset, DatasetError, Variable};
use log::{debug, warn};
use ndarray::{ArrayD, Axis, Zip};
use thiserror::Error;

/// Half-width of the smoothing window, in lead steps.
pub const SMOOTH_WINDOW: usize = 5;

/// Number of smoothing passes.
pub const SMOOTH_PASSES: usize = 2;

/// Lead length from which a climatology is always treated as daily.
pub const DAILY_LEAD_THRESHOLD: usize = 365;

/// Errors that can occur while building climatologies or anomalies
#[derive(Error, Debug)]
pub enum ClimatologyError {
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("No initializations between {0} and {1}")]
    EmptyWindow(i32, i32),

    #[error("Variable '{0}' has no '{1}' dimension")]
    MissingDimension(String, String),

    #[error("Climatology of '{0}' does not broadcast against the forecast")]
    ShapeMismatch(String),
}

pub type ClimatologyResult<T> = Result<T, ClimatologyError>;

/// Whether a climatology over `lead_len` steps in `domain` should be smoothed.
pub fn needs_smoothing(domain: &str, lead_len: usize) -> bool {
    domain.contains("daily") || lead_len >= DAILY_LEAD_THRESHOLD
}

/// Centered moving mean of width `2 * window + 1` on a periodic series.
///
/// The series is padded with its last and first `window` values before
/// averaging, so the ends see the opposite end as neighbours. NaN values are
/// skipped; a window with no finite values yields NaN.
fn smooth_lane(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let pad = window.min(n);
    let mut padded = Vec::with_capacity(n + 2 * pad);
    padded.extend_from_slice(&values[n - pad..]);
    padded.extend_from_slice(values);
    padded.extend_from_slice(&values[..pad]);

    (0..n)
        .map(|i| {
            let center = i + pad;
            let lo = center.saturating_sub(window);
            let hi = (center + window + 1).min(padded.len());
            let (sum, count) = padded[lo..hi]
                .iter()
                .filter(|x| !x.is_nan())
                .fold((0.0, 0usize), |(s, c), x| (s + x, c + 1));
            if count == 0 { f64::NAN } else { sum / count as f64 }
        })
        .collect()
}

/// Applies [`SMOOTH_PASSES`] passes of the cyclic moving mean along `axis`.
pub fn smooth_cyclic(data: &ArrayD<f64>, axis: Axis, window: usize, passes: usize) -> ArrayD<f64> {
    let mut out = data.clone();
    for _ in 0..passes {
        for mut lane in out.lanes_mut(axis) {
            let values: Vec<f64> = lane.iter().copied().collect();
            for (dst, src) in lane.iter_mut().zip(smooth_lane(&values, window)) {
                *dst = src;
            }
        }
    }
    out
}

/// Computes the monthly climatology of `var` from an ensemble-mean dataset
/// with an `init` dimension.
///
/// The result has `var` with a leading `month` dimension (one entry per
/// month present in the window, ascending) followed by the remaining
/// non-`init` dimensions.
pub fn climatology(
    ensmean: &Dataset,
    var: &str,
    first_year: i32,
    last_year: i32,
    smooth: bool,
) -> ClimatologyResult<Dataset> {
    let inits = ensmean
        .coord_values("init")
        .ok_or_else(|| ClimatologyError::MissingDimension(var.to_string(), "init".to_string()))?;
    let selected = ensmean.select(&[var])?;

    let mut months: Vec<Dataset> = Vec::new();
    let mut any = false;
    for month in 1..=12u32 {
        let indices: Vec<usize> = inits
            .iter()
            .enumerate()
            .filter(|&(_, &t)| {
                year_of(t).is_some_and(|y| (first_year..=last_year).contains(&y)) && month_of(t) == Some(month)
            })
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            continue;
        }
        any = true;
        debug!("Climatology month {:02}: {} initializations", month, indices.len());
        let mut mean = selected.take("init", &indices)?.mean_over("init")?;
        mean.add_coord("month", Variable::scalar(month as f64))?;
        months.push(mean);
    }
    if !any {
        return Err(ClimatologyError::EmptyWindow(first_year, last_year));
    }

    let mut clim = Dataset::concat(&months, "month")?;
    clim.set_unlimited(None);
    if smooth {
        let variable = clim
            .data_var_mut(var)
            .ok_or_else(|| DatasetError::VariableNotFound(var.to_string()))?;
        let axis = variable
            .axis("lead")
            .ok_or_else(|| ClimatologyError::MissingDimension(var.to_string(), "lead".to_string()))?;
        debug!("Smoothing daily climatology of {}", var);
        variable.data = smooth_cyclic(&variable.data, Axis(axis), SMOOTH_WINDOW, SMOOTH_PASSES);
    }
    Ok(clim)
}

/// Calendar months present in a climatology.
pub fn climatology_months(clim: &Dataset) -> Vec<u32> {
    clim.coord_values("month")
        .unwrap_or_default()
        .into_iter()
        .map(|m| m as u32)
        .collect()
}

/// The climatology of `var` for one calendar month, without the `month`
/// dimension. `None` when the month is absent.
pub fn month_slice(clim: &Dataset, var: &str, month: u32) -> Option<ArrayD<f64>> {
    let pos = climatology_months(clim).iter().position(|&m| m == month)?;
    let variable = clim.data_var(var)?;
    let axis = variable.axis("month")?;
    Some(variable.data.index_axis(Axis(axis), pos).to_owned())
}

/// Subtracts `clim` from every element of `target`, broadcasting over
/// leading dimensions.
pub fn subtract_broadcast(target: &mut ArrayD<f64>, clim: &ArrayD<f64>) -> bool {
    match clim.broadcast(target.raw_dim()) {
        Some(b) => {
            Zip::from(target).and(&b).for_each(|x, &c| *x -= c);
            true
        }
        None => false,
    }
}

/// Anomaly of `var` with respect to `clim`, matched by the month of each
/// initialization.
///
/// Initializations whose month is missing from the climatology get NaN
/// anomalies and a warning. The returned variable has the same dimensions
/// as `var` in `forecast`.
pub fn anomaly(forecast: &Dataset, var: &str, clim: &Dataset) -> ClimatologyResult<Variable> {
    let source = forecast.require(var)?;
    let axis = source
        .axis("init")
        .ok_or_else(|| ClimatologyError::MissingDimension(var.to_string(), "init".to_string()))?;
    let inits = forecast
        .coord_values("init")
        .ok_or_else(|| ClimatologyError::MissingDimension(var.to_string(), "init".to_string()))?;

    let mut anom = source.clone();
    anom.attrs.clear();
    if let Some(units) = source.attrs.get("units") {
        anom.attrs.insert("units".to_string(), units.clone());
    }
    for (i, &init) in inits.iter().enumerate() {
        let mut slab = anom.data.index_axis_mut(Axis(axis), i);
        let month = month_of(init);
        match month.and_then(|m| month_slice(clim, var, m)) {
            Some(c) => {
                let mut owned = slab.to_owned();
                if !subtract_broadcast(&mut owned, &c) {
                    return Err(ClimatologyError::ShapeMismatch(var.to_string()));
                }
                slab.assign(&owned);
            }
            None => {
                warn!(
                    "Climatology not found for month {}. Setting anomalies to NaN",
                    month.map(|m| m.to_string()).unwrap_or_else(|| "?".to_string())
                );
                slab.fill(f64::NAN);
            }
        }
    }
    Ok(anom)
}

/// Month of each initialization, for the `month` coordinate along `init`.
pub fn init_months(forecast: &Dataset) -> Option<Variable> {
    let inits = forecast.coord_values("init")?;
    let months = inits
        .iter()
        .map(|&t| month_of(t).map(|m| m as f64).unwrap_or(f64::NAN))
        .collect();
    Some(Variable::from_vec("init", months))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{date_to_days, init_date};
    use ndarray::{ArrayD, IxDyn};

    fn days(year: i32, month: u32) -> f64 {
        date_to_days(init_date(year, month).unwrap())
    }

    fn forecast(inits: &[(i32, u32)], nlead: usize) -> Dataset {
        let mut ds = Dataset::new();
        let values: Vec<f64> = inits
            .iter()
            .flat_map(|&(y, m)| (0..nlead).map(move |l| (y - 2000) as f64 * 10.0 + m as f64 + l as f64))
            .collect();
        ds.add_data_var(
            "tos",
            Variable::new(&["init", "lead"], ArrayD::from_shape_vec(IxDyn(&[inits.len(), nlead]), values).unwrap()),
        )
        .unwrap();
        ds.add_coord(
            "init",
            Variable::from_vec("init", inits.iter().map(|&(y, m)| days(y, m)).collect()),
        )
        .unwrap();
        ds.add_coord("lead", Variable::from_vec("lead", (0..nlead).map(|l| l as f64).collect()))
            .unwrap();
        ds
    }

    #[test]
    fn test_smooth_lane_wraps_around() {
        let mut values = vec![0.0; 20];
        values[0] = 11.0;
        let smoothed = smooth_lane(&values, SMOOTH_WINDOW);
        // The spike reaches the last 5 positions through the wrap.
        assert!((smoothed[19] - 1.0).abs() < 1e-12);
        assert!((smoothed[15] - 1.0).abs() < 1e-12);
        assert_eq!(smoothed[14], 0.0);
        assert!((smoothed[5] - 1.0).abs() < 1e-12);
        assert_eq!(smoothed[6], 0.0);
    }

    #[test]
    fn test_smooth_preserves_constant_and_skips_nan() {
        let values = vec![2.0, f64::NAN, 2.0, 2.0];
        let smoothed = smooth_lane(&values, SMOOTH_WINDOW);
        assert!(smoothed.iter().all(|&x| (x - 2.0).abs() < 1e-12));

        let data = ArrayD::from_elem(IxDyn(&[2, 30]), 7.5);
        let out = smooth_cyclic(&data, Axis(1), SMOOTH_WINDOW, SMOOTH_PASSES);
        assert!(out.iter().all(|&x| (x - 7.5).abs() < 1e-12));
    }

    #[test]
    fn test_needs_smoothing() {
        assert!(needs_smoothing("ocean_daily", 10));
        assert!(needs_smoothing("ocean_month", 365));
        assert!(!needs_smoothing("ocean_month", 12));
    }

    #[test]
    fn test_climatology_groups_by_month_within_window() {
        let ds = forecast(&[(2001, 3), (2002, 3), (2001, 6), (2010, 9)], 2);
        let clim = climatology(&ds, "tos", 2001, 2002, false).unwrap();
        assert_eq!(climatology_months(&clim), vec![3, 6]);
        let tos = clim.data_var("tos").unwrap();
        assert_eq!(tos.dims, vec!["month", "lead"]);
        // March: mean of 13 and 23 at lead 0.
        assert_eq!(tos.data[[0, 0]], 18.0);
        assert_eq!(tos.data[[1, 1]], 17.0);

        assert!(matches!(
            climatology(&ds, "tos", 1990, 1991, false),
            Err(ClimatologyError::EmptyWindow(1990, 1991))
        ));
    }

    #[test]
    fn test_anomaly_nan_for_missing_month() {
        let ds = forecast(&[(2001, 3), (2002, 3), (2010, 9)], 2);
        let clim = climatology(&ds, "tos", 2001, 2002, false).unwrap();
        let anom = anomaly(&ds, "tos", &clim).unwrap();
        assert_eq!(anom.data[[0, 0]], -5.0);
        assert_eq!(anom.data[[1, 1]], 5.0);
        assert!(anom.data[[2, 0]].is_nan() && anom.data[[2, 1]].is_nan());

        let months = init_months(&ds).unwrap();
        assert_eq!(months.values(), vec![3.0, 3.0, 9.0]);
    }

    #[test]
    fn test_anomaly_broadcasts_over_members() {
        let single = forecast(&[(2001, 1)], 3);
        let clim = climatology(&single, "tos", 2001, 2001, false).unwrap();

        let mut a = single.clone();
        a.add_coord("member", Variable::scalar(1.0)).unwrap();
        let mut b = single.clone();
        b.add_coord("member", Variable::scalar(2.0)).unwrap();
        b.data_var_mut("tos").unwrap().data.mapv_inplace(|x| x + 1.0);
        let members = Dataset::concat(&[a, b], "member").unwrap();

        let anom = anomaly(&members, "tos", &clim).unwrap();
        assert_eq!(anom.dims, vec!["member", "init", "lead"]);
        assert_eq!(anom.data[[0, 0, 2]], 0.0);
        assert_eq!(anom.data[[1, 0, 2]], 1.0);
    }

    #[test]
    fn test_every_month_present_when_initialized() {
        let inits: Vec<(i32, u32)> = (1..=12).map(|m| (2001, m)).collect();
        let clim = climatology(&forecast(&inits, 1), "tos", 2001, 2001, false).unwrap();
        assert_eq!(climatology_months(&clim), (1..=12).collect::<Vec<u32>>());
        let tos = clim.data_var("tos").unwrap();
        assert_eq!(tos.dims, vec!["month", "lead"]);
        assert_eq!(tos.data[[11, 0]], 22.0);
    }

    #[test]
    fn test_smoothed_climatology_matches_two_passes() {
        // A single spike of 121 at lead 0 over 20 leads. The first pass
        // spreads 11 over the 11 leads within 5 steps of lead 0 (wrapping);
        // the second pass yields the overlap count of two such windows.
        let mut ds = forecast(&[(2001, 7)], 20);
        let tos = ds.data_var_mut("tos").unwrap();
        tos.data.fill(0.0);
        tos.data[[0, 0]] = 121.0;

        let clim = climatology(&ds, "tos", 2001, 2001, true).unwrap();
        let smoothed = clim.data_var("tos").unwrap().values();
        let expected = [
            11.0, 10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 2.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0,
        ];
        for (lead, (got, want)) in smoothed.iter().zip(expected).enumerate() {
            assert!((got - want).abs() < 1e-9, "lead {lead}: {got} != {want}");
        }
        assert!((smoothed.iter().sum::<f64>() - 121.0).abs() < 1e-9);

        let raw = climatology(&ds, "tos", 2001, 2001, false).unwrap();
        assert_eq!(raw.data_var("tos").unwrap().data[[0, 0]], 121.0);
    }

    #[test]
    fn test_smooth_lane_shorter_than_window() {
        // Padded to [3,0,0 | 3,0,0 | 3,0,0]; every window clips to all nine values.
        let smoothed = smooth_lane(&[3.0, 0.0, 0.0], SMOOTH_WINDOW);
        assert!(smoothed.iter().all(|&x| (x - 1.0).abs() < 1e-12));
    }
}
