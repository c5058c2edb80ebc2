//! # Logistic Regression Coefficients
//!
//! Fits, independently at every grid point, a three-parameter logistic
//! model for the probability that an observed value exceeds a forecast
//! quantile:
//!
//! ```text
//! P(exceed) = 1 / (1 + exp(-(b0 + b1 * x + b2 * q)))
//! ```
//!
//! where `x` is the ensemble-mean forecast for an initialization and `q` the
//! quantile value. Fitting is maximum likelihood by Newton-Raphson, started
//! from zero coefficients. Grid points are independent and are fitted in
//! parallel.
//!
//! Coefficients are fitted separately for every calendar month of
//! initialization and every lead. The outcomes come from gridded
//! observations on the forecast grid: per-month quantiles of the
//! observations are computed once ([`observed_quantiles`]), each observation
//! is marked as exceeding its month's quantiles or not, and every forecast
//! (init, lead) is matched with the observation of the month it verifies
//! ([`regression_inputs`]).

use crate::calendar::{add_months, days_to_date, month_of, to_epoch_days, year_of};
use crate::dataset::{Dataset, DatasetError, Variable};
use chrono::Datelike;
use log::{debug, info};
use ndarray::{
    Array2, Array4, Array5, ArrayD, ArrayView3, ArrayView4, ArrayView5, Axis, Ix3, Ix4, Ix5, s,
};
use rayon::prelude::*;
use thiserror::Error;

/// Convergence tolerance on the summed absolute coefficient update.
pub const DEFAULT_TOL: f64 = 1e-5;

/// Newton iterations before a fit is declared non-convergent.
pub const DEFAULT_MAX_ITER: usize = 50;

/// Names of the fitted coefficient variables.
pub const COEFFICIENT_NAMES: [&str; 3] = ["intercept", "b1", "b2"];

/// Quantile levels of the observations used as exceedance thresholds.
pub const DEFAULT_QUANTILES: [f64; 5] = [0.1, 0.33, 0.5, 0.67, 0.9];

/// Ensemble-mean predictor in a prepared input dataset.
pub const PREDICTOR: &str = "ensmean";

/// Observed quantile matched to each forecast, in a prepared input dataset.
pub const QUANTILE_VALUE: &str = "quantile_value";

/// 0/1 exceedance outcome matched to each forecast, in a prepared input dataset.
pub const EXCEEDED: &str = "exceeded";

/// File caching the observed quantiles of `var`.
pub fn quantiles_file_name(var: &str) -> String {
    format!("logreg_quantiles_obs_{}.nc", var)
}

/// File holding the fitted coefficients of forecast variable `var`.
pub fn coefficients_file_name(var: &str) -> String {
    format!("logreg_coefs_forecast_{}.nc", var)
}

/// Errors that can occur while fitting coefficients
#[derive(Error, Debug)]
pub enum LogRegError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("No observation verifies {0}")]
    MissingObservation(String),

    #[error("Observed quantiles have no entry for month {0}")]
    MissingMonth(u32),

    #[error("Cannot decode times of '{0}'")]
    InvalidTime(String),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),
}

/// Result type for coefficient fitting
pub type LogRegResult<T> = Result<T, LogRegError>;

/// Coefficient grids over the horizontal dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    pub intercept: Array2<f64>,
    pub b1: Array2<f64>,
    pub b2: Array2<f64>,
}

/// Coefficient grids shaped `[month, lead, y, x]`, one entry per calendar
/// month of initialization present in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthLeadCoefficients {
    pub months: Vec<u32>,
    pub intercept: Array4<f64>,
    pub b1: Array4<f64>,
    pub b2: Array4<f64>,
}

type Matrix3 = [[f64; 3]; 3];

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn norm1(m: &Matrix3) -> f64 {
    (0..3)
        .map(|j| (0..3).map(|i| m[i][j].abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Inverse of a 3x3 matrix by cofactors, or `None` when the matrix is
/// singular or too ill-conditioned to invert reliably.
fn invert(m: &Matrix3) -> Option<Matrix3> {
    let cof = |r0: usize, r1: usize, c0: usize, c1: usize| m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0];
    let adj = [
        [cof(1, 2, 1, 2), -cof(0, 2, 1, 2), cof(0, 1, 1, 2)],
        [-cof(1, 2, 0, 2), cof(0, 2, 0, 2), -cof(0, 1, 0, 2)],
        [cof(1, 2, 0, 1), -cof(0, 2, 0, 1), cof(0, 1, 0, 1)],
    ];
    let det = m[0][0] * adj[0][0] + m[0][1] * adj[1][0] + m[0][2] * adj[2][0];
    if det == 0.0 || !det.is_finite() {
        return None;
    }
    let mut inv = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            inv[i][j] = adj[i][j] / det;
        }
    }
    let cond = norm1(m) * norm1(&inv);
    if cond < 1.0 / f64::EPSILON { Some(inv) } else { None }
}

/// Maximum-likelihood coefficients for rows `[1, x, q]` of `features` and
/// 0/1 `outcomes`.
///
/// Iteration stops when the summed absolute update falls below `tol`, when
/// the Hessian becomes singular, or after `max_iter` steps. Only the first
/// of these counts as convergence; otherwise every coefficient is NaN.
pub fn logreg_mle(features: &[[f64; 3]], outcomes: &[f64], tol: f64, max_iter: usize) -> [f64; 3] {
    let mut w = [0.0; 3];
    for _ in 0..max_iter {
        let mut grad = [0.0; 3];
        let mut info = [[0.0; 3]; 3];
        for (row, &y) in features.iter().zip(outcomes) {
            let s = sigmoid(row[0] * w[0] + row[1] * w[1] + row[2] * w[2]);
            let v = s * (1.0 - s);
            for i in 0..3 {
                grad[i] += row[i] * (y - s);
                for j in 0..3 {
                    info[i][j] += row[i] * v * row[j];
                }
            }
        }
        let Some(inv) = invert(&info) else {
            break;
        };
        let mut change = 0.0;
        for i in 0..3 {
            let step: f64 = (0..3).map(|j| inv[i][j] * grad[j]).sum();
            w[i] += step;
            change += step.abs();
        }
        if change < tol {
            return w;
        }
    }
    [f64::NAN; 3]
}

/// Fits one grid point, or returns NaN when its predictors are not all
/// finite or its outcomes do not contain both classes.
fn fit_point(x: &[f64], q: &Array2<f64>, outcome: &Array2<f64>) -> [f64; 3] {
    if x.iter().any(|v| !v.is_finite()) {
        return [f64::NAN; 3];
    }
    let (min, max) = outcome
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !(min < 1.0 && max > 0.0) {
        return [f64::NAN; 3];
    }
    let features: Vec<[f64; 3]> = q
        .indexed_iter()
        .map(|((init, _), &qv)| [1.0, x[init], qv])
        .collect();
    let outcomes: Vec<f64> = outcome.iter().copied().collect();
    logreg_mle(&features, &outcomes, DEFAULT_TOL, DEFAULT_MAX_ITER)
}

/// Fits every grid point of `x[init, y, x]` against quantile values and
/// exceedance outcomes shaped `[init, y, x, quantile]`.
pub fn fit_gridpoints(
    x: ArrayView3<f64>,
    q: ArrayView4<f64>,
    outcome: ArrayView4<f64>,
) -> LogRegResult<Coefficients> {
    let (ninit, ny, nx) = x.dim();
    let (qi, qy, qx, nq) = q.dim();
    if (qi, qy, qx) != (ninit, ny, nx) {
        return Err(LogRegError::ShapeMismatch(format!(
            "quantiles {:?} do not match predictor {:?}",
            q.shape(),
            x.shape()
        )));
    }
    if outcome.dim() != q.dim() {
        return Err(LogRegError::ShapeMismatch(format!(
            "outcomes {:?} do not match quantiles {:?}",
            outcome.shape(),
            q.shape()
        )));
    }
    debug!("Fitting {} grid points ({} inits, {} quantiles)", ny * nx, ninit, nq);

    let fits: Vec<[f64; 3]> = (0..ny * nx)
        .into_par_iter()
        .map(|k| {
            let (j, i) = (k / nx, k % nx);
            let xs: Vec<f64> = x.slice(s![.., j, i]).to_vec();
            let qs = q.slice(s![.., j, i, ..]).to_owned();
            let zs = outcome.slice(s![.., j, i, ..]).to_owned();
            fit_point(&xs, &qs, &zs)
        })
        .collect();

    let grid = |n: usize| Array2::from_shape_fn((ny, nx), |(j, i)| fits[j * nx + i][n]);
    Ok(Coefficients {
        intercept: grid(0),
        b1: grid(1),
        b2: grid(2),
    })
}

/// Fits `x[init, lead, y, x]` against quantile values and outcomes shaped
/// `[init, lead, y, x, quantile]`, separately for each calendar month in
/// `init_months` (one entry per init) and each lead.
pub fn fit_by_month_lead(
    x: ArrayView4<f64>,
    q: ArrayView5<f64>,
    outcome: ArrayView5<f64>,
    init_months: &[u32],
) -> LogRegResult<MonthLeadCoefficients> {
    let (ninit, nlead, ny, nx) = x.dim();
    let (qi, ql, qy, qx, _) = q.dim();
    if (qi, ql, qy, qx) != (ninit, nlead, ny, nx) || outcome.dim() != q.dim() {
        return Err(LogRegError::ShapeMismatch(format!(
            "predictor {:?}, quantiles {:?} and outcomes {:?} disagree",
            x.shape(),
            q.shape(),
            outcome.shape()
        )));
    }
    if init_months.len() != ninit {
        return Err(LogRegError::ShapeMismatch(format!(
            "{} init months for {} inits",
            init_months.len(),
            ninit
        )));
    }
    let mut months = init_months.to_vec();
    months.sort_unstable();
    months.dedup();

    let shape = (months.len(), nlead, ny, nx);
    let mut intercept = Array4::from_elem(shape, f64::NAN);
    let mut b1 = intercept.clone();
    let mut b2 = intercept.clone();
    for (m, &month) in months.iter().enumerate() {
        let inits: Vec<usize> = init_months
            .iter()
            .enumerate()
            .filter(|&(_, &im)| im == month)
            .map(|(i, _)| i)
            .collect();
        debug!("Month {:02}: {} inits over {} leads", month, inits.len(), nlead);
        let xm = x.select(Axis(0), &inits);
        let qm = q.select(Axis(0), &inits);
        let zm = outcome.select(Axis(0), &inits);
        for lead in 0..nlead {
            let coefs = fit_gridpoints(
                xm.index_axis(Axis(1), lead),
                qm.index_axis(Axis(1), lead),
                zm.index_axis(Axis(1), lead),
            )?;
            intercept.slice_mut(s![m, lead, .., ..]).assign(&coefs.intercept);
            b1.slice_mut(s![m, lead, .., ..]).assign(&coefs.b1);
            b2.slice_mut(s![m, lead, .., ..]).assign(&coefs.b2);
        }
    }
    Ok(MonthLeadCoefficients {
        months,
        intercept,
        b1,
        b2,
    })
}

/// Quantile of the non-NaN `values` by linear interpolation between order
/// statistics. NaN when nothing is left.
fn nan_quantile(values: &mut Vec<f64>, level: f64) -> f64 {
    values.retain(|v| !v.is_nan());
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(f64::total_cmp);
    let pos = level * (values.len() - 1) as f64;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
    values[lo] + (values[hi] - values[lo]) * (pos - lo as f64)
}

/// Quantiles of `obs[time, y, x]` over the times of each calendar month.
///
/// Returns the months present (ascending) and the quantiles shaped
/// `[month, y, x, level]`.
pub fn monthly_quantiles(
    obs: ArrayView3<f64>,
    time_months: &[u32],
    levels: &[f64],
) -> LogRegResult<(Vec<u32>, Array4<f64>)> {
    let (nt, ny, nx) = obs.dim();
    if time_months.len() != nt {
        return Err(LogRegError::ShapeMismatch(format!(
            "{} time months for {} observations",
            time_months.len(),
            nt
        )));
    }
    let mut months = time_months.to_vec();
    months.sort_unstable();
    months.dedup();

    let mut out = Array4::from_elem((months.len(), ny, nx, levels.len()), f64::NAN);
    for (m, &month) in months.iter().enumerate() {
        let times: Vec<usize> = (0..nt).filter(|&t| time_months[t] == month).collect();
        let points: Vec<Vec<f64>> = (0..ny * nx)
            .into_par_iter()
            .map(|k| {
                let (j, i) = (k / nx, k % nx);
                let series: Vec<f64> = times.iter().map(|&t| obs[[t, j, i]]).collect();
                levels
                    .iter()
                    .map(|&level| nan_quantile(&mut series.clone(), level))
                    .collect()
            })
            .collect();
        for (k, values) in points.into_iter().enumerate() {
            for (l, v) in values.into_iter().enumerate() {
                out[[m, k / nx, k % nx, l]] = v;
            }
        }
    }
    Ok((months, out))
}

/// Marks each observation of `obs[time, y, x]` with 1 where it exceeds the
/// quantile of its calendar month and 0 otherwise. Missing observations
/// never exceed. The result is shaped `[time, y, x, level]`.
pub fn exceedances(
    obs: ArrayView3<f64>,
    time_months: &[u32],
    months: &[u32],
    quantiles: ArrayView4<f64>,
) -> LogRegResult<Array4<f64>> {
    let (nt, ny, nx) = obs.dim();
    let (nm, qy, qx, nq) = quantiles.dim();
    if (qy, qx) != (ny, nx) || nm != months.len() || time_months.len() != nt {
        return Err(LogRegError::ShapeMismatch(format!(
            "observations {:?} against quantiles {:?}",
            obs.shape(),
            quantiles.shape()
        )));
    }
    let mut out = Array4::zeros((nt, ny, nx, nq));
    for (t, month) in time_months.iter().enumerate() {
        let m = months
            .iter()
            .position(|x| x == month)
            .ok_or(LogRegError::MissingMonth(*month))?;
        for ((j, i, l), cell) in out.slice_mut(s![t, .., .., ..]).indexed_iter_mut() {
            if obs[[t, j, i]] > quantiles[[m, j, i, l]] {
                *cell = 1.0;
            }
        }
    }
    Ok(out)
}

/// Index into `obs_times` of the observation verifying every forecast
/// `(init, lead)`, for monthly leads. The target is `init + lead` months and
/// matches the observation in the same calendar year and month.
pub fn match_valid_times(
    obs_times: &[f64],
    inits: &[f64],
    nlead: usize,
) -> LogRegResult<Array2<usize>> {
    let obs_months: Vec<Option<(i32, u32)>> = obs_times
        .iter()
        .map(|&t| days_to_date(t).map(|d| (d.year(), d.month())))
        .collect();
    let mut out = Array2::zeros((inits.len(), nlead));
    for (i, &init) in inits.iter().enumerate() {
        let start =
            days_to_date(init).ok_or_else(|| LogRegError::InvalidTime("init".to_string()))?;
        for lead in 0..nlead {
            let target = u32::try_from(lead)
                .ok()
                .and_then(|l| add_months(start, l))
                .ok_or_else(|| LogRegError::InvalidTime("init".to_string()))?;
            let key = Some((target.year(), target.month()));
            out[[i, lead]] = obs_months.iter().position(|m| *m == key).ok_or_else(|| {
                LogRegError::MissingObservation(target.format("%Y-%m").to_string())
            })?;
        }
    }
    Ok(out)
}

/// Times of a one-dimensional coordinate as days since the epoch, decoding
/// its CF `units` when present.
fn epoch_days(ds: &Dataset, dim: &str) -> LogRegResult<Vec<f64>> {
    let coord = ds
        .coord(dim)
        .ok_or_else(|| DatasetError::VariableNotFound(dim.to_string()))?;
    let values = coord.values();
    match coord.text_attr("units") {
        Some(units) => to_epoch_days(&values, units)
            .ok_or_else(|| LogRegError::InvalidTime(dim.to_string())),
        None => Ok(values),
    }
}

fn shape_err(e: ndarray::ShapeError) -> LogRegError {
    LogRegError::Dataset(DatasetError::Shape(e))
}

/// Per-month quantiles of the observed `var[time, y, x]`, as a dataset with
/// `var` shaped `[month, y, x, quantile]`.
pub fn observed_quantiles(
    observations: &Dataset,
    var: &str,
    levels: &[f64],
) -> LogRegResult<Dataset> {
    let ovar = observations.require(var)?;
    if ovar.dims.len() != 3 {
        return Err(LogRegError::ShapeMismatch(format!(
            "expected {var}[time, y, x], found {:?}",
            ovar.dims
        )));
    }
    let tdim = ovar.dims[0].as_str();
    let times = epoch_days(observations, tdim)?;
    let time_months = times
        .iter()
        .map(|&t| month_of(t).ok_or_else(|| LogRegError::InvalidTime(tdim.to_string())))
        .collect::<LogRegResult<Vec<u32>>>()?;
    let obs = ovar.data.view().into_dimensionality::<Ix3>().map_err(shape_err)?;
    info!(
        "Computing {} quantile(s) of {} from {} observations",
        levels.len(),
        var,
        times.len()
    );
    let (months, quantiles) = monthly_quantiles(obs, &time_months, levels)?;

    let (ydim, xdim) = (ovar.dims[1].as_str(), ovar.dims[2].as_str());
    let mut out = Dataset::new();
    let dims = ["month", ydim, xdim, "quantile"];
    out.add_data_var(var, Variable::new(&dims, quantiles.into_dyn()))?;
    let months: Vec<f64> = months.iter().map(|&m| m as f64).collect();
    out.add_coord("month", Variable::from_vec("month", months))?;
    out.add_coord("quantile", Variable::from_vec("quantile", levels.to_vec()))?;
    for dim in [ydim, xdim] {
        if let Some(coord) = observations.coord(dim) {
            out.add_coord(dim, coord.clone())?;
        }
    }
    Ok(out)
}

/// Builds the regression inputs for forecast variable `var` from the
/// combined forecast, the observations of `obs_var` on the same grid, and
/// their quantiles from [`observed_quantiles`].
///
/// The forecast is averaged over `member` when present and restricted to
/// inits within `years`. The result holds [`PREDICTOR`] shaped
/// `[init, lead, y, x]` and [`QUANTILE_VALUE`] and [`EXCEEDED`] shaped
/// `[init, lead, y, x, quantile]`, where the quantile is that of the
/// verifying month.
pub fn regression_inputs(
    forecast: &Dataset,
    var: &str,
    observations: &Dataset,
    obs_var: &str,
    quantiles: &Dataset,
    years: Option<(i32, i32)>,
) -> LogRegResult<Dataset> {
    let mut ensmean = forecast.select(&[var])?;
    if ensmean.has_dim("member") {
        ensmean = ensmean.mean_over("member")?;
    }
    if let Some((first, last)) = years {
        let inits = epoch_days(&ensmean, "init")?;
        let keep: Vec<usize> = (0..inits.len())
            .filter(|&i| year_of(inits[i]).is_some_and(|y| (first..=last).contains(&y)))
            .collect();
        debug!("Keeping {} of {} inits in {}-{}", keep.len(), inits.len(), first, last);
        ensmean = ensmean.take("init", &keep)?;
    }
    ensmean.transpose_front(&["init", "lead"]);
    let fvar = ensmean.require(var)?;
    if fvar.dims.len() != 4 || fvar.dims[0] != "init" || fvar.dims[1] != "lead" {
        return Err(LogRegError::ShapeMismatch(format!(
            "expected {var}[init, lead, y, x] after the member mean, found {:?}",
            fvar.dims
        )));
    }
    let x = fvar.data.view().into_dimensionality::<Ix4>().map_err(shape_err)?;
    let (ninit, nlead, ny, nx) = x.dim();

    let ovar = observations.require(obs_var)?;
    let obs = ovar.data.view().into_dimensionality::<Ix3>().map_err(shape_err)?;
    if obs.dim().1 != ny || obs.dim().2 != nx {
        return Err(LogRegError::ShapeMismatch(format!(
            "observations {:?} are not on the forecast grid {:?}",
            obs.shape(),
            x.shape()
        )));
    }
    let tdim = ovar.dims[0].as_str();
    let obs_times = epoch_days(observations, tdim)?;
    let time_months = obs_times
        .iter()
        .map(|&t| month_of(t).ok_or_else(|| LogRegError::InvalidTime(tdim.to_string())))
        .collect::<LogRegResult<Vec<u32>>>()?;

    let qvar = quantiles.require(obs_var)?;
    let q = qvar.data.view().into_dimensionality::<Ix4>().map_err(shape_err)?;
    let months: Vec<u32> = quantiles
        .coord_values("month")
        .ok_or_else(|| DatasetError::VariableNotFound("month".to_string()))?
        .into_iter()
        .map(|m| m as u32)
        .collect();
    let exceeded = exceedances(obs, &time_months, &months, q)?;

    let inits = epoch_days(&ensmean, "init")?;
    let matched = match_valid_times(&obs_times, &inits, nlead)?;
    let nq = q.dim().3;
    let mut qvalues = Array5::from_elem((ninit, nlead, ny, nx, nq), f64::NAN);
    let mut outcomes = Array5::zeros((ninit, nlead, ny, nx, nq));
    for ((i, lead), &t) in matched.indexed_iter() {
        let month = time_months[t];
        let m = months
            .iter()
            .position(|&x| x == month)
            .ok_or(LogRegError::MissingMonth(month))?;
        qvalues.slice_mut(s![i, lead, .., .., ..]).assign(&q.index_axis(Axis(0), m));
        outcomes.slice_mut(s![i, lead, .., .., ..]).assign(&exceeded.index_axis(Axis(0), t));
    }

    let (ydim, xdim) = (fvar.dims[2].clone(), fvar.dims[3].clone());
    let dims5 = ["init", "lead", ydim.as_str(), xdim.as_str(), "quantile"];
    let mut out = Dataset::new();
    out.add_data_var(PREDICTOR, Variable::new(&dims5[..4], x.to_owned().into_dyn()))?;
    out.add_data_var(QUANTILE_VALUE, Variable::new(&dims5, qvalues.into_dyn()))?;
    out.add_data_var(EXCEEDED, Variable::new(&dims5, outcomes.into_dyn()))?;
    for dim in ["init", "lead", ydim.as_str(), xdim.as_str()] {
        if let Some(coord) = ensmean.coord(dim) {
            out.add_coord(dim, coord.clone())?;
        }
    }
    if let Some(levels) = quantiles.coord("quantile") {
        out.add_coord("quantile", levels.clone())?;
    }
    Ok(out)
}

/// Fits coefficients from variables of `ds` for every calendar month of
/// initialization and every lead, and returns them as a dataset with
/// `intercept`, `b1` and `b2` over `[month, lead, y, x]`.
///
/// `predictor` must be `[init, lead, y, x]`; `quantiles` and `outcomes`
/// must share those dimensions and add a trailing quantile dimension. The
/// `init` coordinate supplies the months.
pub fn fit_dataset(
    ds: &Dataset,
    predictor: &str,
    quantiles: &str,
    outcomes: &str,
) -> LogRegResult<Dataset> {
    let xvar = ds.require(predictor)?;
    let qvar = ds.require(quantiles)?;
    let zvar = ds.require(outcomes)?;
    if xvar.dims.len() != 4
        || qvar.dims.len() != 5
        || qvar.dims[..4] != xvar.dims[..]
        || zvar.dims != qvar.dims
    {
        return Err(LogRegError::ShapeMismatch(format!(
            "expected {predictor}[init, lead, y, x] and {quantiles}/{outcomes} with one extra \
             trailing dimension, found {:?}, {:?} and {:?}",
            xvar.dims, qvar.dims, zvar.dims
        )));
    }
    let init_dim = xvar.dims[0].as_str();
    let init_months = epoch_days(ds, init_dim)?
        .into_iter()
        .map(|t| month_of(t).ok_or_else(|| LogRegError::InvalidTime(init_dim.to_string())))
        .collect::<LogRegResult<Vec<u32>>>()?;
    let x = xvar.data.view().into_dimensionality::<Ix4>().map_err(shape_err)?;
    let q = qvar.data.view().into_dimensionality::<Ix5>().map_err(shape_err)?;
    let z = zvar.data.view().into_dimensionality::<Ix5>().map_err(shape_err)?;
    let coefs = fit_by_month_lead(x, q, z, &init_months)?;

    let lead_dim = xvar.dims[1].as_str();
    let (ydim, xdim) = (xvar.dims[2].as_str(), xvar.dims[3].as_str());
    let mut out = Dataset::new();
    let months: Vec<f64> = coefs.months.iter().map(|&m| m as f64).collect();
    out.add_coord("month", Variable::from_vec("month", months))?;
    for dim in [lead_dim, ydim, xdim] {
        if let Some(coord) = ds.coord(dim) {
            out.add_coord(dim, coord.clone())?;
        }
    }
    let dims = ["month", lead_dim, ydim, xdim];
    for (name, grid) in COEFFICIENT_NAMES.iter().zip([coefs.intercept, coefs.b1, coefs.b2]) {
        let data: ArrayD<f64> = grid.into_dyn();
        out.add_data_var(name, Variable::new(&dims, data))?;
    }
    let intercept = out.require("intercept")?;
    let fitted = intercept.data.iter().filter(|v| v.is_finite()).count();
    debug!("{} of {} month/lead grid points fitted", fitted, intercept.data.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{TIME_UNITS, date_to_days, init_date};
    use ndarray::{Array3, IxDyn};

    fn mixed_sample() -> (Vec<[f64; 3]>, Vec<f64>) {
        let x1 = [-2.0, -1.0, 0.0, 1.0, 2.0, -2.0, -1.0, 0.0, 1.0, 2.0];
        let x2 = [0.5, 0.1, -0.3, 0.2, 0.9, -0.4, 0.0, 0.7, -0.8, 0.3];
        let y = vec![0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        let features = x1.iter().zip(x2).map(|(&a, b)| [1.0, a, b]).collect();
        (features, y)
    }

    #[test]
    fn test_mle_reaches_stationary_point() {
        let (features, y) = mixed_sample();
        let w = logreg_mle(&features, &y, DEFAULT_TOL, DEFAULT_MAX_ITER);
        assert!(w.iter().all(|v| v.is_finite()));
        // The score vanishes at the maximum.
        for k in 0..3 {
            let score: f64 = features
                .iter()
                .zip(&y)
                .map(|(row, &yi)| row[k] * (yi - sigmoid(row[0] * w[0] + row[1] * w[1] + row[2] * w[2])))
                .sum();
            assert!(score.abs() < 1e-6, "score {k} = {score}");
        }
        assert!(w[1] > 0.0);
    }

    #[test]
    fn test_separable_data_does_not_converge() {
        let features = vec![[1.0, -2.0, 0.3], [1.0, -1.0, -0.1], [1.0, 1.0, 0.2], [1.0, 2.0, -0.4]];
        let y = vec![0.0, 0.0, 1.0, 1.0];
        let w = logreg_mle(&features, &y, DEFAULT_TOL, DEFAULT_MAX_ITER);
        assert!(w.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_collinear_features_are_singular() {
        let features = vec![[1.0, 1.0, 2.0], [1.0, 2.0, 4.0], [1.0, 3.0, 6.0], [1.0, 4.0, 8.0]];
        let y = vec![0.0, 1.0, 0.0, 1.0];
        let w = logreg_mle(&features, &y, DEFAULT_TOL, DEFAULT_MAX_ITER);
        assert!(w.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_invert_identity_and_singular() {
        let eye = [[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 4.0]];
        let inv = invert(&eye).unwrap();
        assert_eq!(inv[1][1], 0.5);
        assert_eq!(inv[2][2], 0.25);
        assert!(invert(&[[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 1.0, 1.0]]).is_none());
    }

    #[test]
    fn test_fit_gridpoints_masks_points() -> Result<(), Box<dyn std::error::Error>> {
        let (features, y) = mixed_sample();
        // 10 inits, 1x3 grid, 1 quantile.
        let mut x = Array3::<f64>::zeros((10, 1, 3));
        let mut q = Array4::<f64>::zeros((10, 1, 3, 1));
        let mut z = Array4::<f64>::zeros((10, 1, 3, 1));
        for (t, (row, &yt)) in features.iter().zip(&y).enumerate() {
            for i in 0..3 {
                x[[t, 0, i]] = row[1];
                q[[t, 0, i, 0]] = row[2];
                z[[t, 0, i, 0]] = yt;
            }
        }
        // Point 1 has a missing predictor, point 2 only one outcome class.
        x[[4, 0, 1]] = f64::NAN;
        for t in 0..10 {
            z[[t, 0, 2, 0]] = 0.0;
        }

        let coefs = fit_gridpoints(x.view(), q.view(), z.view())?;
        let expected = logreg_mle(&features, &y, DEFAULT_TOL, DEFAULT_MAX_ITER);
        assert_eq!(coefs.intercept[[0, 0]], expected[0]);
        assert_eq!(coefs.b1[[0, 0]], expected[1]);
        assert_eq!(coefs.b2[[0, 0]], expected[2]);
        assert!(coefs.intercept[[0, 1]].is_nan());
        assert!(coefs.b2[[0, 2]].is_nan());
        Ok(())
    }

    #[test]
    fn test_fit_gridpoints_rejects_mismatched_shapes() {
        let x = Array3::<f64>::zeros((2, 2, 2));
        let q = Array4::<f64>::zeros((2, 2, 3, 1));
        assert!(matches!(
            fit_gridpoints(x.view(), q.view(), q.view()),
            Err(LogRegError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_fit_by_month_lead_groups_inits() -> Result<(), Box<dyn std::error::Error>> {
        let (features, y) = mixed_sample();
        // 20 inits alternating March and September, 2 leads, 1x1 grid.
        let scale = |month: u32, lead: usize| match (month, lead) {
            (3, 0) => 1.0,
            (3, _) => -1.0,
            (9, 0) => 2.0,
            _ => 0.5,
        };
        let init_months: Vec<u32> = (0..20).map(|i| if i % 2 == 0 { 3 } else { 9 }).collect();
        let mut x = Array4::<f64>::zeros((20, 2, 1, 1));
        let mut q = Array5::<f64>::zeros((20, 2, 1, 1, 1));
        let mut z = Array5::<f64>::zeros((20, 2, 1, 1, 1));
        for (i, &month) in init_months.iter().enumerate() {
            let k = i / 2;
            for lead in 0..2 {
                x[[i, lead, 0, 0]] = scale(month, lead) * features[k][1];
                q[[i, lead, 0, 0, 0]] = features[k][2];
                z[[i, lead, 0, 0, 0]] = y[k];
            }
        }

        let coefs = fit_by_month_lead(x.view(), q.view(), z.view(), &init_months)?;
        assert_eq!(coefs.months, vec![3, 9]);
        assert_eq!(coefs.b1.dim(), (2, 2, 1, 1));
        for (m, &month) in coefs.months.iter().enumerate() {
            for lead in 0..2 {
                let scaled: Vec<[f64; 3]> = features
                    .iter()
                    .map(|row| [1.0, scale(month, lead) * row[1], row[2]])
                    .collect();
                let expected = logreg_mle(&scaled, &y, DEFAULT_TOL, DEFAULT_MAX_ITER);
                assert_eq!(coefs.intercept[[m, lead, 0, 0]], expected[0]);
                assert_eq!(coefs.b1[[m, lead, 0, 0]], expected[1]);
                assert_eq!(coefs.b2[[m, lead, 0, 0]], expected[2]);
            }
        }
        assert!(coefs.b1[[0, 0, 0, 0]] > 0.0);
        assert!(coefs.b1[[0, 1, 0, 0]] < 0.0);
        assert!(coefs.b1[[1, 0, 0, 0]] < coefs.b1[[0, 0, 0, 0]]);
        assert!(coefs.b1[[1, 1, 0, 0]] > coefs.b1[[0, 0, 0, 0]]);

        assert!(matches!(
            fit_by_month_lead(x.view(), q.view(), z.view(), &init_months[..19]),
            Err(LogRegError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_monthly_quantiles_and_exceedances() -> Result<(), Box<dyn std::error::Error>> {
        let obs = Array3::from_shape_vec((6, 1, 1), vec![1.0, 10.0, 2.0, f64::NAN, 3.0, 30.0])?;
        let time_months = [1, 2, 1, 2, 1, 2];
        let (months, q) = monthly_quantiles(obs.view(), &time_months, &[0.5, 0.9])?;
        assert_eq!(months, vec![1, 2]);
        assert!((q[[0, 0, 0, 0]] - 2.0).abs() < 1e-12);
        assert!((q[[0, 0, 0, 1]] - 2.8).abs() < 1e-12);
        assert!((q[[1, 0, 0, 0]] - 20.0).abs() < 1e-12);
        assert!((q[[1, 0, 0, 1]] - 28.0).abs() < 1e-12);

        let exceeded = exceedances(obs.view(), &time_months, &months, q.view())?;
        let median: Vec<f64> = (0..6).map(|t| exceeded[[t, 0, 0, 0]]).collect();
        assert_eq!(median, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        let upper: Vec<f64> = (0..6).map(|t| exceeded[[t, 0, 0, 1]]).collect();
        assert_eq!(upper, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);

        assert!(matches!(
            exceedances(obs.view(), &[1, 2, 1, 2, 1, 3], &months, q.view()),
            Err(LogRegError::MissingMonth(3))
        ));
        Ok(())
    }

    fn first_of(year: i32, month: u32) -> f64 {
        init_date(year, month).map(date_to_days).unwrap_or(f64::NAN)
    }

    #[test]
    fn test_match_valid_times() -> Result<(), Box<dyn std::error::Error>> {
        // Observations stamped mid-month, January 2000 to June 2000.
        let obs: Vec<f64> = (1..=6).map(|m| first_of(2000, m) + 14.0).collect();
        let inits = [first_of(2000, 1), first_of(2000, 3)];
        let matched = match_valid_times(&obs, &inits, 3)?;
        assert_eq!(matched.row(0).to_vec(), vec![0, 1, 2]);
        assert_eq!(matched.row(1).to_vec(), vec![2, 3, 4]);

        let err = match_valid_times(&obs, &[first_of(2000, 5)], 3);
        assert!(matches!(err, Err(LogRegError::MissingObservation(ref m)) if m == "2000-07"));
        Ok(())
    }

    /// Four inits (January and July of 2000 and 2001), 3 leads, 2 members on
    /// a 1x1 grid, and monthly observations through 2001 stamped in hours.
    fn forecast_and_observations() -> Result<(Dataset, Dataset), Box<dyn std::error::Error>> {
        let inits: Vec<f64> = [(2000, 1), (2000, 7), (2001, 1), (2001, 7)]
            .iter()
            .map(|&(y, m)| first_of(y, m))
            .collect();
        let mut forecast = Dataset::new();
        let mut tos = ArrayD::zeros(IxDyn(&[4, 2, 3, 1, 1]));
        for mut init in tos.outer_iter_mut() {
            init.index_axis_mut(ndarray::Axis(0), 0).fill(1.0);
            init.index_axis_mut(ndarray::Axis(0), 1).fill(3.0);
        }
        forecast.add_data_var("tos", Variable::new(&["init", "member", "lead", "yh", "xh"], tos))?;
        let init = Variable::from_vec("init", inits).with_attr("units", TIME_UNITS);
        forecast.add_coord("init", init)?;
        forecast.add_coord("member", Variable::from_vec("member", vec![1.0, 2.0]))?;
        forecast.add_coord("lead", Variable::from_vec("lead", vec![0.0, 1.0, 2.0]))?;
        forecast.add_coord("yh", Variable::from_vec("yh", vec![40.0]))?;
        forecast.add_coord("xh", Variable::from_vec("xh", vec![-70.0]))?;

        let hours: Vec<f64> = (0..24)
            .map(|t| first_of(2000 + t / 12, (t % 12) as u32 + 1) * 24.0)
            .collect();
        let values = ArrayD::from_shape_vec(IxDyn(&[24, 1, 1]), (0..24).map(f64::from).collect())?;
        let mut observations = Dataset::new();
        observations.add_data_var("thetao", Variable::new(&["time", "yh", "xh"], values))?;
        let time =
            Variable::from_vec("time", hours).with_attr("units", "hours since 1970-01-01 00:00:00");
        observations.add_coord("time", time)?;
        observations.add_coord("yh", Variable::from_vec("yh", vec![40.0]))?;
        observations.add_coord("xh", Variable::from_vec("xh", vec![-70.0]))?;
        Ok((forecast, observations))
    }

    #[test]
    fn test_regression_inputs_match_verifying_month() -> Result<(), Box<dyn std::error::Error>> {
        let (forecast, observations) = forecast_and_observations()?;
        let quantiles = observed_quantiles(&observations, "thetao", &[0.5])?;
        assert_eq!(quantiles.require("thetao")?.dims, vec!["month", "yh", "xh", "quantile"]);
        assert_eq!(quantiles.coord_values("month"), Some((1..=12).map(f64::from).collect()));
        // Each month holds its 2000 value t and its 2001 value t + 12.
        assert_eq!(quantiles.require("thetao")?.data[[8, 0, 0, 0]], 14.0);

        let inputs =
            regression_inputs(&forecast, "tos", &observations, "thetao", &quantiles, None)?;
        let x = &inputs.require(PREDICTOR)?;
        assert_eq!(x.dims, vec!["init", "lead", "yh", "xh"]);
        assert!(x.data.iter().all(|&v| v == 2.0));
        let qv = &inputs.require(QUANTILE_VALUE)?.data;
        let ex = &inputs.require(EXCEEDED)?.data;
        assert_eq!(qv.shape(), &[4, 3, 1, 1, 1]);
        // July 2000 at lead 2 verifies in September 2000.
        assert_eq!(qv[[1, 2, 0, 0, 0]], 14.0);
        assert_eq!(ex[[1, 2, 0, 0, 0]], 0.0);
        // January 2001 at lead 1 verifies in February 2001.
        assert_eq!(qv[[2, 1, 0, 0, 0]], 7.0);
        assert_eq!(ex[[2, 1, 0, 0, 0]], 1.0);

        let recent = regression_inputs(
            &forecast,
            "tos",
            &observations,
            "thetao",
            &quantiles,
            Some((2001, 2001)),
        )?;
        assert_eq!(recent.dim_len("init"), Some(2));
        assert_eq!(recent.require(EXCEEDED)?.data[[0, 0, 0, 0, 0]], 1.0);
        Ok(())
    }

    #[test]
    fn test_regression_inputs_require_observations() -> Result<(), Box<dyn std::error::Error>> {
        let (forecast, observations) = forecast_and_observations()?;
        let short = observations.take("time", &(0..18).collect::<Vec<_>>())?;
        let quantiles = observed_quantiles(&short, "thetao", &[0.5])?;
        let result = regression_inputs(&forecast, "tos", &short, "thetao", &quantiles, None);
        assert!(matches!(result, Err(LogRegError::MissingObservation(ref m)) if m == "2001-07"));
        Ok(())
    }

    #[test]
    fn test_fit_dataset_names_outputs() -> Result<(), Box<dyn std::error::Error>> {
        let (forecast, observations) = forecast_and_observations()?;
        let quantiles = observed_quantiles(&observations, "thetao", &[0.5])?;
        let inputs =
            regression_inputs(&forecast, "tos", &observations, "thetao", &quantiles, None)?;

        let out = fit_dataset(&inputs, PREDICTOR, QUANTILE_VALUE, EXCEEDED)?;
        assert_eq!(out.data_var_names(), vec!["intercept", "b1", "b2"]);
        assert_eq!(out.require("b1")?.dims, vec!["month", "lead", "yh", "xh"]);
        assert_eq!(out.coord_values("month"), Some(vec![1.0, 7.0]));
        assert_eq!(out.coord_values("lead"), Some(vec![0.0, 1.0, 2.0]));
        assert_eq!(out.coord_values("yh"), Some(vec![40.0]));
        // A constant predictor cannot be fitted.
        assert!(out.require("intercept")?.data.iter().all(|v| v.is_nan()));

        assert!(matches!(
            fit_dataset(&inputs, QUANTILE_VALUE, PREDICTOR, EXCEEDED),
            Err(LogRegError::ShapeMismatch(_))
        ));
        Ok(())
    }
}
