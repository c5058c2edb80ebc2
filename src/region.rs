//! # Region Averaging
//!
//! Reduces gridded fields to area-weighted means over named regions.
//!
//! The region mask file holds one 0/1 (or boolean) field per region and the
//! cell area `areacello`. The dimensions of `areacello` (e.g. `yh`, `xh`)
//! name the horizontal dimensions to reduce over. A region's weights are
//! the cell areas inside the region and zero elsewhere; missing data points
//! drop out of both the weighted sum and the weight total.

use crate::cleanup::wildcard_match;
use crate::dataset::{Dataset, DatasetError, Encoding, Variable};
use indexmap::IndexMap;
use log::{debug, info};
use ndarray::{ArrayD, Axis, IxDyn};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during region averaging
#[derive(Error, Debug)]
pub enum RegionError {
    #[error("Region '{0}' not found in mask file")]
    MissingRegion(String),

    #[error("Mask file has no 2-D 'areacello' variable")]
    MissingArea,

    #[error("Variable '{var}' has {found:?} points along the horizontal dimensions, mask has {expected:?}")]
    GridMismatch {
        var: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RegionResult<T> = Result<T, RegionError>;

/// Region masks and cell areas, loaded once and shared read-only.
#[derive(Debug, Clone)]
pub struct RegionMask {
    areacello: Variable,
    masks: IndexMap<String, Variable>,
}

impl RegionMask {
    pub fn open<P: AsRef<Path>>(path: P) -> RegionResult<Self> {
        debug!("Loading region masks from {}", path.as_ref().display());
        Self::from_dataset(&Dataset::open(path)?)
    }

    pub fn from_dataset(ds: &Dataset) -> RegionResult<Self> {
        let areacello = ds
            .variable("areacello")
            .filter(|a| a.dims.len() == 2)
            .cloned()
            .ok_or(RegionError::MissingArea)?;
        let masks = ds
            .data_vars()
            .iter()
            .filter(|(name, var)| *name != "areacello" && var.dims == areacello.dims)
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        Ok(RegionMask { areacello, masks })
    }

    pub fn region_names(&self) -> Vec<String> {
        self.masks.keys().cloned().collect()
    }

    /// Names of the two horizontal dimensions.
    pub fn horizontal_dims(&self) -> (&str, &str) {
        (&self.areacello.dims[0], &self.areacello.dims[1])
    }

    fn shape(&self) -> (usize, usize) {
        let s = self.areacello.data.shape();
        (s[0], s[1])
    }

    /// Cell areas inside `region`, zero outside it or where the area is NaN.
    pub fn weights(&self, region: &str) -> RegionResult<ArrayD<f64>> {
        let mask = self
            .masks
            .get(region)
            .ok_or_else(|| RegionError::MissingRegion(region.to_string()))?;
        let mut weights = self.areacello.data.clone();
        ndarray::Zip::from(&mut weights).and(&mask.data).for_each(|w, &m| {
            if m.is_nan() || m == 0.0 || w.is_nan() {
                *w = 0.0;
            }
        });
        Ok(weights)
    }
}

/// Weighted mean of `data` over its last two axes, skipping NaN points.
fn weighted_mean(data: &ArrayD<f64>, weights: &[f64]) -> ArrayD<f64> {
    let shape = data.shape();
    let rest = &shape[..shape.len() - 2];
    let cells: usize = shape[shape.len() - 2..].iter().product();
    let values: Vec<f64> = data.iter().copied().collect();
    let means: Vec<f64> = values
        .chunks(cells.max(1))
        .map(|chunk| {
            let (num, den) = chunk
                .iter()
                .zip(weights)
                .filter(|(x, _)| !x.is_nan())
                .fold((0.0, 0.0), |(n, d), (x, w)| (n + x * w, d + w));
            if den == 0.0 { f64::NAN } else { num / den }
        })
        .collect();
    ArrayD::from_shape_vec(IxDyn(rest), means).unwrap_or_else(|_| ArrayD::from_elem(IxDyn(rest), f64::NAN))
}

/// Renames horizontal dimensions carrying a decorated name (e.g.
/// `yh_sub01`) to the mask's canonical names.
///
/// A canonical dimension already present is left alone; otherwise the first
/// dimension whose name contains it is renamed.
fn canonical_dims(ds: &Dataset, mask: &RegionMask) -> RegionResult<Dataset> {
    let mut ds = ds.clone();
    let (y, x) = mask.horizontal_dims();
    for dim in [y, x] {
        if ds.has_dim(dim) {
            continue;
        }
        let found = ds.dims().keys().find(|d| d.contains(dim)).cloned();
        if let Some(decorated) = found {
            debug!("Renaming {} to {}", decorated, dim);
            ds.rename_dim(&decorated, dim)?;
        }
    }
    Ok(ds)
}

/// Area-weighted means of every gridded data variable over each region.
///
/// Gridded variables gain a leading `region` dimension labelled with
/// `region_names` in order; data variables without the horizontal
/// dimensions are carried through unchanged.
pub fn region_average(ds: &Dataset, mask: &RegionMask, region_names: &[String]) -> RegionResult<Dataset> {
    let ds = canonical_dims(ds, mask)?;
    let (ydim, xdim) = mask.horizontal_dims();
    let weights: Vec<Vec<f64>> = region_names
        .iter()
        .map(|r| Ok(mask.weights(r)?.iter().copied().collect()))
        .collect::<RegionResult<_>>()?;

    let mut out = Dataset::new();
    for (name, value) in ds.attrs() {
        out.set_attr(name, value.clone());
    }
    out.set_labels("region", region_names.to_vec())?;

    for (name, var) in ds.data_vars() {
        let (Some(ya), Some(xa)) = (var.axis(ydim), var.axis(xdim)) else {
            out.add_data_var(name, var.clone())?;
            continue;
        };
        let found = (var.data.shape()[ya], var.data.shape()[xa]);
        if found != mask.shape() {
            return Err(RegionError::GridMismatch {
                var: name.clone(),
                expected: mask.shape(),
                found,
            });
        }
        let mut order: Vec<usize> = (0..var.dims.len()).filter(|&a| a != ya && a != xa).collect();
        let rest_dims: Vec<String> = order.iter().map(|&a| var.dims[a].clone()).collect();
        order.extend([ya, xa]);
        let permuted = var.data.clone().permuted_axes(IxDyn(&order)).as_standard_layout().into_owned();

        let means: Vec<ArrayD<f64>> = weights.iter().map(|w| weighted_mean(&permuted, w)).collect();
        let views: Vec<_> = means.iter().map(|m| m.view()).collect();
        let data = ndarray::stack(Axis(0), &views).map_err(DatasetError::from)?;

        let mut dims = vec!["region".to_string()];
        dims.extend(rest_dims);
        out.add_data_var(
            name,
            Variable {
                dims,
                data,
                attrs: var.attrs.clone(),
            },
        )?;
    }
    for (name, coord) in ds.coords() {
        if !coord.has_dim(ydim) && !coord.has_dim(xdim) && coord.dims.iter().all(|d| out.has_dim(d)) {
            out.add_coord(name, coord.clone())?;
        }
    }
    if ds.unlimited().is_some_and(|u| out.has_dim(u)) {
        out.set_unlimited(ds.unlimited());
    }
    Ok(out)
}

/// Output file name for the region means of `path`: `<stem>_regionmean.nc`.
pub fn region_mean_name(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    format!("{}_regionmean.nc", stem)
}

fn region_encoding(ds: &Dataset, unlimited_init: bool) -> Encoding {
    let mut enc = Encoding::new();
    for name in ["lead", "member", "month"] {
        if ds.contains(name) {
            enc = enc.int32(name);
        }
    }
    if unlimited_init && ds.has_dim("init") {
        enc = enc.unlimited("init");
    }
    enc
}

/// Region-averages the file at `input` into `output`.
///
/// Returns `false` without doing anything when `output` exists and `rerun`
/// is not set.
pub fn region_average_file(
    input: &Path,
    output: &Path,
    mask: &RegionMask,
    region_names: &[String],
    unlimited_init: bool,
    rerun: bool,
) -> RegionResult<bool> {
    if output.is_file() && !rerun {
        debug!("{} exists; skipping", output.display());
        return Ok(false);
    }
    info!("Region averages {} -> {}", input.display(), output.display());
    let ds = Dataset::open(input)?;
    let averaged = region_average(&ds, mask, region_names)?;
    averaged.write(output, &region_encoding(&averaged, unlimited_init))?;
    Ok(true)
}

/// Region-averages every extracted product of members `1..=ensemble_size`
/// in `extracted_dir` into `outdir`, keeping file names.
pub fn region_average_extracted(
    extracted_dir: &Path,
    outdir: &Path,
    domain: &str,
    ensemble_size: u32,
    mask: &RegionMask,
    region_names: &[String],
    rerun: bool,
) -> RegionResult<Vec<PathBuf>> {
    std::fs::create_dir_all(outdir)?;
    let mut written = Vec::new();
    for member in 1..=ensemble_size {
        let pattern = format!("????-??-e{:02}.{}.nc", member, domain);
        let mut files: Vec<PathBuf> = std::fs::read_dir(extracted_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| wildcard_match(&pattern, n))
            })
            .collect();
        files.sort();
        for file in files {
            let Some(name) = file.file_name() else { continue };
            let output = outdir.join(name);
            if region_average_file(&file, &output, mask, region_names, true, rerun)? {
                written.push(output);
            }
        }
    }
    Ok(written)
}
