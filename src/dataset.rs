//! # Labelled Datasets
//!
//! An in-memory view of a NetCDF file: named dimensions, coordinate and data
//! variables stored as `f64` n-dimensional arrays (`NaN` marks missing data),
//! string label coordinates, attributes and an optional unlimited dimension.
//!
//! The aggregation and reduction engines only ever need a handful of
//! labelled-array operations (select, rename, concatenate with an outer join,
//! sort, NaN-skipping mean), so those are implemented here directly on top of
//! `ndarray`. All file access goes through the `netcdf` crate.
//!
//! ## Writing
//!
//! [`Dataset::write`] always writes to a temporary sibling file first and
//! renames it into place, so a failed write never leaves a partial product.
//!
//! ```rust,no_run
//! use ncforecast::dataset::{Dataset, Encoding};
//!
//! let ds = Dataset::open("forecast.nc")?;
//! let subset = ds.select(&["tos"])?;
//! subset.write("tos.nc", &Encoding::new().compress("tos", 3))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};
use ndarray::{ArrayD, Axis, IxDyn};
use netcdf::AttributeValue;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while building, transforming or persisting datasets
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("NetCDF error: {0}")]
    NetCdf(#[from] netcdf::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Variable '{0}' not found")]
    VariableNotFound(String),

    #[error("Dimension '{0}' not found")]
    DimensionNotFound(String),

    #[error("Dimension '{dim}' has length {expected} but variable '{var}' uses length {found}")]
    LengthMismatch {
        dim: String,
        var: String,
        expected: usize,
        found: usize,
    },

    #[error("Cannot combine datasets: {0}")]
    Incompatible(String),
}

/// Result type for dataset operations
pub type DatasetResult<T> = Result<T, DatasetError>;

/// A named n-dimensional array with attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub data: ArrayD<f64>,
    pub attrs: IndexMap<String, AttributeValue>,
}

impl Variable {
    pub fn new(dims: &[&str], data: ArrayD<f64>) -> Self {
        Variable {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            data,
            attrs: IndexMap::new(),
        }
    }

    /// A zero-dimensional variable holding a single value.
    pub fn scalar(value: f64) -> Self {
        Variable::new(&[], ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// A one-dimensional variable along `dim`.
    pub fn from_vec(dim: &str, values: Vec<f64>) -> Self {
        let n = values.len();
        // A flat vector always fits a one-dimensional shape of its own length.
        let data = ArrayD::from_shape_vec(IxDyn(&[n]), values).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])));
        Variable::new(&[dim], data)
    }

    pub fn with_attr<V: Into<AttributeValue>>(mut self, name: &str, value: V) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    /// Position of `dim` in this variable's dimension list.
    pub fn axis(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.axis(dim).is_some()
    }

    /// Returns a string attribute, if present and textual.
    pub fn text_attr(&self, name: &str) -> Option<&str> {
        match self.attrs.get(name) {
            Some(AttributeValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Values of a one-dimensional (or scalar) variable as a flat vector.
    pub fn values(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }
}

/// Per-variable write options.
///
/// Variables listed in `int32` are rounded and stored as 32-bit integers;
/// variables in `deflate` are compressed at the given level.
#[derive(Debug, Clone, Default)]
pub struct Encoding {
    pub deflate: IndexMap<String, i32>,
    pub int32: IndexSet<String>,
    pub unlimited: Option<String>,
}

impl Encoding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compress(mut self, var: &str, level: i32) -> Self {
        self.deflate.insert(var.to_string(), level);
        self
    }

    pub fn int32(mut self, var: &str) -> Self {
        self.int32.insert(var.to_string());
        self
    }

    pub fn unlimited(mut self, dim: &str) -> Self {
        self.unlimited = Some(dim.to_string());
        self
    }
}

/// An ordered collection of labelled variables sharing named dimensions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    dims: IndexMap<String, usize>,
    coords: IndexMap<String, Variable>,
    data_vars: IndexMap<String, Variable>,
    labels: IndexMap<String, Vec<String>>,
    attrs: IndexMap<String, AttributeValue>,
    unlimited: Option<String>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dims(&self) -> &IndexMap<String, usize> {
        &self.dims
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.dims.get(dim).copied()
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.dims.contains_key(dim)
    }

    pub fn coords(&self) -> &IndexMap<String, Variable> {
        &self.coords
    }

    pub fn data_vars(&self) -> &IndexMap<String, Variable> {
        &self.data_vars
    }

    pub fn data_var_names(&self) -> Vec<String> {
        self.data_vars.keys().cloned().collect()
    }

    pub fn attrs(&self) -> &IndexMap<String, AttributeValue> {
        &self.attrs
    }

    pub fn set_attr<V: Into<AttributeValue>>(&mut self, name: &str, value: V) {
        self.attrs.insert(name.to_string(), value.into());
    }

    pub fn unlimited(&self) -> Option<&str> {
        self.unlimited.as_deref()
    }

    pub fn set_unlimited(&mut self, dim: Option<&str>) {
        self.unlimited = dim.map(|d| d.to_string());
    }

    pub fn coord(&self, name: &str) -> Option<&Variable> {
        self.coords.get(name)
    }

    pub fn data_var(&self, name: &str) -> Option<&Variable> {
        self.data_vars.get(name)
    }

    pub fn data_var_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.data_vars.get_mut(name)
    }

    /// Looks a name up among coordinates first, then data variables.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.coords.get(name).or_else(|| self.data_vars.get(name))
    }

    pub fn require(&self, name: &str) -> DatasetResult<&Variable> {
        self.variable(name)
            .ok_or_else(|| DatasetError::VariableNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.coords.contains_key(name) || self.data_vars.contains_key(name) || self.labels.contains_key(name)
    }

    /// String labels attached to a dimension (e.g. region names).
    pub fn labels(&self, dim: &str) -> Option<&Vec<String>> {
        self.labels.get(dim)
    }

    /// Coordinate values along `dim`, if a numeric coordinate variable exists.
    pub fn coord_values(&self, dim: &str) -> Option<Vec<f64>> {
        self.coords
            .get(dim)
            .filter(|c| c.dims.len() == 1 && c.dims[0] == dim)
            .map(|c| c.values())
    }

    fn register_dims(&mut self, name: &str, var: &Variable) -> DatasetResult<()> {
        if var.dims.len() != var.data.ndim() {
            return Err(DatasetError::Incompatible(format!(
                "variable '{}' has {} dimension names for {}-d data",
                name,
                var.dims.len(),
                var.data.ndim()
            )));
        }
        for (dim, &len) in var.dims.iter().zip(var.data.shape()) {
            match self.dims.get(dim) {
                Some(&expected) if expected != len => {
                    return Err(DatasetError::LengthMismatch {
                        dim: dim.clone(),
                        var: name.to_string(),
                        expected,
                        found: len,
                    });
                }
                Some(_) => {}
                None => {
                    self.dims.insert(dim.clone(), len);
                }
            }
        }
        Ok(())
    }

    pub fn add_coord(&mut self, name: &str, var: Variable) -> DatasetResult<()> {
        self.register_dims(name, &var)?;
        self.data_vars.shift_remove(name);
        self.coords.insert(name.to_string(), var);
        Ok(())
    }

    pub fn add_data_var(&mut self, name: &str, var: Variable) -> DatasetResult<()> {
        self.register_dims(name, &var)?;
        self.coords.shift_remove(name);
        self.data_vars.insert(name.to_string(), var);
        Ok(())
    }

    pub fn set_labels(&mut self, dim: &str, values: Vec<String>) -> DatasetResult<()> {
        match self.dims.get(dim) {
            Some(&len) if len != values.len() => {
                return Err(DatasetError::LengthMismatch {
                    dim: dim.to_string(),
                    var: dim.to_string(),
                    expected: len,
                    found: values.len(),
                });
            }
            Some(_) => {}
            None => {
                self.dims.insert(dim.to_string(), values.len());
            }
        }
        self.labels.insert(dim.to_string(), values);
        Ok(())
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Variable> {
        self.coords
            .shift_remove(name)
            .or_else(|| self.data_vars.shift_remove(name))
    }

    /// Removes the named variables, ignoring names that are not present.
    pub fn drop_vars(&mut self, names: &[&str]) {
        for name in names {
            self.remove_variable(name);
        }
        self.prune_dims();
    }

    /// Drops dimensions no longer referenced by any variable or label.
    fn prune_dims(&mut self) {
        let used: IndexSet<String> = self
            .coords
            .values()
            .chain(self.data_vars.values())
            .flat_map(|v| v.dims.iter().cloned())
            .chain(self.labels.keys().cloned())
            .collect();
        self.dims.retain(|d, _| used.contains(d));
        if let Some(u) = &self.unlimited {
            if !self.dims.contains_key(u) {
                self.unlimited = None;
            }
        }
    }

    /// Returns a dataset containing only the named data variables and the
    /// coordinates that describe them.
    pub fn select(&self, names: &[&str]) -> DatasetResult<Dataset> {
        let mut out = Dataset {
            attrs: self.attrs.clone(),
            unlimited: self.unlimited.clone(),
            ..Dataset::default()
        };
        for name in names {
            let var = self
                .data_vars
                .get(*name)
                .ok_or_else(|| DatasetError::VariableNotFound(name.to_string()))?;
            out.add_data_var(name, var.clone())?;
        }
        for (name, coord) in &self.coords {
            if coord.dims.iter().all(|d| out.dims.contains_key(d)) {
                out.add_coord(name, coord.clone())?;
            }
        }
        for (dim, values) in &self.labels {
            if out.dims.contains_key(dim) {
                out.labels.insert(dim.clone(), values.clone());
            }
        }
        out.prune_dims();
        Ok(out)
    }

    /// Renames a dimension everywhere it is used.
    pub fn rename_dim(&mut self, old: &str, new: &str) -> DatasetResult<()> {
        let len = self
            .dims
            .get(old)
            .copied()
            .ok_or_else(|| DatasetError::DimensionNotFound(old.to_string()))?;
        if self.dims.contains_key(new) {
            return Err(DatasetError::Incompatible(format!(
                "cannot rename '{}' to existing dimension '{}'",
                old, new
            )));
        }
        let mut dims = IndexMap::new();
        for (d, l) in self.dims.drain(..) {
            if d == old {
                dims.insert(new.to_string(), len);
            } else {
                dims.insert(d, l);
            }
        }
        self.dims = dims;
        for var in self.coords.values_mut().chain(self.data_vars.values_mut()) {
            for d in var.dims.iter_mut() {
                if d == old {
                    *d = new.to_string();
                }
            }
        }
        if let Some(labels) = self.labels.shift_remove(old) {
            self.labels.insert(new.to_string(), labels);
        }
        if self.unlimited.as_deref() == Some(old) {
            self.unlimited = Some(new.to_string());
        }
        // A dimension coordinate follows its dimension.
        if let Some(coord) = self.coords.shift_remove(old) {
            self.coords.insert(new.to_string(), coord);
        }
        Ok(())
    }

    /// Renames a coordinate or data variable.
    pub fn rename_var(&mut self, old: &str, new: &str) -> DatasetResult<()> {
        if let Some(var) = self.data_vars.shift_remove(old) {
            self.data_vars.insert(new.to_string(), var);
            Ok(())
        } else if let Some(var) = self.coords.shift_remove(old) {
            self.coords.insert(new.to_string(), var);
            Ok(())
        } else {
            Err(DatasetError::VariableNotFound(old.to_string()))
        }
    }

    /// Turns the scalar coordinate `dim` into a leading dimension of length
    /// one shared by every data variable.
    pub fn expand_dims(&mut self, dim: &str) -> DatasetResult<()> {
        if self.dims.contains_key(dim) {
            return Err(DatasetError::Incompatible(format!(
                "dimension '{}' already exists",
                dim
            )));
        }
        if let Some(coord) = self.coords.get_mut(dim) {
            if coord.data.ndim() != 0 {
                return Err(DatasetError::Incompatible(format!(
                    "coordinate '{}' is not a scalar",
                    dim
                )));
            }
            coord.data = coord.data.clone().insert_axis(Axis(0));
            coord.dims.insert(0, dim.to_string());
        }
        for var in self.data_vars.values_mut() {
            var.data = var.data.clone().insert_axis(Axis(0));
            var.dims.insert(0, dim.to_string());
        }
        let mut dims = IndexMap::new();
        dims.insert(dim.to_string(), 1);
        dims.extend(self.dims.drain(..));
        self.dims = dims;
        Ok(())
    }

    /// Removes a length-one dimension, keeping its coordinate as a scalar.
    pub fn squeeze(&mut self, dim: &str) -> DatasetResult<()> {
        match self.dims.get(dim) {
            Some(1) => {}
            Some(_) => {
                return Err(DatasetError::Incompatible(format!(
                    "cannot squeeze dimension '{}' with length > 1",
                    dim
                )));
            }
            None => return Err(DatasetError::DimensionNotFound(dim.to_string())),
        }
        for var in self.coords.values_mut().chain(self.data_vars.values_mut()) {
            if let Some(axis) = var.axis(dim) {
                var.data = var.data.index_axis(Axis(axis), 0).to_owned();
                var.dims.remove(axis);
            }
        }
        self.labels.shift_remove(dim);
        self.dims.shift_remove(dim);
        if self.unlimited.as_deref() == Some(dim) {
            self.unlimited = None;
        }
        Ok(())
    }

    /// Reorders every data variable so that the listed dimensions (those it
    /// has) come first, in the given order.
    pub fn transpose_front(&mut self, front: &[&str]) {
        for var in self.data_vars.values_mut() {
            let mut order: Vec<usize> = front.iter().filter_map(|d| var.axis(d)).collect();
            let rest: Vec<usize> = (0..var.dims.len()).filter(|i| !order.contains(i)).collect();
            order.extend(rest);
            if order.iter().enumerate().all(|(i, &a)| i == a) {
                continue;
            }
            var.dims = order.iter().map(|&a| var.dims[a].clone()).collect();
            var.data = var.data.clone().permuted_axes(IxDyn(&order)).as_standard_layout().into_owned();
        }
    }

    /// Keeps only the given positions along `dim`, in the given order.
    pub fn take(&self, dim: &str, indices: &[usize]) -> DatasetResult<Dataset> {
        let len = self
            .dim_len(dim)
            .ok_or_else(|| DatasetError::DimensionNotFound(dim.to_string()))?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
            return Err(DatasetError::Incompatible(format!(
                "index {} out of bounds for dimension '{}' of length {}",
                bad, dim, len
            )));
        }
        let mut out = self.clone();
        for var in out.coords.values_mut().chain(out.data_vars.values_mut()) {
            if let Some(axis) = var.axis(dim) {
                var.data = var.data.select(Axis(axis), indices);
            }
        }
        if let Some(labels) = out.labels.get_mut(dim) {
            *labels = indices.iter().map(|&i| labels[i].clone()).collect();
        }
        out.dims.insert(dim.to_string(), indices.len());
        Ok(out)
    }

    /// Sorts the dataset along `dim` by its coordinate values (NaN last).
    pub fn sort_by(&self, dim: &str) -> DatasetResult<Dataset> {
        let values = self
            .coord_values(dim)
            .ok_or_else(|| DatasetError::VariableNotFound(dim.to_string()))?;
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        self.take(dim, &order)
    }

    /// Reindexes `dim` onto new coordinate values; positions with no match
    /// in the current coordinate are filled with NaN.
    pub fn reindex(&self, dim: &str, new_values: &[f64]) -> DatasetResult<Dataset> {
        let old_values = self
            .coord_values(dim)
            .ok_or_else(|| DatasetError::VariableNotFound(dim.to_string()))?;
        let mapping: Vec<Option<usize>> = new_values
            .iter()
            .map(|v| old_values.iter().position(|o| o == v))
            .collect();
        let mut out = self.clone();
        for (name, var) in out.data_vars.iter_mut().chain(out.coords.iter_mut()) {
            let Some(axis) = var.axis(dim) else { continue };
            if name == dim {
                continue;
            }
            var.data = reindex_axis(&var.data, axis, &mapping);
        }
        out.coords
            .insert(dim.to_string(), Variable::from_vec(dim, new_values.to_vec()).with_attrs_of(self.coords.get(dim)));
        out.dims.insert(dim.to_string(), new_values.len());
        Ok(out)
    }

    /// NaN-skipping mean over `dim`.
    ///
    /// Data variables without `dim` are kept unchanged; coordinates along
    /// `dim` are dropped together with the dimension.
    pub fn mean_over(&self, dim: &str) -> DatasetResult<Dataset> {
        if !self.dims.contains_key(dim) {
            return Err(DatasetError::DimensionNotFound(dim.to_string()));
        }
        let mut out = Dataset {
            attrs: self.attrs.clone(),
            unlimited: self.unlimited.clone().filter(|u| u != dim),
            ..Dataset::default()
        };
        for (name, var) in &self.data_vars {
            let reduced = match var.axis(dim) {
                Some(axis) => {
                    let mut dims = var.dims.clone();
                    dims.remove(axis);
                    Variable {
                        dims,
                        data: nanmean_axis(&var.data, Axis(axis)),
                        attrs: var.attrs.clone(),
                    }
                }
                None => var.clone(),
            };
            out.add_data_var(name, reduced)?;
        }
        for (name, coord) in &self.coords {
            if !coord.has_dim(dim) {
                out.add_coord(name, coord.clone())?;
            }
        }
        for (d, labels) in &self.labels {
            if d != dim {
                out.labels.insert(d.clone(), labels.clone());
            }
        }
        Ok(out)
    }

    /// Concatenates datasets along `dim`.
    ///
    /// When `dim` is not yet a dimension of a part, a scalar coordinate of the
    /// same name (if any) is promoted and every data variable gains a leading
    /// axis of length one. Other dimensions that carry numeric coordinates are
    /// outer-joined on their values, filling gaps with NaN.
    pub fn concat(parts: &[Dataset], dim: &str) -> DatasetResult<Dataset> {
        if parts.is_empty() {
            return Err(DatasetError::Incompatible("no datasets to concatenate".to_string()));
        }
        let mut parts: Vec<Dataset> = parts
            .iter()
            .map(|p| {
                let mut p = p.clone();
                if !p.has_dim(dim) {
                    p.expand_dims(dim)?;
                }
                Ok(p)
            })
            .collect::<DatasetResult<_>>()?;

        // Outer join on every other dimension that differs between parts.
        let other_dims: Vec<String> = parts[0].dims.keys().filter(|d| *d != dim).cloned().collect();
        for other in &other_dims {
            let lens: Vec<Option<usize>> = parts.iter().map(|p| p.dim_len(other)).collect();
            let values: Vec<Option<Vec<f64>>> = parts.iter().map(|p| p.coord_values(other)).collect();
            let all_equal = lens.windows(2).all(|w| w[0] == w[1])
                && values.windows(2).all(|w| w[0] == w[1]);
            if all_equal {
                continue;
            }
            if values.iter().any(|v| v.is_none()) {
                return Err(DatasetError::Incompatible(format!(
                    "dimension '{}' differs between datasets and has no coordinate to align on",
                    other
                )));
            }
            let mut union: Vec<f64> = values.iter().flatten().flatten().copied().collect();
            union.sort_by(|a, b| a.total_cmp(b));
            union.dedup();
            debug!("Outer join on '{}' with {} values", other, union.len());
            parts = parts
                .iter()
                .map(|p| p.reindex(other, &union))
                .collect::<DatasetResult<_>>()?;
        }

        let first = &parts[0];
        let mut out = Dataset {
            attrs: first.attrs.clone(),
            unlimited: first.unlimited.clone(),
            ..Dataset::default()
        };

        for (name, var) in &first.data_vars {
            let joined = concat_variable(&parts, name, var, dim, |p| p.data_vars.get(name))?;
            out.add_data_var(name, joined)?;
        }
        for (name, coord) in &first.coords {
            let joined = if coord.has_dim(dim) {
                concat_variable(&parts, name, coord, dim, |p| p.coords.get(name))?
            } else {
                coord.clone()
            };
            out.add_coord(name, joined)?;
        }
        for (d, labels) in &first.labels {
            if d == dim {
                let joined: Vec<String> = parts
                    .iter()
                    .flat_map(|p| p.labels.get(dim).cloned().unwrap_or_default())
                    .collect();
                out.set_labels(d, joined)?;
            } else {
                out.labels.insert(d.clone(), labels.clone());
            }
        }
        let total: usize = parts.iter().map(|p| p.dim_len(dim).unwrap_or(0)).sum();
        out.dims.insert(dim.to_string(), total);
        Ok(out)
    }

    /// Opens a NetCDF file and loads every numeric variable into memory.
    ///
    /// `_FillValue` and `missing_value` entries become NaN. One-dimensional
    /// string variables are loaded as labels; other non-numeric variables
    /// are skipped with a warning.
    pub fn open<P: AsRef<Path>>(path: P) -> DatasetResult<Dataset> {
        let path = path.as_ref();
        debug!("Opening NetCDF file: {}", path.display());
        let file = netcdf::open(path)?;
        let mut ds = Dataset::new();

        for dim in file.dimensions() {
            ds.dims.insert(dim.name().to_string(), dim.len());
            if dim.is_unlimited() {
                ds.unlimited = Some(dim.name().to_string());
            }
        }

        let mut coord_names: IndexSet<String> = ds.dims.keys().cloned().collect();
        for var in file.variables() {
            if let Some(Ok(AttributeValue::Str(listed))) = var.attribute_value("coordinates") {
                coord_names.extend(listed.split_whitespace().map(|s| s.to_string()));
            }
        }

        for var in file.variables() {
            let name = var.name().to_string();
            let dims: Vec<String> = var.dimensions().iter().map(|d| d.name().to_string()).collect();
            let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();

            let values = match var.get_values::<f64, _>(..) {
                Ok(values) => values,
                Err(e) if dims.len() == 1 => {
                    let strings: Result<Vec<String>, _> =
                        (0..shape[0]).map(|i| var.get_string([i])).collect();
                    match strings {
                        Ok(strings) => {
                            ds.labels.insert(dims[0].clone(), strings);
                        }
                        Err(_) => warn!("Skipping non-numeric variable '{}': {}", name, e),
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Skipping non-numeric variable '{}': {}", name, e);
                    continue;
                }
            };

            let mut attrs = IndexMap::new();
            for attr in var.attributes() {
                match attr.value() {
                    Ok(value) => {
                        attrs.insert(attr.name().to_string(), value);
                    }
                    Err(e) => debug!("Ignoring attribute {}:{}: {}", name, attr.name(), e),
                }
            }
            let mut data = ArrayD::from_shape_vec(IxDyn(&shape), values)?;
            for key in ["_FillValue", "missing_value"] {
                if let Some(fill) = attrs.shift_remove(key).as_ref().and_then(attribute_as_f64) {
                    data.mapv_inplace(|x| if x == fill { f64::NAN } else { x });
                }
            }
            attrs.shift_remove("coordinates");

            let variable = Variable { dims, data, attrs };
            if coord_names.contains(&name) {
                ds.coords.insert(name, variable);
            } else {
                ds.data_vars.insert(name, variable);
            }
        }

        for attr in file.attributes() {
            if let Ok(value) = attr.value() {
                ds.attrs.insert(attr.name().to_string(), value);
            }
        }
        Ok(ds)
    }

    /// Writes the dataset to `path` through a temporary file.
    pub fn write<P: AsRef<Path>>(&self, path: P, encoding: &Encoding) -> DatasetResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = temporary_path(path);
        if let Err(e) = self.write_netcdf(&tmp, encoding) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::rename(&tmp, path)?;
        debug!("Wrote NetCDF file: {}", path.display());
        Ok(())
    }

    fn write_netcdf(&self, path: &Path, encoding: &Encoding) -> DatasetResult<()> {
        let mut file = netcdf::create(path)?;
        let unlimited = encoding.unlimited.as_deref().or(self.unlimited.as_deref());

        for (name, &len) in &self.dims {
            if Some(name.as_str()) == unlimited {
                file.add_unlimited_dimension(name)?;
            } else {
                file.add_dimension(name, len)?;
            }
        }

        for (dim, values) in &self.labels {
            let mut var = file.add_string_variable(dim, &[dim.as_str()])?;
            for (i, value) in values.iter().enumerate() {
                var.put_string(value, [i])?;
            }
        }

        let auxiliary: Vec<&str> = self
            .coords
            .iter()
            .filter(|(name, c)| !(c.dims.len() == 1 && &c.dims[0] == *name))
            .map(|(name, _)| name.as_str())
            .collect();

        let vars = self
            .coords
            .iter()
            .map(|(n, v)| (n, v, false))
            .chain(self.data_vars.iter().map(|(n, v)| (n, v, true)));
        for (name, var, is_data) in vars {
            let dims: Vec<&str> = var.dims.iter().map(|d| d.as_str()).collect();
            let count: Vec<usize> = var.data.shape().to_vec();
            let start = vec![0usize; count.len()];
            let values: Vec<f64> = var.data.iter().copied().collect();

            if encoding.int32.contains(name) {
                let mut nc_var = file.add_variable::<i32>(name, &dims)?;
                if let Some(&level) = encoding.deflate.get(name) {
                    nc_var.set_compression(level, false)?;
                }
                for (key, value) in &var.attrs {
                    nc_var.put_attribute(key, value.clone())?;
                }
                let ints: Vec<i32> = values.iter().map(|x| x.round() as i32).collect();
                if dims.is_empty() {
                    nc_var.put_values(&ints, ..)?;
                } else {
                    nc_var.put_values(&ints, (start.as_slice(), count.as_slice()))?;
                }
            } else {
                let mut nc_var = file.add_variable::<f64>(name, &dims)?;
                if let Some(&level) = encoding.deflate.get(name) {
                    nc_var.set_compression(level, false)?;
                }
                for (key, value) in &var.attrs {
                    nc_var.put_attribute(key, value.clone())?;
                }
                if is_data && !auxiliary.is_empty() {
                    nc_var.put_attribute("coordinates", auxiliary.join(" "))?;
                }
                if dims.is_empty() {
                    nc_var.put_values(&values, ..)?;
                } else {
                    nc_var.put_values(&values, (start.as_slice(), count.as_slice()))?;
                }
            }
        }

        for (key, value) in &self.attrs {
            file.add_attribute(key, value.clone())?;
        }
        Ok(())
    }
}

impl Variable {
    fn with_attrs_of(mut self, other: Option<&Variable>) -> Self {
        if let Some(other) = other {
            self.attrs = other.attrs.clone();
        }
        self
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Numeric value of a scalar attribute.
pub fn attribute_as_f64(value: &AttributeValue) -> Option<f64> {
    match value {
        AttributeValue::Double(v) => Some(*v),
        AttributeValue::Float(v) => Some(*v as f64),
        AttributeValue::Int(v) => Some(*v as f64),
        AttributeValue::Short(v) => Some(*v as f64),
        AttributeValue::Longlong(v) => Some(*v as f64),
        AttributeValue::Schar(v) => Some(*v as f64),
        AttributeValue::Uchar(v) => Some(*v as f64),
        AttributeValue::Ushort(v) => Some(*v as f64),
        AttributeValue::Uint(v) => Some(*v as f64),
        AttributeValue::Ulonglong(v) => Some(*v as f64),
        _ => None,
    }
}

/// Mean along `axis`, ignoring NaN; all-NaN lanes reduce to NaN.
pub fn nanmean_axis(data: &ArrayD<f64>, axis: Axis) -> ArrayD<f64> {
    data.map_axis(axis, |lane| {
        let (sum, count) = lane
            .iter()
            .filter(|x| !x.is_nan())
            .fold((0.0, 0usize), |(s, c), x| (s + x, c + 1));
        if count == 0 { f64::NAN } else { sum / count as f64 }
    })
}

fn reindex_axis(data: &ArrayD<f64>, axis: usize, mapping: &[Option<usize>]) -> ArrayD<f64> {
    let mut shape = data.shape().to_vec();
    shape[axis] = mapping.len();
    let mut out = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
    for (new_idx, old_idx) in mapping.iter().enumerate() {
        if let Some(old_idx) = old_idx {
            out.index_axis_mut(Axis(axis), new_idx)
                .assign(&data.index_axis(Axis(axis), *old_idx));
        }
    }
    out
}

fn concat_variable<'a, F>(
    parts: &'a [Dataset],
    name: &str,
    template: &Variable,
    dim: &str,
    lookup: F,
) -> DatasetResult<Variable>
where
    F: Fn(&'a Dataset) -> Option<&'a Variable>,
{
    let axis = template
        .axis(dim)
        .ok_or_else(|| DatasetError::Incompatible(format!("variable '{}' lacks dimension '{}'", name, dim)))?;
    let mut views = Vec::with_capacity(parts.len());
    for part in parts {
        let var = lookup(part).ok_or_else(|| {
            DatasetError::Incompatible(format!("variable '{}' missing from one of the datasets", name))
        })?;
        if var.dims != template.dims {
            return Err(DatasetError::Incompatible(format!(
                "variable '{}' has dimensions {:?} in one dataset and {:?} in another",
                name, var.dims, template.dims
            )));
        }
        views.push(var.data.view());
    }
    let data = ndarray::concatenate(Axis(axis), &views)?;
    Ok(Variable {
        dims: template.dims.clone(),
        data,
        attrs: template.attrs.clone(),
    })
}
