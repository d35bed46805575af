//! In-memory sample frames.
//!
//! A `Frame` is one row per sample, ordered named columns of f64: traces,
//! synchronization pulses, task-state flags. All columns share one length and an
//! implicit monotone index at a fixed nominal rate. Frames are transient,
//! produced per session; only extracted traces are persisted.

use rustc_hash::FxHashMap;

use crate::core::error::FlowError;

#[derive(Debug, Clone, Default)]
pub struct Frame {
    names: Vec<String>,
    cols: Vec<Vec<f64>>,
    index: FxHashMap<String, usize>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cols.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Append a column. Every column must match the frame's length.
    pub fn push_column(&mut self, name: &str, values: Vec<f64>) -> Result<(), FlowError> {
        if self.index.contains_key(name) {
            return Err(FlowError::Validation(format!(
                "frame already has column '{}'",
                name
            )));
        }
        if !self.cols.is_empty() && values.len() != self.len() {
            return Err(FlowError::Validation(format!(
                "column '{}' has {} rows, frame has {}",
                name,
                values.len(),
                self.len()
            )));
        }
        self.index.insert(name.to_string(), self.cols.len());
        self.names.push(name.to_string());
        self.cols.push(values);
        Ok(())
    }

    /// Append or overwrite a column.
    pub fn set_column(&mut self, name: &str, values: Vec<f64>) -> Result<(), FlowError> {
        if let Some(&i) = self.index.get(name) {
            if values.len() != self.len() {
                return Err(FlowError::Validation(format!(
                    "column '{}' has {} rows, frame has {}",
                    name,
                    values.len(),
                    self.len()
                )));
            }
            self.cols[i] = values;
            Ok(())
        } else {
            self.push_column(name, values)
        }
    }

    pub fn column(&self, name: &str) -> Result<&[f64], FlowError> {
        self.index
            .get(name)
            .map(|&i| self.cols[i].as_slice())
            .ok_or_else(|| FlowError::Validation(format!("frame has no column '{}'", name)))
    }

    pub fn column_mut(&mut self, name: &str) -> Result<&mut Vec<f64>, FlowError> {
        match self.index.get(name) {
            Some(&i) => Ok(&mut self.cols[i]),
            None => Err(FlowError::Validation(format!(
                "frame has no column '{}'",
                name
            ))),
        }
    }

    pub fn get(&self, name: &str, row: usize) -> Result<f64, FlowError> {
        Ok(self.column(name)?[row])
    }

    pub fn set(&mut self, name: &str, row: usize, value: f64) -> Result<(), FlowError> {
        self.column_mut(name)?[row] = value;
        Ok(())
    }

    /// Keep only the listed columns, in the listed order.
    pub fn select(&self, names: &[String]) -> Result<Frame, FlowError> {
        let mut out = Frame::new();
        for name in names {
            out.push_column(name, self.column(name)?.to_vec())?;
        }
        Ok(out)
    }

    /// Rows `[start, end)` of every column.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Frame, FlowError> {
        if start > end || end > self.len() {
            return Err(FlowError::Validation(format!(
                "row slice {}..{} out of bounds for frame of {} rows",
                start,
                end,
                self.len()
            )));
        }
        let mut out = Frame::new();
        for (name, col) in self.names.iter().zip(&self.cols) {
            out.push_column(name, col[start..end].to_vec())?;
        }
        Ok(out)
    }

    /// Drop the first `n` rows in place.
    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.len());
        for col in &mut self.cols {
            col.drain(..n);
        }
    }

    /// Truncate every column to `n` rows.
    pub fn truncate(&mut self, n: usize) {
        for col in &mut self.cols {
            col.truncate(n);
        }
    }
}
