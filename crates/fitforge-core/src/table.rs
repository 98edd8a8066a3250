//! Whitespace-separated tabular files: experimental `.exp` references,
//! simulator `.gdat` outputs, and bootstrap weight files. The header line
//! starts with `#` followed by column names; rows are floats or the literal
//! `NaN` (ignore-this-point in reference data).

use crate::error::{FfResult, FitError};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    pub path: PathBuf,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl TableData {
    pub fn load(path: &Path) -> FfResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| FitError::Table {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> FfResult<Self> {
        let err = |msg: String| FitError::Table {
            path: path.to_path_buf(),
            msg,
        };

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<f64>> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                // First comment line is the header; later comments are noise.
                if columns.is_empty() {
                    columns = rest.split_whitespace().map(str::to_string).collect();
                }
                continue;
            }
            if columns.is_empty() {
                return Err(err(format!("line {}: data before header", lineno + 1)));
            }
            let mut row = Vec::with_capacity(columns.len());
            for tok in line.split_whitespace() {
                let v = if tok.eq_ignore_ascii_case("nan") {
                    f64::NAN
                } else {
                    tok.parse::<f64>()
                        .map_err(|_| err(format!("line {}: bad value '{}'", lineno + 1, tok)))?
                };
                row.push(v);
            }
            if row.len() != columns.len() {
                return Err(err(format!(
                    "line {}: {} values for {} columns",
                    lineno + 1,
                    row.len(),
                    columns.len()
                )));
            }
            rows.push(row);
        }

        if columns.is_empty() {
            return Err(err("missing header line".into()));
        }

        Ok(TableData {
            path: path.to_path_buf(),
            columns,
            rows,
        })
    }

    pub fn write(&self, path: &Path) -> FfResult<()> {
        let mut out = String::new();
        out.push('#');
        for c in &self.columns {
            let _ = write!(out, " {}", c);
        }
        out.push('\n');
        for row in &self.rows {
            let mut first = true;
            for v in row {
                if !first {
                    out.push(' ');
                }
                if v.is_nan() {
                    out.push_str("NaN");
                } else {
                    let _ = write!(out, "{}", v);
                }
                first = false;
            }
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }

    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// The independent-variable column used to align rows: the scan parameter
    /// when configured, otherwise `time`.
    pub fn control_index(&self, scan_parameter: Option<&str>) -> FfResult<usize> {
        let name = scan_parameter.unwrap_or("time");
        self.col_index(name).ok_or_else(|| FitError::Table {
            path: self.path.clone(),
            msg: format!("missing control column '{}'", name),
        })
    }

    /// Index of the paired `<name>_SD` standard-deviation column, if present.
    pub fn sd_index(&self, name: &str) -> Option<usize> {
        self.col_index(&format!("{}_SD", name))
    }

    pub fn is_sd_column(name: &str) -> bool {
        name.ends_with("_SD")
    }

    /// Columns that carry observable data: everything except the control
    /// column and `_SD` partners.
    pub fn data_columns(&self, control: usize) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(i, name)| *i != control && !Self::is_sd_column(name))
            .map(|(i, _)| i)
            .collect()
    }
}
