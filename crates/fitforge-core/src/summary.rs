//! Generation summary artifacts: ranked `(permutation, score, vector)` rows
//! persisted as `<g>_summary_diff.txt`, parent summaries, and the
//! consolidated `Results/sorted_params.txt`.

use crate::error::{FfResult, FitError};
use crate::SENTINEL_SCORE;
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub perm: usize,
    pub score: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub names: Vec<String>,
    pub rows: Vec<SummaryRow>,
}

impl Summary {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            rows: Vec::new(),
        }
    }

    /// Ascending by score; stable, so tied rows keep their current order.
    pub fn sort(&mut self) {
        self.rows
            .sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal));
    }

    pub fn best(&self) -> Option<&SummaryRow> {
        self.rows.first()
    }

    pub fn failed_count(&self) -> usize {
        self.rows.iter().filter(|r| r.score >= SENTINEL_SCORE).count()
    }

    /// Union of two summaries (rows are copied; caller sorts/truncates).
    pub fn merged(&self, other: &Summary) -> Summary {
        let mut rows = self.rows.clone();
        rows.extend(other.rows.iter().cloned());
        Summary {
            names: self.names.clone(),
            rows,
        }
    }

    pub fn write(&self, path: &Path, id_label: &str) -> FfResult<()> {
        let mut out = String::new();
        let _ = write!(out, "{} Chi-Sq", id_label);
        for n in &self.names {
            let _ = write!(out, " {}", n);
        }
        out.push('\n');
        for row in &self.rows {
            let _ = write!(out, "{} {}", row.perm, row.score);
            for v in &row.values {
                let _ = write!(out, " {}", v);
            }
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }

    pub fn load(path: &Path) -> FfResult<Summary> {
        let err = |msg: String| FitError::Table {
            path: path.to_path_buf(),
            msg,
        };
        let text = fs::read_to_string(path)?;
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());

        let header = lines.next().ok_or_else(|| err("empty summary".into()))?;
        let mut head_toks = header.split_whitespace();
        let _id_label = head_toks.next();
        let chi = head_toks.next();
        if chi != Some("Chi-Sq") {
            return Err(err("malformed summary header".into()));
        }
        let names: Vec<String> = head_toks.map(str::to_string).collect();

        let mut rows = Vec::new();
        for line in lines {
            let mut toks = line.split_whitespace();
            let perm = toks
                .next()
                .and_then(|t| t.parse::<usize>().ok())
                .ok_or_else(|| err(format!("bad permutation id in '{}'", line)))?;
            let score = toks
                .next()
                .and_then(|t| t.parse::<f64>().ok())
                .ok_or_else(|| err(format!("bad score in '{}'", line)))?;
            let values: Vec<f64> = toks
                .map(|t| {
                    t.parse::<f64>()
                        .map_err(|_| err(format!("bad value '{}'", t)))
                })
                .collect::<Result<_, _>>()?;
            if values.len() != names.len() {
                return Err(err(format!(
                    "row for permutation {} has {} values for {} parameters",
                    perm,
                    values.len(),
                    names.len()
                )));
            }
            rows.push(SummaryRow { perm, score, values });
        }
        Ok(Summary { names, rows })
    }
}
