//! Scoring: align simulation outputs against reference datasets row by row,
//! accumulate the selected objective's residuals (optionally weighted by a
//! bootstrap map), and emit the ranked generation summary. Anything that
//! cannot be scored degrades to the sentinel score instead of an error, so a
//! bad permutation never takes the generation down with it.

pub mod objective;

pub use objective::Objective;

use crate::bootstrap::BootstrapWeights;
use crate::config::FitConfig;
use crate::error::{FfResult, FitError};
use crate::model::read_changelog;
use crate::population::ParamSchema;
use crate::summary::{Summary, SummaryRow};
use crate::table::TableData;
use crate::{CONTROL_EPSILON, SENTINEL_SCORE};
use rayon::prelude::*;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, warn};

const ZERO_REPLACEMENT: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default)]
struct Preprocess {
    divide_by_init: bool,
    /// 0 = off, else log base.
    log_base: f64,
    standardize_sim: bool,
    standardize_exp: bool,
}

/// One reference file, preprocessed and indexed for scoring.
#[derive(Debug, Clone)]
pub struct RefSet {
    pub stem: String,
    pub table: TableData,
    pub control: usize,
    pub data_cols: Vec<usize>,
    /// Mean of non-NaN reference values per data column (objective 4).
    col_means: Vec<f64>,
    /// Bootstrap weights per (row, data-column slot), when bootstrapping.
    weights: Option<Vec<Vec<u32>>>,
}

#[derive(Debug, Clone)]
pub struct PermScore {
    pub total: f64,
    pub per_ref: Vec<f64>,
    pub failed: bool,
}

pub struct Scorer {
    objective: Objective,
    prep: Preprocess,
    scan_parameter: Option<String>,
    pub refs: Vec<RefSet>,
}

impl Scorer {
    pub fn new(cfg: &FitConfig, weights: Option<&BootstrapWeights>) -> FfResult<Self> {
        let objective = Objective::from_selector(cfg.objfunc)?;
        let prep = Preprocess {
            divide_by_init: cfg.divide_by_init,
            log_base: cfg.log_transform_sim_data,
            standardize_sim: cfg.standardize_sim_data,
            standardize_exp: cfg.standardize_exp_data,
        };

        let mut refs = Vec::with_capacity(cfg.exp_files.len());
        for path in &cfg.exp_files {
            let mut table = TableData::load(path)?;
            let control = table.control_index(cfg.scan_parameter.as_deref())?;
            let data_cols = table.data_columns(control);
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("data")
                .to_string();

            if objective.needs_sd_columns() {
                for &c in &data_cols {
                    if table.sd_index(&table.columns[c]).is_none() {
                        return Err(FitError::Config(format!(
                            "objective 2 needs an {}_SD column in {}",
                            table.columns[c],
                            path.display()
                        )));
                    }
                }
            }

            if prep.standardize_exp {
                for &c in &data_cols {
                    standardize_column(&mut table, c, true);
                }
            }

            let col_means = data_cols
                .iter()
                .map(|&c| {
                    let vals: Vec<f64> = table
                        .rows
                        .iter()
                        .map(|r| r[c])
                        .filter(|v| !v.is_nan())
                        .collect();
                    if vals.is_empty() {
                        0.0
                    } else {
                        vals.iter().sum::<f64>() / vals.len() as f64
                    }
                })
                .collect();

            // Re-order bootstrap weight columns into data_cols order; columns
            // the weight file does not know keep weight 1.
            let ref_weights = weights.and_then(|w| {
                w.per_ref.iter().find(|rw| rw.stem == stem).map(|rw| {
                    let mut acc = vec![vec![1u32; data_cols.len()]; table.rows.len()];
                    for (slot, &c) in data_cols.iter().enumerate() {
                        if let Some(src) = rw.columns.iter().position(|n| *n == table.columns[c]) {
                            for (ri, row) in rw.rows.iter().enumerate().take(acc.len()) {
                                acc[ri][slot] = row[src];
                            }
                        }
                    }
                    acc
                })
            });

            refs.push(RefSet {
                stem,
                table,
                control,
                data_cols,
                col_means,
                weights: ref_weights,
            });
        }

        Ok(Self {
            objective,
            prep,
            scan_parameter: cfg.scan_parameter.clone(),
            refs,
        })
    }

    /// Score one permutation's simulation outputs, ordered like `self.refs`.
    pub fn score_tables(&self, sims: &[TableData]) -> PermScore {
        let mut per_ref = Vec::with_capacity(self.refs.len());
        let mut total = 0.0;
        for (rs, sim) in self.refs.iter().zip(sims) {
            match self.score_against(rs, sim) {
                Some(sum) if sum.is_finite() => {
                    per_ref.push(sum.sqrt());
                    total += sum;
                }
                _ => {
                    return PermScore {
                        total: SENTINEL_SCORE,
                        per_ref: vec![SENTINEL_SCORE; self.refs.len()],
                        failed: true,
                    }
                }
            }
        }
        PermScore {
            total: total.sqrt(),
            per_ref,
            failed: false,
        }
    }

    /// None marks the permutation unscorable (sentinel).
    fn score_against(&self, rs: &RefSet, sim: &TableData) -> Option<f64> {
        let mut sim = sim.clone();
        let sim_control = sim.control_index(self.scan_parameter.as_deref()).ok()?;
        preprocess_sim(&mut sim, sim_control, self.prep);

        // Column handles in the simulation output, by reference column name.
        let sim_cols: Vec<usize> = rs
            .data_cols
            .iter()
            .map(|&c| sim.col_index(&rs.table.columns[c]))
            .collect::<Option<Vec<_>>>()
            .or_else(|| {
                debug!("{}: simulation output missing reference columns", rs.stem);
                None
            })?;

        // Simulation must reach the reference's final control value.
        let last_ref = rs.table.rows.last()?[rs.control];
        let last_sim = sim.rows.last()?[sim_control];
        if last_sim < last_ref - CONTROL_EPSILON {
            debug!(
                "{}: simulation ends at {} before reference end {}",
                rs.stem, last_sim, last_ref
            );
            return None;
        }

        let mut sum = 0.0;
        let mut si = 0usize;
        for (ri, ref_row) in rs.table.rows.iter().enumerate() {
            let target = ref_row[rs.control];
            while si < sim.rows.len() && sim.rows[si][sim_control] < target - CONTROL_EPSILON {
                si += 1;
            }
            if si >= sim.rows.len()
                || (sim.rows[si][sim_control] - target).abs() > CONTROL_EPSILON
            {
                debug!("{}: no simulation row at control value {}", rs.stem, target);
                return None;
            }

            for (slot, (&rc, &sc)) in rs.data_cols.iter().zip(&sim_cols).enumerate() {
                let e = ref_row[rc];
                if e.is_nan() {
                    continue;
                }
                let s = sim.rows[si][sc];
                let residual = match self.objective {
                    Objective::Absolute => (e - s).powi(2),
                    Objective::Sd => {
                        let sd_col = rs.table.sd_index(&rs.table.columns[rc])?;
                        let sigma = ref_row[sd_col];
                        if sigma == 0.0 || !sigma.is_finite() {
                            return None;
                        }
                        ((e - s) / sigma).powi(2)
                    }
                    Objective::Relative => {
                        if e == 0.0 {
                            return None;
                        }
                        ((e - s) / e).powi(2)
                    }
                    Objective::ColumnMean => {
                        let mu = rs.col_means[slot];
                        if mu == 0.0 {
                            return None;
                        }
                        ((e - s) / mu).powi(2)
                    }
                };
                let weight = rs
                    .weights
                    .as_ref()
                    .map(|w| w[ri][slot] as f64)
                    .unwrap_or(1.0);
                sum += residual * weight;
            }
        }
        Some(sum)
    }

    /// Score a whole generation from disk: recover each permutation's vector
    /// from its model change log, load its (averaged) outputs, and rank.
    /// `failed_perms` are pre-marked by the executor/averager and skip
    /// straight to the sentinel.
    pub fn score_generation(
        &self,
        gen_dir: &Path,
        model_stem: &str,
        model_ext: &str,
        schema: &ParamSchema,
        perms: &[usize],
        failed_perms: &[usize],
    ) -> FfResult<(Summary, Vec<(usize, Vec<f64>)>)> {
        let scored: Vec<(SummaryRow, Vec<f64>)> = perms
            .par_iter()
            .map(|&perm| {
                let base = format!("{}_perm{}", model_stem, perm);
                let model_path = gen_dir.join(format!("{}.{}", base, model_ext));
                let values = read_changelog(&model_path, schema).unwrap_or_else(|e| {
                    warn!("perm {}: cannot recover vector: {}", perm, e);
                    vec![f64::NAN; schema.len()]
                });

                if failed_perms.contains(&perm) {
                    return (
                        SummaryRow {
                            perm,
                            score: SENTINEL_SCORE,
                            values,
                        },
                        vec![SENTINEL_SCORE; self.refs.len()],
                    );
                }

                let mut sims = Vec::with_capacity(self.refs.len());
                for rs in &self.refs {
                    let path = gen_dir.join(format!("{}_{}.gdat", base, rs.stem));
                    match TableData::load(&path) {
                        Ok(t) => sims.push(t),
                        Err(e) => {
                            debug!("perm {}: missing output {}: {}", perm, path.display(), e);
                            return (
                                SummaryRow {
                                    perm,
                                    score: SENTINEL_SCORE,
                                    values,
                                },
                                vec![SENTINEL_SCORE; self.refs.len()],
                            );
                        }
                    }
                }

                let ps = self.score_tables(&sims);
                (
                    SummaryRow {
                        perm,
                        score: ps.total,
                        values,
                    },
                    ps.per_ref,
                )
            })
            .collect();

        let mut summary = Summary::new(schema.names.clone());
        let mut per_ref = Vec::with_capacity(scored.len());
        for (row, refs) in scored {
            per_ref.push((row.perm, refs));
            summary.rows.push(row);
        }
        summary.sort();
        Ok((summary, per_ref))
    }

    /// `perm_model_diff` artifact: the per-reference breakdown.
    pub fn write_model_diff(
        &self,
        path: &Path,
        summary: &Summary,
        per_ref: &[(usize, Vec<f64>)],
    ) -> FfResult<()> {
        let mut out = String::from("Permutation");
        for rs in &self.refs {
            let _ = write!(out, " {}", rs.stem);
        }
        out.push_str(" Total\n");
        for row in &summary.rows {
            let _ = write!(out, "{}", row.perm);
            let refs = per_ref
                .iter()
                .find(|(p, _)| *p == row.perm)
                .map(|(_, r)| r.as_slice())
                .unwrap_or(&[]);
            for v in refs {
                let _ = write!(out, " {}", v);
            }
            let _ = writeln!(out, " {}", row.score);
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

/// Simulation-side preprocessing, in the documented order.
fn preprocess_sim(sim: &mut TableData, control: usize, prep: Preprocess) {
    if sim.rows.is_empty() {
        return;
    }
    let cols: Vec<usize> = sim.data_columns(control);

    if prep.divide_by_init {
        for &c in &cols {
            let mut init = sim.rows[0][c];
            if init == 0.0 {
                init = ZERO_REPLACEMENT;
            }
            for row in &mut sim.rows {
                row[c] /= init;
            }
            sim.rows[0][c] = 1.0;
        }
    }

    if prep.log_base > 0.0 {
        let denom = prep.log_base.ln();
        for &c in &cols {
            for row in &mut sim.rows {
                let v = if row[c] == 0.0 { ZERO_REPLACEMENT } else { row[c] };
                row[c] = v.ln() / denom;
            }
        }
    }

    if prep.standardize_sim {
        for &c in &cols {
            standardize_column(sim, c, false);
        }
    }
}

/// Subtract the mean and divide by the sample standard deviation (N-1).
/// Skipped entirely when the mean is zero; with `skip_nan`, NaN entries are
/// excluded from the statistics and passed through untouched.
fn standardize_column(table: &mut TableData, col: usize, skip_nan: bool) {
    let vals: Vec<f64> = table
        .rows
        .iter()
        .map(|r| r[col])
        .filter(|v| !skip_nan || !v.is_nan())
        .collect();
    if vals.len() < 2 {
        return;
    }
    let mean = vals.iter().sum::<f64>() / vals.len() as f64;
    if mean == 0.0 {
        return;
    }
    let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (vals.len() - 1) as f64;
    let sd = var.sqrt();
    for row in &mut table.rows {
        let v = row[col];
        if skip_nan && v.is_nan() {
            continue;
        }
        row[col] = (v - mean) / sd;
    }
}
