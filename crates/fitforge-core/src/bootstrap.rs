//! Bootstrap outer loop: resample per-point reference weights, rerun the
//! whole fit, and collect the distribution of best-fit parameters. Each
//! iteration must beat `bootstrap_chi` to count; iterations that do not are
//! retried with a perturbed seed until `bootstrap_retries` runs out.

use crate::config::FitConfig;
use crate::controller::{FitOutcome, GenerationController};
use crate::error::{FfResult, FitError};
use crate::summary::{Summary, SummaryRow};
use crate::table::TableData;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Multinomial resample counts for one reference file: one integer per
/// (row, data column), column sums equal to the row count.
#[derive(Debug, Clone)]
pub struct RefWeights {
    pub stem: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapWeights {
    pub per_ref: Vec<RefWeights>,
}

impl BootstrapWeights {
    /// Draw fresh weights for every reference file: per column, sample row
    /// indices uniformly with replacement N times and count the hits.
    pub fn generate(cfg: &FitConfig, rng: &mut fastrand::Rng) -> FfResult<Self> {
        let mut per_ref = Vec::with_capacity(cfg.exp_files.len());
        for path in &cfg.exp_files {
            let table = TableData::load(path)?;
            let control = table.control_index(cfg.scan_parameter.as_deref())?;
            let data_cols = table.data_columns(control);
            let n = table.rows.len();

            let mut rows = vec![vec![0u32; data_cols.len()]; n];
            for slot in 0..data_cols.len() {
                for _ in 0..n {
                    rows[rng.usize(0..n)][slot] += 1;
                }
            }

            per_ref.push(RefWeights {
                stem: path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("data")
                    .to_string(),
                columns: data_cols
                    .iter()
                    .map(|&c| table.columns[c].clone())
                    .collect(),
                rows,
            });
        }
        Ok(Self { per_ref })
    }

    /// Reload previously written weight files from `dir`.
    pub fn load(cfg: &FitConfig, dir: &Path) -> FfResult<Self> {
        let mut per_ref = Vec::with_capacity(cfg.exp_files.len());
        for path in &cfg.exp_files {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("data")
                .to_string();
            let table = TableData::load(&dir.join(format!("{}_weights.txt", stem)))?;
            per_ref.push(RefWeights {
                stem,
                columns: table.columns.clone(),
                rows: table
                    .rows
                    .iter()
                    .map(|row| row.iter().map(|&v| v as u32).collect())
                    .collect(),
            });
        }
        Ok(Self { per_ref })
    }

    /// One weight file per reference, `<stem>_weights.txt` under `dir`.
    pub fn write(&self, dir: &Path) -> FfResult<()> {
        for rw in &self.per_ref {
            let mut out = String::from("#");
            for c in &rw.columns {
                let _ = write!(out, " {}", c);
            }
            out.push('\n');
            for row in &rw.rows {
                let line: Vec<String> = row.iter().map(|w| w.to_string()).collect();
                out.push_str(&line.join(" "));
                out.push('\n');
            }
            fs::write(dir.join(format!("{}_weights.txt", rw.stem)), out)?;
        }
        Ok(())
    }
}

pub struct BootstrapController {
    cfg: FitConfig,
}

impl BootstrapController {
    pub fn new(cfg: FitConfig) -> Self {
        Self { cfg }
    }

    pub fn run(&self) -> FfResult<FitOutcome> {
        fs::create_dir_all(&self.cfg.output_dir)?;
        let base_seed = self.cfg.base_seed();
        let total = self.cfg.bootstrap;
        let params_path = self.cfg.output_dir.join("params.txt");
        let mut results: Option<Summary> = None;
        let mut last_outcome = None;

        for run in 1..=total {
            let mut weight_rng = fastrand::Rng::with_seed(base_seed.wrapping_add(7000 + run as u64));
            let weights = BootstrapWeights::generate(&self.cfg, &mut weight_rng)?;
            weights.write(&self.cfg.output_dir)?;

            let mut retries = 0usize;
            let outcome = loop {
                self.reset_fit_artifacts()?;

                let mut fit_cfg = self.cfg.clone();
                fit_cfg.seed = Some(
                    base_seed
                        .wrapping_add(run as u64 * 1000)
                        .wrapping_add(retries as u64),
                );
                let mut controller = GenerationController::new(fit_cfg)?;
                let outcome = controller.run(Some(&weights))?;

                if outcome.best.score < self.cfg.bootstrap_chi {
                    break outcome;
                }
                retries += 1;
                if retries > self.cfg.bootstrap_retries {
                    return Err(FitError::BootstrapExhausted {
                        run,
                        retries: self.cfg.bootstrap_retries,
                    });
                }
                warn!(
                    "bootstrap run {}: best score {} >= {}, retrying ({}/{})",
                    run, outcome.best.score, self.cfg.bootstrap_chi, retries, self.cfg.bootstrap_retries
                );
            };

            info!(
                "bootstrap run {}/{} accepted with score {}",
                run, total, outcome.best.score
            );

            let table = results.get_or_insert_with(|| Summary::new(outcome.names.clone()));
            table.rows.push(SummaryRow {
                perm: run,
                score: outcome.best.score,
                values: outcome.best.values.clone(),
            });
            table.write(&params_path, "Run")?;

            crate::controller::archive_results(&self.cfg.output_dir, run)?;
            last_outcome = Some(outcome);
        }

        last_outcome.ok_or_else(|| FitError::Config("bootstrap count is zero".into()))
    }

    /// Clear per-fit artifacts (generation directories, summaries, Results)
    /// so the next iteration starts clean; weight files and the bootstrap
    /// results table survive.
    fn reset_fit_artifacts(&self) -> FfResult<()> {
        let dir = &self.cfg.output_dir;
        if !dir.exists() {
            return Ok(());
        }
        let entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() && (name == "Results" || name.parse::<usize>().is_ok()) {
                fs::remove_dir_all(&path)?;
            } else if name.ends_with("_summary_diff.txt") {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

pub fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
