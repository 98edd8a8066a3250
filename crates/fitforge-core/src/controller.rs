//! The generation controller: a sequential state machine that materializes a
//! generation, dispatches its simulations, averages replicates, scores,
//! summarizes, and decides what happens next (continue, retry, stop). The
//! executor is the only concurrent subsystem; everything here blocks on it.

use crate::average::average_generation;
use crate::bootstrap::{copy_dir_all, BootstrapWeights};
use crate::breeder::{BreedOutcome, Breeder};
use crate::config::{FitConfig, JobId};
use crate::error::{FfResult, FitError};
use crate::executor::{await_batch, dispatcher_for, SimTask};
use crate::model::ModelTemplate;
use crate::population::{generate_initial, ParamSchema, ParamVector};
use crate::summary::{Summary, SummaryRow};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const SNAPSHOT_NAME: &str = "fit.conf.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Generation budget exhausted.
    Completed,
    Stalled,
    ThresholdMet,
    /// Fewer than 3 survivors after culling; results were salvaged.
    SurvivorsExhausted,
    /// Generation retries exhausted; results salvaged from earlier generations.
    RetriesFinalized,
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub best: SummaryRow,
    pub names: Vec<String>,
    pub reason: StopReason,
}

/// Append-only run log the progress monitor tails from its own process.
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn line(&self, msg: &str) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let entry = format!("[{}] {}\n", stamp, msg);
        let _ = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, entry.as_bytes()));
    }
}

/// `.lock_<job>` guard: created at submit, unlinked on final termination.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_lock(cfg: &FitConfig) -> FfResult<LockGuard> {
    fs::create_dir_all(&cfg.output_dir)?;
    let path = cfg.lock_path();
    if path.exists() {
        return Err(FitError::LockPresent(path));
    }
    fs::write(
        &path,
        format!(
            "{} pid={}\n",
            JobId::from_config(cfg).short(),
            std::process::id()
        ),
    )?;
    Ok(LockGuard { path })
}

pub fn remove_stale_lock(cfg: &FitConfig) -> FfResult<()> {
    let path = cfg.lock_path();
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub struct GenerationController {
    cfg: FitConfig,
    template: ModelTemplate,
    schema: ParamSchema,
    base_seed: u64,
    run_log: RunLog,
    net_file: Option<PathBuf>,
}

impl GenerationController {
    pub fn new(mut cfg: FitConfig) -> FfResult<Self> {
        cfg.validate()?;
        fs::create_dir_all(&cfg.output_dir)?;
        let base_seed = cfg.base_seed();
        cfg.seed = Some(base_seed);

        let template = ModelTemplate::load(&cfg.model)?;
        let schema = ParamSchema::from_specs(&cfg.var)?;
        let run_log = RunLog::new(cfg.run_log_path());

        info!(
            "🧬 job '{}' ({} parameters, P={}, seed={})",
            cfg.job_name,
            schema.len(),
            cfg.permutations,
            base_seed
        );

        Ok(Self {
            cfg,
            template,
            schema,
            base_seed,
            run_log,
            net_file: None,
        })
    }

    pub fn schema(&self) -> &ParamSchema {
        &self.schema
    }

    /// Run the full fit from generation 1.
    pub fn run(&mut self, weights: Option<&BootstrapWeights>) -> FfResult<FitOutcome> {
        let mut rng = fastrand::Rng::with_seed(self.base_seed);
        let vectors = generate_initial(&self.cfg, &mut rng)?;
        self.run_from(1, vectors, None, weights)
    }

    /// Continue a fit from `start_gen` with prepared vectors and the parent
    /// summary behind them (None for generation 1).
    pub fn run_from(
        &mut self,
        start_gen: usize,
        mut vectors: Vec<ParamVector>,
        mut parent_summary: Option<Summary>,
        weights: Option<&BootstrapWeights>,
    ) -> FfResult<FitOutcome> {
        let scorer = crate::scorer::Scorer::new(&self.cfg, weights)?;
        self.generate_network_once()?;

        let mut g = start_gen;
        let mut retries = 0usize;

        loop {
            self.run_log.line(&format!("generation {} started", g));
            let summary = self.execute_generation(g, &vectors, parent_summary.as_ref(), &scorer)?;

            let tolerated = self.cfg.permutations.saturating_sub(3);
            if summary.failed_count() > tolerated {
                if retries < self.cfg.max_retries {
                    retries += 1;
                    warn!(
                        "generation {}: {} failed permutations (tolerated {}), retry {}/{}",
                        g,
                        summary.failed_count(),
                        tolerated,
                        retries,
                        self.cfg.max_retries
                    );
                    self.run_log
                        .line(&format!("generation {} retry {}", g, retries));
                    self.discard_generation(g)?;
                    if g == 1 {
                        // Redraw; a fresh stream keeps the retry from being a
                        // bit-identical repeat when randomness is in play.
                        let mut rng = fastrand::Rng::with_seed(
                            self.base_seed.wrapping_add(retries as u64 * 101),
                        );
                        vectors = generate_initial(&self.cfg, &mut rng)?;
                    }
                    continue;
                }
                if g >= 3 {
                    warn!("generation {}: retries exhausted, salvaging earlier results", g);
                    self.discard_generation(g)?;
                    return self.finalize(g - 1, StopReason::RetriesFinalized);
                }
                return Err(FitError::RetriesExhausted(g, self.cfg.max_retries));
            }
            retries = 0;

            if let Some(best) = summary.best() {
                info!("📈 generation {}: best score {}", g, best.score);
                self.run_log
                    .line(&format!("generation {} best {}", g, best.score));
            }

            // Next generation's scoring is done; the previous one's bulky
            // simulation outputs can go.
            if self.cfg.delete_old_files && g >= 2 {
                self.prune_outputs(g - 1)?;
            }

            if g >= self.cfg.max_generations {
                return self.finalize(g, StopReason::Completed);
            }

            let breed_rng = fastrand::Rng::with_seed(self.base_seed.wrapping_add(g as u64 + 1));
            let mut breeder = Breeder::new(&self.cfg, &self.schema, breed_rng);
            match breeder.breed(&summary, parent_summary.as_ref()) {
                Ok(BreedOutcome::Stalled) => return self.finalize(g, StopReason::Stalled),
                Ok(BreedOutcome::ThresholdMet) => {
                    return self.finalize(g, StopReason::ThresholdMet)
                }
                Ok(BreedOutcome::Next {
                    vectors: next,
                    parent_summary: parents,
                }) => {
                    vectors = next;
                    parent_summary = Some(parents);
                    g += 1;
                }
                Err(FitError::InsufficientSurvivors(n)) => {
                    warn!("generation {}: only {} survivors, terminating", g, n);
                    return self.finalize(g, StopReason::SurvivorsExhausted);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// materialize -> dispatch -> await -> average -> score -> summarize.
    fn execute_generation(
        &mut self,
        g: usize,
        vectors: &[ParamVector],
        parent_summary: Option<&Summary>,
        scorer: &crate::scorer::Scorer,
    ) -> FfResult<Summary> {
        let gen_dir = self.gen_dir(g);
        if gen_dir.exists() {
            fs::remove_dir_all(&gen_dir)?;
        }
        fs::create_dir_all(&gen_dir)?;

        self.cfg.save_to_file(&gen_dir.join(SNAPSHOT_NAME))?;
        if let Some(parents) = parent_summary {
            parents.write(&gen_dir.join("parent_summary_diff.txt"), "Permutation")?;
        }

        for (perm, vector) in vectors.iter().enumerate() {
            let out = self.template.perm_path(&gen_dir, perm);
            self.template
                .materialize(&self.schema, vector, &out, self.net_file.as_deref())?;
        }

        let replicates = self.cfg.smoothing;
        let mut tasks = Vec::with_capacity(vectors.len() * replicates);
        for perm in 0..vectors.len() {
            for rep in 1..=replicates {
                let outdir = if replicates > 1 {
                    gen_dir.join(rep.to_string())
                } else {
                    gen_dir.clone()
                };
                tasks.push(SimTask {
                    perm,
                    replicate: rep,
                    model_file: self.template.perm_path(&gen_dir, perm),
                    outdir,
                });
            }
        }

        info!(
            "🚀 generation {}: dispatching {} simulations ({} permutations x {} replicates)",
            g,
            tasks.len(),
            vectors.len(),
            replicates
        );
        let dispatcher = dispatcher_for(&self.cfg)?;
        let mut handle = dispatcher.dispatch(tasks)?;
        let batch = await_batch(handle.as_mut())?;

        let perms: Vec<usize> = (0..vectors.len()).collect();
        let suffixes: Vec<String> = scorer.refs.iter().map(|r| r.stem.clone()).collect();
        let failed: Vec<usize> = if replicates > 1 {
            average_generation(
                &gen_dir,
                self.template.stem(),
                &perms,
                &suffixes,
                replicates,
                self.cfg.scan_parameter.as_deref(),
            )?
        } else {
            batch.failed_permutations(1)
        };
        if !failed.is_empty() {
            warn!("generation {}: {} permutations failed", g, failed.len());
        }

        let (summary, per_ref) = scorer.score_generation(
            &gen_dir,
            self.template.stem(),
            self.template.extension(),
            &self.schema,
            &perms,
            &failed,
        )?;
        summary.write(&self.summary_path(g), "Permutation")?;
        scorer.write_model_diff(&gen_dir.join("perm_model_diff.txt"), &summary, &per_ref)?;
        Ok(summary)
    }

    /// ODE path: run the simulator once against a plain copy of the template
    /// (whose actions still generate the network); every permutation file
    /// then references the resulting `.net` instead of regenerating it.
    fn generate_network_once(&mut self) -> FfResult<()> {
        if !self.cfg.generate_network || self.net_file.is_some() {
            return Ok(());
        }
        let net_model = self.cfg.output_dir.join(format!(
            "{}_net.{}",
            self.template.stem(),
            self.template.extension()
        ));
        let net_file = self
            .cfg
            .output_dir
            .join(format!("{}_net.net", self.template.stem()));

        if !net_file.exists() {
            self.template.write_plain(&net_model)?;
            info!("🕸️  generating reaction network once");
            let status = std::process::Command::new(&self.cfg.simulator)
                .arg("--outdir")
                .arg(&self.cfg.output_dir)
                .arg(&net_model)
                .status()
                .map_err(|e| FitError::Executor(format!("network generation spawn: {}", e)))?;
            if !status.success() || !net_file.exists() {
                return Err(FitError::Executor(format!(
                    "network generation failed (exit {}, expected {})",
                    status,
                    net_file.display()
                )));
            }
        }
        self.net_file = Some(net_file);
        Ok(())
    }

    fn gen_dir(&self, g: usize) -> PathBuf {
        self.cfg.output_dir.join(g.to_string())
    }

    fn summary_path(&self, g: usize) -> PathBuf {
        self.cfg.output_dir.join(format!("{}_summary_diff.txt", g))
    }

    fn discard_generation(&self, g: usize) -> FfResult<()> {
        let dir = self.gen_dir(g);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let summary = self.summary_path(g);
        if summary.exists() {
            fs::remove_file(summary)?;
        }
        Ok(())
    }

    /// Drop a generation's simulation outputs (gdat, capture, sentinels,
    /// replicate subdirectories); models, summaries, and the config snapshot
    /// stay.
    fn prune_outputs(&self, g: usize) -> FfResult<()> {
        let dir = self.gen_dir(g);
        if !dir.exists() {
            return Ok(());
        }
        let entries: Vec<_> = fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() && name.parse::<usize>().is_ok() {
                fs::remove_dir_all(&path)?;
            } else if name.ends_with(".gdat")
                || name.ends_with(".BNG_OUT")
                || name.ends_with(".finished")
                || name.ends_with(".failed")
            {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Consolidate summaries from generations 1..=g_last into `Results/` and
    /// report the overall best permutation.
    fn finalize(&mut self, g_last: usize, reason: StopReason) -> FfResult<FitOutcome> {
        let results_dir = self.cfg.output_dir.join("Results");
        fs::create_dir_all(&results_dir)?;

        let mut all = Summary::new(self.schema.names.clone());
        let mut best_gen: Option<(usize, SummaryRow)> = None;
        for g in 1..=g_last {
            let Ok(summary) = Summary::load(&self.summary_path(g)) else {
                continue;
            };
            if let Some(row) = summary.best() {
                let better = best_gen
                    .as_ref()
                    .map(|(_, b)| row.score < b.score)
                    .unwrap_or(true);
                if better {
                    best_gen = Some((g, row.clone()));
                }
            }
            all.rows.extend(summary.rows);
        }
        let Some((best_g, best)) = best_gen else {
            return Err(FitError::Resume("no generation summaries to consolidate".into()));
        };
        all.sort();
        all.write(&results_dir.join("sorted_params.txt"), "Permutation")?;

        self.copy_best_outputs(best_g, best.perm, &results_dir)?;

        info!(
            "🏁 fit finished ({:?}): best score {} from generation {} permutation {}",
            reason, best.score, best_g, best.perm
        );
        self.run_log.line(&format!(
            "finished {:?} best {} gen {} perm {}",
            reason, best.score, best_g, best.perm
        ));

        Ok(FitOutcome {
            best,
            names: self.schema.names.clone(),
            reason,
        })
    }

    /// Copy the winning permutation's model and outputs into `Results/`.
    fn copy_best_outputs(&self, g: usize, perm: usize, results_dir: &Path) -> FfResult<()> {
        let gen_dir = self.gen_dir(g);
        let base = format!("{}_perm{}", self.template.stem(), perm);
        if !gen_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&gen_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&base) && !name.ends_with(".finished") && !name.ends_with(".failed")
            {
                fs::copy(entry.path(), results_dir.join(&name))?;
            }
        }
        Ok(())
    }

    /// Offline consolidation for the `results` verb: use whatever generation
    /// summaries exist.
    pub fn consolidate(&mut self) -> FfResult<FitOutcome> {
        let mut last = 0usize;
        for g in 1.. {
            if self.summary_path(g).exists() {
                last = g;
            } else {
                break;
            }
        }
        if last == 0 {
            return Err(FitError::Resume("no generation summaries found".into()));
        }
        self.finalize(last, StopReason::Completed)
    }
}

/// Resume a fit from the highest generation that wrote a config snapshot.
/// Partial outputs in that generation are discarded (its snapshot survives),
/// higher generations are deleted, and its vectors are rebuilt
/// deterministically from the preceding summaries.
pub fn resume(conf_cfg: &FitConfig, new_max_generations: Option<usize>) -> FfResult<FitOutcome> {
    let output_dir = conf_cfg.output_dir.clone();
    let mut latest: Option<usize> = None;
    if output_dir.exists() {
        for entry in fs::read_dir(&output_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(g) = name.parse::<usize>() {
                if entry.path().join(SNAPSHOT_NAME).exists() && latest.map_or(true, |l| g > l) {
                    latest = Some(g);
                }
            }
        }
    }
    let g = latest.ok_or_else(|| {
        FitError::Resume(format!(
            "no recoverable generation under {}",
            output_dir.display()
        ))
    })?;

    let mut cfg = FitConfig::load_from_file(&output_dir.join(g.to_string()).join(SNAPSHOT_NAME))?;
    if let Some(n) = new_max_generations {
        cfg.max_generations = n;
        cfg.save_to_file(&output_dir.join(g.to_string()).join(SNAPSHOT_NAME))?;
    }
    info!("⏪ resuming '{}' at generation {}", cfg.job_name, g);

    // Drop everything newer than the resume point, plus the resumed
    // generation's own partial state (models get re-materialized).
    let entries: Vec<_> = fs::read_dir(&output_dir)?.collect::<Result<_, _>>()?;
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(other) = name.trim_end_matches("_summary_diff.txt").parse::<usize>() {
            let is_dir = entry.path().is_dir();
            if (is_dir && other > g) || (!is_dir && other >= g) {
                if is_dir {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        } else if name == "Results" && entry.path().is_dir() {
            fs::remove_dir_all(entry.path())?;
        }
    }
    let gen_dir = output_dir.join(g.to_string());
    let entries: Vec<_> = fs::read_dir(&gen_dir)?.collect::<Result<_, _>>()?;
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != SNAPSHOT_NAME {
            if entry.path().is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
    }

    let mut controller = GenerationController::new(cfg.clone())?;
    let base_seed = cfg.seed.ok_or_else(|| {
        FitError::Resume("config snapshot carries no seed; cannot rebuild vectors".into())
    })?;

    if g == 1 {
        let mut rng = fastrand::Rng::with_seed(base_seed);
        let vectors = generate_initial(&cfg, &mut rng)?;
        return controller.run_from(1, vectors, None, None);
    }

    let prev_summary = Summary::load(&output_dir.join(format!("{}_summary_diff.txt", g - 1)))?;
    let prev_parents = Summary::load(&output_dir.join((g - 1).to_string()).join("parent_summary_diff.txt")).ok();
    let schema = ParamSchema::from_specs(&cfg.var)?;
    let breed_rng = fastrand::Rng::with_seed(base_seed.wrapping_add(g as u64));
    let mut breeder = Breeder::new(&cfg, &schema, breed_rng);
    match breeder.breed(&prev_summary, prev_parents.as_ref())? {
        BreedOutcome::Next {
            vectors,
            parent_summary,
        } => controller.run_from(g, vectors, Some(parent_summary), None),
        // The original run continued into generation g, so a deterministic
        // re-breed cannot stop here; treat it as already-finished anyway.
        BreedOutcome::Stalled | BreedOutcome::ThresholdMet => controller.consolidate(),
    }
}

/// Copy `Results` to a sibling directory (bootstrap keeps one per run).
pub fn archive_results(output_dir: &Path, suffix: usize) -> FfResult<()> {
    let src = output_dir.join("Results");
    let dst = output_dir.join(format!("Results_{}", suffix));
    if dst.exists() {
        fs::remove_dir_all(&dst)?;
    }
    copy_dir_all(&src, &dst)?;
    Ok(())
}
