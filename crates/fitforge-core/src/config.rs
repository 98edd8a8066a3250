use crate::error::{FfResult, FitError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    Local,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Torque,
    Slurm,
    Sge,
}

/// One declarative variable spec. Specs are applied in declaration order to
/// build the initial population (see `population`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VarSpec {
    Fixed {
        name: String,
        value: f64,
    },
    /// Cartesian product with the working set.
    List {
        name: String,
        values: Vec<f64>,
    },
    /// Zipped with the working set; length must match.
    StaticList {
        name: String,
        values: Vec<f64>,
    },
    Linear {
        name: String,
        first: f64,
        last: f64,
        steps: usize,
    },
    /// Geometrically spaced: `base` raised to equally spaced exponents in
    /// [first, last], rounded to `mantissa` significant digits (0 = exact).
    Log {
        name: String,
        first: f64,
        last: f64,
        steps: usize,
        #[serde(default)]
        mantissa: usize,
        #[serde(default = "default_log_base")]
        base: f64,
    },
    /// Uniform on [min, max).
    Random {
        name: String,
        min: f64,
        max: f64,
    },
    /// 10^(log10(min) + U * (log10(max) - log10(min))).
    Loguniform {
        name: String,
        min: f64,
        max: f64,
    },
    /// exp(ln(mean) + Z * stddev), Z standard normal.
    Lognormrandom {
        name: String,
        mean: f64,
        stddev: f64,
    },
}

fn default_log_base() -> f64 {
    10.0
}

impl VarSpec {
    pub fn name(&self) -> &str {
        match self {
            VarSpec::Fixed { name, .. }
            | VarSpec::List { name, .. }
            | VarSpec::StaticList { name, .. }
            | VarSpec::Linear { name, .. }
            | VarSpec::Log { name, .. }
            | VarSpec::Random { name, .. }
            | VarSpec::Loguniform { name, .. }
            | VarSpec::Lognormrandom { name, .. } => name,
        }
    }
}

/// Per-parameter mutation behavior: with probability `prob`, perturb value v
/// by a uniform draw on [-v*pct, +v*pct].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MutateSpec {
    pub prob: f64,
    pub pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub job_name: String,
    pub model: PathBuf,
    pub exp_files: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub simulator: PathBuf,

    pub max_generations: usize,
    pub permutations: usize,
    /// Replicates per permutation; averaging kicks in above 1.
    pub smoothing: usize,
    /// Objective function selector, 1..=4.
    pub objfunc: u8,

    pub parallel_mode: ParallelMode,
    pub parallel_count: usize,
    pub cluster_type: Option<ClusterType>,
    pub cluster_parallel: usize,
    pub multisim: usize,
    pub job_limit: usize,
    /// Per-simulation walltime in seconds.
    pub walltime_sim: u64,
    pub max_retries: usize,

    pub bootstrap: usize,
    pub bootstrap_chi: f64,
    pub bootstrap_retries: usize,

    pub var: Vec<VarSpec>,
    /// Keyed by parameter name; the `default` entry covers the rest.
    pub mutate: BTreeMap<String, MutateSpec>,
    pub swap_rate: f64,
    /// 0 = no cap.
    pub max_parents: usize,
    pub keep_parents: usize,
    pub min_objfunc_value: f64,
    /// 0 = no culling threshold.
    pub max_objfunc_value: f64,
    pub force_different_parents: bool,
    /// Shaves the selection interval: draws land in [0, sum*(1 - extra_weight/10)).
    pub extra_weight: f64,
    /// 0 = use `permutations` for generation 1 as well.
    pub first_gen_permutations: usize,
    pub stop_when_stalled: bool,

    pub delete_old_files: bool,
    pub seed: Option<u64>,
    pub scan_parameter: Option<String>,

    pub divide_by_init: bool,
    /// 0 = off, otherwise the log base applied to simulation columns.
    pub log_transform_sim_data: f64,
    pub standardize_sim_data: bool,
    pub standardize_exp_data: bool,

    /// Deterministic-ODE path: generate the reaction network once in
    /// generation 1, then reference it from every permutation file.
    pub generate_network: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            job_name: "fit".into(),
            model: PathBuf::new(),
            exp_files: Vec::new(),
            output_dir: PathBuf::new(),
            simulator: PathBuf::new(),
            max_generations: 10,
            permutations: 24,
            smoothing: 1,
            objfunc: 1,
            parallel_mode: ParallelMode::Local,
            parallel_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            cluster_type: None,
            cluster_parallel: 8,
            multisim: 1,
            job_limit: 50,
            walltime_sim: 3600,
            max_retries: 3,
            bootstrap: 0,
            bootstrap_chi: 1.0,
            bootstrap_retries: 3,
            var: Vec::new(),
            mutate: BTreeMap::new(),
            swap_rate: 0.5,
            max_parents: 0,
            keep_parents: 0,
            min_objfunc_value: 0.0,
            max_objfunc_value: 0.0,
            force_different_parents: true,
            extra_weight: 0.0,
            first_gen_permutations: 0,
            stop_when_stalled: false,
            delete_old_files: false,
            seed: None,
            scan_parameter: None,
            divide_by_init: false,
            log_transform_sim_data: 0.0,
            standardize_sim_data: false,
            standardize_exp_data: false,
            generate_network: false,
        }
    }
}

impl FitConfig {
    pub fn load_from_file(path: &Path) -> FfResult<Self> {
        let content = fs::read_to_string(path)?;
        let cfg: FitConfig = serde_json::from_str(&content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to_file(&self, path: &Path) -> FfResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> FfResult<()> {
        let bail = |msg: String| Err(FitError::Config(msg));

        if self.model.as_os_str().is_empty() {
            return bail("'model' is required".into());
        }
        if self.exp_files.is_empty() {
            return bail("at least one entry in 'exp_files' is required".into());
        }
        if self.output_dir.as_os_str().is_empty() {
            return bail("'output_dir' is required".into());
        }
        if self.simulator.as_os_str().is_empty() {
            return bail("'simulator' is required".into());
        }
        if self.permutations < 1 {
            return bail("'permutations' must be at least 1".into());
        }
        if self.max_generations < 1 {
            return bail("'max_generations' must be at least 1".into());
        }
        if self.smoothing < 1 {
            return bail("'smoothing' must be at least 1".into());
        }
        if !(1..=4).contains(&self.objfunc) {
            return bail(format!("'objfunc' must be 1..4, got {}", self.objfunc));
        }
        if self.walltime_sim == 0 {
            return bail("'walltime_sim' must be nonzero".into());
        }
        if !(0.0..=1.0).contains(&self.swap_rate) {
            return bail(format!("'swap_rate' must be in [0,1], got {}", self.swap_rate));
        }
        if !(0.0..10.0).contains(&self.extra_weight) {
            return bail(format!(
                "'extra_weight' must be in [0,10), got {}",
                self.extra_weight
            ));
        }
        if self.first_gen_permutations != 0 && self.first_gen_permutations < self.permutations {
            return bail("'first_gen_permutations' cannot be below 'permutations'".into());
        }
        if self.keep_parents > self.permutations {
            return bail("'keep_parents' cannot exceed 'permutations'".into());
        }
        for (name, m) in &self.mutate {
            if !(0.0..=1.0).contains(&m.prob) || m.pct < 0.0 {
                return bail(format!("bad mutate spec for '{}'", name));
            }
        }
        match self.parallel_mode {
            ParallelMode::Local => {
                if self.parallel_count == 0 {
                    return bail("'parallel_count' must be nonzero in local mode".into());
                }
            }
            ParallelMode::Cluster => {
                if self.cluster_type.is_none() {
                    return bail("'cluster_type' is required in cluster mode".into());
                }
                if self.cluster_parallel == 0 || self.multisim == 0 {
                    return bail("'cluster_parallel' and 'multisim' must be nonzero".into());
                }
            }
        }
        if self.var.is_empty() {
            return bail("at least one 'var' spec is required".into());
        }
        for spec in &self.var {
            validate_spec(spec)?;
        }
        Ok(())
    }

    /// Generation-1 population target.
    pub fn first_gen_target(&self) -> usize {
        if self.first_gen_permutations > self.permutations {
            self.first_gen_permutations
        } else {
            self.permutations
        }
    }

    pub fn base_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| fastrand::u64(..))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.output_dir.join(format!(".lock_{}", self.job_name))
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.log", self.job_name))
    }
}

fn validate_spec(spec: &VarSpec) -> FfResult<()> {
    let bad = |msg: String| Err(FitError::Config(msg));
    match spec {
        VarSpec::Fixed { .. } => Ok(()),
        VarSpec::List { name, values } | VarSpec::StaticList { name, values } => {
            if values.is_empty() {
                bad(format!("var '{}': empty value list", name))
            } else {
                Ok(())
            }
        }
        VarSpec::Linear {
            name, first, last, steps,
        } => {
            if *steps < 2 {
                bad(format!("var '{}': linear needs at least 2 steps", name))
            } else if last < first {
                bad(format!("var '{}': inverted range", name))
            } else {
                Ok(())
            }
        }
        VarSpec::Log {
            name,
            first,
            last,
            steps,
            base,
            ..
        } => {
            if *steps < 2 {
                bad(format!("var '{}': log needs at least 2 steps", name))
            } else if last < first {
                bad(format!("var '{}': inverted range", name))
            } else if *base <= 0.0 || *base == 1.0 {
                bad(format!("var '{}': bad log base {}", name, base))
            } else {
                Ok(())
            }
        }
        VarSpec::Random { name, min, max } => {
            if max <= min {
                bad(format!("var '{}': inverted range", name))
            } else {
                Ok(())
            }
        }
        VarSpec::Loguniform { name, min, max } => {
            if *min <= 0.0 || max <= min {
                bad(format!("var '{}': loguniform needs 0 < min < max", name))
            } else {
                Ok(())
            }
        }
        VarSpec::Lognormrandom { name, mean, stddev } => {
            if *mean <= 0.0 || *stddev < 0.0 {
                bad(format!("var '{}': lognormrandom needs mean > 0", name))
            } else {
                Ok(())
            }
        }
    }
}

/// Content hash identifying a fit job; embedded in the lock file so a stale
/// lock can name the config it belonged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobId {
    pub hash: String,
}

impl JobId {
    pub fn from_config(cfg: &FitConfig) -> Self {
        let mut hasher = Sha256::new();
        let canonical = serde_json::to_string(cfg).unwrap_or_default();
        hasher.update(canonical.as_bytes());
        hasher.update(cfg.job_name.as_bytes());
        let digest = hasher.finalize();
        Self {
            hash: hex::encode(digest),
        }
    }

    pub fn short(&self) -> &str {
        &self.hash[..12.min(self.hash.len())]
    }
}
