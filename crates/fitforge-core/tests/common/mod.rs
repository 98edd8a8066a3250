//! Shared fixtures: a workspace with a template model, reference data, and a
//! stub simulator script that reads the fitted rate from the model change
//! log and writes an exponential-decay trace.
#![allow(dead_code)]

use fitforge_core::config::{FitConfig, MutateSpec, VarSpec};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const TEMPLATE: &str = "\
begin model
begin parameters
    k 0.5
end parameters
begin actions
simulate({method=>\"ode\",t_end=>2})
end actions
end model
";

/// Decay trace A(t) = 10 * exp(-k t) sampled at t = 0, 0.5, .., 2.0.
pub const SIM_SCRIPT: &str = r##"#!/bin/sh
outdir=$2
model=$3
base=$(basename "$model")
base=${base%.*}
k=$(awk '/^# k changed to /{print $5; exit}' "$model")
awk -v k="$k" 'BEGIN {
    printf "# time A\n"
    for (i = 0; i <= 4; i++) {
        t = i * 0.5
        printf "%.17g %.17g\n", t, 10 * exp(-k * t)
    }
}' > "$outdir/${base}_data.gdat"
"##;

pub struct Fixture {
    pub dir: TempDir,
    pub cfg: FitConfig,
}

pub fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Reference data produced by the stub simulator at k = 1.
pub fn write_reference(path: &Path) {
    let mut out = String::from("# time A\n");
    for i in 0..=4 {
        let t = i as f64 * 0.5;
        out.push_str(&format!("{} {}\n", t, 10.0 * (-t).exp()));
    }
    fs::write(path, out).unwrap();
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.bngl");
        fs::write(&model, TEMPLATE).unwrap();

        let exp = dir.path().join("data.exp");
        write_reference(&exp);

        let sim = dir.path().join("run_sim.sh");
        write_script(&sim, SIM_SCRIPT);

        let cfg = FitConfig {
            job_name: "decay".into(),
            model,
            exp_files: vec![exp],
            output_dir: dir.path().join("out"),
            simulator: sim,
            max_generations: 2,
            permutations: 8,
            smoothing: 1,
            objfunc: 1,
            parallel_count: 2,
            walltime_sim: 60,
            max_retries: 1,
            var: vec![VarSpec::Loguniform {
                name: "k".into(),
                min: 0.01,
                max: 100.0,
            }],
            mutate: [(
                "default".to_string(),
                MutateSpec {
                    prob: 0.2,
                    pct: 0.25,
                },
            )]
            .into_iter()
            .collect(),
            swap_rate: 0.5,
            keep_parents: 2,
            seed: Some(1234),
            ..Default::default()
        };

        Self { dir, cfg }
    }

    pub fn out(&self) -> &Path {
        &self.cfg.output_dir
    }

    pub fn summary_path(&self, g: usize) -> PathBuf {
        self.out().join(format!("{}_summary_diff.txt", g))
    }
}
