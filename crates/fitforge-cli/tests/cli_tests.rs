//! Binary-level tests: drive the built `fitforge` executable against a stub
//! simulator script and a JSON config in a temp workspace.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fitforge"))
}

const TEMPLATE: &str = "\
begin model
begin parameters
    k 0.5
end parameters
begin actions
simulate({method=>\"ode\",t_end=>2})
end actions
end model
";

const SIM_SCRIPT: &str = r##"#!/bin/sh
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

struct TestContext {
    _dir: TempDir,
    conf_path: PathBuf,
    out_dir: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let model = dir.path().join("model.bngl");
        fs::write(&model, TEMPLATE).unwrap();

        let exp = dir.path().join("data.exp");
        let mut body = String::from("# time A\n");
        for i in 0..=4 {
            let t = i as f64 * 0.5;
            body.push_str(&format!("{} {}\n", t, 10.0 * (-t).exp()));
        }
        fs::write(&exp, body).unwrap();

        let sim = dir.path().join("run_sim.sh");
        fs::write(&sim, SIM_SCRIPT).unwrap();
        fs::set_permissions(&sim, fs::Permissions::from_mode(0o755)).unwrap();

        let out_dir = dir.path().join("out");
        let conf = serde_json::json!({
            "job_name": "decay",
            "model": model,
            "exp_files": [exp],
            "output_dir": out_dir,
            "simulator": sim,
            "max_generations": 2,
            "permutations": 6,
            "parallel_count": 2,
            "walltime_sim": 60,
            "objfunc": 1,
            "swap_rate": 0.5,
            "keep_parents": 2,
            "seed": 777,
            "var": [
                { "kind": "loguniform", "name": "k", "min": 0.01, "max": 100.0 }
            ],
            "mutate": {
                "default": { "prob": 0.2, "pct": 0.25 }
            }
        });
        let conf_path = dir.path().join("fit.conf.json");
        fs::write(&conf_path, serde_json::to_string_pretty(&conf).unwrap()).unwrap();

        Self {
            _dir: dir,
            conf_path,
            out_dir,
        }
    }

    fn run(&self, args: &[&str]) -> std::process::Output {
        Command::new(binary())
            .args(args)
            .arg(&self.conf_path)
            .output()
            .expect("failed to execute fitforge")
    }
}

fn assert_success(output: &std::process::Output) {
    assert!(
        output.status.success(),
        "fitforge failed\nSTDOUT:\n{}\nSTDERR:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn count_rows(path: &Path) -> usize {
    fs::read_to_string(path).unwrap().lines().count() - 1
}

#[test]
fn submit_runs_a_fit_to_completion() {
    let ctx = TestContext::new();
    let output = ctx.run(&["submit"]);
    assert_success(&output);

    assert!(ctx.out_dir.join("Results").join("sorted_params.txt").exists());
    assert_eq!(count_rows(&ctx.out_dir.join("1_summary_diff.txt")), 6);
    assert_eq!(count_rows(&ctx.out_dir.join("2_summary_diff.txt")), 6);

    // Final termination released the lock.
    assert!(!ctx.out_dir.join(".lock_decay").exists());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("BEST FIT"), "missing report:\n{}", stdout);
}

#[test]
fn results_consolidates_existing_summaries() {
    let ctx = TestContext::new();
    assert_success(&ctx.run(&["submit"]));

    let output = ctx.run(&["results"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Chi-Sq"));
    assert!(stdout.contains("BEST FIT"));
}

#[test]
fn stale_lock_blocks_submit_until_forced() {
    let ctx = TestContext::new();
    fs::create_dir_all(&ctx.out_dir).unwrap();
    fs::write(ctx.out_dir.join(".lock_decay"), "deadbeef pid=1\n").unwrap();

    // Declining the prompt aborts.
    let mut child = Command::new(binary())
        .arg("submit")
        .arg(&ctx.conf_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.as_mut().unwrap().write_all(b"n\n").unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(!output.status.success());
    assert!(ctx.out_dir.join(".lock_decay").exists());

    // --force clears it and runs.
    let output = ctx.run(&["submit", "--force"]);
    assert_success(&output);
    assert!(!ctx.out_dir.join(".lock_decay").exists());
}

#[test]
fn resume_extends_the_generation_budget() {
    let ctx = TestContext::new();
    assert_success(&ctx.run(&["submit"]));

    let output = ctx.run(&["resume", "--generations", "3"]);
    assert_success(&output);
    assert!(ctx.out_dir.join("3_summary_diff.txt").exists());
}

#[test]
fn monitor_drains_the_run_log_after_completion() {
    let ctx = TestContext::new();
    assert_success(&ctx.run(&["submit"]));

    let output = ctx.run(&["monitor"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("generation 1 started"));
    assert!(stdout.contains("finished"));
}
