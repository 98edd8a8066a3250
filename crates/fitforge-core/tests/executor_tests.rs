mod common;

use common::write_script;
use fitforge_core::executor::local::LocalDispatcher;
use fitforge_core::executor::{await_batch, Dispatcher, SimTask};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const OK_SCRIPT: &str = r##"#!/bin/sh
base=$(basename "$3")
base=${base%.*}
echo "# time A" > "$2/${base}_data.gdat"
echo "0 1" >> "$2/${base}_data.gdat"
exit 0
"##;

const FAIL_SCRIPT: &str = "#!/bin/sh\nexit 1\n";

const SLOW_SCRIPT: &str = "#!/bin/sh\nsleep 30\n";

fn task(dir: &Path, perm: usize, replicate: usize) -> SimTask {
    let model = dir.join(format!("model_perm{}.bngl", perm));
    fs::write(&model, "stub").unwrap();
    let outdir = if replicate > 0 {
        dir.join(replicate.to_string())
    } else {
        dir.to_path_buf()
    };
    SimTask {
        perm,
        replicate: replicate.max(1),
        model_file: model,
        outdir,
    }
}

fn dispatcher(dir: &TempDir, script: &str, walltime: Duration) -> LocalDispatcher {
    let sim = dir.path().join("sim.sh");
    write_script(&sim, script);
    LocalDispatcher {
        simulator: sim,
        workers: 2,
        walltime,
    }
}

#[test]
fn successful_tasks_touch_finished_sentinels() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, OK_SCRIPT, Duration::from_secs(30));
    let tasks = vec![task(dir.path(), 0, 0), task(dir.path(), 1, 0)];
    let sentinel = tasks[0].finished_path();

    let mut handle = d.dispatch(tasks).unwrap();
    let summary = await_batch(handle.as_mut()).unwrap();

    assert_eq!(summary.finished.len(), 2);
    assert!(summary.failed.is_empty());
    assert!(sentinel.exists());
    assert!(dir.path().join("model_perm0_data.gdat").exists());
    assert!(dir.path().join("model_perm0.BNG_OUT").exists());
}

#[test]
fn nonzero_exit_touches_failed_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, FAIL_SCRIPT, Duration::from_secs(30));
    let tasks = vec![task(dir.path(), 0, 0)];
    let failed = tasks[0].failed_path();

    let mut handle = d.dispatch(tasks).unwrap();
    let summary = await_batch(handle.as_mut()).unwrap();

    assert_eq!(summary.failed, vec![(0, 1)]);
    assert!(failed.exists());
}

#[test]
fn walltime_violation_terminates_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, SLOW_SCRIPT, Duration::from_secs(1));
    let tasks = vec![task(dir.path(), 0, 0)];
    let failed = tasks[0].failed_path();

    let start = Instant::now();
    let mut handle = d.dispatch(tasks).unwrap();
    let summary = await_batch(handle.as_mut()).unwrap();

    assert_eq!(summary.failed, vec![(0, 1)]);
    assert!(failed.exists());
    // Killed at the deadline, nowhere near the scripted 30 s sleep.
    assert!(start.elapsed() < Duration::from_secs(15));
}

#[test]
fn walltime_kill_takes_out_forked_helpers() {
    // The script forks a ticker and blocks on it; killing only the direct
    // child would leave the ticker appending past the deadline.
    const FORKING_SCRIPT: &str = r#"#!/bin/sh
( while :; do echo tick >> "$2/helper.out"; sleep 0.2; done ) &
wait
"#;
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, FORKING_SCRIPT, Duration::from_secs(1));
    let tasks = vec![task(dir.path(), 0, 0)];

    let mut handle = d.dispatch(tasks).unwrap();
    let summary = await_batch(handle.as_mut()).unwrap();
    assert_eq!(summary.failed, vec![(0, 1)]);

    let helper_out = dir.path().join("helper.out");
    let size_after_kill = fs::metadata(&helper_out).map(|m| m.len()).unwrap_or(0);
    std::thread::sleep(Duration::from_millis(700));
    let size_later = fs::metadata(&helper_out).map(|m| m.len()).unwrap_or(0);
    assert_eq!(
        size_after_kill, size_later,
        "forked helper survived the walltime kill"
    );
}

#[test]
fn replicates_fail_independently() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, OK_SCRIPT, Duration::from_secs(30));
    // Replicate 1 succeeds; replicate 2 points at a bad outdir-free task via
    // the failing script below.
    let ok_task = task(dir.path(), 0, 1);

    let fail_sim = dir.path().join("fail.sh");
    write_script(&fail_sim, FAIL_SCRIPT);
    let fail_d = LocalDispatcher {
        simulator: fail_sim,
        workers: 1,
        walltime: Duration::from_secs(30),
    };
    let fail_task = task(dir.path(), 0, 2);

    let mut h1 = d.dispatch(vec![ok_task]).unwrap();
    let s1 = await_batch(h1.as_mut()).unwrap();
    let mut h2 = fail_d.dispatch(vec![fail_task]).unwrap();
    let s2 = await_batch(h2.as_mut()).unwrap();

    let mut combined = s1;
    combined.failed.extend(s2.failed);

    // One of two replicates failed: the permutation is not all-failed.
    assert!(combined.failed_permutations(2).is_empty());
    assert_eq!(combined.failed_permutations(1), vec![0]);
}
