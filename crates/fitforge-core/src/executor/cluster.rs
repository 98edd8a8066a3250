//! Cluster execution: permutations are packed into chunks, each chunk is one
//! batch job whose payload chains simulator invocations with `&&`, and the
//! core observes completion purely through sentinel files. While the
//! scheduler queue still holds queued tasks, per-task deadlines are extended
//! so queueing does not consume walltime budget.

use super::{touch, BatchHandle, BatchStatus, BatchSummary, SimTask};
use crate::config::ClusterType;
use crate::error::{FfResult, FitError};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct ClusterDispatcher {
    pub kind: ClusterType,
    pub simulator: PathBuf,
    pub chunk_size: usize,
    pub walltime: Duration,
    pub job_limit: usize,
    pub job_name: String,
    pub poll_interval: Duration,
}

impl ClusterType {
    pub fn submit_program(self) -> &'static str {
        match self {
            ClusterType::Torque | ClusterType::Sge => "qsub",
            ClusterType::Slurm => "sbatch",
        }
    }

    pub fn queue_program(self) -> &'static str {
        match self {
            ClusterType::Torque | ClusterType::Sge => "qstat",
            ClusterType::Slurm => "squeue",
        }
    }

    /// State token the queue listing uses for a not-yet-started job.
    pub fn queued_state(self) -> &'static str {
        match self {
            ClusterType::Torque => "Q",
            ClusterType::Sge => "qw",
            ClusterType::Slurm => "PD",
        }
    }
}

pub fn format_walltime(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Submission arguments for one chunk script.
pub fn submit_args(
    kind: ClusterType,
    job_name: &str,
    walltime: Duration,
    script: &str,
) -> Vec<String> {
    match kind {
        ClusterType::Torque => vec![
            "-N".into(),
            job_name.into(),
            "-l".into(),
            format!("walltime={}", format_walltime(walltime)),
            script.into(),
        ],
        ClusterType::Slurm => vec![
            "-J".into(),
            job_name.into(),
            format!("--time={}", format_walltime(walltime)),
            script.into(),
        ],
        ClusterType::Sge => vec![
            "-N".into(),
            job_name.into(),
            "-l".into(),
            format!("h_rt={}", walltime.as_secs()),
            script.into(),
        ],
    }
}

/// The chunk payload: a conjunction of simulator invocations, each followed
/// by its finished-sentinel touch; on any failure a compensation block
/// touches the failed sentinel for every task the conjunction never reached.
pub fn chunk_script(simulator: &PathBuf, tasks: &[SimTask]) -> String {
    let mut body = String::new();
    for (i, task) in tasks.iter().enumerate() {
        if i > 0 {
            body.push_str(" && ");
        }
        let _ = write!(
            body,
            "{} --outdir {} {} > {} 2>&1 && touch {}",
            simulator.display(),
            task.outdir.display(),
            task.model_file.display(),
            task.capture_path().display(),
            task.finished_path().display()
        );
    }

    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&body);
    script.push_str(" || {\n");
    for task in tasks {
        let _ = writeln!(
            script,
            "  [ -f {} ] || touch {}",
            task.finished_path().display(),
            task.failed_path().display()
        );
    }
    script.push_str("}\nexit 0\n");
    script
}

/// Count job entries in the queue listing (lines whose first token is a job
/// id). Used for the quota gate before submitting more work.
pub fn count_queue_entries(listing: &str) -> usize {
    listing
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .next()
                .map(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
        .count()
}

pub fn listing_has_queued(listing: &str, state: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().any(|tok| tok == state))
}

pub struct ClusterHandle {
    kind: ClusterType,
    tasks: Vec<SimTask>,
    deadlines: Vec<Instant>,
    terminal: Vec<bool>,
    poll_interval: Duration,
    last_probe: Instant,
}

impl ClusterDispatcher {
    fn check_quota(&self) -> FfResult<()> {
        let output = Command::new(self.kind.queue_program()).output();
        let Ok(output) = output else {
            // No queue tool on this host; the submit itself will fail loudly.
            warn!("queue listing unavailable; skipping quota check");
            return Ok(());
        };
        let listing = String::from_utf8_lossy(&output.stdout).into_owned();
        let entries = count_queue_entries(&listing);
        if entries >= self.job_limit {
            return Err(FitError::ClusterQuota(format!(
                "{} jobs queued or running, limit is {}",
                entries, self.job_limit
            )));
        }
        Ok(())
    }

    fn submit_chunk(&self, index: usize, tasks: &[SimTask]) -> FfResult<()> {
        let gen_dir = tasks[0]
            .model_file
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default();
        let script_path = gen_dir.join(format!("{}_chunk{}.sh", self.job_name, index));
        std::fs::write(&script_path, chunk_script(&self.simulator, tasks))?;

        let script = script_path.display().to_string();
        let chunk_name = format!("{}_{}", self.job_name, index);
        let args = submit_args(self.kind, &chunk_name, self.walltime, &script);

        let output = Command::new(self.kind.submit_program())
            .args(&args)
            .output()
            .map_err(|e| {
                FitError::Executor(format!(
                    "failed to run {}: {}",
                    self.kind.submit_program(),
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(FitError::Executor(format!(
                "{} rejected chunk {}: {}",
                self.kind.submit_program(),
                index,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(
            "chunk {} submitted: {}",
            index,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }
}

impl super::Dispatcher for ClusterDispatcher {
    fn dispatch(&self, tasks: Vec<SimTask>) -> FfResult<Box<dyn BatchHandle>> {
        self.check_quota()?;
        for task in &tasks {
            std::fs::create_dir_all(&task.outdir)?;
        }

        let chunks: Vec<&[SimTask]> = tasks.chunks(self.chunk_size.max(1)).collect();
        info!(
            "submitting {} tasks as {} chunk jobs",
            tasks.len(),
            chunks.len()
        );
        for (i, chunk) in chunks.iter().enumerate() {
            self.submit_chunk(i, chunk)?;
        }

        let deadline = Instant::now() + self.walltime + self.poll_interval;
        let n = tasks.len();
        Ok(Box::new(ClusterHandle {
            kind: self.kind,
            tasks,
            deadlines: vec![deadline; n],
            terminal: vec![false; n],
            poll_interval: self.poll_interval,
            last_probe: Instant::now(),
        }))
    }
}

impl BatchHandle for ClusterHandle {
    fn poll(&mut self) -> FfResult<BatchStatus> {
        // Queue probe: while anything is still queued, queueing must not eat
        // into the walltime budget.
        if self.last_probe.elapsed() >= self.poll_interval {
            self.last_probe = Instant::now();
            if let Ok(output) = Command::new(self.kind.queue_program()).output() {
                let listing = String::from_utf8_lossy(&output.stdout).into_owned();
                if listing_has_queued(&listing, self.kind.queued_state()) {
                    for (i, d) in self.deadlines.iter_mut().enumerate() {
                        if !self.terminal[i] {
                            *d += self.poll_interval;
                        }
                    }
                }
            }
        }

        let now = Instant::now();
        for (i, task) in self.tasks.iter().enumerate() {
            if self.terminal[i] {
                continue;
            }
            if task.is_terminal() {
                self.terminal[i] = true;
            } else if now > self.deadlines[i] {
                warn!(
                    "perm {} rep {}: no sentinel before deadline, marking failed",
                    task.perm, task.replicate
                );
                touch(&task.failed_path())?;
                self.terminal[i] = true;
            }
        }

        let done = self.terminal.iter().filter(|t| **t).count();
        if done < self.tasks.len() {
            return Ok(BatchStatus::Pending {
                done,
                total: self.tasks.len(),
            });
        }

        let mut summary = BatchSummary::default();
        for task in &self.tasks {
            let key = (task.perm, task.replicate);
            if task.finished_path().exists() {
                summary.finished.push(key);
            } else {
                summary.failed.push(key);
            }
        }
        Ok(BatchStatus::Done(summary))
    }
}
