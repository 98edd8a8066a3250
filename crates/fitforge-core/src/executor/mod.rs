//! Simulation dispatch. One seam, two strategies: a local worker pool with
//! per-task walltime enforcement, and a chunked batch-scheduler submitter
//! that observes progress through sentinel files.
//!
//! Sentinel files are the single source of truth for task status. A task is
//! terminal when `<basename>.finished` or `<basename>.failed` exists in its
//! output directory; basenames carry the permutation index and replicate
//! directories carry the replicate index, so no two tasks share a path.

pub mod cluster;
pub mod local;

use crate::config::{FitConfig, ParallelMode};
use crate::error::{FfResult, FitError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SimTask {
    pub perm: usize,
    pub replicate: usize,
    pub model_file: PathBuf,
    pub outdir: PathBuf,
}

impl SimTask {
    pub fn basename(&self) -> String {
        self.model_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("sim")
            .to_string()
    }

    pub fn finished_path(&self) -> PathBuf {
        self.outdir.join(format!("{}.finished", self.basename()))
    }

    pub fn failed_path(&self) -> PathBuf {
        self.outdir.join(format!("{}.failed", self.basename()))
    }

    /// Captured simulator stdout/stderr.
    pub fn capture_path(&self) -> PathBuf {
        self.outdir.join(format!("{}.BNG_OUT", self.basename()))
    }

    pub fn is_terminal(&self) -> bool {
        self.finished_path().exists() || self.failed_path().exists()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Finished,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Failed | TaskStatus::TimedOut
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    /// (permutation, replicate) pairs.
    pub finished: Vec<(usize, usize)>,
    pub failed: Vec<(usize, usize)>,
}

impl BatchSummary {
    /// Permutations for which every replicate failed.
    pub fn failed_permutations(&self, replicates: usize) -> Vec<usize> {
        let mut perms: Vec<usize> = self.failed.iter().map(|&(p, _)| p).collect();
        perms.sort_unstable();
        perms.dedup();
        perms
            .into_iter()
            .filter(|&p| {
                self.failed.iter().filter(|&&(fp, _)| fp == p).count() == replicates
            })
            .collect()
    }
}

#[derive(Debug)]
pub enum BatchStatus {
    Pending { done: usize, total: usize },
    Done(BatchSummary),
}

pub trait BatchHandle {
    fn poll(&mut self) -> FfResult<BatchStatus>;
}

pub trait Dispatcher {
    fn dispatch(&self, tasks: Vec<SimTask>) -> FfResult<Box<dyn BatchHandle>>;
}

pub fn dispatcher_for(cfg: &FitConfig) -> FfResult<Box<dyn Dispatcher>> {
    match cfg.parallel_mode {
        ParallelMode::Local => Ok(Box::new(local::LocalDispatcher {
            simulator: cfg.simulator.clone(),
            workers: cfg.parallel_count,
            walltime: Duration::from_secs(cfg.walltime_sim),
        })),
        ParallelMode::Cluster => {
            let kind = cfg
                .cluster_type
                .ok_or_else(|| FitError::Config("cluster mode without cluster_type".into()))?;
            Ok(Box::new(cluster::ClusterDispatcher {
                kind,
                simulator: cfg.simulator.clone(),
                chunk_size: cfg.cluster_parallel * cfg.multisim,
                walltime: Duration::from_secs(cfg.walltime_sim),
                job_limit: cfg.job_limit,
                job_name: cfg.job_name.clone(),
                poll_interval: Duration::from_secs(5),
            }))
        }
    }
}

/// Block until every task in the batch is terminal, logging progress as the
/// supervisor observes it.
pub fn await_batch(handle: &mut dyn BatchHandle) -> FfResult<BatchSummary> {
    let mut last_done = usize::MAX;
    loop {
        match handle.poll()? {
            BatchStatus::Done(summary) => {
                info!(
                    "batch complete: {} finished, {} failed",
                    summary.finished.len(),
                    summary.failed.len()
                );
                return Ok(summary);
            }
            BatchStatus::Pending { done, total } => {
                if done != last_done {
                    info!("simulations: {}/{} done", done, total);
                    last_done = done;
                }
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }
}

/// Atomically-visible empty marker file.
pub fn touch(path: &Path) -> std::io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map(|_| ())
}
