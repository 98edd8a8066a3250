//! Local execution: a fixed-width pool of worker threads, each driving one
//! simulator process at a time. Workers enforce the per-task walltime by
//! polling the child; the failed sentinel is written before the kill so an
//! observer never sees a terminated task without a terminal marker. Each
//! child runs as its own process-group leader, and walltime cancellation
//! signals the whole group.

use super::{touch, BatchHandle, BatchStatus, BatchSummary, SimTask, TaskStatus};
use crate::error::{FfResult, FitError};
use std::collections::VecDeque;
use std::fs::File;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct LocalDispatcher {
    pub simulator: PathBuf,
    pub workers: usize,
    pub walltime: Duration,
}

struct Shared {
    queue: Mutex<VecDeque<(usize, SimTask)>>,
    states: Mutex<Vec<TaskStatus>>,
}

pub struct LocalHandle {
    tasks: Vec<SimTask>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl super::Dispatcher for LocalDispatcher {
    fn dispatch(&self, tasks: Vec<SimTask>) -> FfResult<Box<dyn BatchHandle>> {
        for task in &tasks {
            std::fs::create_dir_all(&task.outdir)?;
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(tasks.iter().cloned().enumerate().collect()),
            states: Mutex::new(vec![TaskStatus::Queued; tasks.len()]),
        });

        let width = self.workers.min(tasks.len()).max(1);
        let mut workers = Vec::with_capacity(width);
        for worker_id in 0..width {
            let shared = Arc::clone(&shared);
            let simulator = self.simulator.clone();
            let walltime = self.walltime;
            workers.push(std::thread::spawn(move || {
                worker_loop(worker_id, &shared, &simulator, walltime);
            }));
        }

        Ok(Box::new(LocalHandle {
            tasks,
            shared,
            workers,
        }))
    }
}

fn worker_loop(worker_id: usize, shared: &Shared, simulator: &PathBuf, walltime: Duration) {
    loop {
        let next = shared.queue.lock().expect("queue poisoned").pop_front();
        let Some((idx, task)) = next else {
            break;
        };
        let status = run_task(&task, simulator, walltime);
        debug!(
            "worker {}: perm {} rep {} -> {:?}",
            worker_id, task.perm, task.replicate, status
        );
        shared.states.lock().expect("states poisoned")[idx] = status;
    }
}

fn run_task(task: &SimTask, simulator: &PathBuf, walltime: Duration) -> TaskStatus {
    let fail = |msg: &str| {
        warn!("perm {} rep {}: {}", task.perm, task.replicate, msg);
        let _ = touch(&task.failed_path());
        TaskStatus::Failed
    };

    let capture = match File::create(task.capture_path()) {
        Ok(f) => f,
        Err(e) => return fail(&format!("cannot create capture file: {}", e)),
    };
    let capture_err = match capture.try_clone() {
        Ok(f) => f,
        Err(e) => return fail(&format!("cannot clone capture handle: {}", e)),
    };

    let mut cmd = Command::new(simulator);
    cmd.arg("--outdir")
        .arg(&task.outdir)
        .arg(&task.model_file)
        .stdin(Stdio::null())
        .stdout(Stdio::from(capture))
        .stderr(Stdio::from(capture_err));
    // Group leader, so walltime cancellation reaches anything it forks.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return fail(&format!("spawn failed: {}", e)),
    };

    let deadline = Instant::now() + walltime;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    let _ = touch(&task.finished_path());
                    return TaskStatus::Finished;
                }
                return fail(&format!("simulator exited with {}", status));
            }
            Ok(None) => {
                if Instant::now() > deadline {
                    // Sentinel first, then terminate, so the terminal state
                    // is already visible when the process dies.
                    let _ = touch(&task.failed_path());
                    terminate_group(&mut child);
                    let _ = child.wait();
                    warn!(
                        "perm {} rep {}: walltime exceeded, task terminated",
                        task.perm, task.replicate
                    );
                    return TaskStatus::TimedOut;
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                terminate_group(&mut child);
                let _ = child.wait();
                return fail(&format!("wait failed: {}", e));
            }
        }
    }
}

/// Kill the task's whole process group; the simulator may have forked
/// helpers that must not outlive the walltime.
fn terminate_group(child: &mut Child) {
    #[cfg(unix)]
    unsafe {
        // Negative pid targets the group; process_group(0) made the child
        // its leader.
        libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
    }
    // Direct-child fallback, and the only path on non-Unix hosts.
    let _ = child.kill();
}

impl BatchHandle for LocalHandle {
    fn poll(&mut self) -> FfResult<BatchStatus> {
        let states = self
            .shared
            .states
            .lock()
            .map_err(|_| FitError::Executor("worker pool state poisoned".into()))?
            .clone();

        let done = states.iter().filter(|s| s.is_terminal()).count();
        if done < self.tasks.len() {
            return Ok(BatchStatus::Pending {
                done,
                total: self.tasks.len(),
            });
        }
        drop(states);

        for worker in self.workers.drain(..) {
            worker
                .join()
                .map_err(|_| FitError::Executor("worker thread panicked".into()))?;
        }

        let states = self
            .shared
            .states
            .lock()
            .map_err(|_| FitError::Executor("worker pool state poisoned".into()))?;
        let mut summary = BatchSummary::default();
        for (task, status) in self.tasks.iter().zip(states.iter()) {
            let key = (task.perm, task.replicate);
            match status {
                TaskStatus::Finished => summary.finished.push(key),
                _ => summary.failed.push(key),
            }
        }
        Ok(BatchStatus::Done(summary))
    }
}
