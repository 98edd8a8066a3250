//! Progress monitor: an independent observer that tails the run log and
//! watches for the terminal `Results` directory. It runs in its own process
//! with its own context and never touches fit state.

use crate::config::FitConfig;
use crate::error::FfResult;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

const POLL: Duration = Duration::from_secs(2);

pub struct Monitor {
    cfg: FitConfig,
}

impl Monitor {
    pub fn new(cfg: FitConfig) -> Self {
        Self { cfg }
    }

    /// Block until the fit reaches a terminal state, streaming new run-log
    /// bytes to `out` as they appear.
    pub fn run(&self, out: &mut dyn Write) -> FfResult<()> {
        let log_path = self.cfg.run_log_path();
        let mut offset: u64 = 0;

        loop {
            offset = drain_log(&log_path, offset, out)?;

            if self.terminal_dir_present() {
                // One last drain so the final status line is not lost.
                drain_log(&log_path, offset, out)?;
                return Ok(());
            }
            // The lock vanishing means the driving process is gone.
            if !self.cfg.lock_path().exists() {
                drain_log(&log_path, offset, out)?;
                return Ok(());
            }
            std::thread::sleep(POLL);
        }
    }

    fn terminal_dir_present(&self) -> bool {
        if self.cfg.bootstrap > 0 {
            self.cfg
                .output_dir
                .join(format!("Results_{}", self.cfg.bootstrap))
                .exists()
        } else {
            self.cfg.output_dir.join("Results").exists()
        }
    }
}

/// Emit bytes appended since `offset`; returns the new offset.
fn drain_log(path: &Path, offset: u64, out: &mut dyn Write) -> FfResult<u64> {
    let Ok(mut file) = File::open(path) else {
        return Ok(offset);
    };
    let len = file.metadata()?.len();
    if len <= offset {
        return Ok(len.min(offset));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut buf)?;
    out.write_all(&buf)?;
    out.flush()?;
    Ok(len)
}
