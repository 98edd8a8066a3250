use anyhow::{bail, Context};
use clap::Args;
use fitforge_core::bootstrap::BootstrapController;
use fitforge_core::config::FitConfig;
use fitforge_core::controller::{acquire_lock, remove_stale_lock, GenerationController, LockGuard};
use fitforge_core::FitError;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Fit configuration (JSON)
    pub conf: PathBuf,

    /// Remove a stale lock without asking
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: SubmitArgs) -> anyhow::Result<()> {
    let cfg = FitConfig::load_from_file(&args.conf)
        .with_context(|| format!("loading {}", args.conf.display()))?;

    let _lock = take_lock(&cfg, args.force)?;

    let outcome = if cfg.bootstrap > 0 {
        info!("🔁 bootstrap mode: {} iterations", cfg.bootstrap);
        BootstrapController::new(cfg).run()?
    } else {
        GenerationController::new(cfg)?.run(None)?
    };

    info!(
        "✅ best score {} ({:?})",
        outcome.best.score, outcome.reason
    );
    crate::reports::print_best(&outcome);
    Ok(())
}

pub fn take_lock(cfg: &FitConfig, force: bool) -> anyhow::Result<LockGuard> {
    match acquire_lock(cfg) {
        Ok(guard) => Ok(guard),
        Err(FitError::LockPresent(path)) => {
            if force || confirm_unlock(&path)? {
                remove_stale_lock(cfg)?;
                Ok(acquire_lock(cfg)?)
            } else {
                bail!("lock held: {}", path.display());
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// The lock may be left over from a crashed run; ask before clearing it.
fn confirm_unlock(path: &Path) -> anyhow::Result<bool> {
    eprint!(
        "Lock file {} exists. Remove it and continue? [y/N] ",
        path.display()
    );
    std::io::stderr().flush().ok();
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
