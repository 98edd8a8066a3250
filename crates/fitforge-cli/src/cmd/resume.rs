use anyhow::Context;
use clap::Args;
use fitforge_core::config::FitConfig;
use fitforge_core::controller;
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct ResumeArgs {
    /// Fit configuration (JSON)
    pub conf: PathBuf,

    /// Raise the generation budget before continuing
    #[arg(short = 'g', long)]
    pub generations: Option<usize>,

    /// Remove a stale lock without asking
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: ResumeArgs) -> anyhow::Result<()> {
    let cfg = FitConfig::load_from_file(&args.conf)
        .with_context(|| format!("loading {}", args.conf.display()))?;

    let _lock = super::submit::take_lock(&cfg, args.force)?;
    let outcome = controller::resume(&cfg, args.generations)?;

    info!(
        "✅ best score {} ({:?})",
        outcome.best.score, outcome.reason
    );
    crate::reports::print_best(&outcome);
    Ok(())
}
