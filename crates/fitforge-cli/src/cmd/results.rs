use anyhow::Context;
use clap::Args;
use fitforge_core::config::FitConfig;
use fitforge_core::controller::GenerationController;
use fitforge_core::summary::Summary;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct ResultsArgs {
    /// Fit configuration (JSON)
    pub conf: PathBuf,

    /// Rows to show in the terminal table
    #[arg(short = 'n', long, default_value_t = 20)]
    pub top: usize,
}

pub fn run(args: ResultsArgs) -> anyhow::Result<()> {
    let cfg = FitConfig::load_from_file(&args.conf)
        .with_context(|| format!("loading {}", args.conf.display()))?;
    let sorted_path = cfg.output_dir.join("Results").join("sorted_params.txt");

    let outcome = GenerationController::new(cfg)?.consolidate()?;
    let sorted = Summary::load(&sorted_path)?;
    crate::reports::print_sorted_params(&sorted, args.top);
    crate::reports::print_best(&outcome);
    Ok(())
}
