use anyhow::Context;
use clap::Args;
use fitforge_core::config::FitConfig;
use fitforge_core::monitor::Monitor;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct MonitorArgs {
    /// Fit configuration (JSON)
    pub conf: PathBuf,
}

pub fn run(args: MonitorArgs) -> anyhow::Result<()> {
    let cfg = FitConfig::load_from_file(&args.conf)
        .with_context(|| format!("loading {}", args.conf.display()))?;
    let mut stdout = std::io::stdout();
    Monitor::new(cfg).run(&mut stdout)?;
    Ok(())
}
