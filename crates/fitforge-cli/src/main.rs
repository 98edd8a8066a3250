use clap::{Parser, Subcommand};
use std::process;
use tracing::error;

mod cmd;
mod reports;

#[derive(Parser, Debug)]
#[command(author, version, about = "Calibrate reaction-network model parameters against time-course data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a fit from generation 1
    Submit(cmd::submit::SubmitArgs),
    /// Continue a fit from its last recoverable generation
    Resume(cmd::resume::ResumeArgs),
    /// Consolidate existing generation summaries into Results/
    Results(cmd::results::ResultsArgs),
    /// Observe a running fit from another terminal
    Monitor(cmd::monitor::MonitorArgs),
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Submit(args) => cmd::submit::run(args),
        Commands::Resume(args) => cmd::resume::run(args),
        Commands::Results(args) => cmd::results::run(args),
        Commands::Monitor(args) => cmd::monitor::run(args),
    };

    if let Err(e) = result {
        error!("❌ {:#}", e);
        process::exit(1);
    }
}
