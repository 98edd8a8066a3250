use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Tabular Data Error in {path}: {msg}")]
    Table { path: PathBuf, msg: String },

    #[error("Model Error: {0}")]
    Model(String),

    #[error("Executor Error: {0}")]
    Executor(String),

    #[error("Cluster quota exceeded: {0}")]
    ClusterQuota(String),

    #[error("Only {0} parents survived culling; at least 3 are required to breed")]
    InsufficientSurvivors(usize),

    #[error("Generation {0} failed after {1} retries with too few completed generations to salvage")]
    RetriesExhausted(usize, usize),

    #[error("Resume Error: {0}")]
    Resume(String),

    #[error("Bootstrap run {run} still above the chi threshold after {retries} retries")]
    BootstrapExhausted { run: usize, retries: usize },

    #[error("Lock file {0} exists; another fit may be running against this output directory")]
    LockPresent(PathBuf),
}

pub type FfResult<T> = Result<T, FitError>;
