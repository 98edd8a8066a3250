pub mod average;
pub mod bootstrap;
pub mod breeder;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod model;
pub mod monitor;
pub mod population;
pub mod scorer;
pub mod summary;
pub mod table;

pub use error::{FfResult, FitError};

/// Score attached to permutations whose result cannot be trusted (2^53).
/// Large enough to rank last, small enough to stay exactly representable.
pub const SENTINEL_SCORE: f64 = 9_007_199_254_740_992.0;

/// Control-column alignment tolerance between simulation and reference rows.
pub const CONTROL_EPSILON: f64 = 1e-6;
