pub mod monitor;
pub mod results;
pub mod resume;
pub mod submit;
