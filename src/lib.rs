pub mod config;
pub mod convergence;
pub mod datatypes;
pub mod error;
pub mod filters;
pub mod mesh;
pub mod optimizer;
pub mod post_processor;
pub mod sensitivity;
pub mod solver;
pub mod switching;
pub mod timing;

pub use config::RunConfig;
pub use error::BesoError;
pub use optimizer::{Optimizer, RunOutcome, StopHandle};
