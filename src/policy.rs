//! Recorder-wide runtime configuration.

mod env;
mod model;

pub use env::configure_policy_from_env;
pub use model::{policy_snapshot, OnRecorderError, RecorderPolicy};
