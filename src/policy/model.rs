//! Policy data structures and in-memory management.

use once_cell::sync::OnceCell;
use recorder_errors::{usage, ErrorCode, RecorderError};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::RwLock;

static POLICY: OnceCell<RwLock<RecorderPolicy>> = OnceCell::new();

fn policy_cell() -> &'static RwLock<RecorderPolicy> {
    POLICY.get_or_init(|| RwLock::new(RecorderPolicy::default()))
}

/// Behaviour when the recorder encounters an error inside a frame callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnRecorderError {
    /// Propagate the error to callers; tracing stops with an exception.
    #[default]
    Abort,
    /// Disable tracing but allow the host process to continue running.
    Disable,
}

#[derive(Debug)]
pub struct PolicyParseError(pub RecorderError);

impl FromStr for OnRecorderError {
    type Err = PolicyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(OnRecorderError::Abort),
            "disable" => Ok(OnRecorderError::Disable),
            other => Err(PolicyParseError(usage!(
                ErrorCode::InvalidPolicyValue,
                "invalid on_recorder_error value '{}' (expected 'abort' or 'disable')",
                other
            ))),
        }
    }
}

/// Recorder-wide runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderPolicy {
    pub on_recorder_error: OnRecorderError,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub json_errors: bool,
    /// Capture native stacks alongside Python frames.
    pub native_traces: bool,
    /// Wrap the interpreter's allocator domains too.
    pub trace_python_allocators: bool,
    /// Re-encode the capture file on close.
    pub compress: bool,
    /// Cadence of periodic memory records.
    pub memory_interval_ms: u64,
}

impl Default for RecorderPolicy {
    fn default() -> Self {
        Self {
            on_recorder_error: OnRecorderError::Abort,
            log_level: None,
            log_file: None,
            json_errors: false,
            native_traces: false,
            trace_python_allocators: false,
            compress: false,
            memory_interval_ms: 10,
        }
    }
}

impl RecorderPolicy {
    pub(crate) fn apply_update(&mut self, update: PolicyUpdate) {
        if let Some(on_err) = update.on_recorder_error {
            self.on_recorder_error = on_err;
        }
        if let Some(level) = update.log_level {
            self.log_level = match level.trim() {
                "" => None,
                other => Some(other.to_string()),
            };
        }
        if let Some(path) = update.log_file {
            self.log_file = match path {
                PolicyPath::Clear => None,
                PolicyPath::Value(pb) => Some(pb),
            };
        }
        if let Some(json_errors) = update.json_errors {
            self.json_errors = json_errors;
        }
        if let Some(native_traces) = update.native_traces {
            self.native_traces = native_traces;
        }
        if let Some(python_allocators) = update.trace_python_allocators {
            self.trace_python_allocators = python_allocators;
        }
        if let Some(compress) = update.compress {
            self.compress = compress;
        }
        if let Some(interval) = update.memory_interval_ms {
            self.memory_interval_ms = interval.max(1);
        }
    }
}

/// Internal helper representing path updates.
#[derive(Debug, Clone)]
pub(crate) enum PolicyPath {
    Clear,
    Value(PathBuf),
}

/// Mutation record for the policy.
#[derive(Debug, Default, Clone)]
pub(crate) struct PolicyUpdate {
    pub(crate) on_recorder_error: Option<OnRecorderError>,
    pub(crate) log_level: Option<String>,
    pub(crate) log_file: Option<PolicyPath>,
    pub(crate) json_errors: Option<bool>,
    pub(crate) native_traces: Option<bool>,
    pub(crate) trace_python_allocators: Option<bool>,
    pub(crate) compress: Option<bool>,
    pub(crate) memory_interval_ms: Option<u64>,
}

/// Snapshot the current policy.
pub fn policy_snapshot() -> RecorderPolicy {
    policy_cell().read().expect("policy lock poisoned").clone()
}

/// Apply the provided update to the global policy and propagate logging changes.
pub(crate) fn apply_policy_update(update: PolicyUpdate) {
    let mut guard = policy_cell().write().expect("policy lock poisoned");
    guard.apply_update(update);
    crate::logging::apply_policy(&guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_apply_only_the_provided_fields() {
        let mut policy = RecorderPolicy::default();
        policy.apply_update(PolicyUpdate {
            native_traces: Some(true),
            memory_interval_ms: Some(0),
            ..PolicyUpdate::default()
        });
        assert!(policy.native_traces);
        // The interval is clamped away from zero.
        assert_eq!(policy.memory_interval_ms, 1);
        assert_eq!(policy.on_recorder_error, OnRecorderError::Abort);
        assert!(!policy.compress);
    }

    #[test]
    fn on_recorder_error_parses_both_modes() {
        assert_eq!(
            OnRecorderError::from_str("Abort").expect("abort"),
            OnRecorderError::Abort
        );
        assert_eq!(
            OnRecorderError::from_str(" disable ").expect("disable"),
            OnRecorderError::Disable
        );
        assert!(OnRecorderError::from_str("explode").is_err());
    }
}
