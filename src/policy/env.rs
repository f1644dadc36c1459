//! Environment variable parsing for recorder policy overrides.

use recorder_errors::{usage, ErrorCode, RecorderResult};
use std::env;
use std::str::FromStr;

use crate::policy::model::{apply_policy_update, OnRecorderError, PolicyPath, PolicyUpdate};

/// Environment variable configuring how the recorder reacts to internal errors.
pub const ENV_ON_RECORDER_ERROR: &str = "CODETRACER_HEAP_ON_RECORDER_ERROR";
/// Environment variable controlling log level for the recorder crate.
pub const ENV_LOG_LEVEL: &str = "CODETRACER_HEAP_LOG_LEVEL";
/// Environment variable pointing to a log destination file.
pub const ENV_LOG_FILE: &str = "CODETRACER_HEAP_LOG_FILE";
/// Environment variable enabling JSON error trailers on stderr.
pub const ENV_JSON_ERRORS: &str = "CODETRACER_HEAP_JSON_ERRORS";
/// Environment variable enabling native stack capture.
pub const ENV_NATIVE_TRACES: &str = "CODETRACER_HEAP_NATIVE_TRACES";
/// Environment variable enabling interpreter-allocator tracing.
pub const ENV_TRACE_PYTHON_ALLOCATORS: &str = "CODETRACER_HEAP_TRACE_PYTHON_ALLOCATORS";
/// Environment variable enabling on-close capture compression.
pub const ENV_COMPRESS: &str = "CODETRACER_HEAP_COMPRESS";
/// Environment variable setting the memory-record cadence in milliseconds.
pub const ENV_MEMORY_INTERVAL_MS: &str = "CODETRACER_HEAP_MEMORY_INTERVAL_MS";

/// Load policy overrides from environment variables.
pub fn configure_policy_from_env() -> RecorderResult<()> {
    let mut update = PolicyUpdate::default();

    if let Ok(value) = env::var(ENV_ON_RECORDER_ERROR) {
        let on_err = OnRecorderError::from_str(&value).map_err(|err| err.0)?;
        update.on_recorder_error = Some(on_err);
    }

    if let Ok(value) = env::var(ENV_LOG_LEVEL) {
        update.log_level = Some(value);
    }

    if let Ok(value) = env::var(ENV_LOG_FILE) {
        let path = if value.trim().is_empty() {
            PolicyPath::Clear
        } else {
            PolicyPath::Value(value.into())
        };
        update.log_file = Some(path);
    }

    if let Ok(value) = env::var(ENV_JSON_ERRORS) {
        update.json_errors = Some(parse_bool(&value)?);
    }

    if let Ok(value) = env::var(ENV_NATIVE_TRACES) {
        update.native_traces = Some(parse_bool(&value)?);
    }

    if let Ok(value) = env::var(ENV_TRACE_PYTHON_ALLOCATORS) {
        update.trace_python_allocators = Some(parse_bool(&value)?);
    }

    if let Ok(value) = env::var(ENV_COMPRESS) {
        update.compress = Some(parse_bool(&value)?);
    }

    if let Ok(value) = env::var(ENV_MEMORY_INTERVAL_MS) {
        let interval: u64 = value.trim().parse().map_err(|_| {
            usage!(
                ErrorCode::InvalidPolicyValue,
                "invalid memory interval '{}' (expected milliseconds)",
                value
            )
        })?;
        update.memory_interval_ms = Some(interval);
    }

    apply_policy_update(update);
    Ok(())
}

fn parse_bool(value: &str) -> RecorderResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => Ok(true),
        "0" | "false" | "f" | "no" | "n" => Ok(false),
        other => Err(usage!(
            ErrorCode::InvalidPolicyValue,
            "invalid boolean value '{}' (expected true/false)",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_accept_the_usual_spellings() {
        for (text, expected) in [("1", true), ("TRUE", true), ("no", false), ("0", false)] {
            assert_eq!(parse_bool(text).expect("parse"), expected);
        }
        let err = parse_bool("maybe").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPolicyValue);
    }
}
