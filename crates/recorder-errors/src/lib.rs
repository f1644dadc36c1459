//! Shared error facade for codetracer recorders.
//!
//! Every fallible operation in a recorder crate returns [`RecorderResult`].
//! Errors carry a coarse [`ErrorKind`] used to pick the Python exception
//! class at the FFI boundary, a stable [`ErrorCode`] that survives into logs
//! and structured trailers, a human-readable message and an ordered list of
//! `key=value` context pairs.

use std::error::Error as StdError;
use std::fmt;

/// Result alias used across recorder crates.
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Coarse classification selecting the exception class surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// The caller misused the API (bad arguments, wrong state).
    Usage,
    /// The surrounding environment refused an operation (I/O, permissions).
    Environment,
    /// The traced target produced data the recorder cannot accept.
    Target,
    /// A recorder bug or contained panic.
    Internal,
}

macro_rules! error_codes {
    ($($variant:ident => $text:literal),+ $(,)?) => {
        /// Stable machine-readable error codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub enum ErrorCode {
            $($variant),+
        }

        impl ErrorCode {
            /// The wire representation written to logs and trailers.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => $text),+
                }
            }

            /// Inverse of [`ErrorCode::as_str`].
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(ErrorCode::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

error_codes! {
    Unknown => "ERR_UNKNOWN",
    Io => "ERR_IO",
    TruncatedRecord => "ERR_TRUNCATED_RECORD",
    UnsupportedVersion => "ERR_UNSUPPORTED_VERSION",
    BadMagic => "ERR_BAD_MAGIC",
    PatchFailed => "ERR_PATCH_FAILED",
    TrackerInactive => "ERR_TRACKER_INACTIVE",
    AlreadyTracing => "ERR_ALREADY_TRACING",
    TracerInstallConflict => "ERR_TRACER_INSTALL_CONFLICT",
    InvalidPolicyValue => "ERR_INVALID_POLICY_VALUE",
    InvalidDestination => "ERR_INVALID_DESTINATION",
    SinkClosed => "ERR_SINK_CLOSED",
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error type shared by the recorder crates.
#[derive(Debug)]
pub struct RecorderError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    /// Ordered `key=value` pairs rendered into diagnostics.
    pub context: Vec<(&'static str, String)>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl RecorderError {
    pub fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    /// Attach a context pair. Builder-style so call sites stay one expression.
    pub fn with_context(mut self, key: &'static str, value: String) -> Self {
        self.context.push((key, value));
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(
        mut self,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Borrow the underlying cause without consuming the error.
    pub fn source_ref(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl fmt::Display for RecorderError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            formatter.write_str(" (")?;
            for (index, (key, value)) in self.context.iter().enumerate() {
                if index > 0 {
                    formatter.write_str(", ")?;
                }
                write!(formatter, "{key}={value}")?;
            }
            formatter.write_str(")")?;
        }
        Ok(())
    }
}

impl StdError for RecorderError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        RecorderError::new(ErrorKind::Environment, ErrorCode::Io, err.to_string())
            .with_source(err)
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __recorder_error {
    ($kind:expr, $code:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::RecorderError::new($kind, $code, format!($fmt $(, $arg)*))
    };
}

/// Construct a [`ErrorKind::Usage`] error.
#[macro_export]
macro_rules! usage {
    ($code:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::__recorder_error!($crate::ErrorKind::Usage, $code, $fmt $(, $arg)*)
    };
}

/// Construct an [`ErrorKind::Environment`] error.
#[macro_export]
macro_rules! enverr {
    ($code:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::__recorder_error!($crate::ErrorKind::Environment, $code, $fmt $(, $arg)*)
    };
}

/// Construct an [`ErrorKind::Target`] error.
#[macro_export]
macro_rules! target {
    ($code:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::__recorder_error!($crate::ErrorKind::Target, $code, $fmt $(, $arg)*)
    };
}

/// Construct an [`ErrorKind::Internal`] error.
#[macro_export]
macro_rules! internal {
    ($code:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::__recorder_error!($crate::ErrorKind::Internal, $code, $fmt $(, $arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_context() {
        let err = usage!(ErrorCode::AlreadyTracing, "tracing already active")
            .with_context("pid", "42".to_string());
        assert_eq!(
            err.to_string(),
            "[ERR_ALREADY_TRACING] tracing already active (pid=42)"
        );
    }

    #[test]
    fn codes_round_trip_through_strings() {
        for code in [
            ErrorCode::Io,
            ErrorCode::TruncatedRecord,
            ErrorCode::UnsupportedVersion,
            ErrorCode::PatchFailed,
            ErrorCode::TrackerInactive,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("ERR_NOT_A_CODE"), None);
    }

    #[test]
    fn io_errors_convert_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err = RecorderError::from(io);
        assert_eq!(err.code, ErrorCode::Io);
        assert!(err.source_ref().is_some());
    }
}
