//! Error types for session coordination.
//!
//! Every failure crossing the session boundary is one of the variants
//! below. Loader errors that are not already `SessionError` values are
//! re-wrapped as `DataParsing` before they reach a caller, so the rest of
//! the engine only ever handles this taxonomy.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the session and its stdin lock.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A deadline fired before the stdin lock could be acquired.
    #[error("{resource}: lock wait timeout period exceeded")]
    LockTimeout {
        /// Name of the contended resource.
        resource: String,
    },

    /// An unlock was attempted without a matching held lock.
    #[error("locker is unlocked")]
    LockMisuse,

    /// A view was requested from stdin but no piped data is available.
    #[error("{reference}: stdin is empty")]
    StdinEmpty {
        /// String form of the referencing expression.
        reference: String,
    },

    /// The underlying stream failed while being read.
    #[error("{reference}: {message}")]
    Io {
        /// String form of the referencing expression.
        reference: String,
        /// Message of the underlying I/O failure.
        message: String,
    },

    /// The parsing collaborator rejected the stream contents.
    #[error("data parsing error in {}: {}", .path.display(), .message)]
    DataParsing {
        /// Resolved path of the offending source.
        path: PathBuf,
        /// Message of the underlying parse failure.
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SessionError::LockTimeout {
            resource: "STDIN".to_string(),
        };
        assert_eq!(err.to_string(), "STDIN: lock wait timeout period exceeded");

        let err = SessionError::StdinEmpty {
            reference: "STDIN".to_string(),
        };
        assert_eq!(err.to_string(), "STDIN: stdin is empty");

        let err = SessionError::DataParsing {
            path: PathBuf::from("STDIN"),
            message: "unexpected field count".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "data parsing error in STDIN: unexpected field count"
        );
    }
}
