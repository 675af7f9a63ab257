//! Driver-facing error type and the recoverable/terminal taxonomy (spec §7).

use std::sync::OnceLock;

use crate::engine::EngineError;

/// Error returned by every driver-plugin-surface operation.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Validation(String),

    #[error("task already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Failed to pull {image}: {source}")]
    ImagePull { image: String, source: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,
}

impl DriverError {
    /// Whether the host may retry by re-issuing the same driver call.
    pub fn recoverable(&self) -> bool {
        match self {
            DriverError::Engine(e) => e.recoverable(),
            DriverError::Validation(_) => false,
            DriverError::AlreadyExists(_) => true,
            DriverError::NotFound(_) => false,
            DriverError::ImagePull { source, .. } => image_pull_error_is_recoverable(source),
            DriverError::Cancelled => true,
            DriverError::Timeout => true,
        }
    }

    pub fn image_pull(image: impl Into<String>, source: impl std::fmt::Display) -> Self {
        DriverError::ImagePull {
            image: image.into(),
            source: source.to_string(),
        }
    }
}

/// `image-not-found` errors are the one terminal case inside an otherwise
/// recoverable envelope; everything else wrapping a pull failure (context
/// deadline, transient HTTP errors) is recoverable.
fn image_pull_error_is_recoverable(text: &str) -> bool {
    static NOT_FOUND: OnceLock<regex::Regex> = OnceLock::new();
    let re = NOT_FOUND.get_or_init(|| regex::Regex::new(r"(?i)error: image .+ not found").unwrap());
    !re.is_match(text)
}

pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_not_found_is_terminal() {
        let err = DriverError::image_pull("busybox:latest", "Error: image busybox:latest not found");
        assert!(!err.recoverable());
    }

    #[test]
    fn other_pull_failures_are_recoverable() {
        let err = DriverError::image_pull("busybox:latest", "context deadline exceeded");
        assert!(err.recoverable());
    }

    #[test]
    fn validation_errors_are_terminal() {
        let err = DriverError::Validation("volumes are not enabled".into());
        assert!(!err.recoverable());
    }
}
