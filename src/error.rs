//! Failure taxonomy for a capture run.
//!
//! Plumbing code returns `anyhow::Result`; these variants mark the failures
//! the capture loop reacts to differently. They travel inside `anyhow::Error`
//! and can be recovered with `downcast_ref::<CaptureError>()`.

/// Classified capture failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureError {
    /// Camera unavailable or a frame read failed. Fatal for the run.
    Device(String),
    /// Remote display unreachable or a publish failed. Logged and swallowed.
    Transport(String),
    /// Malformed external state patch. Rejected before any mutation.
    Validation(String),
    /// Per-side or inactivity timeout. Recoverable.
    Timeout(String),
}

impl CaptureError {
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable short code, used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Device(_) => "device_error",
            Self::Transport(_) => "transport_error",
            Self::Validation(_) => "validation_error",
            Self::Timeout(_) => "timeout",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Device(m) | Self::Transport(m) | Self::Validation(m) | Self::Timeout(m) => m,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for CaptureError {}

/// Returns the classified error carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&CaptureError> {
    err.downcast_ref::<CaptureError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_errors_are_fatal() {
        assert!(CaptureError::device("read failed").is_fatal());
        assert!(!CaptureError::transport("closed").is_fatal());
        assert!(!CaptureError::validation("bad").is_fatal());
        assert!(!CaptureError::Timeout("side".into()).is_fatal());
    }

    #[test]
    fn classify_recovers_error_through_context() {
        let err = anyhow::Error::new(CaptureError::device("no frame")).context("tick");
        assert_eq!(classify(&err), Some(&CaptureError::device("no frame")));
        assert_eq!(classify(&anyhow::anyhow!("plain")), None);
    }
}
