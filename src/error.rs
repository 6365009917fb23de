use thiserror::Error;

/// Errors surfaced by the capture monitor and its collaborators.
///
/// The taxonomy matters to the monitor worker: `Config` never reaches it,
/// `Unexpected` is logged as a fatal internal fault, everything else is
/// treated as a recognized monitor error that ends the worker cleanly.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Invalid user input. Handled at the command layer, no state is mutated.
    #[error("invalid command: {0}")]
    Config(String),

    /// RPC failure or an unreachable destination while monitoring.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The RPC channel to the capture service is down.
    #[error("client has been disconnected")]
    Disconnected,

    /// Sink construction or connection failure. The sink's resources are
    /// already released when this surfaces.
    #[error("resource error: {0}")]
    Resource(String),

    /// A captured packet could not be decoded.
    #[error("failed to decode packet: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed server response: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything uncaught. Logged distinctly by the worker.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl CaptureError {
    /// Whether the monitor worker reports this as a recognized monitor error
    /// rather than a fatal internal one.
    pub fn is_monitor_error(&self) -> bool {
        !matches!(self, CaptureError::Unexpected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_monitor_errors() {
        assert!(CaptureError::Protocol("fetch failed".into()).is_monitor_error());
        assert!(CaptureError::Disconnected.is_monitor_error());
        assert!(CaptureError::Decode("truncated frame".into()).is_monitor_error());
    }

    #[test]
    fn unexpected_errors_are_fatal() {
        assert!(!CaptureError::Unexpected("poisoned lock".into()).is_monitor_error());
    }
}
