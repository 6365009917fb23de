//! Monitor packet sinks.
//!
//! A capture monitor forwards every drained batch into exactly one sink.
//! The `MonitorWriter` trait keeps the worker loop independent of where the
//! packets end up: the console or a named pipe feeding an external analyzer.

mod console;
mod decode;
#[cfg(unix)]
mod pipe;

pub use console::{ConsoleWriter, Verbosity};
#[cfg(unix)]
pub use pipe::PipeWriter;

use crate::error::CaptureError;
use crate::service::CapturedPacket;

/// Sink consuming the packet batches drained by a capture monitor.
pub trait MonitorWriter: Send {
    /// Consume one batch and return the total bytes handled. Fails when the
    /// destination is unavailable or a packet cannot be decoded or written.
    fn handle_pkts(&mut self, pkts: &[CapturedPacket]) -> Result<u64, CaptureError>;

    /// Verify the destination can still accept packets.
    fn periodic_check(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Release the sink's resources. Must be idempotent and safe to call
    /// after partial construction.
    fn deinit(&mut self) {}
}

/// Which sink variant a monitor streams into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Console, one summary line per packet.
    Compact,
    /// Console, full structural dump per packet.
    Verbose,
    /// Named pipe feeding an external packet analyzer.
    Pipe,
}
