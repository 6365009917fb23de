//! Remote capture service client.
//!
//! The capture engine runs on the traffic generator and owns the actual
//! packet capture. This module defines the `CaptureService` trait consumed
//! by the monitor and manager, so they can be driven against a live RPC
//! endpoint or a scripted stand-in, plus the JSON-RPC implementation.

mod rpc;

pub use rpc::RpcCaptureService;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Identifier of a server-side capture session.
pub type CaptureId = u64;

/// Retention mode of a capture session buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Rolling buffer of limited size, drained periodically by a monitor.
    Cyclic,
    /// Packets retained up to the limit for later bulk retrieval.
    Fixed,
}

/// Which side of a port a packet was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Origin {
    Tx,
    Rx,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Tx => write!(f, "TX"),
            Origin::Rx => write!(f, "RX"),
        }
    }
}

/// Returned by a successful start-session call.
#[derive(Debug, Clone, Copy)]
pub struct CaptureHandle {
    pub id: CaptureId,
    /// Server-side capture start timestamp, in seconds.
    pub start_ts: f64,
}

/// One packet drained from a capture session. Lives only for the duration
/// of a single fetch-and-forward cycle.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    /// Raw link-layer bytes.
    pub binary: Vec<u8>,
    pub origin: Origin,
    pub port: u16,
    /// Absolute capture timestamp, in seconds.
    pub ts: f64,
    /// Sequence index within the session.
    pub index: u64,
}

/// Server-side snapshot of one capture session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: CaptureId,
    pub state: String,
    pub count: u64,
    pub limit: u64,
    pub bytes: u64,
    pub tx_ports: Vec<u16>,
    pub rx_ports: Vec<u16>,
}

/// Operations the remote capture service exposes over the RPC channel.
///
/// Callers must serialize access through the command lock; implementations
/// only guard their own transport.
pub trait CaptureService: Send + Sync {
    /// Create a capture session over the given port filters.
    fn start_capture(
        &self,
        tx_ports: &[u16],
        rx_ports: &[u16],
        limit: u64,
        mode: CaptureMode,
    ) -> Result<CaptureHandle, CaptureError>;

    /// Destroy a capture session. Tolerant of sessions that are already
    /// gone: stopping an unknown id succeeds.
    fn stop_capture(&self, id: CaptureId, output: Option<&Path>) -> Result<(), CaptureError>;

    /// Snapshot of all live sessions.
    fn capture_status(&self) -> Result<Vec<SessionStatus>, CaptureError>;

    /// Drop every session on the server.
    fn remove_all_captures(&self) -> Result<(), CaptureError>;

    /// Drain up to `pkt_limit` packets from a session's buffer.
    fn fetch(&self, id: CaptureId, pkt_limit: usize) -> Result<Vec<CapturedPacket>, CaptureError>;

    /// Connectivity probe for the underlying channel.
    fn is_connected(&self) -> bool;
}
