//! Command-level orchestration of capture sessions.
//!
//! The manager owns at most one live monitor, dispatches the user-facing
//! operations over the shared RPC channel and renders the status view. It
//! holds the command lock for the duration of every remote call it issues,
//! which is what the monitor worker's non-blocking lock polling pairs with.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, MutexGuard};

use tracing::info;

use crate::error::CaptureError;
use crate::monitor::{CaptureMonitor, CmdLock, MonitorConfig, MonitorRow};
use crate::service::{CaptureId, CaptureMode, CaptureService, SessionStatus};

/// Owns the single optional monitor and routes user commands.
pub struct CaptureManager {
    service: Arc<dyn CaptureService>,
    cmd_lock: CmdLock,
    monitor: Option<CaptureMonitor>,
}

/// One standalone (non-monitored) session row of the status view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderRow {
    pub id: CaptureId,
    pub state: String,
    pub count: u64,
    pub limit: u64,
    pub bytes: u64,
    pub tx_ports: Vec<u16>,
    pub rx_ports: Vec<u16>,
}

impl From<SessionStatus> for RecorderRow {
    fn from(s: SessionStatus) -> Self {
        Self {
            id: s.id,
            state: s.state,
            count: s.count,
            limit: s.limit,
            bytes: s.bytes,
            tx_ports: s.tx_ports,
            rx_ports: s.rx_ports,
        }
    }
}

/// Status view: standalone sessions straight from the server snapshot, the
/// monitored session from the monitor's locally mirrored counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowReport {
    pub recorders: Vec<RecorderRow>,
    pub monitor: Option<MonitorRow>,
}

impl CaptureManager {
    pub fn new(service: Arc<dyn CaptureService>, cmd_lock: CmdLock) -> Self {
        Self {
            service,
            cmd_lock,
            monitor: None,
        }
    }

    fn lock_cmd(&self) -> MutexGuard<'_, ()> {
        self.cmd_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a live monitor, replacing (and first stopping) any prior one.
    pub fn start_monitor(&mut self, config: MonitorConfig) -> Result<(), CaptureError> {
        if config.tx_ports.is_empty() && config.rx_ports.is_empty() {
            return Err(CaptureError::Config(
                "please provide at least one tx or rx port".into(),
            ));
        }

        self.stop_monitor()?;

        let mut monitor =
            CaptureMonitor::new(self.service.clone(), self.cmd_lock.clone(), config);
        {
            let _guard = self.lock_cmd();
            monitor.start()?;
        }
        self.monitor = Some(monitor);

        Ok(())
    }

    /// Stop the live monitor. A no-op when none is running.
    pub fn stop_monitor(&mut self) -> Result<(), CaptureError> {
        let Some(mut monitor) = self.monitor.take() else {
            return Ok(());
        };

        info!("stopping capture monitor");
        let _guard = self.lock_cmd();
        monitor.stop()
    }

    pub fn monitor_active(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| m.is_active())
    }

    /// Start a fixed-mode recording session and return its id.
    pub fn start_record(
        &mut self,
        tx_ports: &[u16],
        rx_ports: &[u16],
        limit: u64,
    ) -> Result<CaptureId, CaptureError> {
        if tx_ports.is_empty() && rx_ports.is_empty() {
            return Err(CaptureError::Config(
                "please provide at least one tx or rx port".into(),
            ));
        }

        let _guard = self.lock_cmd();
        let handle = self
            .service
            .start_capture(tx_ports, rx_ports, limit, CaptureMode::Fixed)?;

        Ok(handle.id)
    }

    /// Stop a recording session. Refuses the id owned by the live monitor.
    pub fn stop_record(
        &mut self,
        id: CaptureId,
        output: Option<&Path>,
    ) -> Result<(), CaptureError> {
        if self.monitored_id() == Some(id) {
            return Err(CaptureError::Config(format!(
                "'{id}' is a monitor, stop it through the monitor command"
            )));
        }

        let _guard = self.lock_cmd();
        let live = self.service.capture_status()?;
        if !live.iter().any(|s| s.id == id) {
            return Err(CaptureError::Config(format!(
                "'{id}' is not an active capture id"
            )));
        }

        self.service.stop_capture(id, output)
    }

    /// Stop the monitor, then drop every session on the server.
    pub fn clear(&mut self) -> Result<(), CaptureError> {
        self.stop_monitor()?;

        let _guard = self.lock_cmd();
        self.service.remove_all_captures()
    }

    /// Build the status view.
    pub fn show(&self) -> Result<ShowReport, CaptureError> {
        let status = {
            let _guard = self.lock_cmd();
            self.service.capture_status()?
        };

        let monitored = self.monitored_id();
        let mut recorders = Vec::new();
        let mut monitor = None;

        for session in status {
            if monitored == Some(session.id) {
                if let Some(m) = &self.monitor {
                    monitor = Some(m.mon_row());
                }
            } else {
                recorders.push(RecorderRow::from(session));
            }
        }

        Ok(ShowReport { recorders, monitor })
    }

    fn monitored_id(&self) -> Option<CaptureId> {
        self.monitor.as_ref().and_then(|m| m.capture_id())
    }
}

const COL_WIDTH: usize = 15;

impl ShowReport {
    /// Render the two fixed-width tables, skipping empty ones.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.recorders.is_empty() {
            render_header(&mut out, "Active Recorders");
            render_row(
                &mut out,
                &["ID", "Status", "Packets", "Bytes", "TX Ports", "RX Ports"],
            );
            for r in &self.recorders {
                render_row(
                    &mut out,
                    &[
                        &r.id.to_string(),
                        &r.state,
                        &format!("[{}/{}]", r.count, r.limit),
                        &format_num(r.bytes),
                        &format_ports(&r.tx_ports),
                        &format_ports(&r.rx_ports),
                    ],
                );
            }
        }

        if let Some(m) = &self.monitor {
            render_header(&mut out, "Active Monitor");
            render_row(
                &mut out,
                &[
                    "ID",
                    "Status",
                    "Packets Seen",
                    "Bytes Seen",
                    "TX Ports",
                    "RX Ports",
                ],
            );
            render_row(
                &mut out,
                &[
                    &m.id.map_or_else(|| "-".to_string(), |id| id.to_string()),
                    if m.active { "ACTIVE" } else { "DEAD" },
                    &m.pkt_count.to_string(),
                    &format_num(m.byte_count),
                    &format_ports(&m.tx_ports),
                    &format_ports(&m.rx_ports),
                ],
            );
        }

        out
    }
}

fn render_header(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{title}");
    let _ = writeln!(out, "{}", "-".repeat(COL_WIDTH * 6 + 5));
}

fn render_row(out: &mut String, cells: &[&str]) {
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push('|');
        }
        let _ = write!(line, "{:^COL_WIDTH$}", truncate(cell));
    }
    let _ = writeln!(out, "{}", line.trim_end());
}

// cells come straight off the wire, so cut on a char boundary
fn truncate(cell: &str) -> &str {
    cell.char_indices()
        .nth(COL_WIDTH)
        .map_or(cell, |(i, _)| &cell[..i])
}

fn format_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        "-".to_string()
    } else {
        ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Human-readable byte count with a decimal-thousands suffix.
fn format_num(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
