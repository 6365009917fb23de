//! Console sink: renders each drained packet on the terminal.

use std::io::{self, Write};

use tracing::debug;

use super::decode;
use super::MonitorWriter;
use crate::error::CaptureError;
use crate::service::{CapturedPacket, Origin};

const TX_ARROW: &str = "\u{25b6}\u{2500}\u{2500}";
const RX_ARROW: &str = "\u{25c0}\u{2500}\u{2500}";

/// How much of each packet the console sink prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// One summary line per packet.
    Brief,
    /// Full structural field dump per packet.
    Verbose,
}

/// Prints captured packets to stdout, relative to the session start.
pub struct ConsoleWriter {
    verbosity: Verbosity,
    start_ts: f64,
}

impl ConsoleWriter {
    pub fn new(verbosity: Verbosity, start_ts: f64) -> Self {
        let level = match verbosity {
            Verbosity::Brief => "low",
            Verbosity::Verbose => "high",
        };
        println!("Starting console capture monitor - verbosity: '{level}'");
        println!("\n*** interrupt to abort capturing... ***\n");

        Self { verbosity, start_ts }
    }

    fn format_origin(origin: Origin) -> String {
        match origin {
            Origin::Tx => format!("{TX_ARROW} TX"),
            Origin::Rx => format!("{RX_ARROW} RX"),
        }
    }

    fn handle_pkt(&self, out: &mut impl Write, pkt: &CapturedPacket) -> Result<u64, CaptureError> {
        let decoded = decode::decode(&pkt.binary)?;

        writeln!(
            out,
            "\n#{} Port: {} {}",
            pkt.index,
            pkt.port,
            Self::format_origin(pkt.origin)
        )?;
        writeln!(
            out,
            "    Type: {}, Size: {} B, TS: {:.2} [sec]",
            decoded.protocol,
            pkt.binary.len(),
            pkt.ts - self.start_ts
        )?;

        match self.verbosity {
            Verbosity::Brief => writeln!(out, "    {}", decoded.summary)?,
            Verbosity::Verbose => {
                for line in &decoded.fields {
                    writeln!(out, "    {line}")?;
                }
                writeln!(out)?;
            }
        }

        Ok(pkt.binary.len() as u64)
    }
}

impl MonitorWriter for ConsoleWriter {
    fn handle_pkts(&mut self, pkts: &[CapturedPacket]) -> Result<u64, CaptureError> {
        let mut stdout = io::stdout().lock();
        let mut byte_count = 0;
        let mut failure = None;

        for pkt in pkts {
            match self.handle_pkt(&mut stdout, pkt) {
                Ok(n) => byte_count += n,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // the interactive display comes back whatever happened above
        let _ = stdout.flush();

        match failure {
            Some(e) => Err(e),
            None => Ok(byte_count),
        }
    }

    fn deinit(&mut self) {
        debug!("console capture monitor closed");
    }
}
