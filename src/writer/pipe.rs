//! Named-pipe sink feeding an external packet analyzer.
//!
//! Construction creates a fifo, waits for the analyzer to attach to the
//! read end and emits the pcap global header. The attach wait is bounded by
//! a timeout and the monitor's cancel token; on any construction failure the
//! fifo is removed before the error surfaces. Liveness is probed with a
//! zero-timeout `poll` on the write end so the worker loop never stalls.

use std::ffi::CString;
use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::MonitorWriter;
use crate::error::CaptureError;
use crate::monitor::CancelToken;
use crate::pcap::{sec_split_usec, PcapStreamWriter};
use crate::service::CapturedPacket;

const ATTACH_RETRY: Duration = Duration::from_millis(100);

/// Streams captured packets into a named pipe as a pcap byte stream.
pub struct PipeWriter {
    path: Option<PathBuf>,
    pcap: Option<PcapStreamWriter<File>>,
    fd: RawFd,
    start_ts: f64,
}

impl PipeWriter {
    /// Create a fifo under the temp directory and wait for an analyzer.
    pub fn connect(
        start_ts: f64,
        attach_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Self, CaptureError> {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let path = std::env::temp_dir().join(format!("capmon-{}-{}.pipe", process::id(), nonce));

        Self::connect_at(&path, start_ts, attach_timeout, cancel)
    }

    /// Like `connect`, with an explicit fifo path.
    pub fn connect_at(
        path: &Path,
        start_ts: f64,
        attach_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Self, CaptureError> {
        match Self::open_pipe(path, start_ts, attach_timeout, cancel) {
            Ok(writer) => Ok(writer),
            Err(e) => {
                // never leave a stale fifo behind
                let _ = fs::remove_file(path);
                Err(e)
            }
        }
    }

    fn open_pipe(
        path: &Path,
        start_ts: f64,
        attach_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Self, CaptureError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| CaptureError::Resource("pipe path contains a nul byte".into()))?;

        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
            return Err(CaptureError::Resource(format!(
                "failed to create pipe {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        println!("*** Please run 'wireshark -k -i {}' ***", path.display());
        println!("Waiting for analyzer pipe connection...");

        let fd = Self::wait_for_reader(&c_path, path, attach_timeout, cancel)?;

        // attached; route the write end through a pcap stream writer
        let file = unsafe { File::from_raw_fd(fd) };
        let pcap = PcapStreamWriter::new(file).map_err(|e| {
            CaptureError::Resource(format!("failed to write pcap header: {e}"))
        })?;

        println!("\n*** Capture monitoring started ***\n");
        debug!("pipe sink streaming into {}", path.display());

        Ok(Self {
            path: Some(path.to_path_buf()),
            pcap: Some(pcap),
            fd,
            start_ts,
        })
    }

    /// Open the write end once a reader shows up. A fifo opened with
    /// `O_WRONLY | O_NONBLOCK` fails with ENXIO until then, which gives the
    /// retry loop its cancellation points.
    fn wait_for_reader(
        c_path: &CString,
        path: &Path,
        attach_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RawFd, CaptureError> {
        let deadline = Instant::now() + attach_timeout;

        loop {
            let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
            if fd >= 0 {
                // back to blocking writes now that both ends are open
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                if flags < 0
                    || unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0
                {
                    let err = std::io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(CaptureError::Resource(format!(
                        "failed to configure pipe {}: {err}",
                        path.display()
                    )));
                }
                return Ok(fd);
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENXIO) {
                return Err(CaptureError::Resource(format!(
                    "failed to open pipe {}: {err}",
                    path.display()
                )));
            }

            if cancel.is_cancelled() {
                return Err(CaptureError::Resource("pipe monitor aborted".into()));
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::Resource(format!(
                    "no analyzer attached to {} within {:?}",
                    path.display(),
                    attach_timeout
                )));
            }
            thread::sleep(ATTACH_RETRY);
        }
    }

    /// Non-blocking probe of the write end. Reports a hangup as soon as the
    /// analyzer detaches.
    fn check_pipe(&self) -> Result<(), CaptureError> {
        if self.pcap.is_none() {
            return Err(CaptureError::Protocol("pipe is closed".into()));
        }

        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLERR,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            return Err(CaptureError::Protocol(format!(
                "pipe poll failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if rc > 0 {
            return Err(CaptureError::Protocol("pipe has been disconnected".into()));
        }

        Ok(())
    }
}

impl MonitorWriter for PipeWriter {
    fn handle_pkts(&mut self, pkts: &[CapturedPacket]) -> Result<u64, CaptureError> {
        // catch an analyzer that detached since the last cycle
        self.check_pipe()?;

        let pcap = self
            .pcap
            .as_mut()
            .ok_or_else(|| CaptureError::Protocol("pipe is closed".into()))?;

        let mut byte_count = 0;
        for pkt in pkts {
            let (sec, usec) = sec_split_usec(pkt.ts - self.start_ts);
            pcap.write_packet(sec, usec, &pkt.binary).map_err(|e| {
                CaptureError::Protocol(format!("failed to write packets to pipe: {e}"))
            })?;
            byte_count += pkt.binary.len() as u64;
        }

        Ok(byte_count)
    }

    fn periodic_check(&mut self) -> Result<(), CaptureError> {
        self.check_pipe()
    }

    fn deinit(&mut self) {
        // closes the write end
        self.pcap = None;

        if let Some(path) = self.path.take() {
            let _ = fs::remove_file(&path);
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.deinit();
    }
}
