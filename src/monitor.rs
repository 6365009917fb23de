//! Live capture monitor.
//!
//! Owns one remote cyclic session, one sink and one background worker that
//! drains the session's rolling buffer through the shared RPC channel. The
//! worker competes with the interactive command thread for that channel via
//! the command lock and cooperates with shutdown at every suspension point,
//! so a stop request is honored within roughly one tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::CaptureError;
use crate::service::{CaptureId, CaptureMode, CaptureService, CapturedPacket};
#[cfg(unix)]
use crate::writer::PipeWriter;
use crate::writer::{ConsoleWriter, MonitorWriter, SinkKind, Verbosity};

/// Cooperative cancellation handle checked by the worker at every
/// suspension point. Cloning shares the underlying flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Serializes all use of the RPC channel between the command thread and the
/// monitor worker.
pub type CmdLock = Arc<Mutex<()>>;

/// Tuning and sink selection for one monitor instance.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub tx_ports: Vec<u16>,
    pub rx_ports: Vec<u16>,
    /// Packet limit of the rolling session buffer.
    pub rate_pps: u64,
    pub sink: SinkKind,
    /// Granularity of the cooperative sleep.
    pub tick: Duration,
    /// Ticks slept between fetch cycles.
    pub ticks_per_poll: u32,
    /// Interval between non-blocking command-lock attempts.
    pub lock_retry: Duration,
    /// Packet-count ceiling per fetch call.
    pub fetch_limit: usize,
    /// How long the pipe sink waits for an analyzer to attach.
    pub pipe_attach_timeout: Duration,
}

impl MonitorConfig {
    pub fn new(tx_ports: Vec<u16>, rx_ports: Vec<u16>, sink: SinkKind) -> Self {
        Self {
            tx_ports,
            rx_ports,
            rate_pps: 100,
            sink,
            tick: Duration::from_millis(100),
            ticks_per_poll: 5,
            lock_retry: Duration::from_millis(100),
            fetch_limit: 10,
            pipe_attach_timeout: Duration::from_secs(60),
        }
    }
}

/// Snapshot of the monitored session rendered from local counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRow {
    pub id: Option<CaptureId>,
    pub active: bool,
    pub pkt_count: u64,
    pub byte_count: u64,
    pub tx_ports: Vec<u16>,
    pub rx_ports: Vec<u16>,
}

/// State shared between the monitor handle and its worker thread.
#[derive(Default)]
struct Shared {
    /// True from spawn until the worker exits, on any path.
    active: AtomicBool,
    pkt_count: AtomicU64,
    byte_count: AtomicU64,
}

type SharedWriter = Arc<Mutex<Box<dyn MonitorWriter>>>;

#[cfg(test)]
type WriterFactory =
    Box<dyn Fn(f64) -> Result<Box<dyn MonitorWriter>, CaptureError> + Send + Sync>;

/// Client-side handle of one live monitoring session.
pub struct CaptureMonitor {
    service: Arc<dyn CaptureService>,
    cmd_lock: CmdLock,
    config: MonitorConfig,
    shared: Arc<Shared>,
    token: CancelToken,
    worker: Option<JoinHandle<()>>,
    writer: Option<SharedWriter>,
    capture_id: Option<CaptureId>,
    #[cfg(test)]
    writer_factory: Option<WriterFactory>,
}

impl CaptureMonitor {
    pub fn new(service: Arc<dyn CaptureService>, cmd_lock: CmdLock, config: MonitorConfig) -> Self {
        Self {
            service,
            cmd_lock,
            config,
            shared: Arc::new(Shared::default()),
            token: CancelToken::new(),
            worker: None,
            writer: None,
            capture_id: None,
            #[cfg(test)]
            writer_factory: None,
        }
    }

    /// Create the remote session, construct the sink and spawn the worker.
    /// Any failure rolls back through `stop()` before the error returns, so
    /// a half-started monitor never leaks a session, thread or sink.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.is_active() {
            return Err(CaptureError::Config("monitor is already active".into()));
        }

        match self.try_start() {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(cleanup) = self.stop() {
                    debug!("rollback cleanup failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn try_start(&mut self) -> Result<(), CaptureError> {
        if self.config.tx_ports.is_empty() && self.config.rx_ports.is_empty() {
            return Err(CaptureError::Config(
                "please provide at least one tx or rx port".into(),
            ));
        }

        let handle = self.service.start_capture(
            &self.config.tx_ports,
            &self.config.rx_ports,
            self.config.rate_pps,
            CaptureMode::Cyclic,
        )?;
        self.capture_id = Some(handle.id);

        self.token = CancelToken::new();
        let writer: SharedWriter = Arc::new(Mutex::new(self.build_writer(handle.start_ts)?));
        self.writer = Some(writer.clone());

        self.shared.pkt_count.store(0, Ordering::Relaxed);
        self.shared.byte_count.store(0, Ordering::Relaxed);
        self.shared.active.store(true, Ordering::Relaxed);

        let worker = Worker {
            service: self.service.clone(),
            cmd_lock: self.cmd_lock.clone(),
            shared: self.shared.clone(),
            token: self.token.clone(),
            writer,
            capture_id: handle.id,
            tick: self.config.tick,
            ticks_per_poll: self.config.ticks_per_poll,
            lock_retry: self.config.lock_retry,
            fetch_limit: self.config.fetch_limit,
        };
        self.worker = Some(
            thread::Builder::new()
                .name("capture-monitor".into())
                .spawn(move || worker.run())?,
        );

        debug!("monitor started for capture {}", handle.id);
        Ok(())
    }

    fn build_writer(&self, start_ts: f64) -> Result<Box<dyn MonitorWriter>, CaptureError> {
        #[cfg(test)]
        if let Some(factory) = &self.writer_factory {
            return factory(start_ts);
        }

        match self.config.sink {
            SinkKind::Compact => Ok(Box::new(ConsoleWriter::new(Verbosity::Brief, start_ts))),
            SinkKind::Verbose => Ok(Box::new(ConsoleWriter::new(Verbosity::Verbose, start_ts))),
            #[cfg(unix)]
            SinkKind::Pipe => Ok(Box::new(PipeWriter::connect(
                start_ts,
                self.config.pipe_attach_timeout,
                &self.token,
            )?)),
            #[cfg(not(unix))]
            SinkKind::Pipe => Err(CaptureError::Config(
                "the pipe sink requires a unix platform".into(),
            )),
        }
    }

    /// Stop the monitor. Safe to call when nothing is running. Local state
    /// is consistent before remote cleanup is attempted, so the handle stays
    /// reusable even when that cleanup fails and its error propagates.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        self.token.cancel();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("monitor worker panicked");
            }
        }
        self.shared.active.store(false, Ordering::Relaxed);

        if let Some(writer) = self.writer.take() {
            match writer.lock() {
                Ok(mut writer) => writer.deinit(),
                Err(poisoned) => poisoned.into_inner().deinit(),
            }
        }

        let Some(id) = self.capture_id.take() else {
            return Ok(());
        };

        // remote reconciliation is best effort past this point
        if !self.service.is_connected() {
            return Ok(());
        }
        let live = self.service.capture_status()?;
        if live.iter().any(|s| s.id == id) {
            self.service.stop_capture(id, None)?;
        }

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    pub fn capture_id(&self) -> Option<CaptureId> {
        self.capture_id
    }

    pub fn pkt_count(&self) -> u64 {
        self.shared.pkt_count.load(Ordering::Relaxed)
    }

    pub fn byte_count(&self) -> u64 {
        self.shared.byte_count.load(Ordering::Relaxed)
    }

    /// Lock-free display snapshot; brief staleness is acceptable.
    pub fn mon_row(&self) -> MonitorRow {
        MonitorRow {
            id: self.capture_id,
            active: self.is_active(),
            pkt_count: self.pkt_count(),
            byte_count: self.byte_count(),
            tx_ports: self.config.tx_ports.clone(),
            rx_ports: self.config.rx_ports.clone(),
        }
    }

    #[cfg(test)]
    fn with_writer_factory(mut self, factory: WriterFactory) -> Self {
        self.writer_factory = Some(factory);
        self
    }
}

impl Drop for CaptureMonitor {
    fn drop(&mut self) {
        // no remote cleanup here; just never leak the thread or the sink
        self.token.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(writer) = self.writer.take() {
            match writer.lock() {
                Ok(mut writer) => writer.deinit(),
                Err(poisoned) => poisoned.into_inner().deinit(),
            }
        }
    }
}

/// Everything the background thread needs, moved into it at spawn.
struct Worker {
    service: Arc<dyn CaptureService>,
    cmd_lock: CmdLock,
    shared: Arc<Shared>,
    token: CancelToken,
    writer: SharedWriter,
    capture_id: CaptureId,
    tick: Duration,
    ticks_per_poll: u32,
    lock_retry: Duration,
    fetch_limit: usize,
}

impl Worker {
    fn run(self) {
        match self.main_loop() {
            Ok(()) => debug!("monitor worker finished"),
            Err(e) if e.is_monitor_error() => {
                warn!("monitor has encountered the following error: {}", e);
                warn!("monitor is inactive - please restart the monitor");
            }
            Err(e) => {
                error!("a fatal internal error has occurred: {}", e);
                error!("monitor is inactive - please restart the monitor");
            }
        }

        self.shared.active.store(false, Ordering::Relaxed);
    }

    fn main_loop(&self) -> Result<(), CaptureError> {
        while !self.token.is_cancelled() {
            if !self.sleep() {
                return Ok(());
            }

            self.with_writer(|w| w.periodic_check())?;

            let Some(guard) = self.lock_cmd_channel() else {
                return Ok(());
            };
            let fetched = self.fetch_locked();
            // the channel frees on every exit path, fetch failure included
            drop(guard);
            let pkts = fetched?;

            if pkts.is_empty() {
                continue;
            }

            let byte_count = self.with_writer(|w| w.handle_pkts(&pkts))?;
            self.shared
                .pkt_count
                .fetch_add(pkts.len() as u64, Ordering::Relaxed);
            self.shared
                .byte_count
                .fetch_add(byte_count, Ordering::Relaxed);
        }

        Ok(())
    }

    /// One poll period, split into short ticks so a pending stop is honored
    /// within roughly one tick. Returns false when cancelled.
    fn sleep(&self) -> bool {
        for _ in 0..self.ticks_per_poll {
            if self.token.is_cancelled() {
                return false;
            }
            thread::sleep(self.tick);
        }
        true
    }

    /// Non-blocking acquisition with bounded retries, so a stop request is
    /// never starved behind a long-held command lock. Returns None when
    /// cancelled while waiting.
    fn lock_cmd_channel(&self) -> Option<MutexGuard<'_, ()>> {
        loop {
            match self.cmd_lock.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            }

            if self.token.is_cancelled() {
                return None;
            }
            thread::sleep(self.lock_retry);
        }
    }

    fn fetch_locked(&self) -> Result<Vec<CapturedPacket>, CaptureError> {
        if !self.service.is_connected() {
            return Err(CaptureError::Disconnected);
        }
        self.service.fetch(self.capture_id, self.fetch_limit)
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut dyn MonitorWriter) -> Result<T, CaptureError>,
    ) -> Result<T, CaptureError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| CaptureError::Unexpected("writer lock poisoned".into()))?;
        f(guard.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testutil::{packet, MockService};

    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Records what the worker does to it; optionally fails the liveness
    /// probe after a scripted number of checks.
    #[derive(Default)]
    struct RecordingWriter {
        batches: Arc<Mutex<Vec<usize>>>,
        deinits: Arc<AtomicUsize>,
        fail_check_after: Option<usize>,
        checks: usize,
    }

    #[derive(Clone, Default)]
    struct WriterProbe {
        batches: Arc<Mutex<Vec<usize>>>,
        deinits: Arc<AtomicUsize>,
    }

    impl RecordingWriter {
        fn with_probe(probe: &WriterProbe, fail_check_after: Option<usize>) -> Self {
            Self {
                batches: probe.batches.clone(),
                deinits: probe.deinits.clone(),
                fail_check_after,
                checks: 0,
            }
        }
    }

    impl MonitorWriter for RecordingWriter {
        fn handle_pkts(&mut self, pkts: &[CapturedPacket]) -> Result<u64, CaptureError> {
            self.batches.lock().unwrap().push(pkts.len());
            Ok(pkts.iter().map(|p| p.binary.len() as u64).sum())
        }

        fn periodic_check(&mut self) -> Result<(), CaptureError> {
            self.checks += 1;
            match self.fail_check_after {
                Some(n) if self.checks > n => {
                    Err(CaptureError::Protocol("pipe has been disconnected".into()))
                }
                _ => Ok(()),
            }
        }

        fn deinit(&mut self) {
            self.deinits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fast_config(sink: SinkKind) -> MonitorConfig {
        let mut config = MonitorConfig::new(vec![0], vec![1], sink);
        config.tick = Duration::from_millis(2);
        config.ticks_per_poll = 2;
        config.lock_retry = Duration::from_millis(2);
        config
    }

    fn monitor_with_probe(
        service: Arc<MockService>,
        lock: CmdLock,
        fail_check_after: Option<usize>,
    ) -> (CaptureMonitor, WriterProbe) {
        let probe = WriterProbe::default();
        let factory_probe = probe.clone();
        let monitor = CaptureMonitor::new(service, lock, fast_config(SinkKind::Compact))
            .with_writer_factory(Box::new(move |_| {
                Ok(Box::new(RecordingWriter::with_probe(
                    &factory_probe,
                    fail_check_after,
                )))
            }));
        (monitor, probe)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn counters_accumulate_across_fetch_cycles() {
        let service = Arc::new(MockService::new());
        service.push_fetch(Ok(vec![packet(0, 60), packet(1, 100), packet(2, 74)]));
        service.push_fetch(Ok(Vec::new()));
        service.push_fetch(Ok(vec![packet(3, 60)]));

        let (mut monitor, probe) =
            monitor_with_probe(service.clone(), Arc::new(Mutex::new(())), None);
        monitor.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || monitor.pkt_count() == 4));
        assert_eq!(monitor.byte_count(), 294);
        assert!(monitor.is_active());
        // the empty fetch never reached the writer
        assert_eq!(*probe.batches.lock().unwrap(), vec![3, 1]);

        monitor.stop().unwrap();
    }

    #[test]
    fn empty_fetches_leave_counters_untouched() {
        let service = Arc::new(MockService::new());
        let (mut monitor, probe) =
            monitor_with_probe(service.clone(), Arc::new(Mutex::new(())), None);

        monitor.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(monitor.pkt_count(), 0);
        assert_eq!(monitor.byte_count(), 0);
        assert!(probe.batches.lock().unwrap().is_empty());

        monitor.stop().unwrap();
    }

    #[test]
    fn failed_liveness_probe_kills_the_worker_quietly() {
        let service = Arc::new(MockService::new());
        let (mut monitor, probe) =
            monitor_with_probe(service.clone(), Arc::new(Mutex::new(())), Some(1));

        monitor.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || !monitor.is_active()));

        // DEAD, not stopped: id and counters stay readable
        assert!(monitor.capture_id().is_some());
        assert_eq!(probe.deinits.load(Ordering::Relaxed), 0);

        monitor.stop().unwrap();
        assert_eq!(probe.deinits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fetch_error_kills_the_worker_quietly() {
        let service = Arc::new(MockService::new());
        service.push_fetch(Err(CaptureError::Protocol("fetch failed".into())));

        let (mut monitor, _probe) =
            monitor_with_probe(service.clone(), Arc::new(Mutex::new(())), None);
        monitor.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || !monitor.is_active()));
        monitor.stop().unwrap();
    }

    #[test]
    fn stop_completes_while_lock_is_held_elsewhere() {
        let service = Arc::new(MockService::new());
        let lock: CmdLock = Arc::new(Mutex::new(()));
        let (mut monitor, _probe) = monitor_with_probe(service.clone(), lock.clone(), None);

        monitor.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        // park the worker in its lock-retry loop
        let guard = lock.lock().unwrap();
        thread::sleep(Duration::from_millis(20));

        let begun = Instant::now();
        monitor.stop().unwrap();
        drop(guard);

        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(!monitor.is_active());
    }

    #[test]
    fn stop_is_idempotent_and_reconciles_remotely() {
        let service = Arc::new(MockService::new());
        let (mut monitor, probe) =
            monitor_with_probe(service.clone(), Arc::new(Mutex::new(())), None);

        monitor.start().unwrap();
        let id = monitor.capture_id().unwrap();

        monitor.stop().unwrap();
        assert_eq!(service.stopped_ids(), vec![id]);
        assert_eq!(probe.deinits.load(Ordering::Relaxed), 1);
        assert!(monitor.capture_id().is_none());

        // second stop has nothing left to do
        monitor.stop().unwrap();
        assert_eq!(service.stopped_ids(), vec![id]);
        assert_eq!(probe.deinits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stop_skips_remote_cleanup_when_disconnected() {
        let service = Arc::new(MockService::new());
        let (mut monitor, _probe) =
            monitor_with_probe(service.clone(), Arc::new(Mutex::new(())), None);

        monitor.start().unwrap();
        service.connected.store(false, Ordering::Relaxed);

        monitor.stop().unwrap();
        assert!(service.stopped_ids().is_empty());
    }

    #[test]
    fn failed_sink_construction_rolls_back_the_session() {
        let service = Arc::new(MockService::new());
        let mut monitor = CaptureMonitor::new(
            service.clone(),
            Arc::new(Mutex::new(())),
            fast_config(SinkKind::Compact),
        )
        .with_writer_factory(Box::new(|_| {
            Err(CaptureError::Resource("no analyzer attached".into()))
        }));

        let err = monitor.start().unwrap_err();
        assert!(matches!(err, CaptureError::Resource(_)));
        assert!(!monitor.is_active());
        assert!(monitor.capture_id().is_none());
        // the half-started session was cleaned up on the server
        assert_eq!(service.stopped_ids().len(), 1);
    }

    #[test]
    fn start_requires_a_port_filter() {
        let service = Arc::new(MockService::new());
        let mut config = fast_config(SinkKind::Compact);
        config.tx_ports.clear();
        config.rx_ports.clear();

        let mut monitor = CaptureMonitor::new(service, Arc::new(Mutex::new(())), config);
        let err = monitor.start().unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
    }

    #[test]
    fn monitor_restarts_after_stop() {
        let service = Arc::new(MockService::new());
        let (mut monitor, _probe) =
            monitor_with_probe(service.clone(), Arc::new(Mutex::new(())), None);

        monitor.start().unwrap();
        monitor.stop().unwrap();
        monitor.start().unwrap();
        assert!(monitor.is_active());
        monitor.stop().unwrap();
    }
}
