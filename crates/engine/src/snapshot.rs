//! Snapshot controller
//!
//! [`SnapshotEngine`] owns the run anchor: the single record of whether a
//! snapshot is running and how the last one ended. It enforces that at most
//! one run is active, drives the scan/dump loop, and publishes the outcome.
//!
//! # Run Lifecycle
//!
//! ```text
//! Idle ──start/run_direct──▶ Preparing ──▶ Running ──▶ Completed(success)
//!                                                 ├──▶ Completed(failure)
//!                                                 └──▶ StoppedPartial
//! ```
//!
//! Leaving Running always clears the running flag and records the outcome,
//! including when the dump panics.
//!
//! # Locking
//!
//! The anchor mutex covers control-plane transitions only. It is never held
//! across the scan/dump loop: for the duration of a run the buffer, file
//! and item counter belong to the thread executing it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use cachesnap_core::{now_secs, PrefixFilter, Result, SnapshotError, SnapshotMode};
use cachesnap_durability::{
    check_file_validity, RedoStore, ReplayStats, SnapshotBuffer, SnapshotReplayer, SnapshotWriter,
};

use crate::background::SnapshotWorker;
use crate::config::SnapshotConfig;
use crate::dump::{DumpContext, DumpStrategy};
use crate::scan::{CheckpointScope, ItemSource, ScanBatch, ScanOptions};

/// Completion callback for asynchronous runs
pub type SnapshotCallback = Box<dyn FnOnce(&Result<SnapshotReport>) + Send>;

/// Parameters of one snapshot run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// What to write
    pub mode: SnapshotMode,
    /// Which keys to cover
    pub prefix: PrefixFilter,
    /// Artifact path; the configured default when `None`
    pub path: Option<PathBuf>,
}

impl SnapshotRequest {
    /// Request a full-keyspace run in `mode` to the default path
    pub fn new(mode: SnapshotMode) -> Self {
        SnapshotRequest {
            mode,
            prefix: PrefixFilter::All,
            path: None,
        }
    }

    /// Restrict the run to a prefix
    pub fn with_prefix(mut self, prefix: PrefixFilter) -> Self {
        self.prefix = prefix;
        self
    }

    /// Write the artifact to `path`
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Mode of the run
    pub mode: SnapshotMode,
    /// Prefix filter of the run
    pub prefix: PrefixFilter,
    /// Artifact path
    pub path: PathBuf,
    /// Whether the artifact is complete
    pub success: bool,
    /// Items dumped
    pub snapped: u64,
    /// Final artifact size in bytes
    pub file_size: u64,
    /// Start time, seconds since the Unix epoch
    pub started_at: u64,
    /// Stop time, seconds since the Unix epoch
    pub stopped_at: u64,
    /// Wall-clock duration
    pub elapsed: Duration,
    /// Failure description for unsuccessful runs
    pub failure: Option<String>,
}

impl SnapshotReport {
    /// Whole seconds between start and stop, as reported in stats
    pub fn last_run_secs(&self) -> u64 {
        self.stopped_at.saturating_sub(self.started_at)
    }
}

/// Handle to an asynchronous run.
///
/// Dropping the ticket does not affect the run.
pub struct SnapshotTicket {
    rx: mpsc::Receiver<Result<SnapshotReport>>,
}

impl SnapshotTicket {
    /// Block until the run finishes.
    pub fn wait(self) -> Result<SnapshotReport> {
        self.rx
            .recv()
            .unwrap_or(Err(SnapshotError::WorkerUnavailable))
    }

    /// Block up to `timeout`; `None` if the run is still going.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<SnapshotReport>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(SnapshotError::WorkerUnavailable)),
        }
    }

    /// The outcome, if the run has finished.
    pub fn try_result(&self) -> Option<Result<SnapshotReport>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(SnapshotError::WorkerUnavailable)),
        }
    }
}

/// Control-plane state, guarded by the anchor mutex
struct RunAnchor {
    running: bool,
    success: bool,
    mode: Option<SnapshotMode>,
    snapped: u64,
    started_at: u64,
    stopped_at: Option<u64>,
    prefix: PrefixFilter,
    path: PathBuf,
    file_size: u64,
    /// Parked here between runs; owned by the running thread during a run
    buffer: Option<SnapshotBuffer>,
    last_report: Option<SnapshotReport>,
}

struct EngineShared {
    config: SnapshotConfig,
    source: Arc<dyn ItemSource>,
    checkpoint_scope: Option<Arc<dyn CheckpointScope>>,
    anchor: Mutex<RunAnchor>,
    run_done: Condvar,
    stop_requested: AtomicBool,
    shutting_down: Arc<AtomicBool>,
}

/// Parameters fixed at run start
struct PreparedRun {
    mode: SnapshotMode,
    prefix: PrefixFilter,
    path: PathBuf,
    started_at: u64,
    started: Instant,
}

/// What the scan/dump loop produced
struct RunOutcome {
    result: Result<()>,
    snapped: u64,
    file_size: u64,
}

/// Publishes the end of a run exactly once: normally through `finish`,
/// otherwise on drop.
struct RunGuard {
    shared: Arc<EngineShared>,
    run: PreparedRun,
    buffer: SnapshotBuffer,
    finished: bool,
}

impl RunGuard {
    fn finish(mut self, outcome: RunOutcome) -> Result<SnapshotReport> {
        self.finished = true;
        let failure = outcome.result.as_ref().err().map(|e| e.to_string());
        let report = self.publish(outcome.result.is_ok(), outcome.snapped, outcome.file_size, failure);
        outcome.result.map(|()| report)
    }

    fn publish(
        &mut self,
        success: bool,
        snapped: u64,
        file_size: u64,
        failure: Option<String>,
    ) -> SnapshotReport {
        let stopped_at = now_secs();
        let report = SnapshotReport {
            mode: self.run.mode,
            prefix: self.run.prefix.clone(),
            path: self.run.path.clone(),
            success,
            snapped,
            file_size,
            started_at: self.run.started_at,
            stopped_at,
            elapsed: self.run.started.elapsed(),
            failure,
        };

        let buffer = std::mem::replace(&mut self.buffer, SnapshotBuffer::with_capacity(0));
        {
            let mut anchor = self.shared.anchor.lock();
            anchor.running = false;
            anchor.success = success;
            anchor.snapped = snapped;
            anchor.file_size = file_size;
            anchor.stopped_at = Some(stopped_at);
            anchor.buffer = Some(buffer);
            anchor.last_report = Some(report.clone());
            self.shared.run_done.notify_all();
        }

        if success {
            info!(
                target: "cachesnap::snapshot",
                mode = %report.mode,
                path = %report.path.display(),
                snapped,
                file_size,
                "Snapshot completed"
            );
        } else {
            info!(
                target: "cachesnap::snapshot",
                mode = %report.mode,
                path = %report.path.display(),
                snapped,
                failure = report.failure.as_deref().unwrap_or(""),
                "Snapshot failed"
            );
        }
        report
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(target: "cachesnap::snapshot", path = %self.run.path.display(), "Snapshot run aborted");
            self.publish(false, 0, 0, Some("run aborted".to_string()));
        }
    }
}

/// The snapshot controller.
///
/// One engine serves one item store. At most one run is active at a time,
/// either on the engine's background worker (`start`) or on the caller's
/// thread (`run_direct`).
pub struct SnapshotEngine {
    shared: Arc<EngineShared>,
    worker: SnapshotWorker,
}

impl SnapshotEngine {
    /// Create an engine over `source`.
    ///
    /// Validates `config`, allocates the snapshot buffer and starts the
    /// background worker. `checkpoint_scope` is passed to checkpoint-mode
    /// scans only.
    pub fn new(
        config: SnapshotConfig,
        source: Arc<dyn ItemSource>,
        checkpoint_scope: Option<Arc<dyn CheckpointScope>>,
    ) -> Result<Self> {
        config.validate()?;
        let worker = SnapshotWorker::spawn()?;
        let buffer = SnapshotBuffer::with_capacity(config.buffer_size);

        let anchor = RunAnchor {
            running: false,
            success: false,
            mode: None,
            snapped: 0,
            started_at: 0,
            stopped_at: None,
            prefix: PrefixFilter::All,
            path: PathBuf::new(),
            file_size: 0,
            buffer: Some(buffer),
            last_report: None,
        };

        info!(target: "cachesnap::snapshot", buffer_size = config.buffer_size, "Snapshot module initialized");
        Ok(SnapshotEngine {
            shared: Arc::new(EngineShared {
                config,
                source,
                checkpoint_scope,
                anchor: Mutex::new(anchor),
                run_done: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                shutting_down: Arc::new(AtomicBool::new(false)),
            }),
            worker,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &SnapshotConfig {
        &self.shared.config
    }

    /// Start an asynchronous run.
    ///
    /// Returns as soon as the run is handed to the background worker. The
    /// outcome goes to `on_done`, if given, and then to the returned ticket.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if a run is active, `ShutdownInProgress` after
    /// [`shutdown`](Self::shutdown).
    pub fn start(
        &self,
        request: SnapshotRequest,
        on_done: Option<SnapshotCallback>,
    ) -> Result<SnapshotTicket> {
        let guard = self.begin(request)?;
        let (tx, rx) = mpsc::channel();

        self.worker.submit(move || {
            let mut guard = guard;
            let outcome = execute(&guard.shared, &guard.run, &mut guard.buffer);
            let result = guard.finish(outcome);
            if let Some(on_done) = on_done {
                on_done(&result);
            }
            // The caller may have dropped the ticket
            let _ = tx.send(result);
        })?;
        Ok(SnapshotTicket { rx })
    }

    /// Run a snapshot on the calling thread.
    ///
    /// Returns the artifact size on success, or the run's error.
    pub fn run_direct(&self, request: SnapshotRequest) -> Result<u64> {
        let mut guard = self.begin(request)?;
        let outcome = execute(&guard.shared, &guard.run, &mut guard.buffer);
        guard.finish(outcome).map(|report| report.file_size)
    }

    /// Request the active run to stop.
    ///
    /// The run checks the request once per scan batch and ends without
    /// writing its trailer. With `wait_for_stop`, blocks until it has ended.
    /// No-op when idle or when the active run is a checkpoint.
    pub fn stop(&self, wait_for_stop: bool) {
        let mut anchor = self.shared.anchor.lock();
        if !anchor.running || !anchor.mode.is_some_and(SnapshotMode::is_cancellable) {
            return;
        }
        self.shared.stop_requested.store(true, Ordering::Release);
        info!(target: "cachesnap::snapshot", wait_for_stop, "Snapshot stop requested");
        if wait_for_stop {
            while anchor.running {
                self.shared.run_done.wait(&mut anchor);
            }
            info!(target: "cachesnap::snapshot", "Snapshot run stopped");
        }
    }

    /// Whether a run is active
    pub fn is_running(&self) -> bool {
        self.shared.anchor.lock().running
    }

    /// Outcome of the most recent finished run
    pub fn last_report(&self) -> Option<SnapshotReport> {
        self.shared.anchor.lock().last_report.clone()
    }

    /// Stats as key/value pairs.
    ///
    /// While a run is active only `snapshot:status` is reported.
    pub fn stats(&self) -> Vec<(&'static str, String)> {
        let anchor = self.shared.anchor.lock();
        let mut stats = Vec::with_capacity(7);
        if anchor.running {
            stats.push(("snapshot:status", "running".to_string()));
            return stats;
        }

        stats.push(("snapshot:status", "stopped".to_string()));
        stats.push(("snapshot:success", anchor.success.to_string()));
        if let Some(mode) = anchor.mode {
            stats.push(("snapshot:mode", mode.as_str().to_string()));
            if let Some(stopped_at) = anchor.stopped_at {
                stats.push((
                    "snapshot:last_run",
                    stopped_at.saturating_sub(anchor.started_at).to_string(),
                ));
            }
            stats.push(("snapshot:snapped", anchor.snapped.to_string()));
            stats.push(("snapshot:prefix", anchor.prefix.describe()));
            if !anchor.path.as_os_str().is_empty() {
                stats.push(("snapshot:filepath", anchor.path.display().to_string()));
            }
        }
        stats
    }

    /// Feed stats to an `add_stat(key, value)` sink.
    pub fn emit_stats(&self, mut add_stat: impl FnMut(&str, &str)) {
        for (key, value) in self.stats() {
            add_stat(key, &value);
        }
    }

    /// Check that an artifact is complete; see [`check_file_validity`].
    pub fn check_file_validity(&self, file: &mut File) -> Result<u64> {
        check_file_validity(file)
    }

    /// Replay an artifact into `store`.
    ///
    /// Replay ends early, successfully, once the engine starts shutting
    /// down; the returned stats say so.
    pub fn apply_file<S: RedoStore>(&self, path: &Path, store: &S) -> Result<ReplayStats> {
        SnapshotReplayer::new(self.shared.config.max_record_size)
            .with_shutdown_flag(Arc::clone(&self.shared.shutting_down))
            .apply(path, store)
    }

    /// Stop any cancellable run, then stop the worker. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop(true);
        self.worker.shutdown();
        info!(target: "cachesnap::snapshot", "Snapshot module destroyed");
    }

    fn begin(&self, request: SnapshotRequest) -> Result<RunGuard> {
        let mut anchor = self.shared.anchor.lock();
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(SnapshotError::ShutdownInProgress);
        }
        if anchor.running {
            info!(target: "cachesnap::snapshot", "Failed to start snapshot: already started");
            return Err(SnapshotError::AlreadyRunning);
        }
        let buffer = anchor.buffer.take().ok_or(SnapshotError::AlreadyRunning)?;

        let path = request
            .path
            .unwrap_or_else(|| self.shared.config.default_file_path.clone());
        let started_at = now_secs();

        anchor.running = true;
        anchor.success = false;
        anchor.mode = Some(request.mode);
        anchor.snapped = 0;
        anchor.started_at = started_at;
        anchor.stopped_at = None;
        anchor.prefix = request.prefix.clone();
        anchor.path = path.clone();
        anchor.file_size = 0;
        self.shared.stop_requested.store(false, Ordering::Release);

        info!(
            target: "cachesnap::snapshot",
            mode = %request.mode,
            prefix = %request.prefix,
            path = %path.display(),
            "Snapshot started"
        );
        Ok(RunGuard {
            shared: Arc::clone(&self.shared),
            run: PreparedRun {
                mode: request.mode,
                prefix: request.prefix,
                path,
                started_at,
                started: Instant::now(),
            },
            buffer,
            finished: false,
        })
    }
}

impl Drop for SnapshotEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The scan/dump loop of one run
fn execute(shared: &EngineShared, run: &PreparedRun, buffer: &mut SnapshotBuffer) -> RunOutcome {
    let created = SnapshotWriter::create(&run.path, buffer, shared.config.max_record_size);
    let mut writer = match created {
        Ok(writer) => writer,
        Err(e) => {
            warn!(target: "cachesnap::snapshot", path = %run.path.display(), error = %e, "Failed to open the snapshot file");
            return RunOutcome {
                result: Err(e),
                snapped: 0,
                file_size: 0,
            };
        }
    };

    let options = ScanOptions {
        prefix: run.prefix.clone(),
        with_elements: run.mode.writes_records(),
        checkpoint_scope: match run.mode {
            SnapshotMode::Checkpoint => shared.checkpoint_scope.clone(),
            _ => None,
        },
    };
    let mut scan = match shared.source.open_scan(options) {
        Ok(scan) => scan,
        Err(e) => {
            warn!(target: "cachesnap::snapshot", error = %e, "Failed to open the item scan");
            let file_size = writer.abandon();
            return RunOutcome {
                result: Err(e),
                snapped: 0,
                file_size,
            };
        }
    };

    let strategy = DumpStrategy::for_mode(run.mode);
    let mut ctx = DumpContext::new(run.prefix.clone());
    let batch_size = shared.config.scan_batch_size;

    let result = loop {
        if run.mode.is_cancellable() && shared.stop_requested.load(Ordering::Acquire) {
            info!(target: "cachesnap::snapshot", snapped = ctx.snapped(), "Ongoing snapshot recognized stop request");
            break Err(SnapshotError::Stopped);
        }
        match scan.next_batch(batch_size) {
            ScanBatch::OutOfMemory => {
                warn!(target: "cachesnap::snapshot", "The item scan has failed by out of memory");
                break Err(SnapshotError::OutOfMemory);
            }
            ScanBatch::End => {
                let done = strategy.done(&mut writer, &mut ctx);
                if let Err(e) = &done {
                    warn!(target: "cachesnap::snapshot", error = %e, "The snapshot done function has failed");
                }
                break done;
            }
            ScanBatch::Items(batch) if batch.is_empty() => continue,
            ScanBatch::Items(batch) => {
                let dumped = strategy.dump(&mut writer, &batch, &mut ctx);
                debug!(target: "cachesnap::snapshot", items = batch.len(), snapped = ctx.snapped(), "Dumped scan batch");
                scan.release(batch);
                if let Err(e) = dumped {
                    warn!(target: "cachesnap::snapshot", error = %e, "The snapshot dump function has failed");
                    break Err(e);
                }
            }
        }
    };
    scan.close(result.is_ok());

    let (result, file_size) = match result {
        Ok(()) => match writer.close() {
            Ok(size) => (Ok(()), size),
            Err(e) => (Err(e), 0),
        },
        Err(e) => (Err(e), writer.abandon()),
    };
    RunOutcome {
        result,
        snapped: ctx.snapped(),
        file_size,
    }
}
