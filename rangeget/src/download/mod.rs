//! Download orchestration.
//!
//! A [`Download`] probes the resource, picks a mode and then runs a single
//! event loop that owns every decision:
//!
//! ```text
//!                 probe (unbounded GET)
//!                        │
//!        ranges + size + identity encoding?
//!           │ yes                        │ no
//!           ▼                            ▼
//!   manifest / fresh pool          sequential: keep streaming
//!   spawn N ranged connections     the probe, no retries
//!           │
//!           ▼
//!   ┌──── event loop ◄──── Connected / Progress / Finished / Failed
//!   │  finished → replace, or retire the slot when the tail is small
//!   │  failed   → count against the budget, retry the same range
//!   │  tick     → flush manifest
//!   └─ dispose  → stop connections, flush manifest
//! ```
//!
//! Connections run as tokio tasks; the pool is shared behind a mutex and
//! everything else belongs to the loop.

mod events;
mod policy;
mod progress;
mod task;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{DownloadConfig, ValidatedConfig};
use crate::connection::{Connection, ConnectionError, Endpoint, ResponseInfo};
use crate::error::{DownloadError, DownloadResult};
use crate::manifest::Manifest;
use crate::pool::{RangePool, SharedPool, WorkerId, MIN_WORKER_SIZE};
use crate::storage::SharedFile;
use crate::transport::Transport;

pub use events::{DisposeHandle, DownloadEvent, DownloadEvents, DownloadOutcome, StartInfo, Summary};
pub use policy::{initial_connections, RetryPolicy};
pub use progress::Progress;

use events::EventSender;
use progress::ProgressTracker;
use task::{ConnectionEvent, Launch, TaskContext};

/// Create a download for `config`.
///
/// Nothing is requested until [`Download::run`] is awaited.
pub fn download(config: DownloadConfig) -> DownloadResult<(Download, DownloadEvents)> {
    Download::new(config)
}

/// A single resource download.
#[derive(Debug)]
pub struct Download {
    config: ValidatedConfig,
    transport: Transport,
    cancel: CancellationToken,
    events: EventSender,
}

impl Download {
    pub fn new(config: DownloadConfig) -> DownloadResult<(Self, DownloadEvents)> {
        let config = config.validate()?;
        let transport = Transport::new(config.connect_timeout)?;
        let (events, receiver) = events::channel();
        let download = Self {
            config,
            transport,
            cancel: CancellationToken::new(),
            events,
        };
        Ok((download, receiver))
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    /// Handle for stopping the download from elsewhere.
    pub fn dispose_handle(&self) -> DisposeHandle {
        DisposeHandle::new(self.cancel.clone())
    }

    /// Run the download to completion, failure or disposal.
    ///
    /// Every error is reported as a [`DownloadEvent::Error`], and the events
    /// always end with a [`DownloadEvent::Disposed`].
    pub async fn run(self) -> DownloadResult<DownloadOutcome> {
        let result = self.execute().await;
        if let Err(error) = &result {
            warn!(url = %self.config.url, error = %error, "Download failed");
            if !already_reported(error) {
                self.events.emit(DownloadEvent::Error(Arc::new(error.clone())));
            }
        }
        self.events.emit(DownloadEvent::Disposed);
        result
    }

    async fn execute(&self) -> DownloadResult<DownloadOutcome> {
        let started_at = Instant::now();
        let endpoint = Endpoint {
            url: self.config.url.clone(),
            headers: self.config.headers.clone(),
            transport: self.transport.clone(),
            idle_timeout: self.config.idle_timeout,
        };

        // Unbounded request that reveals size, name and range support
        let probe_pool = RangePool::new(None).shared();
        let probe_worker = probe_pool
            .lock()
            .allocate()
            .ok_or_else(|| DownloadError::Stalled("no probe worker".to_string()))?;
        let mut probe = Connection::new(probe_worker.id(), endpoint.clone(), probe_pool.clone());

        let probed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = probe.request() => Some(result),
        };
        let info = match probed {
            None => {
                info!(url = %self.config.url, "Download disposed during probe");
                return Ok(DownloadOutcome::Interrupted {
                    path: None,
                    completed: 0,
                });
            }
            Some(Ok(info)) => info,
            Some(Err(error)) => {
                let error = Arc::new(error);
                self.events.emit(DownloadEvent::Error(Arc::new(DownloadError::Probe(
                    Arc::clone(&error),
                ))));
                return Err(DownloadError::Probe(error));
            }
        };

        let path = self.config.destination(info.file_name.as_deref());
        info!(
            url = %self.config.url,
            path = %path.display(),
            file_size = ?info.file_size,
            supports_resume = info.supports_resume,
            encoding = info.content_encoding.as_str(),
            "Probe complete"
        );

        match info.file_size {
            Some(size) if info.supports_resume && info.content_encoding.is_identity() => {
                probe.dispose();
                self.prepare_ranged(endpoint, path, size, started_at)
                    .await?
                    .drive()
                    .await
            }
            _ => {
                self.prepare_sequential(endpoint, path, probe, probe_pool, &info, started_at)
                    .await?
                    .drive()
                    .await
            }
        }
    }

    async fn prepare_ranged(
        &self,
        endpoint: Endpoint,
        path: PathBuf,
        size: u64,
        started_at: Instant,
    ) -> DownloadResult<Run<'_>> {
        let manifest = Manifest::new(self.config.url.as_str(), &path, size);

        // Recorded progress is only trusted if the file it describes is there
        let on_disk = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
        let restored = if on_disk == Some(size) {
            manifest.load().await
        } else {
            None
        };
        let resumed = restored.is_some();
        let pool = restored.unwrap_or_else(|| RangePool::new(Some(size)));

        let file = if resumed {
            SharedFile::open_resumable(&path).await?
        } else {
            SharedFile::create_truncated(&path).await?
        };
        file.set_len(size).await?;
        manifest.write(pool.snapshot()).await?;

        let completed = pool.completed_bytes();
        info!(
            path = %path.display(),
            size,
            resumed,
            completed,
            "Starting ranged download"
        );

        let mut run = Run::new(
            self,
            RunSetup {
                endpoint,
                pool: pool.shared(),
                file,
                manifest: Some(manifest),
                path,
                resumed,
                started_at,
            },
        );

        let count = initial_connections(self.config.connections, size);
        let workers: Vec<WorkerId> = {
            let mut pool = run.pool.lock();
            (0..count)
                .map_while(|_| pool.allocate())
                .map(|worker| worker.id())
                .collect()
        };
        debug!(requested = self.config.connections, count = workers.len(), "Spawning connections");

        run.start_info.connections = workers.len();
        for worker in workers {
            run.pending_start.insert(worker);
            run.spawn(Launch::Fresh {
                worker,
                delay: std::time::Duration::ZERO,
            });
        }
        run.maybe_started();
        Ok(run)
    }

    async fn prepare_sequential(
        &self,
        endpoint: Endpoint,
        path: PathBuf,
        probe: Connection,
        pool: SharedPool,
        info: &ResponseInfo,
        started_at: Instant,
    ) -> DownloadResult<Run<'_>> {
        let reason = if !info.content_encoding.is_identity() {
            "response is compressed"
        } else if info.file_size.is_none() {
            "size is unknown"
        } else {
            "server does not accept ranges"
        };
        info!(path = %path.display(), reason, "Falling back to a single sequential stream");

        // Content-Length of a compressed body is not the size on disk
        if info.content_encoding.is_identity() {
            if let Some(size) = info.file_size {
                pool.lock().bound(size);
            }
        }

        let file = SharedFile::create_truncated(&path).await?;
        let mut run = Run::new(
            self,
            RunSetup {
                endpoint,
                pool,
                file,
                manifest: None,
                path,
                resumed: false,
                started_at,
            },
        );
        run.sequential = true;
        run.start_info.connections = 1;
        run.spawn(Launch::Connected(Box::new(probe)));
        run.maybe_started();
        Ok(run)
    }
}

/// Probe and connection failures are emitted where they happen; a
/// sequential failure wraps a connection error that was already emitted.
fn already_reported(error: &DownloadError) -> bool {
    matches!(
        error,
        DownloadError::Probe(_)
            | DownloadError::Connection { .. }
            | DownloadError::SequentialStreamFailed(_)
    )
}

/// How the event loop stopped.
enum LoopExit {
    Completed,
    Interrupted,
}

/// What a run starts from once the mode is chosen.
struct RunSetup {
    endpoint: Endpoint,
    pool: SharedPool,
    file: SharedFile,
    manifest: Option<Manifest>,
    path: PathBuf,
    resumed: bool,
    started_at: Instant,
}

/// State of one download run, owned by the event loop.
struct Run<'a> {
    download: &'a Download,
    pool: SharedPool,
    context: TaskContext,
    receiver: mpsc::UnboundedReceiver<ConnectionEvent>,
    tasks: JoinSet<()>,
    live: HashSet<WorkerId>,
    manifest: Option<Manifest>,
    sequential: bool,
    errors: u32,
    progress: ProgressTracker,
    pending_start: HashSet<WorkerId>,
    started: bool,
    start_info: StartInfo,
    started_at: Instant,
}

impl<'a> Run<'a> {
    fn new(download: &'a Download, setup: RunSetup) -> Self {
        let RunSetup {
            endpoint,
            pool,
            file,
            manifest,
            path,
            resumed,
            started_at,
        } = setup;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (file_size, completed) = {
            let pool = pool.lock();
            (pool.length(), pool.completed_bytes())
        };
        Self {
            download,
            context: TaskContext {
                endpoint,
                pool: pool.clone(),
                file,
                events: sender,
                cancel: download.cancel.child_token(),
            },
            pool,
            receiver,
            tasks: JoinSet::new(),
            live: HashSet::new(),
            manifest,
            sequential: false,
            errors: 0,
            progress: ProgressTracker::new(),
            pending_start: HashSet::new(),
            started: false,
            start_info: StartInfo {
                path,
                file_size,
                connections: 0,
                resumed,
                completed,
            },
            started_at,
        }
    }

    async fn drive(mut self) -> DownloadResult<DownloadOutcome> {
        let result = self.event_loop().await;
        self.stop_connections().await;

        match result {
            Ok(LoopExit::Completed) => self.complete().await,
            Ok(LoopExit::Interrupted) => {
                self.flush_manifest().await;
                let completed = self.pool.lock().completed_bytes();
                info!(
                    path = %self.start_info.path.display(),
                    completed,
                    "Download interrupted"
                );
                Ok(DownloadOutcome::Interrupted {
                    path: Some(self.start_info.path.clone()),
                    completed,
                })
            }
            Err(error) => {
                self.flush_manifest().await;
                Err(error)
            }
        }
    }

    async fn event_loop(&mut self) -> DownloadResult<LoopExit> {
        let cancel = self.download.cancel.clone();
        let period = self.download.config.manifest_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let flush_enabled = self.manifest.is_some() && !period.is_zero();

        loop {
            if self.pool.lock().has_completed() {
                return Ok(LoopExit::Completed);
            }
            if self.live.is_empty() && !self.replace() {
                return Err(DownloadError::Stalled(
                    "no connection can make progress".to_string(),
                ));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(LoopExit::Interrupted),
                event = self.receiver.recv() => match event {
                    Some(event) => self.handle(event)?,
                    None => {
                        return Err(DownloadError::Stalled(
                            "connection events closed".to_string(),
                        ))
                    }
                },
                _ = ticker.tick(), if flush_enabled => self.flush_manifest().await,
            }
        }
    }

    fn handle(&mut self, event: ConnectionEvent) -> DownloadResult<()> {
        match event {
            ConnectionEvent::Connected { worker } => {
                debug!(worker, "Connection streaming");
                self.settle_start(worker);
            }
            ConnectionEvent::Progress { worker, bytes } => {
                trace!(worker, bytes, "Chunk written");
                self.report_progress();
            }
            ConnectionEvent::Finished { worker } => self.on_finished(worker)?,
            ConnectionEvent::Failed { worker, error } => self.on_failed(worker, error)?,
        }
        Ok(())
    }

    fn on_finished(&mut self, worker: WorkerId) -> DownloadResult<()> {
        self.live.remove(&worker);
        self.settle_start(worker);
        self.report_progress();

        {
            let mut pool = self.pool.lock();
            if !pool.mark_done(worker)? {
                // Stream ended early without an error; hand the rest out again
                pool.release(worker)?;
            }
            if pool.has_completed() {
                return Ok(());
            }
        }
        debug!(worker, "Worker finished");
        self.replace();
        Ok(())
    }

    fn on_failed(&mut self, worker: WorkerId, error: ConnectionError) -> DownloadResult<()> {
        self.live.remove(&worker);
        self.settle_start(worker);
        self.errors += 1;

        let error = Arc::new(error);
        warn!(worker, errors = self.errors, error = %error, "Connection failed");
        self.download
            .events
            .emit(DownloadEvent::Error(Arc::new(DownloadError::Connection {
                worker,
                source: Arc::clone(&error),
            })));

        if self.sequential {
            return Err(DownloadError::SequentialStreamFailed(error));
        }
        if error.is_fatal() {
            return Err(DownloadError::Connection {
                worker,
                source: error,
            });
        }
        if self.errors >= self.download.config.max_errors {
            warn!(errors = self.errors, "Error budget exhausted");
            return Err(DownloadError::ErrorBudgetExhausted {
                errors: self.errors,
            });
        }

        let attempt = {
            let mut pool = self.pool.lock();
            let attempt = pool.record_failure(worker)?;
            let complete = pool.worker(worker).map_or(true, |w| w.is_complete());
            if complete {
                pool.mark_done(worker)?;
                None
            } else {
                Some(attempt)
            }
        };

        match attempt {
            Some(attempt) => {
                let delay = self.download.config.retry.delay_for(attempt);
                debug!(
                    worker,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying range"
                );
                self.spawn(Launch::Fresh { worker, delay });
            }
            None => {
                self.replace();
            }
        }
        Ok(())
    }

    /// Fill a free connection slot. Returns false when the slot is retired.
    fn replace(&mut self) -> bool {
        if self.sequential {
            return false;
        }
        let next = {
            let mut pool = self.pool.lock();
            let laziest = pool.laziest_worker().and_then(|w| w.remaining()).unwrap_or(0);
            if pool.has_idle() || laziest >= MIN_WORKER_SIZE {
                pool.allocate()
            } else {
                None
            }
        };
        match next {
            Some(worker) => {
                debug!(
                    worker = worker.id(),
                    start = worker.start(),
                    limit = ?worker.limit(),
                    "Spawning connection"
                );
                self.spawn(Launch::Fresh {
                    worker: worker.id(),
                    delay: std::time::Duration::ZERO,
                });
                true
            }
            None => {
                debug!(live = self.live.len(), "Retiring connection slot");
                false
            }
        }
    }

    fn spawn(&mut self, launch: Launch) {
        self.live.insert(launch.worker());
        self.tasks.spawn(task::run(self.context.clone(), launch));
    }

    /// An initial connection has either started streaming or ended.
    fn settle_start(&mut self, worker: WorkerId) {
        if self.pending_start.remove(&worker) {
            self.maybe_started();
        }
    }

    fn maybe_started(&mut self) {
        if self.started || !self.pending_start.is_empty() {
            return;
        }
        self.started = true;
        info!(
            path = %self.start_info.path.display(),
            connections = self.start_info.connections,
            "Download started"
        );
        self.download
            .events
            .emit(DownloadEvent::Started(self.start_info.clone()));
        self.report_progress();
    }

    fn report_progress(&mut self) {
        if !self.started {
            return;
        }
        let (completed, total) = {
            let pool = self.pool.lock();
            (pool.completed_bytes(), pool.length())
        };
        if let Some(progress) = self.progress.update(completed, total) {
            self.download.events.emit(DownloadEvent::Progress(progress));
        }
    }

    async fn flush_manifest(&self) {
        let Some(manifest) = &self.manifest else {
            return;
        };
        let snapshot = self.pool.lock().snapshot();
        match manifest.write(snapshot).await {
            Ok(()) => debug!(path = %manifest.path().display(), "Manifest flushed"),
            Err(e) => warn!(error = %e, "Failed to flush manifest"),
        }
    }

    async fn stop_connections(&mut self) {
        self.context.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        self.live.clear();
    }

    async fn complete(&mut self) -> DownloadResult<DownloadOutcome> {
        self.maybe_started_forced();
        self.context.file.sync().await?;

        let (bytes, total) = {
            let pool = self.pool.lock();
            (pool.length().unwrap_or(pool.completed_bytes()), pool.length())
        };
        if !self.progress.reported_complete(total) {
            self.report_progress();
        }

        if let Some(manifest) = &self.manifest {
            match manifest.delete().await {
                Ok(()) => debug!(path = %manifest.path().display(), "Manifest deleted"),
                Err(e) => warn!(error = %e, "Failed to delete manifest"),
            }
        }

        let summary = Summary {
            path: self.start_info.path.clone(),
            bytes,
            transferred: bytes.saturating_sub(self.start_info.completed),
            elapsed: self.started_at.elapsed(),
            resumed: self.start_info.resumed,
            errors: self.errors,
        };
        info!(
            path = %summary.path.display(),
            bytes = summary.bytes,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            errors = summary.errors,
            "Download complete"
        );
        self.download
            .events
            .emit(DownloadEvent::Completed(summary.clone()));
        Ok(DownloadOutcome::Completed(summary))
    }

    /// Completion without any connection (empty or fully resumed file)
    /// still announces the start first.
    fn maybe_started_forced(&mut self) {
        self.pending_start.clear();
        self.maybe_started();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_rejects_invalid_config() {
        let err = download(DownloadConfig::new("ftp://example.com/file")).unwrap_err();
        assert!(matches!(err, DownloadError::Config(_)));
    }

    #[test]
    fn test_dispose_handle_is_shared() {
        let (download, _events) = download(DownloadConfig::new("http://example.com/a")).unwrap();
        let handle = download.dispose_handle();
        handle.dispose();
        assert!(download.dispose_handle().is_disposed());
    }

    #[tokio::test]
    async fn test_disposed_before_probe_is_interrupted() {
        let (download, mut events) =
            download(DownloadConfig::new("http://127.0.0.1:9/never")).unwrap();
        download.dispose_handle().dispose();

        let outcome = download.run().await.unwrap();
        assert_eq!(
            outcome,
            DownloadOutcome::Interrupted {
                path: None,
                completed: 0
            }
        );
        assert!(matches!(events.recv().await, Some(DownloadEvent::Disposed)));
    }
}
