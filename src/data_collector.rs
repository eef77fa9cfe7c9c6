//! Data collector peer.
//!
//! A [`DataCollector`] is a [`CommandHandler`] that
//!
//! - binds a data listener when asked SERVER and reports its address in `_SERVER`,
//! - accepts producer data connections (same handshake as the control channel,
//!   with a DATA greeting) carrying one encoded [`Event`] per frame,
//! - writes every event received during a run to `run<NNNNNN>.raw` (v2 framing)
//!   in the output directory,
//! - reports `EVENT` and `FILEBYTES` status tags so run limits can be enforced.

use crate::codec::file::{FileVersion, FileWriter};
use crate::config::Configuration;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::protocol::{Identification, CONFIRM, DATA_GREETING, TAG_EVENT, TAG_FILEBYTES};
use crate::receiver::{CommandHandler, PeerContext};
use crate::transport::{self, FrameReader};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Minimum spacing of status tag refreshes from the data path.
const TAG_REFRESH: Duration = Duration::from_millis(200);

/// File name of a run.
pub fn run_file_name(run: u32) -> String {
    format!("run{run:06}.raw")
}

struct RunFile {
    run: u32,
    writer: FileWriter,
}

#[derive(Default)]
struct Counters {
    events: AtomicU64,
    dropped: AtomicU64,
}

struct CollectorState {
    output_dir: Mutex<PathBuf>,
    file: Mutex<Option<RunFile>>,
    counters: Counters,
    prepared_run: Mutex<Option<u32>>,
    server: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
}

impl CollectorState {
    fn store(&self, event: &Event) -> AppResult<bool> {
        let mut file = self.file.lock();
        match file.as_mut() {
            Some(run_file) => {
                run_file.writer.write_event(event)?;
                self.counters.events.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    fn bytes_written(&self) -> u64 {
        self.file.lock().as_ref().map_or(0, |f| f.writer.bytes_written())
    }

    /// Zero the per-run counters and the tags reporting them.
    fn reset_run_counters(&self, ctx: &PeerContext) {
        self.counters.events.store(0, Ordering::Relaxed);
        ctx.set_tag(TAG_EVENT, 0);
        ctx.set_tag(TAG_FILEBYTES, 0);
    }

    fn refresh_tags(&self, ctx: &PeerContext) {
        ctx.set_tag(TAG_EVENT, self.counters.events.load(Ordering::Relaxed));
        ctx.set_tag(TAG_FILEBYTES, self.bytes_written());
    }
}

/// Collects producer events into run files.
pub struct DataCollector {
    listen_address: String,
    handshake_timeout: Duration,
    state: Arc<CollectorState>,
}

impl DataCollector {
    /// Collector binding its data listener to `listen_address` and writing into `output_dir`.
    pub fn new(listen_address: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_address: listen_address.into(),
            handshake_timeout: Duration::from_secs(5),
            state: Arc::new(CollectorState {
                output_dir: Mutex::new(output_dir.into()),
                file: Mutex::new(None),
                counters: Counters::default(),
                prepared_run: Mutex::new(None),
                server: Mutex::new(None),
            }),
        }
    }

    /// Override the data handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Events written in the current run.
    pub fn events_written(&self) -> u64 {
        self.state.counters.events.load(Ordering::Relaxed)
    }

    /// Events received while no run file was open.
    pub fn events_dropped(&self) -> u64 {
        self.state.counters.dropped.load(Ordering::Relaxed)
    }

    /// Directory run files go to.
    pub fn output_dir(&self) -> PathBuf {
        self.state.output_dir.lock().clone()
    }

    /// Bound data address, once SERVER has been handled.
    pub fn data_address(&self) -> Option<SocketAddr> {
        self.state.server.lock().as_ref().map(|(addr, _)| *addr)
    }

    fn close_file(&self) -> AppResult<Option<(u32, u64)>> {
        let Some(mut run_file) = self.state.file.lock().take() else {
            return Ok(None);
        };
        crate::codec::Serializer::flush(&mut run_file.writer)?;
        let events = run_file.writer.events_written();
        info!(
            run = run_file.run,
            events,
            bytes = run_file.writer.bytes_written(),
            path = %run_file.writer.path().display(),
            "run file closed"
        );
        Ok(Some((run_file.run, events)))
    }
}

#[async_trait]
impl CommandHandler for DataCollector {
    async fn on_configure(&self, _ctx: &PeerContext, conf: &Configuration) -> AppResult<()> {
        let dir = conf.get_str("OutputDir", "");
        if !dir.is_empty() {
            *self.state.output_dir.lock() = PathBuf::from(dir);
        }
        Ok(())
    }

    async fn on_server(&self, ctx: &PeerContext) -> AppResult<Option<String>> {
        if let Some(addr) = self.data_address() {
            return Ok(Some(format!("tcp://{addr}")));
        }
        let listener = TcpListener::bind(transport::strip_scheme(&self.listen_address))
            .await
            .map_err(|err| DaqError::Transport(format!("cannot listen on {}: {err}", self.listen_address)))?;
        let addr = listener.local_addr()?;
        let span = tracing::info_span!("data_server", address = %addr);
        let task = tokio::spawn(
            accept_producers(listener, self.state.clone(), ctx.clone(), self.handshake_timeout).instrument(span),
        );
        *self.state.server.lock() = Some((addr, task));
        info!(address = %addr, "data server listening");
        Ok(Some(format!("tcp://{addr}")))
    }

    async fn on_prepare(&self, ctx: &PeerContext, run: u32) -> AppResult<()> {
        debug!(run, "preparing run");
        self.state.reset_run_counters(ctx);
        *self.state.prepared_run.lock() = Some(run);
        Ok(())
    }

    async fn on_start_run(&self, ctx: &PeerContext, run: u32) -> AppResult<()> {
        self.state.reset_run_counters(ctx);
        self.close_file()?;
        if let Some(prepared) = self.state.prepared_run.lock().take() {
            if prepared != run {
                warn!(prepared, run, "START for a different run than PREPARE");
            }
        }
        let dir = self.output_dir();
        let path = run_file_path(&dir, run);
        let writer = tokio::task::spawn_blocking({
            let path = path.clone();
            move || FileWriter::create(&path, FileVersion::V2)
        })
        .await
        .map_err(|err| DaqError::Handler(format!("opening run file: {err}")))??;
        info!(run, path = %path.display(), "run file opened");
        *self.state.file.lock() = Some(RunFile { run, writer });
        self.state.refresh_tags(ctx);
        Ok(())
    }

    async fn on_stop_run(&self, ctx: &PeerContext) -> AppResult<()> {
        self.state.refresh_tags(ctx);
        self.close_file()?;
        Ok(())
    }

    async fn on_reset(&self, _ctx: &PeerContext) -> AppResult<()> {
        self.close_file()?;
        Ok(())
    }

    async fn on_clear(&self, ctx: &PeerContext) -> AppResult<()> {
        self.state.reset_run_counters(ctx);
        Ok(())
    }

    async fn on_status(&self, ctx: &PeerContext) -> AppResult<()> {
        self.state.refresh_tags(ctx);
        Ok(())
    }

    async fn on_terminate(&self, _ctx: &PeerContext) -> AppResult<()> {
        self.close_file()?;
        if let Some((addr, task)) = self.state.server.lock().take() {
            task.abort();
            info!(address = %addr, "data server stopped");
        }
        Ok(())
    }
}

async fn accept_producers(listener: TcpListener, state: Arc<CollectorState>, ctx: PeerContext, timeout: Duration) {
    loop {
        tokio::select! {
            _ = ctx.wait_done() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let state = state.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        match transport::split(stream) {
                            Ok((reader, writer)) => {
                                if let Err(err) = serve_producer(reader, writer, state, ctx, timeout).await {
                                    warn!(remote = %remote, error = %err, "data connection ended");
                                }
                            }
                            Err(err) => warn!(remote = %remote, error = %err, "data connection failed"),
                        }
                    });
                }
                Err(err) => warn!(error = %err, "data accept failed"),
            }
        }
    }
}

async fn serve_producer(
    mut reader: FrameReader,
    mut writer: transport::FrameWriter,
    state: Arc<CollectorState>,
    ctx: PeerContext,
    timeout: Duration,
) -> AppResult<()> {
    writer.send(DATA_GREETING).await?;
    let ident: Identification = tokio::time::timeout(timeout, reader.expect())
        .await
        .map_err(|_| DaqError::Timeout("data identification".to_string()))??;
    writer.send(CONFIRM).await?;
    let source = ident.into_info().with_remote(reader.remote());
    info!(source = %source, "producer connected");

    let mut last_refresh = Instant::now();
    loop {
        match reader.recv::<Event>().await {
            Ok(Some(event)) => {
                if !state.store(&event)? {
                    debug!(source = %source, event = event.event_n(), "no run file open, event dropped");
                }
                if last_refresh.elapsed() >= TAG_REFRESH || event.is_eore() {
                    state.refresh_tags(&ctx);
                    last_refresh = Instant::now();
                }
            }
            Ok(None) => break,
            Err(err @ (DaqError::Io(_) | DaqError::ConnectionClosed | DaqError::Transport(_))) => return Err(err),
            Err(err) => warn!(source = %source, error = %err, "discarding undecodable event"),
        }
    }
    info!(source = %source, "producer disconnected");
    Ok(())
}

/// Path of a run's file in `dir`.
pub fn run_file_path(dir: &Path, run: u32) -> PathBuf {
    dir.join(run_file_name(run))
}
