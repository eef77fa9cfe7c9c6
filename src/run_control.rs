//! Run-control orchestrator.
//!
//! [`RunControl`] is the controller side of the command protocol. It accepts peer
//! connections, admits them into the [`ConnectionRegistry`] after an identity
//! handshake, tells them where to send data and logs, and drives the whole
//! system through its lifecycle:
//!
//! ```text
//! initialise -> configure -> start_run <-> stop_run
//!      ^             ^                        |
//!      +---- reset --+------------------------+
//! ```
//!
//! Every transition broadcasts a command and then waits for the aggregate state
//! to reach the target. Missing the deadline is reported as
//! [`TransitionOutcome::TimedOut`] and logged as a warning; the command is not
//! retried.
//!
//! One task per connection reads status frames. Commands are written under a
//! per-peer mutex so frames from concurrent callers never interleave, and a
//! second per-peer mutex allows only one synchronous request in flight.

use crate::config::Configuration;
use crate::connection::{ConnectionInfo, ConnectionRecord, ConnectionRegistry, PeerId};
use crate::error::{AppResult, DaqError};
use crate::logging;
use crate::protocol::{
    self, CommandMessage, Identification, CONTROL_GREETING, CONFIRM, TAG_COMMAND, TAG_EVENT,
    TAG_FILEBYTES, TAG_RUN, TAG_SEQUENCE, TAG_SERVER,
};
use crate::settings::RunControlSettings;
use crate::status::{LifecycleState, Severity, Status};
use crate::transport::{self, FrameReader, FrameWriter};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn, Instrument};

/// Role name of data collectors.
pub const DATA_COLLECTOR: &str = "DataCollector";
/// Role name of log collectors.
pub const LOG_COLLECTOR: &str = "LogCollector";
/// Section of the run configuration read by the orchestrator.
pub const RUN_CONTROL_SECTION: &str = "RunControl";

/// Who a command goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every connected peer.
    All,
    /// One peer.
    Peer(PeerId),
}

/// Result of waiting for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The aggregate reached the target state.
    Reached(LifecycleState),
    /// A peer reported ERROR while waiting.
    Failed,
    /// The deadline passed.
    TimedOut {
        /// State that was expected.
        target: LifecycleState,
        /// Aggregate at the deadline.
        actual: LifecycleState,
    },
}

impl TransitionOutcome {
    /// Whether the target was reached.
    pub fn is_reached(&self) -> bool {
        matches!(self, TransitionOutcome::Reached(_))
    }
}

struct PendingRequest {
    command: String,
    seq: u32,
    reply: oneshot::Sender<Status>,
}

impl PendingRequest {
    /// Whether `status` acknowledges this request rather than an earlier command.
    fn answered_by(&self, status: &Status) -> bool {
        let seq = status.tag(TAG_SEQUENCE).and_then(|s| s.parse::<u32>().ok());
        seq == Some(self.seq) && status.tag(TAG_COMMAND) == Some(self.command.as_str())
    }
}

struct PeerLink {
    id: PeerId,
    info: ConnectionInfo,
    writer: tokio::sync::Mutex<FrameWriter>,
    request_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingRequest>>,
    next_seq: AtomicU32,
}

impl PeerLink {
    async fn send(&self, msg: &CommandMessage) -> AppResult<()> {
        self.writer.lock().await.send(msg).await
    }

    fn take_reply(&self, status: &Status) -> Option<oneshot::Sender<Status>> {
        let mut pending = self.pending.lock();
        let matches = pending.as_ref().is_some_and(|p| p.answered_by(status));
        if matches {
            pending.take().map(|p| p.reply)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct DataCollectorEntry {
    name: String,
    address: String,
}

#[derive(Debug, Default)]
struct RunLimits {
    size: u64,
    events: u64,
    stop_issued: bool,
}

struct Shared {
    registry: Arc<ConnectionRegistry>,
    links: RwLock<BTreeMap<PeerId, Arc<PeerLink>>>,
    settings: RunControlSettings,
    handshake_timeout: Duration,
    run_number: AtomicU32,
    next_run: AtomicU32,
    running: AtomicBool,
    configuration: RwLock<Option<Configuration>>,
    log_address: RwLock<Option<String>>,
    data_collectors: RwLock<BTreeMap<PeerId, DataCollectorEntry>>,
    limits: Mutex<RunLimits>,
    shutdown: watch::Sender<bool>,
}

/// The orchestrator.
pub struct RunControl {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RunControl {
    /// Bind the control listener and start accepting peers.
    pub async fn bind(settings: RunControlSettings, handshake_timeout: Duration) -> AppResult<Self> {
        let listener = TcpListener::bind(transport::strip_scheme(&settings.listen_address))
            .await
            .map_err(|err| {
                DaqError::Transport(format!("cannot listen on {}: {err}", settings.listen_address))
            })?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "run control listening");

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry: Arc::new(ConnectionRegistry::new()),
            links: RwLock::new(BTreeMap::new()),
            settings,
            handshake_timeout,
            run_number: AtomicU32::new(0),
            next_run: AtomicU32::new(1),
            running: AtomicBool::new(false),
            configuration: RwLock::new(None),
            log_address: RwLock::new(None),
            data_collectors: RwLock::new(BTreeMap::new()),
            limits: Mutex::new(RunLimits::default()),
            shutdown,
        });
        let accept_task = tokio::spawn(Shared::accept_loop(shared.clone(), listener));
        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    /// Address peers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    /// Current aggregate state.
    pub fn aggregate(&self) -> LifecycleState {
        self.shared.registry.aggregate()
    }

    /// Snapshot of every connected peer.
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.shared.registry.snapshot()
    }

    /// Whether any peer last reported BUSY.
    pub fn any_busy(&self) -> bool {
        self.shared.registry.any_busy()
    }

    /// Number of the current (or last) run.
    pub fn run_number(&self) -> u32 {
        self.shared.run_number.load(Ordering::Acquire)
    }

    /// Run number the next `start_run` uses.
    pub fn set_next_run_number(&self, run: u32) {
        self.shared.next_run.store(run, Ordering::Release);
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Configuration sent with the last `configure`.
    pub fn configuration(&self) -> Option<Configuration> {
        self.shared.configuration.read().clone()
    }

    /// Log collector address, once one has connected.
    pub fn log_address(&self) -> Option<String> {
        self.shared.log_address.read().clone()
    }

    /// Data addresses by collector name (`""` for the default collector).
    pub fn data_addresses(&self) -> BTreeMap<String, String> {
        self.shared
            .data_collectors
            .read()
            .values()
            .map(|dc| (dc.name.clone(), dc.address.clone()))
            .collect()
    }

    /// Send a command without waiting for anything.
    pub async fn send_command(&self, command: &str, param: &str, target: Target) -> AppResult<()> {
        self.shared.send_command(command, param, target).await
    }

    /// Send a command to one peer and wait for the status acknowledging it.
    pub async fn send_receive_command(&self, peer: PeerId, command: &str, param: &str) -> AppResult<Status> {
        self.shared.send_receive(peer, command, param).await
    }

    /// Ask one peer for its status.
    pub async fn remote_status(&self, peer: PeerId) -> AppResult<Status> {
        self.shared.send_receive(peer, "STATUS", "").await
    }

    /// Ask every peer to refresh its status.
    pub async fn request_status(&self) -> AppResult<()> {
        self.shared.send_command("STATUS", "", Target::All).await
    }

    /// Initialise peers that start in UNINIT.
    pub async fn initialise(&self, conf: &Configuration, timeout: Option<Duration>) -> AppResult<TransitionOutcome> {
        info!(name = conf.name(), "initialising");
        self.shared.send_command("INIT", &conf.to_string(), Target::All).await?;
        Ok(self
            .shared
            .wait_for(LifecycleState::Unconf, |s| s == LifecycleState::Unconf, true, timeout)
            .await)
    }

    /// Configure every peer with `conf`.
    pub async fn configure(&self, conf: &Configuration, timeout: Option<Duration>) -> AppResult<TransitionOutcome> {
        self.shared.configure(conf, timeout).await
    }

    /// Start the next run.
    pub async fn start_run(&self, timeout: Option<Duration>) -> AppResult<TransitionOutcome> {
        self.shared.start_run(timeout).await
    }

    /// Stop the current run.
    pub async fn stop_run(&self, timeout: Option<Duration>) -> AppResult<TransitionOutcome> {
        self.shared.stop_run(timeout).await
    }

    /// Return every peer to its initial state.
    pub async fn reset(&self, timeout: Option<Duration>) -> AppResult<TransitionOutcome> {
        info!("resetting");
        self.shared.running.store(false, Ordering::Release);
        self.shared.send_command("RESET", "", Target::All).await?;
        Ok(self
            .shared
            .wait_for(
                LifecycleState::Unconf,
                |s| matches!(s, LifecycleState::Unconf | LifecycleState::Uninit),
                false,
                timeout,
            )
            .await)
    }

    /// Tell every peer to exit and wait for them to disconnect.
    pub async fn terminate(&self, timeout: Option<Duration>) -> AppResult<bool> {
        info!("terminating connections");
        self.shared.running.store(false, Ordering::Release);
        self.shared.send_command("TERMINATE", "", Target::All).await?;
        let deadline = timeout.unwrap_or_else(|| self.shared.settings.transition_timeout());
        let emptied = self.wait_for_peers(0, deadline).await;
        if !emptied {
            warn!(remaining = self.shared.registry.len(), "peers still connected after TERMINATE");
        }
        Ok(emptied)
    }

    /// Wait until exactly `count` peers are connected.
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> bool {
        let registry = self.shared.registry.clone();
        tokio::time::timeout(timeout, async move {
            while registry.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Wait for the aggregate to reach `target`.
    pub async fn wait_for_state(&self, target: LifecycleState, timeout: Option<Duration>) -> TransitionOutcome {
        self.shared.wait_for(target, |s| s == target, target != LifecycleState::Error, timeout).await
    }

    /// Stop accepting connections and drop every peer.
    pub async fn shutdown(self) {
        self.shared.shutdown.send_replace(true);
        self.accept_task.abort();
        let links: Vec<_> = self.shared.links.write().values().cloned().collect();
        for link in links {
            if let Err(err) = link.writer.lock().await.shutdown().await {
                debug!(peer = %link.id, error = %err, "closing connection");
            }
        }
        info!("run control stopped");
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let shared = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = shared.admit(stream, remote).await {
                                warn!(remote = %remote, error = %err, "connection not admitted");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
        }
    }

    #[instrument(skip_all, fields(remote = %remote))]
    async fn admit(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> AppResult<()> {
        let (mut reader, mut writer) = transport::split(stream)?;
        if self.running.load(Ordering::Acquire) && !self.settings.accept_during_run {
            writer.send(protocol::refusal("run in progress").as_str()).await?;
            return Err(DaqError::Protocol("refused during run".to_string()));
        }
        writer.send(CONTROL_GREETING).await?;
        let ident: Identification = tokio::time::timeout(self.handshake_timeout, reader.expect())
            .await
            .map_err(|_| DaqError::Timeout("identification".to_string()))??;
        writer.send(CONFIRM).await?;

        let info = ident.into_info().with_remote(remote);
        let id = self.registry.connect(info.clone(), LifecycleState::Uninit);
        let link = Arc::new(PeerLink {
            id,
            info: info.clone(),
            writer: tokio::sync::Mutex::new(writer),
            request_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            next_seq: AtomicU32::new(1),
        });
        self.links.write().insert(id, link.clone());

        let span = tracing::info_span!("peer", peer = %id, identity = %info);
        tokio::spawn(self.clone().status_loop(link.clone(), reader).instrument(span));

        if let Err(err) = self.bootstrap(&link, remote).await {
            warn!(peer = %id, error = %err, "bootstrap failed");
        }
        Ok(())
    }

    async fn bootstrap(&self, link: &PeerLink, remote: SocketAddr) -> AppResult<()> {
        if link.info.is_type(LOG_COLLECTOR) {
            self.init_log(link).await
        } else if link.info.is_type(DATA_COLLECTOR) {
            self.init_data(link, remote).await
        } else {
            self.init_other(link).await
        }
    }

    async fn init_log(&self, link: &PeerLink) -> AppResult<()> {
        let status = self.send_receive(link.id, "SERVER", "").await?;
        let address = status
            .tag(TAG_SERVER)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| DaqError::Protocol("log collector reported no address".to_string()))?
            .to_string();
        info!(address = %address, "log collector registered");
        *self.log_address.write() = Some(address.clone());
        self.send_command("LOG", &address, Target::All).await
    }

    async fn init_data(&self, link: &PeerLink, remote: SocketAddr) -> AppResult<()> {
        let status = self.send_receive(link.id, "SERVER", "").await?;
        let reported = status
            .tag(TAG_SERVER)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| DaqError::Protocol("data collector reported no address".to_string()))?;
        let address = data_address(remote, reported)?;
        let name = link.info.name.clone();
        info!(address = %address, collector = %name, "data collector registered");

        let named: Vec<String> = self
            .data_collectors
            .read()
            .values()
            .filter(|dc| !dc.name.is_empty())
            .map(|dc| dc.name.clone())
            .collect();
        self.data_collectors.write().insert(
            link.id,
            DataCollectorEntry {
                name: name.clone(),
                address: address.clone(),
            },
        );

        let targets: Vec<PeerId> = self
            .links
            .read()
            .values()
            .filter(|other| other.id != link.id && !is_collector(&other.info))
            .filter(|other| {
                if name.is_empty() {
                    !named.iter().any(|dc| serves(dc, &other.info.name))
                } else {
                    serves(&name, &other.info.name)
                }
            })
            .map(|other| other.id)
            .collect();
        for peer in targets {
            self.send_command("DATA", &address, Target::Peer(peer)).await?;
        }

        let log = self.log_address.read().clone();
        if let Some(log) = log {
            self.send_command("LOG", &log, Target::Peer(link.id)).await?;
        }
        Ok(())
    }

    async fn init_other(&self, link: &PeerLink) -> AppResult<()> {
        let log = self.log_address.read().clone();
        if let Some(log) = log {
            self.send_command("LOG", &log, Target::Peer(link.id)).await?;
        }

        let (matching, default): (Vec<_>, Vec<_>) = self
            .data_collectors
            .read()
            .values()
            .cloned()
            .partition(|dc| serves(&dc.name, &link.info.name));
        let chosen: Vec<String> = if matching.is_empty() {
            default
                .into_iter()
                .filter(|dc| dc.name.is_empty())
                .map(|dc| dc.address)
                .collect()
        } else {
            matching.into_iter().map(|dc| dc.address).collect()
        };
        for address in chosen {
            self.send_command("DATA", &address, Target::Peer(link.id)).await?;
        }
        Ok(())
    }

    async fn status_loop(self: Arc<Self>, link: Arc<PeerLink>, mut reader: FrameReader) {
        loop {
            match reader.recv::<Status>().await {
                Ok(Some(status)) => self.on_status(&link, status),
                Ok(None) => {
                    info!("peer closed the connection");
                    break;
                }
                Err(err @ (DaqError::Io(_) | DaqError::ConnectionClosed | DaqError::Transport(_))) => {
                    warn!(error = %err, "peer connection lost");
                    break;
                }
                Err(err) => warn!(error = %err, "discarding malformed status frame"),
            }
        }
        self.disconnect(&link);
    }

    fn on_status(self: &Arc<Self>, link: &PeerLink, status: Status) {
        if let Some(reply) = link.take_reply(&status) {
            // The requester may have timed out already.
            let _ = reply.send(status.clone());
        }

        let current = self.run_number.load(Ordering::Acquire);
        let stamped = status.tag(TAG_RUN).and_then(|r| r.parse::<u32>().ok());
        if let Some(run) = stamped {
            if run < current {
                debug!(peer = %link.id, run, current, "ignoring status from an earlier run");
                return;
            }
        }

        let changed = self
            .registry
            .get(link.id)
            .map_or(true, |r| r.state != status.state() || r.message != status.message());
        if changed {
            logging::log_status(&link.info.section(), &status, Severity::Warn);
        }
        self.registry.upsert(link.id, &status);
        self.check_limits(&status);
    }

    fn check_limits(self: &Arc<Self>, status: &Status) {
        // Counts only belong to the current run once the peer reports RUNNING.
        if !self.running.load(Ordering::Acquire) || status.state() != LifecycleState::Running {
            return;
        }
        let exceeded = {
            let mut limits = self.limits.lock();
            if limits.stop_issued {
                return;
            }
            let tag = |key: &str| status.tag(key).and_then(|v| v.parse::<u64>().ok());
            let size = tag(TAG_FILEBYTES).filter(|&b| limits.size > 0 && b >= limits.size);
            let events = tag(TAG_EVENT).filter(|&e| limits.events > 0 && e >= limits.events);
            let exceeded = size.is_some() || events.is_some();
            if exceeded {
                limits.stop_issued = true;
                info!(bytes = ?size, events = ?events, "run limit reached, stopping run");
            }
            exceeded
        };
        if exceeded {
            let shared = self.clone();
            tokio::spawn(async move {
                if let Err(err) = shared.stop_run(None).await {
                    warn!(error = %err, "automatic stop failed");
                }
            });
        }
    }

    fn disconnect(&self, link: &PeerLink) {
        self.links.write().remove(&link.id);
        self.data_collectors.write().remove(&link.id);
        if link.info.is_type(LOG_COLLECTOR) {
            *self.log_address.write() = None;
        }
        if let Some(pending) = link.pending.lock().take() {
            drop(pending.reply);
        }
        self.registry.remove(link.id);
    }

    fn link(&self, peer: PeerId) -> AppResult<Arc<PeerLink>> {
        self.links.read().get(&peer).cloned().ok_or(DaqError::NotConnected)
    }

    async fn send_command(&self, command: &str, param: &str, target: Target) -> AppResult<()> {
        let msg = CommandMessage::new(command, param);
        let links: Vec<Arc<PeerLink>> = match target {
            Target::All => self.links.read().values().cloned().collect(),
            Target::Peer(peer) => vec![self.link(peer)?],
        };
        debug!(command = %msg, peers = links.len(), "sending command");
        let msg = &msg;
        let sends = links.iter().map(|link| async move { (link, link.send(msg).await) });
        for (link, result) in futures::future::join_all(sends).await {
            if let Err(err) = result {
                warn!(peer = %link.id, command = %msg, error = %err, "send failed");
                if target != Target::All {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn send_receive(&self, peer: PeerId, command: &str, param: &str) -> AppResult<Status> {
        let link = self.link(peer)?;
        let _one_at_a_time = link.request_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        // 0 marks a message that expects no reply.
        let seq = match link.next_seq.fetch_add(1, Ordering::Relaxed) {
            0 => link.next_seq.fetch_add(1, Ordering::Relaxed),
            seq => seq,
        };
        *link.pending.lock() = Some(PendingRequest {
            command: command.to_string(),
            seq,
            reply: tx,
        });
        if let Err(err) = link.send(&CommandMessage::new(command, param).with_seq(seq)).await {
            link.pending.lock().take();
            return Err(err);
        }
        match tokio::time::timeout(self.settings.request_timeout(), rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(DaqError::ConnectionClosed),
            Err(_) => {
                link.pending.lock().take();
                Err(DaqError::Timeout(format!("{command} to {}", link.info)))
            }
        }
    }

    async fn configure(&self, conf: &Configuration, timeout: Option<Duration>) -> AppResult<TransitionOutcome> {
        info!(name = conf.name(), "configuring");
        {
            let section = conf.scoped(RUN_CONTROL_SECTION);
            let mut limits = self.limits.lock();
            if section.current_section() == RUN_CONTROL_SECTION {
                limits.size = section.get_uint("RunSizeLimit", 0);
                limits.events = section.get_uint("RunEventLimit", 0);
            } else {
                limits.size = 0;
                limits.events = 0;
            }
        }
        *self.configuration.write() = Some(conf.clone());
        self.send_command("CLEAR", "", Target::All).await?;
        self.send_command("CONFIG", &conf.to_string(), Target::All).await?;
        Ok(self
            .wait_for(LifecycleState::Conf, |s| s == LifecycleState::Conf, true, timeout)
            .await)
    }

    async fn start_run(&self, timeout: Option<Duration>) -> AppResult<TransitionOutcome> {
        let run = self.next_run.load(Ordering::Acquire);
        info!(run, "starting run");
        self.run_number.store(run, Ordering::Release);
        self.send_command("CLEAR", "", Target::All).await?;

        let collectors: Vec<PeerId> = self.data_collectors.read().keys().copied().collect();
        for collector in collectors {
            if let Err(err) = self.send_receive(collector, "PREPARE", &run.to_string()).await {
                warn!(peer = %collector, run, error = %err, "PREPARE not acknowledged");
            }
        }

        self.limits.lock().stop_issued = false;
        self.running.store(true, Ordering::Release);
        self.send_command("START", &run.to_string(), Target::All).await?;
        self.next_run.store(run.wrapping_add(1), Ordering::Release);
        Ok(self
            .wait_for(LifecycleState::Running, |s| s == LifecycleState::Running, true, timeout)
            .await)
    }

    async fn stop_run(&self, timeout: Option<Duration>) -> AppResult<TransitionOutcome> {
        info!(run = self.run_number.load(Ordering::Acquire), "stopping run");
        self.running.store(false, Ordering::Release);
        self.send_command("STOP", "", Target::All).await?;
        Ok(self
            .wait_for(LifecycleState::Conf, |s| s == LifecycleState::Conf, true, timeout)
            .await)
    }

    /// Wait for the aggregate to satisfy `reached`.
    ///
    /// With `fail_on_error` an ERROR aggregate ends the wait early as `Failed`.
    async fn wait_for<F>(
        &self,
        target: LifecycleState,
        reached: F,
        fail_on_error: bool,
        timeout: Option<Duration>,
    ) -> TransitionOutcome
    where
        F: Fn(LifecycleState) -> bool,
    {
        let deadline = timeout.unwrap_or_else(|| self.settings.transition_timeout());
        let mut rx = self.registry.subscribe();
        let waited = tokio::time::timeout(deadline, async {
            loop {
                let state = self.registry.aggregate();
                if reached(state) {
                    return TransitionOutcome::Reached(state);
                }
                if fail_on_error && state == LifecycleState::Error {
                    return TransitionOutcome::Failed;
                }
                if rx.changed().await.is_err() {
                    return TransitionOutcome::Failed;
                }
            }
        })
        .await;
        match waited {
            Ok(TransitionOutcome::Failed) => {
                warn!(expected = %target, "transition failed: a peer reported ERROR");
                TransitionOutcome::Failed
            }
            Ok(outcome) => outcome,
            Err(_) => {
                let actual = self.registry.aggregate();
                warn!(expected = %target, actual = %actual, timeout_ms = deadline.as_millis() as u64, "transition timed out");
                TransitionOutcome::TimedOut { target, actual }
            }
        }
    }
}

fn is_collector(info: &ConnectionInfo) -> bool {
    info.is_type(DATA_COLLECTOR) || info.is_type(LOG_COLLECTOR)
}

/// Whether a collector named `collector` serves the peer named `peer`.
fn serves(collector: &str, peer: &str) -> bool {
    !collector.is_empty() && !peer.is_empty() && collector.contains(peer)
}

/// Combine the IP the collector connected from with the port it reported.
fn data_address(remote: SocketAddr, reported: &str) -> AppResult<String> {
    let bare = transport::strip_scheme(reported);
    let port = bare
        .rsplit_once(':')
        .map_or(bare, |(_, port)| port)
        .parse::<u16>()
        .map_err(|_| DaqError::Protocol(format!("invalid data server address '{reported}'")))?;
    Ok(format!("tcp://{}", SocketAddr::new(remote.ip(), port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_address_uses_connection_ip_and_reported_port() {
        let remote: SocketAddr = "192.168.1.20:51234".parse().unwrap();
        assert_eq!(data_address(remote, "tcp://0.0.0.0:44001").unwrap(), "tcp://192.168.1.20:44001");
        assert_eq!(data_address(remote, "44002").unwrap(), "tcp://192.168.1.20:44002");
        assert!(data_address(remote, "tcp://host:port").is_err());
    }

    #[test]
    fn named_collectors_serve_matching_peers() {
        assert!(serves("tel_dc", "tel"));
        assert!(!serves("tel_dc", "dut"));
        assert!(!serves("", "tel"));
        assert!(!serves("tel_dc", ""));
    }

    #[test]
    fn replies_match_on_request_sequence() {
        let (reply, _rx) = oneshot::channel();
        let pending = PendingRequest {
            command: "STATUS".to_string(),
            seq: 2,
            reply,
        };
        let ack = |tags: &[(&str, &str)]| {
            let mut status = Status::new(Severity::Ok, LifecycleState::Conf, "");
            for (key, value) in tags {
                status.set_tag(*key, *value);
            }
            status
        };
        assert!(!pending.answered_by(&ack(&[(TAG_COMMAND, "STATUS")])));
        assert!(!pending.answered_by(&ack(&[(TAG_COMMAND, "STATUS"), (TAG_SEQUENCE, "1")])));
        assert!(!pending.answered_by(&ack(&[(TAG_COMMAND, "CONFIG"), (TAG_SEQUENCE, "2")])));
        assert!(pending.answered_by(&ack(&[(TAG_COMMAND, "STATUS"), (TAG_SEQUENCE, "2")])));
    }

    #[test]
    fn outcome_helpers() {
        assert!(TransitionOutcome::Reached(LifecycleState::Conf).is_reached());
        assert!(!TransitionOutcome::Failed.is_reached());
    }
}
