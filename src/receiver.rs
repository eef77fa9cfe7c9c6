//! Peer side of the command protocol.
//!
//! A peer connects to the orchestrator, identifies itself and then runs three
//! independent tasks over the one connection:
//!
//! - **receive**: reads command frames and queues them, never running handler code,
//! - **dispatch**: takes commands off the queue one at a time (strict FIFO), runs
//!   the matching [`CommandHandler`] hook, applies the lifecycle transition and
//!   acknowledges with the updated [`Status`],
//! - **status push**: sends the current status on a timer and whenever it
//!   changes, so the orchestrator sees BUSY peers without polling.
//!
//! Data taking runs in a fourth task, [`CommandHandler::run_loop`], started on
//! START and stopped cooperatively on STOP, RESET or TERMINATE.
//!
//! ## Lifecycle
//!
//! | command   | allowed from        | on success        |
//! |-----------|---------------------|-------------------|
//! | INIT      | UNINIT, UNCONF      | UNCONF            |
//! | CONFIG    | UNCONF, CONF        | CONF              |
//! | START     | CONF                | RUNNING           |
//! | STOP      | RUNNING, ERROR      | CONF (ERROR stays)|
//! | RESET     | any                 | initial state     |
//! | TERMINATE | any                 | peer exits        |
//!
//! A hook returning `Err` puts the peer into the sticky ERROR state. Commands
//! that are not allowed are acknowledged with the status left unchanged.

use crate::config::Configuration;
use crate::connection::ConnectionInfo;
use crate::error::{AppResult, DaqError};
use crate::protocol::{Command, CommandMessage, TAG_COMMAND, TAG_RUN, TAG_SEQUENCE, TAG_SERVER};
use crate::settings::PeerSettings;
use crate::status::{LifecycleState, Severity, Status};
use crate::transport::{self, FrameReader, FrameWriter};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

type SharedWriter = Arc<tokio::sync::Mutex<FrameWriter>>;

/// Application hooks of a peer.
///
/// Every hook has a no-op default. The receiver applies the lifecycle
/// transition after a hook succeeds; hooks only do the application work and
/// may add status tags through the [`PeerContext`].
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Whether the peer starts in UNINIT and needs INIT before CONFIG.
    fn requires_initialise(&self) -> bool {
        false
    }

    /// INIT.
    async fn on_initialise(&self, _ctx: &PeerContext, _conf: &Configuration) -> AppResult<()> {
        Ok(())
    }

    /// CONFIG. `conf` is scoped to this peer's section.
    async fn on_configure(&self, _ctx: &PeerContext, _conf: &Configuration) -> AppResult<()> {
        Ok(())
    }

    /// PREPARE, sent to data collectors before START.
    async fn on_prepare(&self, _ctx: &PeerContext, _run: u32) -> AppResult<()> {
        Ok(())
    }

    /// START. The run loop is started after this returns.
    async fn on_start_run(&self, _ctx: &PeerContext, _run: u32) -> AppResult<()> {
        Ok(())
    }

    /// STOP. Called after the run loop has finished.
    async fn on_stop_run(&self, _ctx: &PeerContext) -> AppResult<()> {
        Ok(())
    }

    /// RESET.
    async fn on_reset(&self, _ctx: &PeerContext) -> AppResult<()> {
        Ok(())
    }

    /// TERMINATE.
    async fn on_terminate(&self, _ctx: &PeerContext) -> AppResult<()> {
        Ok(())
    }

    /// STATUS. Refresh status tags here.
    async fn on_status(&self, _ctx: &PeerContext) -> AppResult<()> {
        Ok(())
    }

    /// LOG with the log collector address.
    async fn on_log(&self, _ctx: &PeerContext, _address: &str) -> AppResult<()> {
        Ok(())
    }

    /// DATA with the data collector address.
    async fn on_data(&self, _ctx: &PeerContext, _address: &str) -> AppResult<()> {
        Ok(())
    }

    /// SERVER. Return the address this peer serves on, if any.
    async fn on_server(&self, _ctx: &PeerContext) -> AppResult<Option<String>> {
        Ok(None)
    }

    /// CLEAR.
    async fn on_clear(&self, _ctx: &PeerContext) -> AppResult<()> {
        Ok(())
    }

    /// Anything not in the command vocabulary.
    async fn on_unrecognised(&self, ctx: &PeerContext, command: &str, param: &str) -> AppResult<()> {
        warn!(command, param, "unrecognised command");
        ctx.set_message(Severity::Warn, format!("Unrecognised command {command}"));
        Ok(())
    }

    /// Data-taking loop for one run.
    ///
    /// Runs until it returns or [`PeerContext::run_active`] turns false; an
    /// error puts the peer into ERROR.
    async fn run_loop(&self, _ctx: PeerContext) -> AppResult<()> {
        Ok(())
    }
}

struct ContextInner {
    info: ConnectionInfo,
    initial_state: LifecycleState,
    status: Mutex<Status>,
    status_changed: Notify,
    run_number: AtomicU32,
    took_part_in_run: AtomicBool,
    run_active: watch::Sender<bool>,
    done: watch::Sender<bool>,
    configuration: RwLock<Option<Configuration>>,
    log_address: RwLock<Option<String>>,
    data_address: RwLock<Option<String>>,
}

/// State shared between a peer's tasks and its handler.
///
/// The status lives behind its own mutex, separate from the command queue.
#[derive(Clone)]
pub struct PeerContext {
    inner: Arc<ContextInner>,
}

impl PeerContext {
    /// Context for a peer with the given identity.
    pub fn new(info: ConnectionInfo, requires_initialise: bool) -> Self {
        let initial_state = if requires_initialise {
            LifecycleState::Uninit
        } else {
            LifecycleState::Unconf
        };
        let (run_active, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                info,
                initial_state,
                status: Mutex::new(Status::new(Severity::Ok, initial_state, "")),
                status_changed: Notify::new(),
                run_number: AtomicU32::new(0),
                took_part_in_run: AtomicBool::new(false),
                run_active,
                done,
                configuration: RwLock::new(None),
                log_address: RwLock::new(None),
                data_address: RwLock::new(None),
            }),
        }
    }

    /// Handshake identity.
    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    /// State after connect and after RESET.
    pub fn initial_state(&self) -> LifecycleState {
        self.inner.initial_state
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner.status.lock().state()
    }

    /// Copy of the current status.
    pub fn status(&self) -> Status {
        self.inner.status.lock().clone()
    }

    /// Status as it goes on the wire: stamped with `RUN` once the peer took part in a run.
    pub fn outgoing_status(&self) -> Status {
        let mut status = self.status();
        if self.inner.took_part_in_run.load(Ordering::Acquire) {
            status.set_tag(TAG_RUN, self.run_number());
        }
        status
    }

    fn update(&self, f: impl FnOnce(&mut Status)) {
        {
            let mut status = self.inner.status.lock();
            f(&mut status);
        }
        self.inner.status_changed.notify_one();
    }

    /// Replace level, state and message. Tags are kept.
    pub fn set_status(&self, level: Severity, state: LifecycleState, message: impl Into<String>) {
        let message = message.into();
        self.update(|status| {
            let tags = std::mem::take(status.tags_mut());
            *status = Status::new(level, state, message);
            *status.tags_mut() = tags;
        });
    }

    /// Replace level and message, keeping the state.
    pub fn set_message(&self, level: Severity, message: impl Into<String>) {
        let state = self.state();
        self.set_status(level, state, message);
    }

    /// Enter the sticky ERROR state.
    pub fn set_error(&self, message: impl Into<String>) {
        self.set_status(Severity::Error, LifecycleState::Error, message);
    }

    /// Mark the peer busy (or not) without changing state or message.
    pub fn set_busy(&self, busy: bool) {
        let message = self.status().message().to_string();
        let level = if busy { Severity::Busy } else { Severity::Ok };
        self.set_message(level, message);
    }

    /// Set a status tag.
    pub fn set_tag(&self, key: &str, value: impl ToString) {
        let value = value.to_string();
        self.update(|status| status.set_tag(key, value));
    }

    /// Run number of the current or last run.
    pub fn run_number(&self) -> u32 {
        self.inner.run_number.load(Ordering::Acquire)
    }

    /// Whether a run is in progress and the run loop should keep going.
    pub fn run_active(&self) -> bool {
        *self.inner.run_active.borrow()
    }

    /// Resolves once the current run has been asked to stop.
    pub async fn run_stopped(&self) {
        let mut rx = self.inner.run_active.subscribe();
        // The sender lives as long as the context.
        let _ = rx.wait_for(|active| !*active).await;
    }

    /// Whether the peer is shutting down.
    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Resolves once the peer is shutting down.
    pub async fn wait_done(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn signal_done(&self) {
        self.inner.end_run();
        self.inner.done.send_replace(true);
    }

    /// Configuration received with the last INIT or CONFIG.
    pub fn configuration(&self) -> Option<Configuration> {
        self.inner.configuration.read().clone()
    }

    /// Log collector address announced by LOG.
    pub fn log_address(&self) -> Option<String> {
        self.inner.log_address.read().clone()
    }

    /// Data collector address announced by DATA.
    pub fn data_address(&self) -> Option<String> {
        self.inner.data_address.read().clone()
    }

    fn begin_run(&self, run: u32) {
        self.inner.run_number.store(run, Ordering::Release);
        self.inner.took_part_in_run.store(true, Ordering::Release);
        self.inner.run_active.send_replace(true);
    }

    async fn status_changed(&self) {
        self.inner.status_changed.notified().await;
    }
}

impl ContextInner {
    fn end_run(&self) {
        self.run_active.send_replace(false);
    }
}

/// Whether the dispatch loop keeps going after a command.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

struct Dispatcher<H> {
    handler: Arc<H>,
    ctx: PeerContext,
    writer: SharedWriter,
    run_task: Option<JoinHandle<()>>,
}

impl<H: CommandHandler> Dispatcher<H> {
    async fn dispatch(&mut self, msg: CommandMessage) -> Flow {
        let command = Command::parse(&msg);
        debug!(command = %msg, state = %self.ctx.state(), "dispatching");

        if let Err(err) = self.execute(&command).await {
            error!(command = command.name(), error = %err, "command failed");
            self.ctx.set_error(format!("{} failed: {err}", command.name()));
        }

        let mut ack = self.ctx.outgoing_status();
        ack.set_tag(TAG_COMMAND, command.name());
        if msg.seq != 0 {
            ack.set_tag(TAG_SEQUENCE, msg.seq);
        }
        if let Err(err) = self.writer.lock().await.send(&ack).await {
            warn!(error = %err, "failed to acknowledge command");
        }

        if command == Command::Terminate {
            Flow::Terminate
        } else {
            Flow::Continue
        }
    }

    fn refuse(&self, command: &Command, allowed: &str) {
        let state = self.ctx.state();
        warn!(command = command.name(), state = %state, "command not allowed");
        if state != LifecycleState::Error {
            self.ctx.set_message(
                Severity::Warn,
                format!("{} not allowed in state {state} (expected {allowed})", command.name()),
            );
        }
    }

    async fn stop_run_loop(&mut self) {
        self.ctx.inner.end_run();
        if let Some(task) = self.run_task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "run loop panicked");
            }
        }
    }

    fn spawn_run_loop(&mut self) {
        let handler = self.handler.clone();
        let ctx = self.ctx.clone();
        let span = tracing::info_span!("run_loop", run = ctx.run_number());
        self.run_task = Some(tokio::spawn(
            async move {
                if let Err(err) = handler.run_loop(ctx.clone()).await {
                    error!(error = %err, "run loop failed");
                    ctx.set_error(format!("run loop failed: {err}"));
                }
            }
            .instrument(span),
        ));
    }

    async fn execute(&mut self, command: &Command) -> AppResult<()> {
        let ctx = self.ctx.clone();
        let state = ctx.state();
        match command {
            Command::Init(doc) => {
                if !matches!(state, LifecycleState::Uninit | LifecycleState::Unconf) {
                    self.refuse(command, "UNINIT or UNCONF");
                    return Ok(());
                }
                let conf = Configuration::parse_with_section(doc, &ctx.info().section());
                *ctx.inner.configuration.write() = Some(conf.clone());
                self.handler.on_initialise(&ctx, &conf).await?;
                ctx.set_status(Severity::Ok, LifecycleState::Unconf, "Initialised");
            }
            Command::Config(doc) => {
                if !matches!(state, LifecycleState::Unconf | LifecycleState::Conf) {
                    self.refuse(command, "UNCONF or CONF");
                    return Ok(());
                }
                let conf = Configuration::parse_with_section(doc, &ctx.info().section());
                *ctx.inner.configuration.write() = Some(conf.clone());
                self.handler.on_configure(&ctx, &conf).await?;
                ctx.set_status(
                    Severity::Ok,
                    LifecycleState::Conf,
                    format!("Configured ({})", conf.name()),
                );
            }
            Command::Prepare(run) => {
                if state == LifecycleState::Error {
                    self.refuse(command, "no error");
                    return Ok(());
                }
                self.handler.on_prepare(&ctx, *run).await?;
            }
            Command::Start(run) => {
                if state != LifecycleState::Conf {
                    self.refuse(command, "CONF");
                    return Ok(());
                }
                ctx.begin_run(*run);
                if let Err(err) = self.handler.on_start_run(&ctx, *run).await {
                    ctx.inner.end_run();
                    return Err(err);
                }
                ctx.set_status(Severity::Ok, LifecycleState::Running, format!("Running run {run}"));
                self.spawn_run_loop();
                info!(run, "run started");
            }
            Command::Stop => {
                if !matches!(state, LifecycleState::Running | LifecycleState::Error) {
                    self.refuse(command, "RUNNING");
                    return Ok(());
                }
                self.stop_run_loop().await;
                self.handler.on_stop_run(&ctx).await?;
                if ctx.state() != LifecycleState::Error {
                    ctx.set_status(Severity::Ok, LifecycleState::Conf, "Stopped");
                }
                info!(run = ctx.run_number(), "run stopped");
            }
            Command::Reset => {
                self.stop_run_loop().await;
                self.handler.on_reset(&ctx).await?;
                ctx.update(|status| *status = Status::new(Severity::Ok, ctx.initial_state(), "Reset"));
            }
            Command::Terminate => {
                self.stop_run_loop().await;
                self.handler.on_terminate(&ctx).await?;
                ctx.set_message(Severity::Ok, "Terminating");
            }
            Command::Status => self.handler.on_status(&ctx).await?,
            Command::Log(address) => {
                *ctx.inner.log_address.write() = Some(address.clone());
                self.handler.on_log(&ctx, address).await?;
            }
            Command::Data(address) => {
                *ctx.inner.data_address.write() = Some(address.clone());
                self.handler.on_data(&ctx, address).await?;
            }
            Command::Server => {
                if let Some(address) = self.handler.on_server(&ctx).await? {
                    ctx.set_tag(TAG_SERVER, address);
                }
            }
            Command::Clear => self.handler.on_clear(&ctx).await?,
            Command::Unrecognised { command, param } => {
                self.handler.on_unrecognised(&ctx, command, param).await?;
            }
        }
        Ok(())
    }
}

/// A peer's connection to the orchestrator.
pub struct CommandReceiver<H: CommandHandler> {
    handler: Arc<H>,
    ctx: PeerContext,
    settings: PeerSettings,
    tasks: Vec<JoinHandle<()>>,
}

impl<H: CommandHandler> CommandReceiver<H> {
    /// A receiver for a peer of role `peer_type` named `name`.
    pub fn new(peer_type: &str, name: &str, handler: H, settings: PeerSettings) -> Self {
        let ctx = PeerContext::new(ConnectionInfo::new(peer_type, name), handler.requires_initialise());
        Self {
            handler: Arc::new(handler),
            ctx,
            settings,
            tasks: Vec::new(),
        }
    }

    /// Shared context, usable from outside the handler (tests, front ends).
    pub fn context(&self) -> PeerContext {
        self.ctx.clone()
    }

    /// The handler.
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Connect, identify and start the receive, dispatch and status-push tasks.
    pub async fn connect(&mut self, address: &str) -> AppResult<()> {
        if !self.tasks.is_empty() {
            return Err(DaqError::Transport("already connected".to_string()));
        }
        let (mut reader, mut writer) = transport::connect(address).await?;
        transport::client_handshake(&mut reader, &mut writer, self.ctx.info(), self.settings.handshake_timeout())
            .await?;

        self.ctx.set_message(Severity::Ok, "Connected");
        writer.send(&self.ctx.outgoing_status()).await?;
        info!(identity = %self.ctx.info(), address, "connected to run control");

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!("peer", identity = %self.ctx.info());

        self.tasks.push(tokio::spawn(receive_task(reader, tx, self.ctx.clone()).instrument(span.clone())));

        let dispatcher = Dispatcher {
            handler: self.handler.clone(),
            ctx: self.ctx.clone(),
            writer: writer.clone(),
            run_task: None,
        };
        self.tasks.push(tokio::spawn(dispatch_task(dispatcher, rx).instrument(span.clone())));

        if let Some(period) = self.settings.status_push_interval() {
            self.tasks.push(tokio::spawn(
                status_push_task(writer, self.ctx.clone(), period).instrument(span),
            ));
        }
        Ok(())
    }

    /// Serve until TERMINATE or until the connection is lost.
    pub async fn exec(mut self) -> AppResult<()> {
        if self.tasks.is_empty() {
            return Err(DaqError::NotConnected);
        }
        self.ctx.wait_done().await;
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(error = %err, "peer task panicked");
                }
            }
        }
        info!(identity = %self.ctx.info(), "peer finished");
        Ok(())
    }

    /// Drop the connection without TERMINATE, as a crashed peer would.
    pub fn abort(mut self) {
        self.ctx.signal_done();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn receive_task(mut reader: FrameReader, tx: mpsc::UnboundedSender<CommandMessage>, ctx: PeerContext) {
    loop {
        tokio::select! {
            _ = ctx.wait_done() => break,
            frame = reader.recv::<CommandMessage>() => match frame {
                Ok(Some(msg)) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("run control closed the connection");
                    break;
                }
                Err(err @ (DaqError::Io(_) | DaqError::ConnectionClosed | DaqError::Transport(_))) => {
                    warn!(error = %err, "control connection lost");
                    break;
                }
                Err(err) => warn!(error = %err, "discarding malformed command frame"),
            }
        }
    }
    // Queued commands still drain before the dispatcher sees the closed queue.
    drop(tx);
}

async fn dispatch_task<H: CommandHandler>(mut dispatcher: Dispatcher<H>, mut rx: mpsc::UnboundedReceiver<CommandMessage>) {
    while let Some(msg) = rx.recv().await {
        if dispatcher.dispatch(msg).await == Flow::Terminate {
            break;
        }
    }
    dispatcher.stop_run_loop().await;
    dispatcher.ctx.signal_done();
}

async fn status_push_task(writer: SharedWriter, ctx: PeerContext, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ctx.wait_done() => break,
            _ = ticker.tick() => {}
            _ = ctx.status_changed() => {}
        }
        let status = ctx.outgoing_status();
        if let Err(err) = writer.lock().await.send(&status).await {
            debug!(error = %err, "status push stopped");
            break;
        }
    }
}
