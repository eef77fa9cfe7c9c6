//! Dataflow processor graph.
//!
//! Events flow through named processor nodes along filtered edges. The graph
//! owns every node in an arena; nodes refer to each other only by [`NodeId`],
//! so links carry no ownership and teardown order never matters.
//!
//! ## Delivery modes
//!
//! - **synchronous** (default): an event delivered to a node runs its
//!   [`Processor::process_event`] on the caller's thread, then everything it
//!   emitted is delivered downstream in edge registration order.
//! - **asynchronous** (`SYS:CS:RUN`): deliveries go onto the node's unbounded
//!   FIFO and a dedicated worker thread processes them one at a time.
//!   `SYS:CS:STOP` drains the backlog and joins the worker.
//! - **hub**: a fan-in node owns one FIFO of `(origin, event)` pairs fed by all
//!   its upstream nodes and a worker that hands them on in arrival order. A node
//!   becomes a hub when it gains a second upstream, or on `SYS:HB:FORCE`.
//!
//! Queues are unbounded. A slow consumer grows its queue without limit and
//! nothing is ever dropped.
//!
//! ## Edges
//!
//! Each downstream edge carries the set of accepted event type ids; an event is
//! delivered along it only if its type is in the set, and an empty set accepts
//! everything. An edge registered without types takes the upstream node's
//! default set, managed with `SYS:EV:ADD=<type>` and `SYS:EV:DEL=<type>`.
//!
//! ## Commands
//!
//! Commands always run on the caller's thread, never behind queued events.
//! `SYS:` commands are handled by the graph; anything else goes to
//! [`Processor::process_command`], deferred until the node is configured if it
//! is still UNCONF.
//!
//! # Example
//!
//! ```
//! use daq_runcontrol::config::Configuration;
//! use daq_runcontrol::event::{type_id, Event};
//! use daq_runcontrol::processor::{EventCounter, Forward, ProcessorGraph};
//!
//! # fn main() -> daq_runcontrol::error::AppResult<()> {
//! let graph = ProcessorGraph::new();
//! let source = graph.add_node(Box::new(Forward));
//! let counter = EventCounter::new();
//! let counts = counter.counts();
//! let sink = graph.add_node(Box::new(counter));
//! graph.connect(source, sink, &[type_id("RawEvent")])?;
//! graph.configure_all(&Configuration::new())?;
//!
//! graph.process(source, Event::new("RawEvent", 1, 0).into_ref())?;
//! graph.process(source, Event::new("SYNC", 1, 0).into_ref())?;
//! assert_eq!(counts.total(), 1);
//! # Ok(())
//! # }
//! ```

mod builtin;
mod node;
mod worker;

pub use builtin::{processor_factory, EventCounter, EventCounts, ExportEvent, Forward, ProcessorConstructor, ProcessorFactory};
pub use node::{NodeId, Processor, ProcessorContext, ProcessorState, ThreadState};

use crate::config::Configuration;
use crate::error::{AppResult, DaqError};
use crate::event::{event_registry, type_id, EventRef};
use node::Node;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use worker::Worker;

/// Start the asynchronous consumer.
pub const CMD_CONSUMER_RUN: &str = "SYS:CS:RUN";
/// Drain and stop the asynchronous consumer.
pub const CMD_CONSUMER_STOP: &str = "SYS:CS:STOP";
/// Make the node a hub.
pub const CMD_HUB_FORCE: &str = "SYS:HB:FORCE";
/// Add a type to the default accepted set.
pub const CMD_EVENT_ADD: &str = "SYS:EV:ADD";
/// Remove a type from the default accepted set.
pub const CMD_EVENT_DEL: &str = "SYS:EV:DEL";

#[derive(Default)]
struct GraphInner {
    nodes: RwLock<Vec<Arc<Node>>>,
}

impl GraphInner {
    fn node(&self, id: NodeId) -> AppResult<Arc<Node>> {
        self.nodes
            .read()
            .get(id.index())
            .cloned()
            .ok_or_else(|| DaqError::Processor(format!("no processor node {id}")))
    }

    /// Entry into `target`: through its hub FIFO if it is a hub, else straight on.
    fn deliver(&self, target: &Node, origin: Option<NodeId>, event: EventRef) -> AppResult<()> {
        let event = match target.hub.lock().as_ref() {
            Some(hub) => match hub.push(origin, event) {
                Ok(()) => return Ok(()),
                Err(event) => event,
            },
            None => event,
        };
        self.dispatch(target, origin, event)
    }

    /// Onto the consumer FIFO if one runs, else run on this thread.
    fn dispatch(&self, target: &Node, origin: Option<NodeId>, event: EventRef) -> AppResult<()> {
        let event = match target.consumer.lock().as_ref() {
            Some(consumer) => match consumer.push(origin, event) {
                Ok(()) => return Ok(()),
                Err(event) => event,
            },
            None => event,
        };
        self.run(target, origin, event, false)
    }

    fn run(&self, target: &Node, origin: Option<NodeId>, event: EventRef, on_worker: bool) -> AppResult<()> {
        let state = target.state();
        if state != ProcessorState::Ready {
            warn!(node = %target.id, state = %state, event = event.event_n(), "node not ready, event dropped");
            return Ok(());
        }
        if on_worker {
            target.set_thread_state(ThreadState::Busy);
        }
        let mut outgoing = Vec::new();
        let result = {
            let mut processor = target.processor.lock();
            let mut ctx = ProcessorContext::new(target.id, origin, &mut outgoing);
            processor.process_event(&event, &mut ctx)
        };
        match &result {
            Ok(()) => {
                target.processed.fetch_add(1, Ordering::Relaxed);
                if on_worker {
                    target.set_thread_state(ThreadState::Ready);
                }
            }
            Err(err) => {
                error!(node = %target.id, kind = %target.type_name, error = %err, "processing failed");
                target.set_state(ProcessorState::Error);
                if on_worker {
                    target.set_thread_state(ThreadState::Error);
                }
            }
        }
        for out in outgoing {
            self.forward(target, out);
        }
        result
    }

    fn forward(&self, from: &Node, event: EventRef) {
        let targets = from.links.read().targets_for(event.type_id());
        for id in targets {
            let delivered = self.node(id).and_then(|target| self.deliver(&target, Some(from.id), event.clone()));
            if let Err(err) = delivered {
                debug!(from = %from.id, to = %id, error = %err, "downstream delivery failed");
            }
        }
    }

    fn start_hub(self: &Arc<Self>, node: &Arc<Node>) -> AppResult<()> {
        let mut hub = node.hub.lock();
        if hub.is_some() {
            return Ok(());
        }
        let graph = Arc::downgrade(self);
        let id = node.id;
        *hub = Some(Worker::spawn(format!("proc-{}-hub", id.0), move |origin, event| {
            hub_step(&graph, id, origin, event)
        })?);
        drop(hub);
        node.set_thread_state(ThreadState::Ready);
        info!(node = %id, kind = %node.type_name, "node is now a hub");
        Ok(())
    }

    fn start_consumer(self: &Arc<Self>, node: &Arc<Node>) -> AppResult<()> {
        let mut consumer = node.consumer.lock();
        if consumer.is_some() {
            return Ok(());
        }
        let graph = Arc::downgrade(self);
        let id = node.id;
        *consumer = Some(Worker::spawn(format!("proc-{}-consumer", id.0), move |origin, event| {
            consumer_step(&graph, id, origin, event)
        })?);
        drop(consumer);
        node.set_thread_state(ThreadState::Ready);
        debug!(node = %id, "asynchronous consumer started");
        Ok(())
    }

    fn stop_consumer(&self, node: &Node) {
        let worker = node.consumer.lock().take();
        if let Some(worker) = worker {
            worker.stop();
            debug!(node = %node.id, "asynchronous consumer stopped");
        }
        if !node.has_worker() {
            node.set_thread_state(ThreadState::Unconf);
        }
    }

    fn stop_hub(&self, node: &Node) {
        let worker = node.hub.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        if !node.has_worker() {
            node.set_thread_state(ThreadState::Unconf);
        }
    }
}

fn hub_step(graph: &Weak<GraphInner>, id: NodeId, origin: Option<NodeId>, event: EventRef) -> bool {
    let Some(graph) = graph.upgrade() else {
        return false;
    };
    if let Ok(node) = graph.node(id) {
        if let Err(err) = graph.dispatch(&node, origin, event) {
            debug!(node = %id, error = %err, "hub delivery failed");
        }
    }
    true
}

fn consumer_step(graph: &Weak<GraphInner>, id: NodeId, origin: Option<NodeId>, event: EventRef) -> bool {
    let Some(graph) = graph.upgrade() else {
        return false;
    };
    if let Ok(node) = graph.node(id) {
        // Failures are already recorded in the node and thread states.
        let _ = graph.run(&node, origin, event, true);
    }
    true
}

/// Arena of processor nodes and the links between them.
///
/// Dropping the graph drains and joins every worker thread.
#[derive(Default)]
pub struct ProcessorGraph {
    inner: Arc<GraphInner>,
}

impl ProcessorGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node in UNCONF state.
    pub fn add_node(&self, processor: Box<dyn Processor>) -> NodeId {
        let mut nodes = self.inner.nodes.write();
        let id = NodeId(nodes.len() as u32);
        let node = Node::new(id, processor);
        debug!(node = %id, kind = %node.type_name, "processor node added");
        nodes.push(Arc::new(node));
        id
    }

    /// Build a node through the processor factory and apply `commands` to it.
    ///
    /// Commands use the `NAME=arg` form accepted by [`command`](Self::command).
    pub fn create(&self, type_name: &str, commands: &[&str]) -> AppResult<NodeId> {
        let processor = processor_factory().create(type_name)?;
        let id = self.add_node(processor);
        for cmd in commands {
            self.command(id, cmd)?;
        }
        Ok(id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.inner.nodes.read().len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `to` downstream of `from`, accepting the given type ids.
    ///
    /// An empty `types` slice takes `from`'s default set (which may itself be
    /// empty, accepting everything). Connecting the same pair again widens the
    /// accepted set. Gaining a second upstream turns `to` into a hub.
    pub fn connect(&self, from: NodeId, to: NodeId, types: &[u32]) -> AppResult<()> {
        let source = self.inner.node(from)?;
        let target = self.inner.node(to)?;
        {
            let mut links = source.links.write();
            let mut accepted: BTreeSet<u32> = types.iter().copied().collect();
            if accepted.is_empty() {
                accepted = links.default_types.clone();
            }
            match links.downstream.iter_mut().find(|(id, _)| *id == to) {
                Some((_, existing)) => existing.extend(accepted),
                None => links.downstream.push((to, accepted)),
            }
        }
        let needs_hub = {
            let mut links = target.links.write();
            if !links.upstream.contains(&from) {
                links.upstream.push(from);
            }
            links.upstream.len() >= 2 || links.hub_forced
        };
        debug!(from = %from, to = %to, "processor nodes connected");
        if needs_hub {
            self.inner.start_hub(&target)?;
        }
        Ok(())
    }

    /// Like [`connect`](Self::connect) with type names.
    pub fn connect_types(&self, from: NodeId, to: NodeId, types: &[&str]) -> AppResult<()> {
        let ids: Vec<u32> = types.iter().map(|name| type_id(name)).collect();
        self.connect(from, to, &ids)
    }

    /// Configure one node. Success makes it READY and replays deferred commands.
    pub fn configure(&self, id: NodeId, conf: &Configuration) -> AppResult<()> {
        let node = self.inner.node(id)?;
        let result = node.processor.lock().configure(conf);
        if let Err(err) = result {
            warn!(node = %id, kind = %node.type_name, error = %err, "configuration failed");
            node.set_state(ProcessorState::Error);
            return Err(err);
        }
        node.set_state(ProcessorState::Ready);
        let pending = std::mem::take(&mut *node.pending_commands.lock());
        for (cmd, arg) in pending {
            node.processor.lock().process_command(&cmd, &arg)?;
        }
        debug!(node = %id, "node ready");
        Ok(())
    }

    /// Configure every node, stopping at the first failure.
    pub fn configure_all(&self, conf: &Configuration) -> AppResult<()> {
        for index in 0..self.len() {
            self.configure(NodeId(index as u32), conf)?;
        }
        Ok(())
    }

    /// Run a command given as `NAME` or `NAME=arg`.
    pub fn command(&self, id: NodeId, command: &str) -> AppResult<()> {
        match command.split_once('=') {
            Some((cmd, arg)) => self.send_command(id, cmd, arg),
            None => self.send_command(id, command, ""),
        }
    }

    /// Run a command on the caller's thread.
    pub fn send_command(&self, id: NodeId, cmd: &str, arg: &str) -> AppResult<()> {
        let node = self.inner.node(id)?;
        match cmd {
            CMD_CONSUMER_RUN => self.inner.start_consumer(&node),
            CMD_CONSUMER_STOP => {
                self.inner.stop_consumer(&node);
                Ok(())
            }
            CMD_HUB_FORCE => {
                node.links.write().hub_forced = true;
                self.inner.start_hub(&node)
            }
            CMD_EVENT_ADD => {
                node.links.write().default_types.insert(type_id(arg));
                Ok(())
            }
            CMD_EVENT_DEL => {
                node.links.write().default_types.remove(&type_id(arg));
                Ok(())
            }
            _ if cmd.starts_with("SYS:") => Err(DaqError::Processor(format!("unknown system command '{cmd}'"))),
            _ => {
                if node.state() == ProcessorState::Unconf {
                    node.pending_commands.lock().push((cmd.to_string(), arg.to_string()));
                    return Ok(());
                }
                node.processor.lock().process_command(cmd, arg)
            }
        }
    }

    /// Inject an event into `id` from outside the graph.
    ///
    /// Fails if the node is not READY. In synchronous mode a processing failure
    /// of this node is returned; failures further downstream are only logged.
    pub fn process(&self, id: NodeId, event: EventRef) -> AppResult<()> {
        let node = self.inner.node(id)?;
        let state = node.state();
        if state != ProcessorState::Ready {
            return Err(DaqError::Processor(format!("node {id} is {state}, not READY")));
        }
        self.inner.deliver(&node, None, event)
    }

    /// Configuration state of a node.
    pub fn state(&self, id: NodeId) -> AppResult<ProcessorState> {
        Ok(self.inner.node(id)?.state())
    }

    /// Worker thread state of a node.
    pub fn thread_state(&self, id: NodeId) -> AppResult<ThreadState> {
        Ok(*self.inner.node(id)?.thread_state.lock())
    }

    /// Whether the node runs as a hub.
    pub fn is_hub(&self, id: NodeId) -> AppResult<bool> {
        Ok(self.inner.node(id)?.is_hub())
    }

    /// Events waiting in the node's queues.
    pub fn queue_len(&self, id: NodeId) -> AppResult<usize> {
        Ok(self.inner.node(id)?.queue_len())
    }

    /// Events the node has processed successfully.
    pub fn processed(&self, id: NodeId) -> AppResult<u64> {
        Ok(self.inner.node(id)?.processed.load(Ordering::Relaxed))
    }

    /// Upstream nodes, in connection order.
    pub fn upstream(&self, id: NodeId) -> AppResult<Vec<NodeId>> {
        Ok(self.inner.node(id)?.links.read().upstream.clone())
    }

    /// Downstream nodes with their accepted type sets, in registration order.
    pub fn downstream(&self, id: NodeId) -> AppResult<Vec<(NodeId, BTreeSet<u32>)>> {
        Ok(self.inner.node(id)?.links.read().downstream.clone())
    }

    /// Human-readable description of one node.
    pub fn describe(&self, id: NodeId) -> AppResult<String> {
        let node = self.inner.node(id)?;
        let mut out = String::new();
        let thread_state = *node.thread_state.lock();
        let _ = write!(out, "{id} {} [{}, {}", node.type_name, node.state(), thread_state);
        if node.is_hub() {
            out.push_str(", hub");
        }
        out.push_str("]\n");
        if let Some(summary) = node.processor.lock().summary() {
            let _ = writeln!(out, "  {summary}");
        }
        let links = node.links.read();
        if !links.upstream.is_empty() {
            let ups: Vec<String> = links.upstream.iter().map(|id| id.to_string()).collect();
            let _ = writeln!(out, "  upstream: {}", ups.join(", "));
        }
        for (target, types) in &links.downstream {
            let _ = writeln!(out, "  downstream: {target} {{{}}}", type_names(types));
        }
        Ok(out)
    }

    /// Drain and join every worker thread. Nodes stay usable synchronously.
    pub fn shutdown(&self) {
        let nodes: Vec<Arc<Node>> = self.inner.nodes.read().clone();
        for node in &nodes {
            self.inner.stop_hub(node);
        }
        for node in &nodes {
            self.inner.stop_consumer(node);
        }
    }
}

impl Drop for ProcessorGraph {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn type_names(types: &BTreeSet<u32>) -> String {
    if types.is_empty() {
        return "*".to_string();
    }
    types
        .iter()
        .map(|tag| event_registry().name_of(*tag).unwrap_or_else(|| format!("0x{tag:08x}")))
        .collect::<Vec<_>>()
        .join(", ")
}
