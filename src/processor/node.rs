//! Node-level types of the processor graph.

use super::worker::Worker;
use crate::config::Configuration;
use crate::error::{AppResult, DaqError};
use crate::event::EventRef;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::AtomicU64;

/// Stable handle of a node inside one [`ProcessorGraph`](super::ProcessorGraph).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Arena index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Configuration readiness of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorState {
    /// Added but not configured.
    #[default]
    Unconf,
    /// Configured and accepting events.
    Ready,
    /// Processing or configuration failed; configure again to recover.
    Error,
}

impl ProcessorState {
    /// Upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            ProcessorState::Unconf => "UNCONF",
            ProcessorState::Ready => "READY",
            ProcessorState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Momentary state of a node's background worker, independent of [`ProcessorState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadState {
    /// No worker thread.
    #[default]
    Unconf,
    /// Worker idle, waiting on its queue.
    Ready,
    /// Worker inside `process_event`.
    Busy,
    /// Worker saw a processing failure. Cleared when the worker is stopped.
    Error,
}

impl ThreadState {
    /// Upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            ThreadState::Unconf => "THREAD_UNCONF",
            ThreadState::Ready => "THREAD_READY",
            ThreadState::Busy => "THREAD_BUSY",
            ThreadState::Error => "THREAD_ERROR",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handed to [`Processor::process_event`] to emit events downstream.
///
/// Emitted events are forwarded after the processor returns, along every
/// downstream edge whose accepted type set admits them.
pub struct ProcessorContext<'a> {
    node: NodeId,
    origin: Option<NodeId>,
    outgoing: &'a mut Vec<EventRef>,
}

impl<'a> ProcessorContext<'a> {
    pub(crate) fn new(node: NodeId, origin: Option<NodeId>, outgoing: &'a mut Vec<EventRef>) -> Self {
        Self { node, origin, outgoing }
    }

    /// Node being run.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Upstream node the event came from, `None` when injected from outside the graph.
    pub fn origin(&self) -> Option<NodeId> {
        self.origin
    }

    /// Queue `event` for downstream delivery.
    pub fn forward(&mut self, event: EventRef) {
        self.outgoing.push(event);
    }
}

/// User logic of one node.
///
/// `process_event` runs on the caller's thread in synchronous mode and on the
/// node's worker thread in asynchronous or hub mode; it never runs twice at the
/// same time for one node. Commands always arrive on the caller's thread.
pub trait Processor: Send + 'static {
    /// Type name, as registered with the processor factory.
    fn type_name(&self) -> &str;

    /// Apply a configuration. Success makes the node READY.
    fn configure(&mut self, _conf: &Configuration) -> AppResult<()> {
        Ok(())
    }

    /// Handle one event. The default forwards it unchanged.
    fn process_event(&mut self, event: &EventRef, ctx: &mut ProcessorContext<'_>) -> AppResult<()> {
        ctx.forward(event.clone());
        Ok(())
    }

    /// Handle a non-system command.
    fn process_command(&mut self, command: &str, _arg: &str) -> AppResult<()> {
        Err(DaqError::Processor(format!(
            "{} does not understand '{command}'",
            self.type_name()
        )))
    }

    /// Extra line for [`ProcessorGraph::describe`](super::ProcessorGraph::describe).
    fn summary(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Default)]
pub(crate) struct Links {
    pub(crate) upstream: Vec<NodeId>,
    pub(crate) downstream: Vec<(NodeId, BTreeSet<u32>)>,
    pub(crate) default_types: BTreeSet<u32>,
    pub(crate) hub_forced: bool,
}

impl Links {
    /// Targets accepting an event of `type_id`, in registration order.
    pub(crate) fn targets_for(&self, type_id: u32) -> Vec<NodeId> {
        self.downstream
            .iter()
            .filter(|(_, types)| types.is_empty() || types.contains(&type_id))
            .map(|(target, _)| *target)
            .collect()
    }
}

pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) type_name: String,
    pub(crate) processor: Mutex<Box<dyn Processor>>,
    pub(crate) state: Mutex<ProcessorState>,
    pub(crate) thread_state: Mutex<ThreadState>,
    pub(crate) links: RwLock<Links>,
    pub(crate) pending_commands: Mutex<Vec<(String, String)>>,
    pub(crate) consumer: Mutex<Option<Worker>>,
    pub(crate) hub: Mutex<Option<Worker>>,
    pub(crate) processed: AtomicU64,
}

impl Node {
    pub(crate) fn new(id: NodeId, processor: Box<dyn Processor>) -> Self {
        Self {
            id,
            type_name: processor.type_name().to_string(),
            processor: Mutex::new(processor),
            state: Mutex::new(ProcessorState::Unconf),
            thread_state: Mutex::new(ThreadState::Unconf),
            links: RwLock::new(Links::default()),
            pending_commands: Mutex::new(Vec::new()),
            consumer: Mutex::new(None),
            hub: Mutex::new(None),
            processed: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ProcessorState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ProcessorState) {
        *self.state.lock() = state;
    }

    pub(crate) fn set_thread_state(&self, state: ThreadState) {
        let mut current = self.thread_state.lock();
        // ERROR sticks until the worker is stopped.
        if *current != ThreadState::Error || state == ThreadState::Unconf {
            *current = state;
        }
    }

    pub(crate) fn has_worker(&self) -> bool {
        self.consumer.lock().is_some() || self.hub.lock().is_some()
    }

    pub(crate) fn is_hub(&self) -> bool {
        self.hub.lock().is_some()
    }

    pub(crate) fn queue_len(&self) -> usize {
        let consumer = self.consumer.lock().as_ref().map_or(0, Worker::queue_len);
        let hub = self.hub.lock().as_ref().map_or(0, Worker::queue_len);
        consumer + hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_type_set_accepts_everything() {
        let mut links = Links::default();
        links.downstream.push((NodeId(1), BTreeSet::from([7])));
        links.downstream.push((NodeId(2), BTreeSet::new()));
        assert_eq!(links.targets_for(7), vec![NodeId(1), NodeId(2)]);
        assert_eq!(links.targets_for(8), vec![NodeId(2)]);
    }

    #[test]
    fn state_names() {
        assert_eq!(ProcessorState::default().to_string(), "UNCONF");
        assert_eq!(ThreadState::Busy.to_string(), "THREAD_BUSY");
        assert_eq!(NodeId(3).to_string(), "#3");
    }
}
