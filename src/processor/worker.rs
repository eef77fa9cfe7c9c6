//! Background worker threads of the processor graph.
//!
//! A worker owns one unbounded FIFO and one OS thread that drains it in arrival
//! order. Stopping queues a stop marker behind the backlog, so everything
//! already queued is processed before the thread exits.

use super::node::NodeId;
use crate::error::AppResult;
use crate::event::EventRef;
use crossbeam_channel::{unbounded, Sender};
use std::thread::JoinHandle;
use tracing::{debug, error};

pub(crate) enum WorkerMsg {
    Event { origin: Option<NodeId>, event: EventRef },
    Stop,
}

pub(crate) struct Worker {
    name: String,
    tx: Sender<WorkerMsg>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Start a worker calling `handle` for every queued event.
    ///
    /// `handle` returns `false` to end the thread early.
    pub(crate) fn spawn<F>(name: String, mut handle: F) -> AppResult<Self>
    where
        F: FnMut(Option<NodeId>, EventRef) -> bool + Send + 'static,
    {
        let (tx, rx) = unbounded::<WorkerMsg>();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(worker = %thread_name, "worker started");
            while let Ok(msg) = rx.recv() {
                match msg {
                    WorkerMsg::Event { origin, event } => {
                        if !handle(origin, event) {
                            break;
                        }
                    }
                    WorkerMsg::Stop => break,
                }
            }
            debug!(worker = %thread_name, "worker finished");
        })?;
        Ok(Self { name, tx, handle })
    }

    /// Queue an event. Hands it back if the thread has already gone.
    pub(crate) fn push(&self, origin: Option<NodeId>, event: EventRef) -> Result<(), EventRef> {
        match self.tx.send(WorkerMsg::Event { origin, event }) {
            Ok(()) => Ok(()),
            Err(err) => match err.into_inner() {
                WorkerMsg::Event { event, .. } => Err(event),
                WorkerMsg::Stop => Ok(()),
            },
        }
    }

    /// Events waiting in the queue.
    pub(crate) fn queue_len(&self) -> usize {
        self.tx.len()
    }

    /// Drain the backlog, then join the thread.
    pub(crate) fn stop(self) {
        let _ = self.tx.send(WorkerMsg::Stop);
        if self.handle.join().is_err() {
            error!(worker = %self.name, "worker thread panicked");
        }
    }
}
