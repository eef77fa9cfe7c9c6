//! Processor graph delivery: type filtering, asynchronous consumers, hubs and export.

use crossbeam_channel::{bounded, Receiver};
use daq_runcontrol::codec::file::{FileReader, FileVersion};
use daq_runcontrol::config::Configuration;
use daq_runcontrol::error::AppResult;
use daq_runcontrol::event::{type_id, Event, EventRef};
use daq_runcontrol::processor::{
    EventCounter, Forward, NodeId, Processor, ProcessorContext, ProcessorGraph, ProcessorState, ThreadState,
};
use parking_lot::Mutex;
use std::sync::Arc;

type Seen = Arc<Mutex<Vec<(Option<NodeId>, u32)>>>;

struct Recorder {
    seen: Seen,
}

impl Processor for Recorder {
    fn type_name(&self) -> &str {
        "Recorder"
    }

    fn process_event(&mut self, event: &EventRef, ctx: &mut ProcessorContext<'_>) -> AppResult<()> {
        self.seen.lock().push((ctx.origin(), event.event_n()));
        Ok(())
    }
}

fn recorder() -> (Box<dyn Processor>, Seen) {
    let seen = Seen::default();
    (Box::new(Recorder { seen: seen.clone() }), seen)
}

/// Blocks on the first event until released.
struct Gate {
    release: Option<Receiver<()>>,
}

impl Processor for Gate {
    fn type_name(&self) -> &str {
        "Gate"
    }

    fn process_event(&mut self, event: &EventRef, ctx: &mut ProcessorContext<'_>) -> AppResult<()> {
        if let Some(release) = self.release.take() {
            let _ = release.recv();
        }
        ctx.forward(event.clone());
        Ok(())
    }
}

fn numbered(type_name: &str, n: u32) -> EventRef {
    let mut ev = Event::new(type_name, 1, 0);
    ev.set_event_n(n);
    ev.into_ref()
}

#[test]
fn test_edges_filter_by_event_type() {
    let graph = ProcessorGraph::new();
    let source = graph.add_node(Box::new(Forward));
    let (raw_sink, raw_seen) = recorder();
    let raw_sink = graph.add_node(raw_sink);
    let (sync_sink, sync_seen) = recorder();
    let sync_sink = graph.add_node(sync_sink);
    let counter = EventCounter::new();
    let counts = counter.counts();
    let counter = graph.add_node(Box::new(counter));

    graph.connect_types(source, raw_sink, &["RawEvent"]).unwrap();
    graph.connect_types(source, sync_sink, &["SYNC"]).unwrap();
    graph.connect(source, counter, &[]).unwrap();
    graph.configure_all(&Configuration::new()).unwrap();

    for n in 1..=4 {
        graph.process(source, numbered("RawEvent", n)).unwrap();
    }
    graph.process(source, numbered("SYNC", 10)).unwrap();
    graph.process(source, numbered("TRIGGER", 20)).unwrap();

    let raw: Vec<u32> = raw_seen.lock().iter().map(|(_, n)| *n).collect();
    assert_eq!(raw, vec![1, 2, 3, 4]);
    assert_eq!(*sync_seen.lock(), vec![(Some(source), 10)]);
    assert_eq!(counts.total(), 6);
    assert_eq!(counts.of_type(type_id("RawEvent")), 4);
    assert_eq!(graph.processed(source).unwrap(), 6);
}

#[test]
fn test_async_consumer_queues_without_dropping() {
    let graph = ProcessorGraph::new();
    let (release_tx, release_rx) = bounded(1);
    let gate = graph.add_node(Box::new(Gate {
        release: Some(release_rx),
    }));
    let (sink, seen) = recorder();
    let sink = graph.add_node(sink);
    graph.connect(gate, sink, &[]).unwrap();
    graph.configure_all(&Configuration::new()).unwrap();
    graph.command(gate, "SYS:CS:RUN").unwrap();
    assert_eq!(graph.thread_state(gate).unwrap(), ThreadState::Ready);

    for n in 0..10_000 {
        graph.process(gate, numbered("RawEvent", n)).unwrap();
    }
    assert!(graph.queue_len(gate).unwrap() >= 9_999);

    release_tx.send(()).unwrap();
    graph.command(gate, "SYS:CS:STOP").unwrap();
    assert_eq!(graph.queue_len(gate).unwrap(), 0);
    assert_eq!(graph.thread_state(gate).unwrap(), ThreadState::Unconf);

    let seen = seen.lock();
    assert_eq!(seen.len(), 10_000);
    assert!(seen.iter().enumerate().all(|(i, (_, n))| *n == i as u32));
}

#[test]
fn test_hub_keeps_arrival_order_across_upstreams() {
    let graph = ProcessorGraph::new();
    let a = graph.add_node(Box::new(Forward));
    let b = graph.add_node(Box::new(Forward));
    let (merge, seen) = recorder();
    let merge = graph.add_node(merge);
    graph.connect(a, merge, &[]).unwrap();
    graph.connect(b, merge, &[]).unwrap();
    assert!(graph.is_hub(merge).unwrap());
    graph.configure_all(&Configuration::new()).unwrap();

    for n in 0..50 {
        let from = if n % 2 == 0 { a } else { b };
        graph.process(from, numbered("RawEvent", n)).unwrap();
    }
    graph.shutdown();

    let seen = seen.lock();
    assert_eq!(seen.len(), 50);
    for (i, (origin, n)) in seen.iter().enumerate() {
        assert_eq!(*n, i as u32);
        assert_eq!(*origin, Some(if i % 2 == 0 { a } else { b }));
    }
}

#[test]
fn test_forced_hub_on_a_single_upstream() {
    let graph = ProcessorGraph::new();
    let source = graph.add_node(Box::new(Forward));
    let (sink, seen) = recorder();
    let sink = graph.add_node(sink);
    graph.command(sink, "SYS:HB:FORCE").unwrap();
    graph.connect(source, sink, &[]).unwrap();
    assert!(graph.is_hub(sink).unwrap());
    graph.configure_all(&Configuration::new()).unwrap();

    graph.process(source, numbered("RawEvent", 1)).unwrap();
    graph.shutdown();
    assert_eq!(*seen.lock(), vec![(Some(source), 1)]);
}

#[test]
fn test_events_to_a_failed_node_are_dropped() {
    let graph = ProcessorGraph::new();
    let source = graph.add_node(Box::new(Forward));
    let export = graph.create("ExportEvent", &[]).unwrap();
    let (sink, seen) = recorder();
    let sink = graph.add_node(sink);
    graph.connect(source, export, &[]).unwrap();
    graph.connect(export, sink, &[]).unwrap();

    graph.configure(source, &Configuration::new()).unwrap();
    graph.configure(sink, &Configuration::new()).unwrap();
    assert!(graph.configure(export, &Configuration::new()).is_err());
    assert_eq!(graph.state(export).unwrap(), ProcessorState::Error);

    graph.process(source, numbered("RawEvent", 1)).unwrap();
    assert!(seen.lock().is_empty());
}

#[test]
fn test_export_writes_a_readable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.raw");

    let graph = ProcessorGraph::new();
    let source = graph.add_node(Box::new(Forward));
    let export = graph.create("ExportEvent", &[]).unwrap();
    graph.connect(source, export, &[]).unwrap();

    let mut conf = Configuration::new();
    conf.set("File", path.display());
    conf.set("Version", 1);
    graph.configure_all(&conf).unwrap();

    graph.process(source, Event::bore("RawEvent", 4, 0).into_ref()).unwrap();
    for n in 1..=3 {
        graph.process(source, numbered("RawEvent", n)).unwrap();
    }
    graph.command(export, "FLUSH").unwrap();
    assert!(graph.describe(export).unwrap().contains("events=4"));

    let mut reader = FileReader::open(&path, FileVersion::V1).unwrap();
    let events: Vec<Event> = std::iter::from_fn(|| reader.read_event(0).unwrap()).collect();
    assert_eq!(events.len(), 4);
    assert!(events[0].is_bore());
    assert_eq!(events[3].event_n(), 3);
}
