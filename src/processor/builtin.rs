//! Processor factory and the stock processors.

use super::node::{Processor, ProcessorContext};
use crate::codec::file::{FileVersion, FileWriter};
use crate::codec::Serializer;
use crate::config::Configuration;
use crate::error::{AppResult, DaqError};
use crate::event::EventRef;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Builds a fresh processor.
pub type ProcessorConstructor = fn() -> Box<dyn Processor>;

/// Type name to constructor table.
pub struct ProcessorFactory {
    entries: RwLock<HashMap<String, ProcessorConstructor>>,
}

impl ProcessorFactory {
    fn with_builtins() -> Self {
        let mut entries: HashMap<String, ProcessorConstructor> = HashMap::new();
        entries.insert(Forward::TYPE.to_string(), || -> Box<dyn Processor> { Box::new(Forward) });
        entries.insert(EventCounter::TYPE.to_string(), || -> Box<dyn Processor> { Box::new(EventCounter::new()) });
        entries.insert(ExportEvent::TYPE.to_string(), || -> Box<dyn Processor> { Box::new(ExportEvent::new()) });
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Register (or replace) a constructor.
    pub fn register(&self, type_name: &str, constructor: ProcessorConstructor) {
        self.entries.write().insert(type_name.to_string(), constructor);
        tracing::debug!(type_name, "registered processor type");
    }

    /// Build a processor of `type_name`.
    pub fn create(&self, type_name: &str) -> AppResult<Box<dyn Processor>> {
        let constructor = self
            .entries
            .read()
            .get(type_name)
            .copied()
            .ok_or_else(|| DaqError::Processor(format!("unknown processor type '{type_name}'")))?;
        Ok(constructor())
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

static FACTORY: Lazy<ProcessorFactory> = Lazy::new(ProcessorFactory::with_builtins);

/// The shared processor factory.
pub fn processor_factory() -> &'static ProcessorFactory {
    &FACTORY
}

/// Passes every event through unchanged.
#[derive(Debug, Default)]
pub struct Forward;

impl Forward {
    /// Factory name.
    pub const TYPE: &'static str = "Forward";
}

impl Processor for Forward {
    fn type_name(&self) -> &str {
        Self::TYPE
    }
}

/// Per-type event counts, shared between an [`EventCounter`] and its observers.
#[derive(Debug, Clone, Default)]
pub struct EventCounts(Arc<Mutex<BTreeMap<u32, u64>>>);

impl EventCounts {
    /// Events of every type.
    pub fn total(&self) -> u64 {
        self.0.lock().values().sum()
    }

    /// Events of type `type_id`.
    pub fn of_type(&self, type_id: u32) -> u64 {
        self.0.lock().get(&type_id).copied().unwrap_or(0)
    }

    /// Snapshot of all counts.
    pub fn snapshot(&self) -> BTreeMap<u32, u64> {
        self.0.lock().clone()
    }

    fn record(&self, type_id: u32) {
        *self.0.lock().entry(type_id).or_insert(0) += 1;
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Counts events per type and forwards them. `RESET` clears the counts.
#[derive(Debug, Default)]
pub struct EventCounter {
    counts: EventCounts,
}

impl EventCounter {
    /// Factory name.
    pub const TYPE: &'static str = "EventCounter";

    /// Counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle onto the live counts.
    pub fn counts(&self) -> EventCounts {
        self.counts.clone()
    }
}

impl Processor for EventCounter {
    fn type_name(&self) -> &str {
        Self::TYPE
    }

    fn process_event(&mut self, event: &EventRef, ctx: &mut ProcessorContext<'_>) -> AppResult<()> {
        self.counts.record(event.type_id());
        ctx.forward(event.clone());
        Ok(())
    }

    fn process_command(&mut self, command: &str, _arg: &str) -> AppResult<()> {
        match command {
            "RESET" => {
                self.counts.clear();
                Ok(())
            }
            other => Err(DaqError::Processor(format!("EventCounter does not understand '{other}'"))),
        }
    }

    fn summary(&self) -> Option<String> {
        Some(format!("events={}", self.counts.total()))
    }
}

/// Writes every event to a file and forwards it.
///
/// Configuration keys: `File` (required), `Version` (`1` or `2`, default `2`).
/// `FLUSH` pushes buffered bytes to disk.
#[derive(Default)]
pub struct ExportEvent {
    writer: Option<FileWriter>,
}

impl ExportEvent {
    /// Factory name.
    pub const TYPE: &'static str = "ExportEvent";

    /// Exporter without an open file.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Processor for ExportEvent {
    fn type_name(&self) -> &str {
        Self::TYPE
    }

    fn configure(&mut self, conf: &Configuration) -> AppResult<()> {
        let path = conf.get_str("File", "");
        if path.is_empty() {
            return Err(DaqError::Configuration("ExportEvent needs a File".into()));
        }
        let version = match conf.get_uint("Version", 2) {
            1 => FileVersion::V1,
            2 => FileVersion::V2,
            other => return Err(DaqError::Configuration(format!("unsupported file version {other}"))),
        };
        self.writer = Some(FileWriter::create(&path, version)?);
        Ok(())
    }

    fn process_event(&mut self, event: &EventRef, ctx: &mut ProcessorContext<'_>) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Processor("ExportEvent has no open file".into()))?;
        writer.write_event(event)?;
        ctx.forward(event.clone());
        Ok(())
    }

    fn process_command(&mut self, command: &str, _arg: &str) -> AppResult<()> {
        match (command, self.writer.as_mut()) {
            ("FLUSH", Some(writer)) => writer.flush(),
            ("FLUSH", None) => Ok(()),
            (other, _) => Err(DaqError::Processor(format!("ExportEvent does not understand '{other}'"))),
        }
    }

    fn summary(&self) -> Option<String> {
        self.writer.as_ref().map(|w| {
            format!(
                "file={} events={} bytes={}",
                w.path().display(),
                w.events_written(),
                w.bytes_written()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let names = processor_factory().names();
        for name in [Forward::TYPE, EventCounter::TYPE, ExportEvent::TYPE] {
            assert!(names.iter().any(|n| n == name), "{name}");
        }
        assert_eq!(processor_factory().create("Forward").unwrap().type_name(), "Forward");
        assert!(processor_factory().create("Histogrammer").is_err());
    }

    #[test]
    fn export_requires_a_file() {
        let mut export = ExportEvent::new();
        assert!(matches!(
            export.configure(&Configuration::new()),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn counter_reset_clears() {
        let mut counter = EventCounter::new();
        let counts = counter.counts();
        counts.record(1);
        counts.record(1);
        assert_eq!(counts.of_type(1), 2);
        counter.process_command("RESET", "").unwrap();
        assert_eq!(counts.total(), 0);
        assert!(counter.process_command("ZERO", "").is_err());
    }
}
