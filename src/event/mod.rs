//! Event model.
//!
//! An [`Event`] is a typed, taggable record with opaque binary payload blocks and
//! an ordered list of sub-events. Packets (and detector events assembled by a
//! collector) own their children exclusively; the tree has no back-edges.
//! Sub-events are held as `Arc<Event>` because downstream pipeline stages share
//! read-only access to the same record.
//!
//! # Wire layout
//!
//! ```text
//! type_id u32 | version u32 | flags u32 | device_n u32 | run_n u32 | event_n u32
//! trigger_n u32 | ts_begin u64 | ts_end u64 | description string
//! tags map<string,string> | blocks map<u32, bytes> | n_sub u32 | sub events...
//! ```
//!
//! Decoding never trusts the caller to know the concrete layout: it peeks the
//! leading type tag and dispatches through the [`registry`].

pub mod registry;

use crate::codec::{Decode, Deserializer, Encode, Serializer};
use crate::error::{AppResult, DaqError};
use bitflags::bitflags;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use registry::{event_registry, type_id, EventDecoder, EventRegistry};

/// Shared handle to an immutable event.
pub type EventRef = Arc<Event>;

/// Layout version written by this crate.
pub const EVENT_VERSION: u32 = 2;

/// Deepest sub-event nesting a decoder accepts, the outermost event included.
pub const MAX_EVENT_NESTING: u32 = 64;

thread_local! {
    static DECODE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Holds one level of the current thread's event decode depth.
struct NestingGuard;

impl NestingGuard {
    fn enter() -> AppResult<Self> {
        DECODE_DEPTH.with(|depth| {
            if depth.get() >= MAX_EVENT_NESTING {
                return Err(DaqError::Protocol("sub-event nesting too deep".to_string()));
            }
            depth.set(depth.get() + 1);
            Ok(NestingGuard)
        })
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        DECODE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

bitflags! {
    /// Event flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u32 {
        /// Begin-of-run marker.
        const BORE = 0x1;
        /// End-of-run marker.
        const EORE = 0x2;
        /// Carries hit data.
        const HITS = 0x4;
        /// Generated without hardware.
        const FAKE = 0x8;
        /// Simulated data.
        const SIMU = 0x10;
        /// Regular physics event.
        const EVENT = 0x20;
        /// Container of sub-events.
        const PACKET = 0x40;
        /// Known to be corrupt.
        const BROKEN = 0x80;
        /// Carries status information.
        const STATUS = 0x100;
        /// `trigger_n` is meaningful.
        const TRIGGER = 0x10000;
        /// `ts_begin`/`ts_end` are meaningful.
        const TIMESTAMP = 0x20000;
    }
}

/// A typed record with tags, payload blocks and sub-events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    type_id: u32,
    version: u32,
    flags: EventFlags,
    device_n: u32,
    run_n: u32,
    event_n: u32,
    trigger_n: u32,
    ts_begin: u64,
    ts_end: u64,
    description: String,
    tags: BTreeMap<String, String>,
    blocks: BTreeMap<u32, Vec<u8>>,
    sub_events: Vec<EventRef>,
}

impl Event {
    /// Create an event of the named type for `run_n`, coming from `device_n`.
    pub fn new(type_name: &str, run_n: u32, device_n: u32) -> Self {
        Self::with_type_id(type_id(type_name), run_n, device_n).with_description(type_name)
    }

    /// Create an event from a raw type id.
    pub fn with_type_id(type_id: u32, run_n: u32, device_n: u32) -> Self {
        Self {
            type_id,
            version: EVENT_VERSION,
            flags: EventFlags::empty(),
            device_n,
            run_n,
            event_n: 0,
            trigger_n: 0,
            ts_begin: 0,
            ts_end: 0,
            description: String::new(),
            tags: BTreeMap::new(),
            blocks: BTreeMap::new(),
            sub_events: Vec::new(),
        }
    }

    /// Begin-of-run marker.
    pub fn bore(type_name: &str, run_n: u32, device_n: u32) -> Self {
        let mut ev = Self::new(type_name, run_n, device_n);
        ev.flags |= EventFlags::BORE;
        ev
    }

    /// End-of-run marker.
    pub fn eore(type_name: &str, run_n: u32, device_n: u32, event_n: u32) -> Self {
        let mut ev = Self::new(type_name, run_n, device_n);
        ev.flags |= EventFlags::EORE;
        ev.event_n = event_n;
        ev
    }

    /// Builder-style description setter.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Registry tag of the concrete layout.
    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    /// Layout version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Flag bits.
    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// Set the given flag bits.
    pub fn set_flags(&mut self, flags: EventFlags) {
        self.flags |= flags;
    }

    /// Clear the given flag bits.
    pub fn clear_flags(&mut self, flags: EventFlags) {
        self.flags.remove(flags);
    }

    /// Whether this is a begin-of-run marker.
    pub fn is_bore(&self) -> bool {
        self.flags.contains(EventFlags::BORE)
    }

    /// Whether this is an end-of-run marker.
    pub fn is_eore(&self) -> bool {
        self.flags.contains(EventFlags::EORE)
    }

    /// Whether this event is a packet of sub-events.
    pub fn is_packet(&self) -> bool {
        self.flags.contains(EventFlags::PACKET)
    }

    /// Source device (stream) number.
    pub fn device_n(&self) -> u32 {
        self.device_n
    }

    /// Run number.
    pub fn run_n(&self) -> u32 {
        self.run_n
    }

    /// Event number within the run.
    pub fn event_n(&self) -> u32 {
        self.event_n
    }

    /// Set the event number.
    pub fn set_event_n(&mut self, event_n: u32) {
        self.event_n = event_n;
    }

    /// Trigger number, meaningful when [`EventFlags::TRIGGER`] is set.
    pub fn trigger_n(&self) -> u32 {
        self.trigger_n
    }

    /// Set the trigger number and the TRIGGER flag.
    pub fn set_trigger_n(&mut self, trigger_n: u32) {
        self.trigger_n = trigger_n;
        self.flags |= EventFlags::TRIGGER;
    }

    /// Timestamp range, meaningful when [`EventFlags::TIMESTAMP`] is set.
    pub fn timestamps(&self) -> (u64, u64) {
        (self.ts_begin, self.ts_end)
    }

    /// Set the timestamp range and the TIMESTAMP flag.
    pub fn set_timestamps(&mut self, begin: u64, end: u64) {
        self.ts_begin = begin;
        self.ts_end = end;
        self.flags |= EventFlags::TIMESTAMP;
    }

    /// Free-form description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Tag value, or `default` when unset.
    pub fn tag_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.tags.get(name).map_or(default, String::as_str)
    }

    /// Tag value.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// Set a tag.
    pub fn set_tag(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(name.into(), value.into());
    }

    /// All tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Attach (or replace) a payload block.
    pub fn add_block(&mut self, id: u32, data: impl Into<Vec<u8>>) {
        self.blocks.insert(id, data.into());
    }

    /// Payload block by id.
    pub fn block(&self, id: u32) -> Option<&[u8]> {
        self.blocks.get(&id).map(Vec::as_slice)
    }

    /// All payload blocks.
    pub fn blocks(&self) -> &BTreeMap<u32, Vec<u8>> {
        &self.blocks
    }

    /// Append a child event. Events with children are packets.
    pub fn add_sub_event(&mut self, ev: impl Into<EventRef>) {
        self.sub_events.push(ev.into());
        self.flags |= EventFlags::PACKET;
    }

    /// Child events in insertion order.
    pub fn sub_events(&self) -> &[EventRef] {
        &self.sub_events
    }

    /// Wrap in a shared handle.
    pub fn into_ref(self) -> EventRef {
        Arc::new(self)
    }

    /// Decode the fields following the type tag in the standard layout.
    ///
    /// Registered decoders call this after consuming the tag themselves.
    pub fn decode_body(type_id: u32, de: &mut dyn Deserializer) -> AppResult<Self> {
        let version = u32::decode(de)?;
        let flags = EventFlags::from_bits_retain(u32::decode(de)?);
        let device_n = u32::decode(de)?;
        let run_n = u32::decode(de)?;
        let event_n = u32::decode(de)?;
        let trigger_n = u32::decode(de)?;
        let ts_begin = u64::decode(de)?;
        let ts_end = u64::decode(de)?;
        let description = String::decode(de)?;
        let tags = BTreeMap::decode(de)?;
        let blocks = BTreeMap::decode(de)?;
        let n_sub = u32::decode(de)?;
        let mut sub_events = Vec::with_capacity((n_sub as usize).min(1024));
        for _ in 0..n_sub {
            sub_events.push(Arc::new(Event::decode(de)?));
        }
        Ok(Self {
            type_id,
            version,
            flags,
            device_n,
            run_n,
            event_n,
            trigger_n,
            ts_begin,
            ts_end,
            description,
            tags,
            blocks,
            sub_events,
        })
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, offset: usize) -> fmt::Result {
        let pad = " ".repeat(offset);
        writeln!(f, "{pad}<Event>")?;
        writeln!(f, "{pad}  <Type> 0x{:08x} {} </Type>", self.type_id, self.description)?;
        writeln!(f, "{pad}  <Flag> 0x{:08x} </Flag>", self.flags.bits())?;
        writeln!(f, "{pad}  <RunN> {} </RunN>", self.run_n)?;
        writeln!(f, "{pad}  <DeviceN> {} </DeviceN>", self.device_n)?;
        writeln!(f, "{pad}  <EventN> {} </EventN>", self.event_n)?;
        if self.flags.contains(EventFlags::TRIGGER) {
            writeln!(f, "{pad}  <TriggerN> {} </TriggerN>", self.trigger_n)?;
        }
        if self.flags.contains(EventFlags::TIMESTAMP) {
            writeln!(f, "{pad}  <Timestamp> {} -> {} </Timestamp>", self.ts_begin, self.ts_end)?;
        }
        if !self.tags.is_empty() {
            writeln!(f, "{pad}  <Tags>")?;
            for (key, value) in &self.tags {
                writeln!(f, "{pad}    <Tag> {key}={value} </Tag>")?;
            }
            writeln!(f, "{pad}  </Tags>")?;
        }
        for (id, data) in &self.blocks {
            writeln!(f, "{pad}  <Block> {id}: {} bytes </Block>", data.len())?;
        }
        if !self.sub_events.is_empty() {
            writeln!(f, "{pad}  <SubEvents size={}>", self.sub_events.len())?;
            for sub in &self.sub_events {
                sub.fmt_indented(f, offset + 4)?;
            }
            writeln!(f, "{pad}  </SubEvents>")?;
        }
        writeln!(f, "{pad}</Event>")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl Encode for Event {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        self.type_id.encode(ser)?;
        self.version.encode(ser)?;
        self.flags.bits().encode(ser)?;
        self.device_n.encode(ser)?;
        self.run_n.encode(ser)?;
        self.event_n.encode(ser)?;
        self.trigger_n.encode(ser)?;
        self.ts_begin.encode(ser)?;
        self.ts_end.encode(ser)?;
        self.description.encode(ser)?;
        self.tags.encode(ser)?;
        self.blocks.encode(ser)?;
        crate::codec::length_prefix(self.sub_events.len())?.encode(ser)?;
        for sub in &self.sub_events {
            sub.encode(ser)?;
        }
        Ok(())
    }
}

/// Peek the type tag, then decode through the registered constructor.
impl Decode for Event {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        let _depth = NestingGuard::enter()?;
        let tag = de.pre_read_u32()?;
        let decoder = event_registry().decoder(tag)?;
        decoder(de)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BufferSerializer;
    use crate::error::DaqError;

    fn detector_event() -> Event {
        let mut packet = Event::new("BASE", 12, 0).with_description("telescope");
        packet.set_event_n(99);
        packet.set_trigger_n(1234);
        packet.set_timestamps(1_000, 1_025);
        packet.set_tag("spill", "4");

        let mut plane = Event::new("RawEvent", 12, 3);
        plane.add_block(0, vec![0xde, 0xad]);
        plane.add_block(7, Vec::<u8>::new());
        packet.add_sub_event(plane);

        let mut nested = Event::new("TRIGGER", 12, 1);
        nested.add_sub_event(Event::new("SYNC", 12, 2));
        packet.add_sub_event(nested);
        packet
    }

    #[test]
    fn event_tree_roundtrips() {
        let ev = detector_event();
        let mut buf = BufferSerializer::encode_value(&ev).unwrap();
        let back: Event = buf.read().unwrap();
        assert_eq!(back, ev);
        assert!(buf.is_empty());

        assert_eq!(back.trigger_n(), 1234);
        assert_eq!(back.timestamps(), (1_000, 1_025));
        assert_eq!(back.sub_events()[0].block(0), Some(&[0xde, 0xad][..]));
        assert_eq!(back.sub_events()[1].sub_events().len(), 1);
        assert!(back.is_packet());
    }

    #[test]
    fn unknown_type_tag_is_fatal_for_the_read() {
        let mut ev = Event::with_type_id(0x1234_5678, 1, 1);
        ev.set_event_n(1);
        let mut buf = BufferSerializer::encode_value(&ev).unwrap();
        match buf.read::<Event>() {
            Err(DaqError::UnknownEventType(tag)) => assert_eq!(tag, 0x1234_5678),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    /// `levels` events, each the single child of the one before.
    fn nested_chain(levels: usize) -> Vec<u8> {
        let leaf = BufferSerializer::encode_value(&Event::new("RawEvent", 1, 0)).unwrap().remaining().to_vec();
        let header = &leaf[..leaf.len() - 4];
        let mut raw = Vec::with_capacity(leaf.len() * levels);
        for _ in 1..levels {
            raw.extend_from_slice(header);
            raw.extend_from_slice(&1u32.to_le_bytes());
        }
        raw.extend_from_slice(&leaf);
        raw
    }

    #[test]
    fn deep_sub_event_nesting_is_rejected() {
        let raw = nested_chain(200_000);
        match BufferSerializer::decode_value::<Event>(&raw) {
            Err(DaqError::Protocol(msg)) => assert!(msg.contains("nesting")),
            other => panic!("unexpected result: {:?}", other.map(|ev| ev.event_n())),
        }

        let ev = BufferSerializer::decode_value::<Event>(&nested_chain(MAX_EVENT_NESTING as usize)).unwrap();
        assert_eq!(ev.sub_events().len(), 1);
        assert!(BufferSerializer::decode_value::<Event>(&nested_chain(MAX_EVENT_NESTING as usize + 1)).is_err());
    }

    #[test]
    fn run_markers() {
        let bore = Event::bore("RawEvent", 5, 0);
        let eore = Event::eore("RawEvent", 5, 0, 17);
        assert!(bore.is_bore() && !bore.is_eore());
        assert!(eore.is_eore());
        assert_eq!(eore.event_n(), 17);
    }

    #[test]
    fn tag_defaults() {
        let mut ev = Event::new("BASE", 1, 0);
        assert_eq!(ev.tag_or("missing", "none"), "none");
        ev.set_tag("missing", "here");
        assert_eq!(ev.tag("missing"), Some("here"));
    }

    #[test]
    fn display_nests_sub_events() {
        let text = detector_event().to_string();
        assert!(text.contains("<TriggerN> 1234 </TriggerN>"));
        assert!(text.contains("        <Event>"));
        assert!(text.contains("<Tag> spill=4 </Tag>"));
    }
}
