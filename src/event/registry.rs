//! Process-wide event type registry.
//!
//! Maps the 32-bit type tag at the head of every encoded event to the function
//! that knows how to decode that layout. The registry is seeded with the built-in
//! types on first use; plugins add their own through [`EventRegistry::register`]
//! before any stream carrying them is read.

use super::Event;
use crate::codec::{Decode, Deserializer};
use crate::error::{AppResult, DaqError};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Decodes one event, starting at its (not yet consumed) type tag.
pub type EventDecoder = fn(&mut dyn Deserializer) -> AppResult<Event>;

/// Built-in type names, all using the standard layout.
pub const BUILTIN_TYPES: [&str; 5] = ["BASE", "TRIGGER", "DUMMYDEV", "SYNC", "RawEvent"];

/// Hash a type name into its 32-bit tag.
///
/// Starts at 5381 and folds the bytes in from the last to the first with
/// `h = h * 33 ^ byte` (wrapping). Stable across processes and releases.
pub const fn type_id(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut h: u32 = 5381;
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        h = h.wrapping_mul(33) ^ bytes[i] as u32;
    }
    h
}

fn decode_standard(de: &mut dyn Deserializer) -> AppResult<Event> {
    let tag = u32::decode(de)?;
    Event::decode_body(tag, de)
}

struct Entry {
    name: String,
    decoder: EventDecoder,
}

/// Tag to decoder table.
pub struct EventRegistry {
    entries: RwLock<HashMap<u32, Entry>>,
}

impl EventRegistry {
    fn with_builtins() -> Self {
        let entries = BUILTIN_TYPES
            .iter()
            .map(|name| {
                (
                    type_id(name),
                    Entry {
                        name: (*name).to_string(),
                        decoder: decode_standard as EventDecoder,
                    },
                )
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Register `name` with a custom decoder.
    ///
    /// Re-registering a name replaces its decoder. Two different names that hash
    /// to the same tag are rejected.
    pub fn register(&self, name: &str, decoder: EventDecoder) -> AppResult<u32> {
        let tag = type_id(name);
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&tag) {
            if existing.name != name {
                return Err(DaqError::Configuration(format!(
                    "event type '{name}' collides with '{}' on tag 0x{tag:08x}",
                    existing.name
                )));
            }
        }
        entries.insert(
            tag,
            Entry {
                name: name.to_string(),
                decoder,
            },
        );
        tracing::debug!(name, tag = %format!("0x{tag:08x}"), "registered event type");
        Ok(tag)
    }

    /// Register `name` using the standard event layout.
    pub fn register_standard(&self, name: &str) -> AppResult<u32> {
        self.register(name, decode_standard)
    }

    /// Decoder for `tag`.
    pub fn decoder(&self, tag: u32) -> AppResult<EventDecoder> {
        self.entries
            .read()
            .get(&tag)
            .map(|entry| entry.decoder)
            .ok_or(DaqError::UnknownEventType(tag))
    }

    /// Registered name for `tag`.
    pub fn name_of(&self, tag: u32) -> Option<String> {
        self.entries.read().get(&tag).map(|entry| entry.name.clone())
    }

    /// Whether `tag` is known.
    pub fn contains(&self, tag: u32) -> bool {
        self.entries.read().contains_key(&tag)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().values().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }
}

static REGISTRY: Lazy<EventRegistry> = Lazy::new(EventRegistry::with_builtins);

/// The shared registry.
pub fn event_registry() -> &'static EventRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BufferSerializer;

    #[test]
    fn hash_folds_from_the_last_byte() {
        assert_eq!(type_id(""), 5381);
        assert_eq!(type_id("A"), 5381u32.wrapping_mul(33) ^ 0x41);
        let ab = (5381u32.wrapping_mul(33) ^ 0x42).wrapping_mul(33) ^ 0x41;
        assert_eq!(type_id("AB"), ab);
        assert_ne!(type_id("AB"), type_id("BA"));
    }

    #[test]
    fn builtins_are_known() {
        for name in BUILTIN_TYPES {
            assert!(event_registry().contains(type_id(name)), "{name}");
        }
        assert_eq!(event_registry().name_of(type_id("SYNC")).as_deref(), Some("SYNC"));
    }

    fn decode_as_fake(de: &mut dyn Deserializer) -> AppResult<Event> {
        let tag = u32::decode(de)?;
        let mut ev = Event::decode_body(tag, de)?;
        ev.set_flags(crate::event::EventFlags::FAKE);
        Ok(ev)
    }

    #[test]
    fn custom_decoders_are_dispatched_by_tag() {
        let tag = event_registry().register("TestPlaneEvent", decode_as_fake).unwrap();
        assert_eq!(tag, type_id("TestPlaneEvent"));

        let ev = Event::new("TestPlaneEvent", 1, 4);
        let back: Event = BufferSerializer::decode_value(&BufferSerializer::encode_value(&ev).unwrap().into_bytes())
            .unwrap();
        assert!(back.flags().contains(crate::event::EventFlags::FAKE));
        assert_eq!(back.device_n(), 4);
    }
}
