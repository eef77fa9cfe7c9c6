//! # DAQ Run Control Library
//!
//! Core of a distributed data-acquisition control framework: many independent
//! processes (producers reading hardware, data collectors writing run files, log
//! collectors) are coordinated by one run-control orchestrator through a small
//! command/status protocol, and recorded events move through a dataflow graph.
//!
//! ## Crate Structure
//!
//! - **`codec`**: binary encoding of primitives, strings, containers and
//!   polymorphic records, plus the on-disk event file formats (`codec::file`).
//! - **`event`**: the `Event` record (tags, binary blocks, sub-event tree) and the
//!   process-wide type registry used to decode it.
//! - **`status`**: `Severity`, `LifecycleState` and the `Status` a peer reports.
//! - **`connection`**: the connection registry and the aggregate-state rules.
//! - **`config`**: the sectioned `key = value` configuration document shipped to peers.
//! - **`settings`**: process settings loaded with Figment (TOML + environment).
//! - **`logging`**: tracing subscriber setup.
//! - **`transport`**: length-prefixed frames over TCP, admission handshake, `DataSender`.
//! - **`protocol`**: command messages, the command vocabulary and handshake strings.
//! - **`receiver`**: the peer side: `CommandReceiver` and the `CommandHandler` hooks.
//! - **`run_control`**: the orchestrator: `RunControl`.
//! - **`data_collector`**: a peer that writes producer events into run files.
//! - **`processor`**: the dataflow processor graph.
//! - **`error`**: the crate-wide `DaqError`.

pub mod codec;
pub mod config;
pub mod connection;
pub mod data_collector;
pub mod error;
pub mod event;
pub mod logging;
pub mod processor;
pub mod protocol;
pub mod receiver;
pub mod run_control;
pub mod settings;
pub mod status;
pub mod transport;
