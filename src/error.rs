//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`, shared by the codec,
//! the command protocol, the run-control orchestrator and the processor graph.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle everything from a truncated byte stream to a peer that never answered.
//!
//! ## Error Hierarchy
//!
//! `DaqError` groups its variants into four families:
//!
//! - **Protocol errors** (`UnknownEventType`, `ReadUnderrun`, `InvalidUtf8`, `Protocol`):
//!   fatal for the single read in progress. Read loops log them and keep going.
//! - **Transport errors** (`Io`, `Transport`, `ConnectionClosed`, `NotConnected`):
//!   the affected peer is dropped from the connection registry. A transport error
//!   never turns into an ERROR lifecycle state.
//! - **Application errors** (`Handler`, `Processor`, `Configuration`): raised by command
//!   handlers and processors. The command loop converts them into a `Status` with
//!   severity ERROR.
//! - **Timeouts** (`Timeout`): an awaited reply or state transition did not arrive in time.
//!   These are surfaced to the operator as warnings and never retried automatically.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying I/O and
//! settings errors, so the `?` operator works across module boundaries.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the run-control framework.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Standard I/O operation failed (files and sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete value could be decoded.
    ///
    /// Buffer readers raise this immediately; the file reader only raises it once
    /// its retry budget is exhausted.
    #[error("Read underrun: needed {needed} bytes, {available} available")]
    ReadUnderrun {
        /// Bytes the decoder asked for.
        needed: usize,
        /// Bytes that were actually available.
        available: usize,
    },

    /// The leading type tag of a record is not present in the event registry.
    #[error("Unrecognised event type: 0x{0:08x}")]
    UnknownEventType(u32),

    /// A decoded string was not valid UTF-8.
    #[error("Invalid UTF-8 in encoded string")]
    InvalidUtf8,

    /// A frame or handshake did not follow the command protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Semantic problem in a configuration document or setting.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Process settings could not be loaded.
    #[error("Settings error: {0}")]
    Settings(#[from] figment::Error),

    /// Connection-level failure that is not a plain I/O error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote end closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// An operation required a connection that does not exist (yet).
    #[error("Not connected")]
    NotConnected,

    /// An awaited reply or transition did not happen in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A blocking read was interrupted on request.
    #[error("Read interrupted")]
    Interrupted,

    /// Reading a persisted event file failed.
    #[error("File read error: {0}")]
    FileRead(String),

    /// A processor node rejected a command or failed on an event.
    #[error("Processor error: {0}")]
    Processor(String),

    /// A command handler reported failure.
    #[error("Handler error: {0}")]
    Handler(String),
}

impl DaqError {
    /// Whether the error is recovered at the boundary where it occurs.
    ///
    /// Protocol, transport and timeout errors are recoverable: the read loop,
    /// the dispatch loop or the orchestrator logs them and continues. Application
    /// errors are not: they put the reporting peer into the sticky ERROR state.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            DaqError::Handler(_) | DaqError::Processor(_) | DaqError::Configuration(_)
        )
    }

    /// Whether the error means the underlying connection is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            DaqError::ConnectionClosed | DaqError::NotConnected => true,
            DaqError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for DaqError {
    fn from(value: anyhow::Error) -> Self {
        DaqError::Handler(format!("{value:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_errors_are_not_recoverable() {
        assert!(!DaqError::Handler("hv trip".into()).is_recoverable());
        assert!(!DaqError::Processor("bad frame".into()).is_recoverable());
        assert!(DaqError::UnknownEventType(7).is_recoverable());
        assert!(DaqError::Timeout("configure".into()).is_recoverable());
    }

    #[test]
    fn eof_counts_as_disconnect() {
        let io = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(DaqError::Io(io).is_disconnect());
        assert!(DaqError::ConnectionClosed.is_disconnect());
        assert!(!DaqError::Protocol("short frame".into()).is_disconnect());
    }

    #[test]
    fn unknown_type_message_shows_hex_tag() {
        let err = DaqError::UnknownEventType(0xdead_beef);
        assert_eq!(err.to_string(), "Unrecognised event type: 0xdeadbeef");
    }

    #[test]
    fn anyhow_context_is_preserved() {
        let err: DaqError = anyhow::anyhow!("bias supply").context("configure").into();
        match err {
            DaqError::Handler(msg) => {
                assert!(msg.contains("configure"));
                assert!(msg.contains("bias supply"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
