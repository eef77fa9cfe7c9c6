//! Command/status protocol messages.
//!
//! The controller sends [`CommandMessage`] frames; a peer answers with
//! [`Status`](crate::status::Status) frames. Both directions share the framing in
//! [`transport`](crate::transport).
//!
//! ## Admission handshake
//!
//! ```text
//! server -> client  "OK EUDAQ CMD RunControl"   (or "ERROR ..." when refusing)
//! client -> server  Identification { peer_type, name }
//! server -> client  "OK"
//! ```
//!
//! Data connections use the same exchange with a `DATA` greeting.

use crate::codec::{Decode, Deserializer, Encode, Serializer};
use crate::connection::ConnectionInfo;
use crate::error::AppResult;
use std::fmt;

/// Greeting sent by the orchestrator to a new control connection.
pub const CONTROL_GREETING: &str = "OK EUDAQ CMD RunControl";
/// Greeting sent by a data collector to a new data connection.
pub const DATA_GREETING: &str = "OK EUDAQ DATA DataCollector";
/// Positive confirmation.
pub const CONFIRM: &str = "OK";

/// Status tag carrying a server address reported in answer to SERVER.
pub const TAG_SERVER: &str = "_SERVER";
/// Status tag naming the command a status acknowledges.
pub const TAG_COMMAND: &str = "_CMD";
/// Status tag echoing the request sequence number of the acknowledged command.
pub const TAG_SEQUENCE: &str = "_SEQ";
/// Status tag carrying the run number a peer last took part in.
pub const TAG_RUN: &str = "RUN";
/// Status tag with the number of events seen in the current run.
pub const TAG_EVENT: &str = "EVENT";
/// Status tag with the bytes written in the current run.
pub const TAG_FILEBYTES: &str = "FILEBYTES";

/// Whether a handshake string is positive.
pub fn is_ok(reply: &str) -> bool {
    reply == CONFIRM || reply.starts_with("OK ")
}

/// Refusal text for a control connection.
pub fn refusal(reason: &str) -> String {
    format!("ERROR EUDAQ CMD RunControl {reason}")
}

/// One command on the wire: `(command, parameter)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandMessage {
    /// Command word.
    pub command: String,
    /// Parameter text, may be empty.
    pub param: String,
    /// Request sequence number echoed in the acknowledgement; 0 when no reply is awaited.
    pub seq: u32,
}

impl CommandMessage {
    /// Build a message.
    pub fn new(command: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            param: param.into(),
            seq: 0,
        }
    }

    /// Tag the message with a request sequence number.
    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.param.is_empty() {
            f.write_str(&self.command)
        } else if self.param.len() > 40 || self.param.contains('\n') {
            write!(f, "{} ({} bytes)", self.command, self.param.len())
        } else {
            write!(f, "{} {}", self.command, self.param)
        }
    }
}

impl Encode for CommandMessage {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        self.command.encode(ser)?;
        self.param.encode(ser)?;
        if self.seq != 0 {
            self.seq.encode(ser)?;
        }
        Ok(())
    }
}

impl Decode for CommandMessage {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        let command = String::decode(de)?;
        let param = String::decode(de)?;
        // Frames without a sequence number are plain commands.
        let seq = if de.has_data()? { u32::decode(de)? } else { 0 };
        Ok(Self { command, param, seq })
    }
}

/// Decoded command vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Initialise with a configuration document.
    Init(String),
    /// Configure with a configuration document.
    Config(String),
    /// Get ready for the given run (data collectors).
    Prepare(u32),
    /// Start the given run.
    Start(u32),
    /// Stop the current run.
    Stop,
    /// Return to the initial state.
    Reset,
    /// Shut down.
    Terminate,
    /// Report status.
    Status,
    /// Log collector address.
    Log(String),
    /// Data collector address.
    Data(String),
    /// Report own server address.
    Server,
    /// Drop buffered state before a transition.
    Clear,
    /// Anything else, including malformed known commands.
    Unrecognised {
        /// Command word as received.
        command: String,
        /// Parameter as received.
        param: String,
    },
}

impl Command {
    /// Interpret a wire message.
    pub fn parse(msg: &CommandMessage) -> Self {
        let param = msg.param.clone();
        let run = || msg.param.trim().parse::<u32>().ok();
        match msg.command.as_str() {
            "INIT" => Command::Init(param),
            "CONFIG" => Command::Config(param),
            "PREPARE" => run().map_or_else(|| Self::unrecognised(msg), Command::Prepare),
            "START" => run().map_or_else(|| Self::unrecognised(msg), Command::Start),
            "STOP" => Command::Stop,
            "RESET" => Command::Reset,
            "TERMINATE" => Command::Terminate,
            "STATUS" => Command::Status,
            "LOG" => Command::Log(param),
            "DATA" => Command::Data(param),
            "SERVER" => Command::Server,
            "CLEAR" => Command::Clear,
            _ => Self::unrecognised(msg),
        }
    }

    fn unrecognised(msg: &CommandMessage) -> Self {
        Command::Unrecognised {
            command: msg.command.clone(),
            param: msg.param.clone(),
        }
    }

    /// Command word.
    pub fn name(&self) -> &str {
        match self {
            Command::Init(_) => "INIT",
            Command::Config(_) => "CONFIG",
            Command::Prepare(_) => "PREPARE",
            Command::Start(_) => "START",
            Command::Stop => "STOP",
            Command::Reset => "RESET",
            Command::Terminate => "TERMINATE",
            Command::Status => "STATUS",
            Command::Log(_) => "LOG",
            Command::Data(_) => "DATA",
            Command::Server => "SERVER",
            Command::Clear => "CLEAR",
            Command::Unrecognised { command, .. } => command,
        }
    }

    /// Wire form.
    pub fn to_message(&self) -> CommandMessage {
        let param = match self {
            Command::Init(p) | Command::Config(p) | Command::Log(p) | Command::Data(p) => p.clone(),
            Command::Prepare(run) | Command::Start(run) => run.to_string(),
            Command::Unrecognised { param, .. } => param.clone(),
            _ => String::new(),
        };
        CommandMessage::new(self.name(), param)
    }
}

impl From<&CommandMessage> for Command {
    fn from(msg: &CommandMessage) -> Self {
        Command::parse(msg)
    }
}

/// Identity sent by a connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    /// Peer role.
    pub peer_type: String,
    /// Instance name.
    pub name: String,
}

impl From<&ConnectionInfo> for Identification {
    fn from(info: &ConnectionInfo) -> Self {
        Self {
            peer_type: info.peer_type.clone(),
            name: info.name.clone(),
        }
    }
}

impl Identification {
    /// Registry identity for this client.
    pub fn into_info(self) -> ConnectionInfo {
        ConnectionInfo::new(self.peer_type, self.name)
    }
}

impl Encode for Identification {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        self.peer_type.encode(ser)?;
        self.name.encode(ser)
    }
}

impl Decode for Identification {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        Ok(Self {
            peer_type: String::decode(de)?,
            name: String::decode(de)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BufferSerializer;

    #[test]
    fn vocabulary_parses() {
        let cases = [
            (CommandMessage::new("START", "7"), Command::Start(7)),
            (CommandMessage::new("PREPARE", " 12 "), Command::Prepare(12)),
            (CommandMessage::new("STOP", ""), Command::Stop),
            (CommandMessage::new("DATA", "tcp://10.0.0.2:44001"), Command::Data("tcp://10.0.0.2:44001".into())),
            (CommandMessage::new("CLEAR", ""), Command::Clear),
        ];
        for (msg, expected) in cases {
            assert_eq!(Command::parse(&msg), expected);
            assert_eq!(expected.to_message().command, msg.command);
        }
    }

    #[test]
    fn malformed_start_is_unrecognised() {
        let cmd = Command::parse(&CommandMessage::new("START", "seven"));
        assert_eq!(
            cmd,
            Command::Unrecognised {
                command: "START".into(),
                param: "seven".into()
            }
        );
        assert_eq!(cmd.name(), "START");
        assert!(matches!(Command::parse(&CommandMessage::new("FLY", "")), Command::Unrecognised { .. }));
    }

    #[test]
    fn command_message_wire_layout() {
        let msg = CommandMessage::new("START", "7");
        let bytes = BufferSerializer::encode_value(&msg).unwrap().into_bytes();
        assert_eq!(&bytes[..], &[5, 0, 0, 0, b'S', b'T', b'A', b'R', b'T', 1, 0, 0, 0, b'7']);
        assert_eq!(BufferSerializer::decode_value::<CommandMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn request_sequence_follows_the_parameter() {
        let msg = CommandMessage::new("STATUS", "").with_seq(3);
        let bytes = BufferSerializer::encode_value(&msg).unwrap().into_bytes();
        assert_eq!(&bytes[bytes.len() - 4..], &[3, 0, 0, 0]);
        let back = BufferSerializer::decode_value::<CommandMessage>(&bytes).unwrap();
        assert_eq!(back.seq, 3);
        assert_eq!(Command::parse(&back), Command::Status);
    }

    #[test]
    fn handshake_strings() {
        assert!(is_ok(CONTROL_GREETING));
        assert!(is_ok(CONFIRM));
        assert!(!is_ok(&refusal("run in progress")));
        assert!(!is_ok("OKAY"));
    }
}
