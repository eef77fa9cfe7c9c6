//! Peer status reports.
//!
//! A [`Status`] is what a peer tells the controller about itself: how alarming
//! the latest message is ([`Severity`]), where it is in its lifecycle
//! ([`LifecycleState`]), a human readable message and free-form tags. A new
//! status always replaces the previous one; nothing mutates a status that has
//! already been sent.

use crate::codec::{Decode, Deserializer, Encode, Serializer};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Totally ordered message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum Severity {
    /// Diagnostics.
    Debug = 0,
    /// Nominal.
    #[default]
    Ok = 1,
    /// Exception text attached to a report.
    Throw = 2,
    /// Verbose informational.
    Extra = 3,
    /// Informational.
    Info = 4,
    /// Warning.
    Warn = 5,
    /// Failure.
    Error = 6,
    /// Operator-facing message.
    User = 7,
    /// Peer is processing and cannot take commands right now.
    Busy = 8,
    /// Above every threshold; never shown.
    None = 9,
}

impl Severity {
    const ALL: [Severity; 10] = [
        Severity::Debug,
        Severity::Ok,
        Severity::Throw,
        Severity::Extra,
        Severity::Info,
        Severity::Warn,
        Severity::Error,
        Severity::User,
        Severity::Busy,
        Severity::None,
    ];

    /// Upper-case name as used on the wire and in logs.
    pub fn name(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Ok => "OK",
            Severity::Throw => "THROW",
            Severity::Extra => "EXTRA",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::User => "USER",
            Severity::Busy => "BUSY",
            Severity::None => "NONE",
        }
    }

    /// Tracing level a message of this severity is forwarded at.
    ///
    /// `None` means the message is not logged at all.
    pub fn log_level(self) -> Option<tracing::Level> {
        match self {
            Severity::Debug => Some(tracing::Level::DEBUG),
            Severity::Ok | Severity::Extra | Severity::Info | Severity::User | Severity::Busy => {
                Some(tracing::Level::INFO)
            }
            Severity::Warn => Some(tracing::Level::WARN),
            Severity::Throw | Severity::Error => Some(tracing::Level::ERROR),
            Severity::None => None,
        }
    }
}

impl TryFrom<u32> for Severity {
    type Error = DaqError;

    fn try_from(value: u32) -> Result<Self, DaqError> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| DaqError::Protocol(format!("invalid severity {value}")))
    }
}

impl FromStr for Severity {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.name() == upper)
            .ok_or_else(|| DaqError::Configuration(format!("unknown severity '{s}'")))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a peer.
///
/// Peers that need an explicit initialisation step start in `Uninit`; all others
/// start in `Unconf`. `Error` is sticky until a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum LifecycleState {
    /// Not yet initialised.
    #[default]
    Uninit = 0,
    /// Initialised, not configured.
    Unconf = 1,
    /// Configured and ready to start a run.
    Conf = 2,
    /// Taking data.
    Running = 3,
    /// Failed; only RESET leaves this state.
    Error = 4,
}

impl LifecycleState {
    /// Upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::Uninit => "UNINIT",
            LifecycleState::Unconf => "UNCONF",
            LifecycleState::Conf => "CONF",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Error => "ERROR",
        }
    }
}

impl TryFrom<u32> for LifecycleState {
    type Error = DaqError;

    fn try_from(value: u32) -> Result<Self, DaqError> {
        match value {
            0 => Ok(LifecycleState::Uninit),
            1 => Ok(LifecycleState::Unconf),
            2 => Ok(LifecycleState::Conf),
            3 => Ok(LifecycleState::Running),
            4 => Ok(LifecycleState::Error),
            other => Err(DaqError::Protocol(format!("invalid lifecycle state {other}"))),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One status report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    level: Severity,
    state: LifecycleState,
    message: String,
    tags: BTreeMap<String, String>,
}

impl Status {
    /// New status without tags.
    pub fn new(level: Severity, state: LifecycleState, message: impl Into<String>) -> Self {
        Self {
            level,
            state,
            message: message.into(),
            tags: BTreeMap::new(),
        }
    }

    /// An error report in the sticky ERROR state.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, LifecycleState::Error, message)
    }

    /// Severity of the message.
    pub fn level(&self) -> Severity {
        self.level
    }

    /// Reported lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Message text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the peer declared itself busy.
    pub fn is_busy(&self) -> bool {
        self.level == Severity::Busy
    }

    /// Builder-style tag setter.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    /// Set a tag.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl ToString) {
        self.tags.insert(key.into(), value.to_string());
    }

    /// Tag value.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// All tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Mutable tag access for the owner before sending.
    pub fn tags_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.tags
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.state, self.level)?;
        if !self.message.is_empty() {
            write!(f, " {}", self.message)?;
        }
        Ok(())
    }
}

impl Encode for Status {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        (self.level as u32).encode(ser)?;
        (self.state as u32).encode(ser)?;
        self.message.encode(ser)?;
        self.tags.encode(ser)
    }
}

impl Decode for Status {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        let level = Severity::try_from(u32::decode(de)?)?;
        let state = LifecycleState::try_from(u32::decode(de)?)?;
        let message = String::decode(de)?;
        let tags = BTreeMap::decode(de)?;
        Ok(Self {
            level,
            state,
            message,
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BufferSerializer;

    #[test]
    fn severity_is_totally_ordered() {
        assert!(Severity::Debug < Severity::Ok);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::User);
        assert!(Severity::Busy < Severity::None);
        assert_eq!(Severity::try_from(8).unwrap(), Severity::Busy);
        assert!(Severity::try_from(10).is_err());
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warn);
        assert_eq!(" ERROR ".parse::<Severity>().unwrap(), Severity::Error);
        assert!("loud".parse::<Severity>().is_err());
        assert_eq!(Severity::None.log_level(), None);
        assert_eq!(Severity::Throw.log_level(), Some(tracing::Level::ERROR));
    }

    #[test]
    fn status_wire_roundtrip() {
        let status = Status::new(Severity::Busy, LifecycleState::Running, "writing")
            .with_tag("RUN", 7)
            .with_tag("EVENT", 1500);
        let back: Status = BufferSerializer::decode_value(&BufferSerializer::encode_value(&status).unwrap().into_bytes())
            .unwrap();
        assert_eq!(back, status);
        assert!(back.is_busy());
        assert_eq!(back.tag("RUN"), Some("7"));
    }

    #[test]
    fn invalid_state_is_a_protocol_error() {
        let mut buf = BufferSerializer::new();
        buf.write(&1u32).unwrap();
        buf.write(&9u32).unwrap();
        buf.write("msg").unwrap();
        buf.write(&BTreeMap::<String, String>::new()).unwrap();
        assert!(matches!(buf.read::<Status>(), Err(DaqError::Protocol(_))));
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(Status::error("hv trip").to_string(), "ERROR [ERROR] hv trip");
        assert_eq!(
            Status::new(Severity::Ok, LifecycleState::Conf, "").to_string(),
            "CONF [OK]"
        );
    }
}
