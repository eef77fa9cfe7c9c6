//! Connection registry and status aggregation.
//!
//! The registry is the only writer of [`ConnectionRecord`] state. Everything else
//! (the orchestrator, an operator console, tests) reads immutable snapshots or
//! subscribes to the aggregate state, which is pushed through a
//! `tokio::sync::watch` channel whenever it changes.
//!
//! ## Aggregation
//!
//! Over all registered peers:
//!
//! 1. any `ERROR` gives `ERROR`;
//! 2. all `RUNNING` gives `RUNNING`;
//! 3. any `UNINIT` gives `UNINIT`;
//! 4. any `UNCONF` gives `UNCONF`;
//! 5. otherwise `CONF`.
//!
//! An empty registry aggregates to `UNINIT`. A peer that disconnects is removed
//! outright; its last state does not linger in the aggregate.

use crate::status::{LifecycleState, Status};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Opaque handle for a registered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PeerId(u64);

impl PeerId {
    /// Raw handle value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity a peer presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Peer role, e.g. `Producer`, `DataCollector`, `LogCollector`.
    pub peer_type: String,
    /// Instance name, may be empty.
    pub name: String,
    /// Transport address of the control connection.
    pub remote: Option<SocketAddr>,
}

impl ConnectionInfo {
    /// Identity without a transport address.
    pub fn new(peer_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_type: peer_type.into(),
            name: name.into(),
            remote: None,
        }
    }

    /// Attach the transport address.
    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Whether this peer has the given role.
    pub fn is_type(&self, peer_type: &str) -> bool {
        self.peer_type.eq_ignore_ascii_case(peer_type)
    }

    /// Configuration section scoping this peer: `type.name` or `type`.
    pub fn section(&self) -> String {
        if self.name.is_empty() {
            self.peer_type.clone()
        } else {
            format!("{}.{}", self.peer_type, self.name)
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.section())?;
        if let Some(remote) = self.remote {
            write!(f, "@{remote}")?;
        }
        Ok(())
    }
}

/// Everything known about one live peer.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    /// Registry handle.
    pub id: PeerId,
    /// Handshake identity.
    pub info: ConnectionInfo,
    /// Last reported lifecycle state.
    pub state: LifecycleState,
    /// Last report had severity BUSY.
    pub busy: bool,
    /// Message of the last report.
    pub message: String,
    /// Tags of the last report.
    pub tags: BTreeMap<String, String>,
    /// When the record last changed.
    pub last_update: DateTime<Utc>,
}

/// Compute the aggregate over a set of peer states.
pub fn aggregate_states<I>(states: I) -> LifecycleState
where
    I: IntoIterator<Item = LifecycleState>,
{
    let mut any = false;
    let mut all_running = true;
    let mut any_uninit = false;
    let mut any_unconf = false;
    for state in states {
        any = true;
        match state {
            LifecycleState::Error => return LifecycleState::Error,
            LifecycleState::Running => {}
            LifecycleState::Uninit => {
                all_running = false;
                any_uninit = true;
            }
            LifecycleState::Unconf => {
                all_running = false;
                any_unconf = true;
            }
            LifecycleState::Conf => all_running = false,
        }
    }
    if !any {
        LifecycleState::Uninit
    } else if all_running {
        LifecycleState::Running
    } else if any_uninit {
        LifecycleState::Uninit
    } else if any_unconf {
        LifecycleState::Unconf
    } else {
        LifecycleState::Conf
    }
}

/// Registry of live peers.
pub struct ConnectionRegistry {
    records: RwLock<BTreeMap<PeerId, ConnectionRecord>>,
    next_id: AtomicU64,
    aggregate_tx: watch::Sender<LifecycleState>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        let (aggregate_tx, _) = watch::channel(LifecycleState::Uninit);
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            aggregate_tx,
        }
    }

    /// Admit a peer. It starts in `initial` until its first report.
    pub fn connect(&self, info: ConnectionInfo, initial: LifecycleState) -> PeerId {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::info!(peer = %id, identity = %info, "peer admitted");
        let mut records = self.records.write();
        records.insert(
            id,
            ConnectionRecord {
                id,
                info,
                state: initial,
                busy: false,
                message: String::new(),
                tags: BTreeMap::new(),
                last_update: Utc::now(),
            },
        );
        self.publish(&records);
        id
    }

    /// Apply a status report. Returns `false` for an unknown peer.
    pub fn upsert(&self, id: PeerId, status: &Status) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(&id) else {
            return false;
        };
        if record.state != status.state() {
            tracing::debug!(
                peer = %id,
                from = %record.state,
                to = %status.state(),
                "peer state changed"
            );
        }
        record.state = status.state();
        record.busy = status.is_busy();
        record.message = status.message().to_string();
        record.tags = status.tags().clone();
        record.last_update = Utc::now();
        self.publish(&records);
        true
    }

    /// Drop a peer. Returns its last record.
    pub fn remove(&self, id: PeerId) -> Option<ConnectionRecord> {
        let mut records = self.records.write();
        let removed = records.remove(&id);
        if let Some(record) = &removed {
            tracing::info!(peer = %id, identity = %record.info, last_state = %record.state, "peer removed");
            self.publish(&records);
        }
        removed
    }

    /// Current aggregate state.
    pub fn aggregate(&self) -> LifecycleState {
        aggregate_states(self.records.read().values().map(|r| r.state))
    }

    /// Read-only copies of all records, ordered by admission.
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Copy of one record.
    pub fn get(&self, id: PeerId) -> Option<ConnectionRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Ids of peers with the given role.
    pub fn peers_of_type(&self, peer_type: &str) -> Vec<PeerId> {
        self.records
            .read()
            .values()
            .filter(|r| r.info.is_type(peer_type))
            .map(|r| r.id)
            .collect()
    }

    /// Whether any peer last reported BUSY.
    pub fn any_busy(&self) -> bool {
        self.records.read().values().any(|r| r.busy)
    }

    /// Number of live peers.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Receive the aggregate every time it changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.aggregate_tx.subscribe()
    }

    /// Called with the records write lock held so publications follow the
    /// order of the updates they describe.
    fn publish(&self, records: &BTreeMap<PeerId, ConnectionRecord>) {
        let aggregate = aggregate_states(records.values().map(|r| r.state));
        self.aggregate_tx.send_if_modified(|current| {
            if *current == aggregate {
                false
            } else {
                tracing::info!(from = %current, to = %aggregate, "aggregate state changed");
                *current = aggregate;
                true
            }
        });
    }
}
