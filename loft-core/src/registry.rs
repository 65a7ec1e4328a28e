//! In-flight sessions keyed by (peer, transfer id). Owned by a coordinator, never global.

use std::collections::{HashMap, VecDeque};

use crate::error::TransferError;
use crate::id::{PeerId, TransferId};
use crate::session::{Direction, Status, Strategy, TransferSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: PeerId,
    pub id: TransferId,
}

impl SessionKey {
    pub fn new(peer: PeerId, id: TransferId) -> Self {
        Self { peer, id }
    }
}

/// Read-only view of a session for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub logical_name: String,
    pub direction: Direction,
    pub strategy: Strategy,
    pub status: Status,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// Completed receive sessions remembered after removal, so late checkups and reports from a
/// sender that has not seen the completion yet still get a truthful answer.
const RETIRED_CAPACITY: usize = 256;

#[derive(Debug, Default)]
pub struct TransferRegistry {
    sessions: HashMap<SessionKey, TransferSession>,
    retired: VecDeque<(SessionKey, u64)>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Ids are unique per peer among active sessions.
    pub fn insert(&mut self, session: TransferSession) -> Result<SessionKey, TransferError> {
        let key = SessionKey::new(session.peer(), session.id());
        if self.sessions.contains_key(&key) {
            return Err(TransferError::DuplicateSession);
        }
        self.sessions.insert(key, session);
        Ok(key)
    }

    pub fn get(&self, key: &SessionKey) -> Option<&TransferSession> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut TransferSession> {
        self.sessions.get_mut(key)
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<TransferSession> {
        self.sessions.remove(key)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TransferSession> {
        self.sessions.values_mut()
    }

    /// Remember that `key` completed with `total` bytes. Oldest entries fall off.
    pub fn retire(&mut self, key: SessionKey, total: u64) {
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back((key, total));
    }

    /// Total length of a recently completed session.
    pub fn retired(&self, key: &SessionKey) -> Option<u64> {
        self.retired
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, total)| *total)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn sessions_for(&self, peer: PeerId) -> Vec<SessionKey> {
        self.sessions
            .keys()
            .filter(|k| k.peer == peer)
            .copied()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|(key, s)| SessionInfo {
                key: *key,
                logical_name: s.logical_name().to_string(),
                direction: s.direction(),
                strategy: s.strategy(),
                status: s.status(),
                bytes_transferred: s.bytes_transferred(),
                total_bytes: s.total_bytes(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
