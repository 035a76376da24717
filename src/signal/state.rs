use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::keys::KeyPair;

/// Skipped message keys retained per chain before decryption gives up.
pub const MAX_SKIPPED_MESSAGE_KEYS: usize = 2000;

/// Closed sessions retained per record; the oldest-closed is evicted.
pub const MAX_CLOSED_SESSIONS: usize = 40;

/// Serialized record format tag.
pub const RECORD_VERSION: &str = "v1";

/// Whether a session was bootstrapped from our base key or the peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseKeyType {
    Ours,
    Theirs,
}

/// Direction of a ratchet chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainType {
    Sending,
    Receiving,
}

/// Rolling chain key; `key` is cleared when the chain closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey {
    pub counter: i32,
    pub key: Option<[u8; 32]>,
}

/// One ratchet chain, keyed in the session by its ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub chain_key: ChainKey,
    pub chain_type: ChainType,
    /// Skipped message keys by counter, awaiting out-of-order arrivals.
    pub message_keys: HashMap<u32, [u8; 32]>,
}

impl Chain {
    pub fn new(chain_type: ChainType, key: [u8; 32]) -> Self {
        Self {
            chain_key: ChainKey {
                counter: -1,
                key: Some(key),
            },
            chain_type,
            message_keys: HashMap::new(),
        }
    }
}

/// DH ratchet position for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratchet {
    pub root_key: [u8; 32],
    pub ephemeral_key_pair: KeyPair,
    pub last_remote_ephemeral: [u8; 32],
    pub previous_counter: u32,
}

/// Bookkeeping that identifies and orders a session within its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub base_key: [u8; 32],
    pub base_key_type: BaseKeyType,
    /// -1 while open, else the close timestamp in epoch milliseconds.
    pub closed: i64,
    pub used: u64,
    pub created: u64,
    pub remote_identity: [u8; 32],
}

/// Pre-key reference carried until the peer's first reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub signed_key_id: u32,
    pub base_key: [u8; 32],
    pub pre_key_id: Option<u32>,
}

/// A single established session with one peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub registration_id: u32,
    pub current_ratchet: Ratchet,
    pub index_info: IndexInfo,
    pub pending_pre_key: Option<PendingPreKey>,
    /// Chains by base64 of their ephemeral public key.
    pub chains: HashMap<String, Chain>,
}

impl SessionEntry {
    /// Base64 key under which this session lives in its record.
    pub fn base_key_b64(&self) -> String {
        STANDARD.encode(self.index_info.base_key)
    }

    pub fn chain(&self, ephemeral_pub: &[u8; 32]) -> Option<&Chain> {
        self.chains.get(&STANDARD.encode(ephemeral_pub))
    }

    pub fn chain_mut(&mut self, ephemeral_pub: &[u8; 32]) -> Option<&mut Chain> {
        self.chains.get_mut(&STANDARD.encode(ephemeral_pub))
    }

    pub fn add_chain(&mut self, ephemeral_pub: &[u8; 32], chain: Chain) {
        self.chains.insert(STANDARD.encode(ephemeral_pub), chain);
    }

    pub fn delete_chain(&mut self, ephemeral_pub: &[u8; 32]) {
        self.chains.remove(&STANDARD.encode(ephemeral_pub));
    }

    /// Marks the session used now.
    pub fn touch(&mut self) {
        self.index_info.used = now_millis();
    }
}

/// Every session ever established with one peer device address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: String,
    /// Sessions by base64 of their base key.
    pub sessions: HashMap<String, SessionEntry>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self {
            version: RECORD_VERSION.to_owned(),
            sessions: HashMap::new(),
        }
    }

    /// The currently open session, if any.
    pub fn open_session(&self) -> Option<&SessionEntry> {
        self.sessions
            .values()
            .find(|entry| entry.index_info.closed == -1)
    }

    pub fn open_session_mut(&mut self) -> Option<&mut SessionEntry> {
        self.sessions
            .values_mut()
            .find(|entry| entry.index_info.closed == -1)
    }

    pub fn session_by_base_key(&self, base_key_b64: &str) -> Option<&SessionEntry> {
        self.sessions.get(base_key_b64)
    }

    /// Sessions ordered most-recently-used first, for trial decryption.
    pub fn sessions_by_recency(&self) -> Vec<(String, SessionEntry)> {
        let mut entries: Vec<(String, SessionEntry)> = self
            .sessions
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| b.1.index_info.used.cmp(&a.1.index_info.used));
        entries
    }

    /// Installs a new open session, closing any currently open one and
    /// evicting the oldest-closed sessions beyond the retention cap.
    pub fn promote(&mut self, entry: SessionEntry) {
        if let Some(open) = self.open_session_mut() {
            open.index_info.closed = now_millis() as i64;
        }

        self.sessions.insert(entry.base_key_b64(), entry);
        self.prune_closed();
    }

    /// Writes back a mutated session under its base key.
    pub fn put(&mut self, entry: SessionEntry) {
        self.sessions.insert(entry.base_key_b64(), entry);
    }

    fn prune_closed(&mut self) {
        let mut closed: Vec<(String, i64)> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.index_info.closed != -1)
            .map(|(key, entry)| (key.clone(), entry.index_info.closed))
            .collect();
        if closed.len() <= MAX_CLOSED_SESSIONS {
            return;
        }

        closed.sort_by_key(|(_, closed_at)| *closed_at);
        for (key, _) in closed
            .into_iter()
            .take(self.sessions.len() - MAX_CLOSED_SESSIONS - 1)
        {
            self.sessions.remove(&key);
        }
    }

    /// Serializes for the store blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Restores from a store blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender-key chain state for one `(group, sender)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    pub key_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
    pub signature_public: [u8; 32],
    /// Skipped message seeds by iteration.
    pub message_seeds: HashMap<u32, [u8; 32]>,
}

impl SenderKeyRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}
