use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    creds::{Credentials, SignedPreKey},
    error::StoreError,
    keys::KeyPair,
    signal::{ProtocolAddress, SenderKeyRecord, SessionRecord},
};

/// Access to local identity material and learned peer identities.
pub trait IdentityStore {
    /// Local long-term identity pair.
    fn local_identity(&self) -> Result<KeyPair, StoreError>;
    /// Local 14-bit registration id.
    fn local_registration_id(&self) -> Result<u32, StoreError>;
    /// Loads the identity key previously seen for a peer user.
    fn load_peer_identity(&self, user: &str) -> Result<Option<[u8; 32]>, StoreError>;
    /// Records a peer user's identity key.
    fn store_peer_identity(&self, user: &str, identity: [u8; 32]) -> Result<(), StoreError>;
}

/// Access to one-time pre-keys.
pub trait PreKeyStore {
    fn load_pre_key(&self, id: u32) -> Result<Option<KeyPair>, StoreError>;
    fn store_pre_key(&self, id: u32, key: KeyPair) -> Result<(), StoreError>;
    /// Consumes a pre-key after a successful first decrypt.
    fn remove_pre_key(&self, id: u32) -> Result<(), StoreError>;
}

/// Access to the medium-term signed pre-key.
pub trait SignedPreKeyStore {
    fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKey>, StoreError>;
}

/// Access to per-address session records.
pub trait SessionStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>, StoreError>;
    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError>;
    /// All stored sessions whose address belongs to `user`, any device.
    fn sessions_for_user(
        &self,
        user: &str,
    ) -> Result<Vec<(ProtocolAddress, SessionRecord)>, StoreError>;
}

/// Access to group sender keys by `group::sender` name.
pub trait SenderKeyStore {
    fn load_sender_key(&self, name: &str) -> Result<Option<SenderKeyRecord>, StoreError>;
    fn store_sender_key(&self, name: &str, record: &SenderKeyRecord) -> Result<(), StoreError>;
}

/// Access to the persisted credential record.
pub trait CredsStore {
    /// Snapshot of the current credentials.
    fn credentials(&self) -> Result<Credentials, StoreError>;
    /// Read-modify-write under the credentials lock, then persist atomically.
    fn update_credentials(
        &self,
        apply: &mut dyn FnMut(&mut Credentials),
    ) -> Result<Credentials, StoreError>;
}

/// Composed store capability required by the protocol core.
pub trait SignalStore:
    IdentityStore + PreKeyStore + SignedPreKeyStore + SessionStore + SenderKeyStore + CredsStore
{
}

impl<T> SignalStore for T where
    T: IdentityStore
        + PreKeyStore
        + SignedPreKeyStore
        + SessionStore
        + SenderKeyStore
        + CredsStore
{
}

/// In-memory store; records round-trip through their blob codecs so the
/// persisted representation is exercised even without a durable backend.
#[derive(Clone)]
pub struct InMemoryStore {
    creds: Arc<RwLock<Credentials>>,
    creds_blob: Arc<RwLock<Vec<u8>>>,
    pre_keys: Arc<RwLock<HashMap<u32, KeyPair>>>,
    sessions: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    sender_keys: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new(creds: Credentials) -> Self {
        Self {
            creds: Arc::new(RwLock::new(creds)),
            creds_blob: Arc::new(RwLock::new(Vec::new())),
            pre_keys: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            sender_keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The last persisted credential blob, for backends layered on top.
    pub fn credentials_blob(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self
            .creds_blob
            .read()
            .map_err(|_| StoreError::Poisoned("creds_blob"))?
            .clone())
    }
}

impl IdentityStore for InMemoryStore {
    fn local_identity(&self) -> Result<KeyPair, StoreError> {
        Ok(self
            .creds
            .read()
            .map_err(|_| StoreError::Poisoned("creds"))?
            .signed_identity_key)
    }

    fn local_registration_id(&self) -> Result<u32, StoreError> {
        Ok(self
            .creds
            .read()
            .map_err(|_| StoreError::Poisoned("creds"))?
            .registration_id)
    }

    fn load_peer_identity(&self, user: &str) -> Result<Option<[u8; 32]>, StoreError> {
        let creds = self
            .creds
            .read()
            .map_err(|_| StoreError::Poisoned("creds"))?;
        Ok(creds.signal_identities.get(user).copied())
    }

    fn store_peer_identity(&self, user: &str, identity: [u8; 32]) -> Result<(), StoreError> {
        let mut creds = self
            .creds
            .write()
            .map_err(|_| StoreError::Poisoned("creds"))?;
        creds.signal_identities.insert(user.to_owned(), identity);
        Ok(())
    }
}

impl PreKeyStore for InMemoryStore {
    fn load_pre_key(&self, id: u32) -> Result<Option<KeyPair>, StoreError> {
        let pre_keys = self
            .pre_keys
            .read()
            .map_err(|_| StoreError::Poisoned("pre_keys"))?;
        Ok(pre_keys.get(&id).copied())
    }

    fn store_pre_key(&self, id: u32, key: KeyPair) -> Result<(), StoreError> {
        let mut pre_keys = self
            .pre_keys
            .write()
            .map_err(|_| StoreError::Poisoned("pre_keys"))?;
        pre_keys.insert(id, key);
        Ok(())
    }

    fn remove_pre_key(&self, id: u32) -> Result<(), StoreError> {
        let mut pre_keys = self
            .pre_keys
            .write()
            .map_err(|_| StoreError::Poisoned("pre_keys"))?;
        pre_keys.remove(&id);
        Ok(())
    }
}

impl SignedPreKeyStore for InMemoryStore {
    fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKey>, StoreError> {
        let creds = self
            .creds
            .read()
            .map_err(|_| StoreError::Poisoned("creds"))?;
        if creds.signed_pre_key.id == id {
            Ok(Some(creds.signed_pre_key))
        } else {
            Ok(None)
        }
    }
}

impl SessionStore for InMemoryStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::Poisoned("sessions"))?;
        sessions
            .get(&address.to_string())
            .map(|blob| SessionRecord::from_bytes(blob))
            .transpose()
    }

    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let blob = record.to_bytes()?;
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::Poisoned("sessions"))?;
        sessions.insert(address.to_string(), blob);
        Ok(())
    }

    fn sessions_for_user(
        &self,
        user: &str,
    ) -> Result<Vec<(ProtocolAddress, SessionRecord)>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::Poisoned("sessions"))?;

        let mut out = Vec::new();
        for (raw, blob) in sessions.iter() {
            let Some(address) = ProtocolAddress::parse(raw) else {
                continue;
            };
            if address.user == user {
                out.push((address, SessionRecord::from_bytes(blob)?));
            }
        }
        Ok(out)
    }
}

impl SenderKeyStore for InMemoryStore {
    fn load_sender_key(&self, name: &str) -> Result<Option<SenderKeyRecord>, StoreError> {
        let sender_keys = self
            .sender_keys
            .read()
            .map_err(|_| StoreError::Poisoned("sender_keys"))?;
        sender_keys
            .get(name)
            .map(|blob| SenderKeyRecord::from_bytes(blob))
            .transpose()
    }

    fn store_sender_key(&self, name: &str, record: &SenderKeyRecord) -> Result<(), StoreError> {
        let blob = record.to_bytes()?;
        let mut sender_keys = self
            .sender_keys
            .write()
            .map_err(|_| StoreError::Poisoned("sender_keys"))?;
        sender_keys.insert(name.to_owned(), blob);
        Ok(())
    }
}

impl CredsStore for InMemoryStore {
    fn credentials(&self) -> Result<Credentials, StoreError> {
        Ok(self
            .creds
            .read()
            .map_err(|_| StoreError::Poisoned("creds"))?
            .clone())
    }

    fn update_credentials(
        &self,
        apply: &mut dyn FnMut(&mut Credentials),
    ) -> Result<Credentials, StoreError> {
        let mut creds = self
            .creds
            .write()
            .map_err(|_| StoreError::Poisoned("creds"))?;
        apply(&mut creds);

        // Serialize while still holding the lock: the in-memory mutation and
        // the persisted blob commit together.
        let blob = serde_json::to_vec(&*creds)?;
        let mut stored = self
            .creds_blob
            .write()
            .map_err(|_| StoreError::Poisoned("creds_blob"))?;
        *stored = blob;
        Ok(creds.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{CredsStore, InMemoryStore, PreKeyStore, SessionStore};
    use crate::{
        creds::Credentials,
        keys::generate_keypair,
        signal::{ProtocolAddress, SessionRecord},
    };

    #[test]
    fn credentials_blob_tracks_updates() -> anyhow::Result<()> {
        let store = InMemoryStore::new(Credentials::new());
        assert!(store.credentials_blob()?.is_empty());

        store.update_credentials(&mut |creds| {
            creds.registered = true;
        })?;

        let blob = store.credentials_blob()?;
        let restored: Credentials = serde_json::from_slice(&blob)?;
        assert!(restored.registered);
        assert_eq!(restored, store.credentials()?);
        Ok(())
    }

    #[test]
    fn sessions_enumerate_by_user() -> anyhow::Result<()> {
        let store = InMemoryStore::new(Credentials::new());
        let record = SessionRecord::new();
        store.store_session(&ProtocolAddress::new("15550002222", 0), &record)?;
        store.store_session(&ProtocolAddress::new("15550002222", 3), &record)?;
        store.store_session(&ProtocolAddress::new("15550009999", 0), &record)?;

        let sessions = store.sessions_for_user("15550002222")?;
        assert_eq!(sessions.len(), 2);
        Ok(())
    }

    #[test]
    fn pre_keys_are_removable() -> anyhow::Result<()> {
        let store = InMemoryStore::new(Credentials::new());
        store.store_pre_key(7, generate_keypair())?;
        assert!(store.load_pre_key(7)?.is_some());
        store.remove_pre_key(7)?;
        assert!(store.load_pre_key(7)?.is_none());
        Ok(())
    }
}
