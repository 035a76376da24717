use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::keys::{
    generate_keypair, generate_registration_id, random_bytes, sign_message, signal_public_key,
    KeyPair,
};

/// Upper bound for the processed-message dedupe cache.
pub const PROCESSED_MESSAGES_CAP: usize = 2000;

/// Account information available after login or pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeInfo {
    /// Full JID for the connected account.
    pub jid: String,
    /// Optional profile display name.
    pub name: Option<String>,
    /// Optional linked-identity JID.
    pub lid: Option<String>,
}

/// Signed pre-key record: the pair plus its identity signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Numeric key id.
    pub id: u32,
    /// Underlying X25519 pair.
    pub key_pair: KeyPair,
    /// XEdDSA signature over the prefixed public key, by the identity key.
    #[serde(with = "serde_sig64")]
    pub signature: [u8; 64],
}

/// Bounded insertion-ordered set used to drop duplicate message deliveries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<(String, String)>", from = "Vec<(String, String)>")]
pub struct ProcessedMessages {
    order: VecDeque<(String, String)>,
    seen: HashSet<(String, String)>,
}

impl ProcessedMessages {
    /// Records a `(chat, id)` pair; returns false when it was already present.
    pub fn insert(&mut self, chat: &str, id: &str) -> bool {
        let key = (chat.to_owned(), id.to_owned());
        if self.seen.contains(&key) {
            return false;
        }

        if self.order.len() == PROCESSED_MESSAGES_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }

        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl From<ProcessedMessages> for Vec<(String, String)> {
    fn from(value: ProcessedMessages) -> Self {
        value.order.into_iter().collect()
    }
}

impl From<Vec<(String, String)>> for ProcessedMessages {
    fn from(entries: Vec<(String, String)>) -> Self {
        let mut out = Self::default();
        for (chat, id) in entries {
            out.insert(&chat, &id);
        }
        out
    }
}

/// Everything the account persists across connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Static Noise identity pair.
    pub noise_key: KeyPair,
    /// Ephemeral pair used for the next handshake while unpaired.
    pub pairing_ephemeral_key: KeyPair,
    /// Long-term Signal identity pair, also used for ADV signing.
    pub signed_identity_key: KeyPair,
    /// Medium-term signed pre-key.
    pub signed_pre_key: SignedPreKey,
    /// 14-bit registration identifier.
    pub registration_id: u32,
    /// Secret for HMAC verification of the server-issued device identity.
    pub adv_secret_key: [u8; 32],
    /// Connected account, set at pairing or login.
    pub me: Option<MeInfo>,
    /// Encoded `AdvSignedDeviceIdentity` returned by the server at pairing.
    pub account: Option<Vec<u8>>,
    /// Primary device platform reported at pairing.
    pub platform: Option<String>,
    /// Long-term public identity keys learned from peers, by JID.
    pub signal_identities: HashMap<String, [u8; 32]>,
    /// Next one-time pre-key id to generate.
    pub next_pre_key_id: u32,
    /// First one-time pre-key id not yet uploaded.
    pub first_unuploaded_pre_key_id: u32,
    /// True once the server accepted pairing.
    pub registered: bool,
    /// Opaque bytes echoed in the transport prologue when present.
    pub routing_info: Option<Vec<u8>>,
    /// Dedupe cache for inbound message stanzas.
    pub processed_messages: ProcessedMessages,
}

impl Credentials {
    /// Creates fresh unpaired credentials with generated key material.
    pub fn new() -> Self {
        let signed_identity_key = generate_keypair();
        let signed_pre_key = make_signed_pre_key(&signed_identity_key, 1);

        Self {
            noise_key: generate_keypair(),
            pairing_ephemeral_key: generate_keypair(),
            signed_identity_key,
            signed_pre_key,
            registration_id: generate_registration_id(),
            adv_secret_key: random_bytes(),
            me: None,
            account: None,
            platform: None,
            signal_identities: HashMap::new(),
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            registered: false,
            routing_info: None,
            processed_messages: ProcessedMessages::default(),
        }
    }

    /// Reserves `count` one-time pre-key ids, returning the allocated range.
    pub fn allocate_pre_key_ids(&mut self, count: u32) -> std::ops::Range<u32> {
        let start = self.next_pre_key_id;
        self.next_pre_key_id = start.saturating_add(count);
        start..self.next_pre_key_id
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a signed pre-key whose public half is signed by the identity key.
pub fn make_signed_pre_key(identity: &KeyPair, id: u32) -> SignedPreKey {
    let key_pair = generate_keypair();
    let signature = sign_message(
        identity.private,
        identity.public,
        &signal_public_key(&key_pair.public),
    );

    SignedPreKey {
        id,
        key_pair,
        signature,
    }
}

mod serde_sig64 {
    use serde::{de::Error as DeError, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        if bytes.len() != 64 {
            return Err(D::Error::invalid_length(bytes.len(), &"64 bytes"));
        }

        let mut out = [0_u8; 64];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{Credentials, ProcessedMessages, PROCESSED_MESSAGES_CAP};
    use crate::keys::{signal_public_key, verify_message};

    #[test]
    fn new_credentials_sign_their_pre_key() {
        let creds = Credentials::new();
        assert!(verify_message(
            creds.signed_identity_key.public,
            &signal_public_key(&creds.signed_pre_key.key_pair.public),
            &creds.signed_pre_key.signature,
        ));
        assert!(creds.first_unuploaded_pre_key_id <= creds.next_pre_key_id);
    }

    #[test]
    fn processed_messages_evicts_oldest() {
        let mut cache = ProcessedMessages::default();
        for index in 0..(PROCESSED_MESSAGES_CAP + 10) {
            assert!(cache.insert("chat", &format!("id-{index}")));
        }

        assert_eq!(cache.len(), PROCESSED_MESSAGES_CAP);
        assert!(cache.insert("chat", "id-0"));
        assert!(!cache.insert("chat", &format!("id-{}", PROCESSED_MESSAGES_CAP + 9)));
    }
}
