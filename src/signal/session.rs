use std::collections::HashMap;

use crate::{
    creds::SignedPreKey,
    error::SignalError,
    keys::{generate_keypair, signal_public_key, verify_message, KeyPair},
    signal::{
        kdf::derive_ratchet_keys,
        state::{
            now_millis, BaseKeyType, Chain, ChainType, IndexInfo, PendingPreKey, Ratchet,
            SessionEntry,
        },
    },
};

const X3DH_INFO: &[u8] = b"WhisperText";
const RATCHET_INFO: &[u8] = b"WhisperRatchet";

/// Peer key material fetched from the server for session bootstrap.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key: [u8; 32],
    pub signed_pre_key_signature: Vec<u8>,
    pub pre_key_id: Option<u32>,
    pub pre_key: Option<[u8; 32]>,
}

/// Initializes an outgoing session from a fetched bundle (we are the initiator).
pub fn init_outgoing_session(
    local_identity: &KeyPair,
    bundle: &PreKeyBundle,
) -> Result<SessionEntry, SignalError> {
    if !verify_message(
        bundle.identity_key,
        &signal_public_key(&bundle.signed_pre_key),
        &bundle.signed_pre_key_signature,
    ) {
        return Err(SignalError::PreKeySignatureInvalid);
    }

    let base_key = generate_keypair();

    let mut ikm = vec![0xFF_u8; 32];
    ikm.extend_from_slice(&local_identity.diffie_hellman(&bundle.signed_pre_key));
    ikm.extend_from_slice(&base_key.diffie_hellman(&bundle.identity_key));
    ikm.extend_from_slice(&base_key.diffie_hellman(&bundle.signed_pre_key));
    if let Some(one_time) = bundle.pre_key.as_ref() {
        ikm.extend_from_slice(&base_key.diffie_hellman(one_time));
    }

    let (root_key, _) = derive_ratchet_keys(&[0_u8; 32], &ikm, X3DH_INFO);

    let created = now_millis();
    let mut entry = SessionEntry {
        registration_id: bundle.registration_id,
        current_ratchet: Ratchet {
            root_key,
            ephemeral_key_pair: generate_keypair(),
            last_remote_ephemeral: bundle.signed_pre_key,
            previous_counter: 0,
        },
        index_info: IndexInfo {
            base_key: base_key.public,
            base_key_type: BaseKeyType::Ours,
            closed: -1,
            used: created,
            created,
            remote_identity: bundle.identity_key,
        },
        pending_pre_key: Some(PendingPreKey {
            signed_key_id: bundle.signed_pre_key_id,
            base_key: base_key.public,
            pre_key_id: bundle.pre_key_id,
        }),
        chains: HashMap::new(),
    };

    calculate_sending_ratchet(&mut entry, &bundle.signed_pre_key);
    Ok(entry)
}

/// Initializes an incoming session from a pre-key message (peer initiated).
pub fn init_incoming_session(
    local_identity: &KeyPair,
    signed_pre_key: &SignedPreKey,
    one_time_pre_key: Option<&KeyPair>,
    peer_identity: [u8; 32],
    peer_base_key: [u8; 32],
    peer_registration_id: u32,
) -> Result<SessionEntry, SignalError> {
    let spk = signed_pre_key.key_pair;

    let mut ikm = vec![0xFF_u8; 32];
    ikm.extend_from_slice(&spk.diffie_hellman(&peer_identity));
    ikm.extend_from_slice(&local_identity.diffie_hellman(&peer_base_key));
    ikm.extend_from_slice(&spk.diffie_hellman(&peer_base_key));
    if let Some(one_time) = one_time_pre_key {
        ikm.extend_from_slice(&one_time.diffie_hellman(&peer_base_key));
    }

    let (root_key, _) = derive_ratchet_keys(&[0_u8; 32], &ikm, X3DH_INFO);

    let created = now_millis();
    Ok(SessionEntry {
        registration_id: peer_registration_id,
        current_ratchet: Ratchet {
            root_key,
            // The responder ratchets from its signed pre-key pair.
            ephemeral_key_pair: spk,
            last_remote_ephemeral: peer_base_key,
            previous_counter: 0,
        },
        index_info: IndexInfo {
            base_key: peer_base_key,
            base_key_type: BaseKeyType::Theirs,
            closed: -1,
            used: created,
            created,
            remote_identity: peer_identity,
        },
        pending_pre_key: None,
        chains: HashMap::new(),
    })
}

/// Installs a fresh SENDING chain for the session's current ephemeral pair.
pub fn calculate_sending_ratchet(entry: &mut SessionEntry, remote_key: &[u8; 32]) {
    let ratchet = &mut entry.current_ratchet;
    let shared = ratchet.ephemeral_key_pair.diffie_hellman(remote_key);
    let (root_key, chain_key) = derive_ratchet_keys(&ratchet.root_key, &shared, RATCHET_INFO);

    ratchet.root_key = root_key;
    let ephemeral_pub = ratchet.ephemeral_key_pair.public;
    entry.add_chain(&ephemeral_pub, Chain::new(ChainType::Sending, chain_key));
}

/// Installs a RECEIVING chain for a newly observed remote ratchet key.
pub fn calculate_receiving_ratchet(entry: &mut SessionEntry, remote_key: &[u8; 32]) {
    let ratchet = &mut entry.current_ratchet;
    let shared = ratchet.ephemeral_key_pair.diffie_hellman(remote_key);
    let (root_key, chain_key) = derive_ratchet_keys(&ratchet.root_key, &shared, RATCHET_INFO);

    ratchet.root_key = root_key;
    entry.add_chain(remote_key, Chain::new(ChainType::Receiving, chain_key));
}
