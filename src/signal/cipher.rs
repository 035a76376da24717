use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use prost::Message;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{
    error::SignalError,
    keys::{generate_keypair, signal_public_key, KeyPair, KEY_BUNDLE_TYPE},
    signal::{
        address::ProtocolAddress,
        kdf::{derive_message_material, hmac_sha256},
        session::{
            calculate_receiving_ratchet, calculate_sending_ratchet, init_incoming_session,
        },
        state::{Chain, ChainType, SessionEntry, MAX_SKIPPED_MESSAGE_KEYS},
    },
    store::{IdentityStore, PreKeyStore, SessionStore, SignalStore, SignedPreKeyStore},
};
use waproto::wa;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Protocol version carried in the high and low nibbles of the first byte.
pub const CIPHERTEXT_VERSION: u8 = 3;
const VERSION_BYTE: u8 = (CIPHERTEXT_VERSION << 4) | CIPHERTEXT_VERSION;
const MAC_LENGTH: usize = 8;

/// Which envelope an encryption produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextKind {
    /// `pkmsg`: session-establishing pre-key message.
    PreKey,
    /// `msg`: regular ratchet message.
    Whisper,
}

impl CiphertextKind {
    /// Wire value for the stanza `enc/@type` attribute.
    pub fn enc_type(self) -> &'static str {
        match self {
            Self::PreKey => "pkmsg",
            Self::Whisper => "msg",
        }
    }
}

/// Result of encrypting one plaintext for one device.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    pub kind: CiphertextKind,
    pub bytes: Vec<u8>,
}

/// Per-address Double Ratchet cipher over a [`SignalStore`].
pub struct SessionCipher<'a, S: SignalStore> {
    store: &'a S,
    address: ProtocolAddress,
}

impl<'a, S: SignalStore> SessionCipher<'a, S> {
    pub fn new(store: &'a S, address: ProtocolAddress) -> Self {
        Self { store, address }
    }

    /// Encrypts a plaintext on the open session's sending chain.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedMessage, SignalError> {
        let mut record = self
            .store
            .load_session(&self.address)?
            .ok_or_else(|| SignalError::NoSession(self.address.to_string()))?;
        let mut entry = record
            .open_session_mut()
            .ok_or_else(|| SignalError::NoSession(self.address.to_string()))?
            .clone();

        let our_identity = self.store.local_identity()?;
        let their_identity = entry.index_info.remote_identity;

        let ephemeral_pub = entry.current_ratchet.ephemeral_key_pair.public;
        let previous_counter = entry.current_ratchet.previous_counter;
        let chain = entry
            .chain_mut(&ephemeral_pub)
            .ok_or(SignalError::InvalidCiphertext)?;

        let next = chain.chain_key.counter + 1;
        fill_message_keys(chain, next.max(0) as u32)?;
        let counter = chain.chain_key.counter as u32;
        let message_key = chain
            .message_keys
            .remove(&counter)
            .ok_or(SignalError::KeyReused(counter))?;
        let material = derive_message_material(&message_key);

        let ciphertext = aes_cbc_encrypt(&material.cipher_key, &material.iv, plaintext);
        let proto = wa::SignalMessage {
            ratchet_key: signal_public_key(&ephemeral_pub).to_vec(),
            counter,
            previous_counter,
            ciphertext,
        };

        let mut serialized = vec![VERSION_BYTE];
        proto
            .encode(&mut serialized)
            .expect("encoding into a Vec cannot fail");
        let mac = compute_mac(
            &material.mac_key,
            &our_identity.public,
            &their_identity,
            &serialized,
        );
        serialized.extend_from_slice(&mac);

        let message = if let Some(pending) = entry.pending_pre_key.clone() {
            let envelope = wa::PreKeySignalMessage {
                pre_key_id: pending.pre_key_id,
                base_key: signal_public_key(&pending.base_key).to_vec(),
                identity_key: signal_public_key(&our_identity.public).to_vec(),
                message: serialized,
                registration_id: self.store.local_registration_id()?,
                signed_pre_key_id: pending.signed_key_id,
            };
            let mut out = vec![VERSION_BYTE];
            envelope
                .encode(&mut out)
                .expect("encoding into a Vec cannot fail");
            EncryptedMessage {
                kind: CiphertextKind::PreKey,
                bytes: out,
            }
        } else {
            EncryptedMessage {
                kind: CiphertextKind::Whisper,
                bytes: serialized,
            }
        };

        record.put(entry);
        self.store.store_session(&self.address, &record)?;
        Ok(message)
    }

    /// Decrypts a `msg` envelope, trying stored sessions most-recent first.
    ///
    /// Each candidate session is tried on a copy so a failed attempt leaves
    /// the record untouched; the first success is committed.
    pub fn decrypt_whisper_message(&self, bytes: &[u8]) -> Result<Vec<u8>, SignalError> {
        let mut record = self
            .store
            .load_session(&self.address)?
            .ok_or(SignalError::NoMatchingSession)?;
        let our_identity = self.store.local_identity()?;

        for (_, entry) in record.sessions_by_recency() {
            let open = entry.index_info.closed == -1;
            let mut candidate = entry;
            match decrypt_with_session(&mut candidate, bytes, &our_identity) {
                Ok(plaintext) => {
                    candidate.pending_pre_key = None;
                    candidate.touch();
                    record.put(candidate);
                    self.store.store_session(&self.address, &record)?;
                    return Ok(plaintext);
                }
                Err(error) => {
                    // Counter-window failures on the open session are real
                    // protocol errors, not candidates to skip past.
                    if open
                        && matches!(
                            error,
                            SignalError::KeyReused(_) | SignalError::TooManySkipped
                        )
                    {
                        return Err(error);
                    }
                    tracing::debug!(address = %self.address, error = %error, "session candidate failed");
                }
            }
        }

        Err(SignalError::NoMatchingSession)
    }

    /// Decrypts a `pkmsg` envelope, creating the session when needed.
    ///
    /// The referenced one-time pre-key is consumed only when the inner
    /// message decrypts successfully.
    pub fn decrypt_pre_key_whisper_message(&self, bytes: &[u8]) -> Result<Vec<u8>, SignalError> {
        let (version, body) = bytes.split_first().ok_or(SignalError::InvalidCiphertext)?;
        check_version(*version)?;
        let envelope = wa::PreKeySignalMessage::decode(body)?;

        let peer_identity = strip_key_prefix(&envelope.identity_key)?;
        let base_key = strip_key_prefix(&envelope.base_key)?;

        if let Some(known) = self.store.load_peer_identity(&self.address.user)? {
            if known != peer_identity {
                return Err(SignalError::UntrustedIdentity(self.address.to_string()));
            }
        }

        let mut record = self.store.load_session(&self.address)?.unwrap_or_default();
        let base_key_b64 = STANDARD.encode(base_key);

        let mut consumed_pre_key = None;
        if record.session_by_base_key(&base_key_b64).is_none() {
            let signed_pre_key = self
                .store
                .load_signed_pre_key(envelope.signed_pre_key_id)?
                .ok_or(SignalError::MissingPreKey(envelope.signed_pre_key_id))?;
            let one_time = match envelope.pre_key_id {
                Some(id) => {
                    let key = self
                        .store
                        .load_pre_key(id)?
                        .ok_or(SignalError::MissingPreKey(id))?;
                    consumed_pre_key = Some(id);
                    Some(key)
                }
                None => None,
            };

            let entry = init_incoming_session(
                &self.store.local_identity()?,
                &signed_pre_key,
                one_time.as_ref(),
                peer_identity,
                base_key,
                envelope.registration_id,
            )?;
            record.promote(entry);
        }

        let our_identity = self.store.local_identity()?;
        let mut candidate = record
            .session_by_base_key(&base_key_b64)
            .cloned()
            .ok_or(SignalError::NoMatchingSession)?;
        let plaintext = decrypt_with_session(&mut candidate, &envelope.message, &our_identity)?;

        candidate.touch();
        record.put(candidate);
        self.store.store_session(&self.address, &record)?;
        self.store
            .store_peer_identity(&self.address.user, peer_identity)?;
        if let Some(id) = consumed_pre_key {
            self.store.remove_pre_key(id)?;
        }

        Ok(plaintext)
    }
}

fn decrypt_with_session(
    entry: &mut SessionEntry,
    bytes: &[u8],
    our_identity: &KeyPair,
) -> Result<Vec<u8>, SignalError> {
    let (version, _) = bytes.split_first().ok_or(SignalError::InvalidCiphertext)?;
    check_version(*version)?;
    if bytes.len() <= 1 + MAC_LENGTH {
        return Err(SignalError::InvalidCiphertext);
    }

    let (authenticated, mac) = bytes.split_at(bytes.len() - MAC_LENGTH);
    let message = wa::SignalMessage::decode(&authenticated[1..])?;
    let ratchet_key = strip_key_prefix(&message.ratchet_key)?;

    maybe_step_ratchet(entry, &ratchet_key, message.previous_counter)?;

    let their_identity = entry.index_info.remote_identity;
    let chain = entry
        .chain_mut(&ratchet_key)
        .ok_or(SignalError::InvalidCiphertext)?;
    if chain.chain_type == ChainType::Sending {
        return Err(SignalError::InvalidCiphertext);
    }

    fill_message_keys(chain, message.counter)?;
    let message_key = chain
        .message_keys
        .remove(&message.counter)
        .ok_or(SignalError::KeyReused(message.counter))?;
    let material = derive_message_material(&message_key);

    let expected = compute_mac(
        &material.mac_key,
        &their_identity,
        &our_identity.public,
        authenticated,
    );
    if expected.ct_eq(mac).unwrap_u8() == 0 {
        return Err(SignalError::MacMismatch);
    }

    aes_cbc_decrypt(&material.cipher_key, &material.iv, &message.ciphertext)
}

/// Runs the DH ratchet when a new remote ephemeral key appears.
fn maybe_step_ratchet(
    entry: &mut SessionEntry,
    remote_key: &[u8; 32],
    previous_counter: u32,
) -> Result<(), SignalError> {
    if entry.chain(remote_key).is_some() {
        return Ok(());
    }

    let last_remote = entry.current_ratchet.last_remote_ephemeral;
    if let Some(previous) = entry.chain_mut(&last_remote) {
        if previous.chain_type == ChainType::Receiving {
            fill_message_keys(previous, previous_counter)?;
            previous.chain_key.key = None;
        }
    }

    calculate_receiving_ratchet(entry, remote_key);

    let our_pub = entry.current_ratchet.ephemeral_key_pair.public;
    let sent_counter = entry
        .chain(&our_pub)
        .map(|sending| sending.chain_key.counter.max(0) as u32);
    if let Some(counter) = sent_counter {
        entry.current_ratchet.previous_counter = counter;
        entry.delete_chain(&our_pub);
    }

    entry.current_ratchet.ephemeral_key_pair = generate_keypair();
    calculate_sending_ratchet(entry, remote_key);
    entry.current_ratchet.last_remote_ephemeral = *remote_key;
    Ok(())
}

/// Advances a chain key through `counter`, banking skipped message keys.
fn fill_message_keys(chain: &mut Chain, counter: u32) -> Result<(), SignalError> {
    if chain.chain_key.counter >= counter as i32 {
        return Ok(());
    }

    if counter as i64 - chain.chain_key.counter as i64 > MAX_SKIPPED_MESSAGE_KEYS as i64 {
        return Err(SignalError::TooManySkipped);
    }

    while chain.chain_key.counter < counter as i32 {
        let key = chain.chain_key.key.ok_or(SignalError::ChainClosed)?;
        let next = (chain.chain_key.counter + 1) as u32;
        chain.message_keys.insert(next, hmac_sha256(&key, &[0x01]));
        if chain.message_keys.len() > MAX_SKIPPED_MESSAGE_KEYS {
            return Err(SignalError::TooManySkipped);
        }
        chain.chain_key.counter = next as i32;
        chain.chain_key.key = Some(hmac_sha256(&key, &[0x02]));
    }

    Ok(())
}

fn compute_mac(
    mac_key: &[u8; 32],
    sender_identity: &[u8; 32],
    receiver_identity: &[u8; 32],
    serialized: &[u8],
) -> [u8; MAC_LENGTH] {
    let mut mac = Hmac::<Sha256>::new_from_slice(mac_key)
        .expect("hmac accepts keys of any length");
    mac.update(&signal_public_key(sender_identity));
    mac.update(&signal_public_key(receiver_identity));
    mac.update(serialized);

    let full = mac.finalize().into_bytes();
    let mut out = [0_u8; MAC_LENGTH];
    out.copy_from_slice(&full[..MAC_LENGTH]);
    out
}

pub(crate) fn check_version(byte: u8) -> Result<(), SignalError> {
    if byte >> 4 != CIPHERTEXT_VERSION || byte & 0x0F != CIPHERTEXT_VERSION {
        return Err(SignalError::InvalidVersion(byte));
    }
    Ok(())
}

/// Accepts both bare and type-prefixed 32-byte public keys.
pub(crate) fn strip_key_prefix(bytes: &[u8]) -> Result<[u8; 32], SignalError> {
    let body = match bytes.len() {
        33 if bytes[0] == KEY_BUNDLE_TYPE => &bytes[1..],
        32 => bytes,
        _ => return Err(SignalError::InvalidCiphertext),
    };

    let mut out = [0_u8; 32];
    out.copy_from_slice(body);
    Ok(out)
}

fn aes_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new_from_slices(key, iv)
        .expect("fixed key and iv lengths")
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub(crate) fn aes_cbc_decrypt(
    key: &[u8; 32],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, SignalError> {
    Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| SignalError::InvalidCiphertext)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| SignalError::InvalidCiphertext)
}
