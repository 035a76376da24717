use prost::Message;

use crate::{
    error::SignalError,
    keys::verify_message,
    signal::{
        address::ProtocolAddress,
        cipher::{aes_cbc_decrypt, check_version, strip_key_prefix},
        kdf::{hkdf_expand, hmac_sha256},
        state::{SenderKeyRecord, MAX_SKIPPED_MESSAGE_KEYS},
    },
    store::{SenderKeyStore, SignalStore},
};
use waproto::wa;

const SIGNATURE_LENGTH: usize = 64;

/// Store key for a group sender chain.
pub fn sender_key_name(group: &str, sender: &ProtocolAddress) -> String {
    format!("{group}::{sender}")
}

/// Installs a sender key received out of band (distribution is external).
pub fn store_sender_key<S: SignalStore>(
    store: &S,
    name: &str,
    key_id: u32,
    iteration: u32,
    chain_key: [u8; 32],
    signature_key: &[u8],
) -> Result<(), SignalError> {
    let record = SenderKeyRecord {
        key_id,
        iteration,
        chain_key,
        signature_public: strip_key_prefix(signature_key)?,
        message_seeds: Default::default(),
    };
    store.store_sender_key(name, &record)?;
    Ok(())
}

/// Decrypts an `skmsg` envelope with a previously stored sender key.
pub fn decrypt_sender_key_message<S: SignalStore>(
    store: &S,
    name: &str,
    bytes: &[u8],
) -> Result<Vec<u8>, SignalError> {
    let (version, _) = bytes.split_first().ok_or(SignalError::InvalidCiphertext)?;
    check_version(*version)?;
    if bytes.len() <= 1 + SIGNATURE_LENGTH {
        return Err(SignalError::InvalidCiphertext);
    }

    let (signed, signature) = bytes.split_at(bytes.len() - SIGNATURE_LENGTH);
    let message = wa::SenderKeyMessage::decode(&signed[1..])?;

    let mut record = store
        .load_sender_key(name)?
        .ok_or_else(|| SignalError::NoSession(name.to_owned()))?;

    if !verify_message(record.signature_public, signed, signature) {
        return Err(SignalError::MacMismatch);
    }

    let seed = take_message_seed(&mut record, message.iteration)?;
    let mut material = [0_u8; 48];
    hkdf_expand(&seed, &[0_u8; 32], b"WhisperGroup", &mut material);

    let mut iv = [0_u8; 16];
    iv.copy_from_slice(&material[..16]);
    let mut cipher_key = [0_u8; 32];
    cipher_key.copy_from_slice(&material[16..]);

    let plaintext = aes_cbc_decrypt(&cipher_key, &iv, &message.ciphertext)?;
    store.store_sender_key(name, &record)?;
    Ok(plaintext)
}

/// Ratchets the sender chain to `iteration` and takes its message seed.
fn take_message_seed(
    record: &mut SenderKeyRecord,
    iteration: u32,
) -> Result<[u8; 32], SignalError> {
    if iteration < record.iteration {
        return record
            .message_seeds
            .remove(&iteration)
            .ok_or(SignalError::KeyReused(iteration));
    }

    if (iteration - record.iteration) as usize > MAX_SKIPPED_MESSAGE_KEYS {
        return Err(SignalError::TooManySkipped);
    }

    while record.iteration < iteration {
        let seed = hmac_sha256(&record.chain_key, &[0x01]);
        record.message_seeds.insert(record.iteration, seed);
        if record.message_seeds.len() > MAX_SKIPPED_MESSAGE_KEYS {
            return Err(SignalError::TooManySkipped);
        }
        record.chain_key = hmac_sha256(&record.chain_key, &[0x02]);
        record.iteration += 1;
    }

    let seed = hmac_sha256(&record.chain_key, &[0x01]);
    record.chain_key = hmac_sha256(&record.chain_key, &[0x02]);
    record.iteration += 1;
    Ok(seed)
}
