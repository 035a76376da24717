use std::sync::Arc;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use prost::Message;
use sha2::Sha256;

use wha_rs::{
    creds::Credentials,
    error::SignalError,
    keys::{sign_message, signal_public_key},
    signal::{
        group, init_outgoing_session, CiphertextKind, PreKeyBundle, ProtocolAddress,
        SessionCipher, SessionRecord,
    },
    store::{IdentityStore, InMemoryStore, PreKeyStore, SessionStore},
};
use waproto::wa;

struct Party {
    creds: Credentials,
    store: Arc<InMemoryStore>,
}

fn party() -> Party {
    let creds = Credentials::new();
    let store = Arc::new(InMemoryStore::new(creds.clone()));
    Party { creds, store }
}

fn bundle_for(peer: &Party, one_time_pub: Option<[u8; 32]>) -> PreKeyBundle {
    PreKeyBundle {
        registration_id: peer.creds.registration_id,
        identity_key: peer.creds.signed_identity_key.public,
        signed_pre_key_id: peer.creds.signed_pre_key.id,
        signed_pre_key: peer.creds.signed_pre_key.key_pair.public,
        signed_pre_key_signature: peer.creds.signed_pre_key.signature.to_vec(),
        pre_key_id: one_time_pub.map(|_| 7),
        pre_key: one_time_pub,
    }
}

/// Alice bootstraps a session toward Bob and stores it under his address.
fn establish(alice: &Party, bob: &Party, bob_address: &ProtocolAddress) -> anyhow::Result<()> {
    let one_time = wha_rs::generate_keypair();
    bob.store.store_pre_key(7, one_time)?;

    let bundle = bundle_for(bob, Some(one_time.public));
    let entry = init_outgoing_session(&alice.store.local_identity()?, &bundle)?;

    let mut record = SessionRecord::new();
    record.promote(entry);
    alice.store.store_session(bob_address, &record)?;
    Ok(())
}

#[test]
fn prekey_message_roundtrip_and_reply() -> anyhow::Result<()> {
    let alice = party();
    let bob = party();
    let bob_address = ProtocolAddress::new("bob", 0);
    let alice_address = ProtocolAddress::new("alice", 0);
    establish(&alice, &bob, &bob_address)?;

    let alice_cipher = SessionCipher::new(alice.store.as_ref(), bob_address.clone());
    let bob_cipher = SessionCipher::new(bob.store.as_ref(), alice_address.clone());

    let first = alice_cipher.encrypt(b"hello bob")?;
    assert_eq!(first.kind, CiphertextKind::PreKey);
    let plaintext = bob_cipher.decrypt_pre_key_whisper_message(&first.bytes)?;
    assert_eq!(plaintext, b"hello bob");

    // The referenced one-time pre-key is consumed exactly on success.
    assert!(bob.store.load_pre_key(7)?.is_none());

    let reply = bob_cipher.encrypt(b"hello alice")?;
    assert_eq!(reply.kind, CiphertextKind::Whisper);
    let reply_plaintext = alice_cipher.decrypt_whisper_message(&reply.bytes)?;
    assert_eq!(reply_plaintext, b"hello alice");

    // Alice's pending pre-key is cleared once she hears back, so further
    // messages travel as plain ratchet envelopes.
    let second = alice_cipher.encrypt(b"again")?;
    assert_eq!(second.kind, CiphertextKind::Whisper);
    assert_eq!(bob_cipher.decrypt_whisper_message(&second.bytes)?, b"again");

    Ok(())
}

#[test]
fn out_of_order_messages_use_skipped_keys() -> anyhow::Result<()> {
    let alice = party();
    let bob = party();
    let bob_address = ProtocolAddress::new("bob", 0);
    let alice_address = ProtocolAddress::new("alice", 0);
    establish(&alice, &bob, &bob_address)?;

    let alice_cipher = SessionCipher::new(alice.store.as_ref(), bob_address);
    let bob_cipher = SessionCipher::new(bob.store.as_ref(), alice_address);

    let m1 = alice_cipher.encrypt(b"one")?;
    let m2 = alice_cipher.encrypt(b"two")?;
    let m3 = alice_cipher.encrypt(b"three")?;

    assert_eq!(
        bob_cipher.decrypt_pre_key_whisper_message(&m3.bytes)?,
        b"three"
    );
    assert_eq!(bob_cipher.decrypt_pre_key_whisper_message(&m1.bytes)?, b"one");
    assert_eq!(bob_cipher.decrypt_pre_key_whisper_message(&m2.bytes)?, b"two");

    // Replaying an already-consumed counter is rejected.
    let replay = bob_cipher.decrypt_pre_key_whisper_message(&m1.bytes);
    assert!(matches!(replay, Err(SignalError::KeyReused(_))));

    Ok(())
}

#[test]
fn counter_gap_beyond_window_fails() -> anyhow::Result<()> {
    let alice = party();
    let bob = party();
    let bob_address = ProtocolAddress::new("bob", 0);
    let alice_address = ProtocolAddress::new("alice", 0);
    establish(&alice, &bob, &bob_address)?;

    let alice_cipher = SessionCipher::new(alice.store.as_ref(), bob_address);
    let bob_cipher = SessionCipher::new(bob.store.as_ref(), alice_address);

    let mut last = None;
    for _ in 0..2002 {
        last = Some(alice_cipher.encrypt(b"flood")?);
    }
    let last = last.expect("at least one message");

    let result = bob_cipher.decrypt_pre_key_whisper_message(&last.bytes);
    assert!(matches!(result, Err(SignalError::TooManySkipped)));
    Ok(())
}

#[test]
fn encrypt_without_session_fails() {
    let alice = party();
    let cipher = SessionCipher::new(alice.store.as_ref(), ProtocolAddress::new("nobody", 0));
    assert!(matches!(
        cipher.encrypt(b"payload"),
        Err(SignalError::NoSession(_))
    ));
}

#[test]
fn sender_key_message_decrypts_with_stored_key() -> anyhow::Result<()> {
    let receiver = party();
    let signing = wha_rs::generate_keypair();
    let chain_key = [9_u8; 32];
    let name = group::sender_key_name(
        "12036304@g.us",
        &ProtocolAddress::new("15550002222", 0),
    );

    group::store_sender_key(
        receiver.store.as_ref(),
        &name,
        1,
        0,
        chain_key,
        &signal_public_key(&signing.public),
    )?;

    // Build iteration-0 ciphertext the way the sending side would.
    let seed = hmac_sha256(&chain_key, &[0x01]);
    let mut material = [0_u8; 48];
    Hkdf::<Sha256>::new(Some(&[0_u8; 32]), &seed)
        .expand(b"WhisperGroup", &mut material)
        .expect("hkdf");
    let iv: [u8; 16] = material[..16].try_into()?;
    let key: [u8; 32] = material[16..].try_into()?;
    let ciphertext = cbc::Encryptor::<aes::Aes256>::new_from_slices(&key, &iv)?
        .encrypt_padded_vec_mut::<Pkcs7>(b"group hello");

    let proto = wa::SenderKeyMessage {
        id: 1,
        iteration: 0,
        ciphertext,
    };
    let mut serialized = vec![0x33_u8];
    proto.encode(&mut serialized)?;
    let signature = sign_message(signing.private, signing.public, &serialized);
    serialized.extend_from_slice(&signature);

    let plaintext = group::decrypt_sender_key_message(receiver.store.as_ref(), &name, &serialized)?;
    assert_eq!(plaintext, b"group hello");

    // A second delivery of the same iteration is rejected.
    let replay = group::decrypt_sender_key_message(receiver.store.as_ref(), &name, &serialized);
    assert!(matches!(replay, Err(SignalError::KeyReused(_))));
    Ok(())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac key");
    mac.update(data);
    let mut out = [0_u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}
