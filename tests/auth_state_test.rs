use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use prost::Message;
use sha2::Sha256;

use wha_rs::{
    auth::{AuthPhase, AuthUpdate, Authenticator},
    binary::BinaryNode,
    error::{ClientError, PairingError},
    keys::{generate_keypair, sign_message, verify_message},
    store::{CredsStore, InMemoryStore},
    Credentials, DisconnectReason, Event, EventBus,
};
use waproto::wa;

fn setup() -> (
    Authenticator<InMemoryStore>,
    Arc<InMemoryStore>,
    tokio::sync::broadcast::Receiver<Event>,
) {
    let store = Arc::new(InMemoryStore::new(Credentials::new()));
    let events = EventBus::new(64);
    let rx = events.subscribe();
    (Authenticator::new(store.clone(), events), store, rx)
}

fn pair_device_node() -> BinaryNode {
    BinaryNode::new("iq")
        .attr("from", "s.whatsapp.net")
        .attr("id", "pd-1")
        .attr("type", "set")
        .children(vec![BinaryNode::new("pair-device").children(vec![
            BinaryNode::new("ref").bytes(b"2@ref-one".to_vec()),
            BinaryNode::new("ref").bytes(b"2@ref-two".to_vec()),
        ])])
}

fn next_qr(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Option<String> {
    while let Ok(event) = rx.try_recv() {
        if let Event::ConnectionUpdate { qr: Some(qr), .. } = event {
            return Some(qr);
        }
    }
    None
}

#[test]
fn pair_device_issues_and_rotates_qr() -> anyhow::Result<()> {
    let (mut auth, _store, mut rx) = setup();

    let outcome = auth.handle_stanza(&pair_device_node())?;
    assert_eq!(auth.phase(), AuthPhase::AwaitingQr);
    assert_eq!(outcome.update, Some(AuthUpdate::QrIssued(Duration::from_secs(60))));

    let ack = &outcome.replies[0];
    assert_eq!(ack.tag, "iq");
    assert_eq!(ack.get_attr("id"), Some("pd-1"));
    assert_eq!(ack.get_attr("type"), Some("result"));

    let qr = next_qr(&mut rx).expect("first qr emitted");
    assert!(qr.starts_with("2@ref-one,"));
    assert_eq!(qr.split(',').count(), 4);

    let rotated = auth.rotate_qr()?;
    assert_eq!(
        rotated.update,
        Some(AuthUpdate::QrIssued(Duration::from_secs(20)))
    );
    let qr = next_qr(&mut rx).expect("second qr emitted");
    assert!(qr.starts_with("2@ref-two,"));

    let exhausted = auth.rotate_qr();
    assert!(matches!(
        exhausted,
        Err(ClientError::Pairing(PairingError::NoMoreRefs))
    ));
    Ok(())
}

#[test]
fn pair_success_verifies_and_signs_the_device_identity() -> anyhow::Result<()> {
    let (mut auth, store, mut rx) = setup();
    let creds = store.credentials()?;
    let identity_pub = creds.signed_identity_key.public;

    // Primary-account side of the ADV exchange.
    let account = generate_keypair();
    let device_details = wa::AdvDeviceIdentity {
        raw_id: 77,
        timestamp: 1_700_000_000,
        key_index: 1,
    }
    .encode_to_vec();

    let mut account_message = vec![0x06, 0x00];
    account_message.extend_from_slice(&device_details);
    account_message.extend_from_slice(&identity_pub);
    let account_signature = sign_message(account.private, account.public, &account_message);

    let signed_identity = wa::AdvSignedDeviceIdentity {
        details: device_details.clone(),
        account_signature_key: account.public.to_vec(),
        account_signature: account_signature.to_vec(),
        device_signature: Vec::new(),
    };
    let details = signed_identity.encode_to_vec();

    let mut mac = Hmac::<Sha256>::new_from_slice(&creds.adv_secret_key)?;
    mac.update(&details);
    let envelope = wa::AdvSignedDeviceIdentityHmac {
        details,
        hmac: mac.finalize().into_bytes().to_vec(),
    }
    .encode_to_vec();

    let node = BinaryNode::new("iq")
        .attr("from", "s.whatsapp.net")
        .attr("id", "ps-1")
        .attr("type", "result")
        .children(vec![BinaryNode::new("pair-success").children(vec![
            BinaryNode::new("device-identity").bytes(envelope),
            BinaryNode::new("device").attr("jid", "15550001111:14@s.whatsapp.net"),
            BinaryNode::new("platform").attr("name", "smba"),
        ])]);

    let outcome = auth.handle_stanza(&node)?;
    assert_eq!(auth.phase(), AuthPhase::Authenticated);
    assert_eq!(outcome.update, Some(AuthUpdate::PairedNewLogin));

    // The reply carries the signed identity without the account key.
    let reply = &outcome.replies[0];
    assert_eq!(reply.get_attr("id"), Some("ps-1"));
    let sign = reply.find_child("pair-device-sign").expect("sign child");
    let identity_node = sign.find_child("device-identity").expect("identity child");
    assert_eq!(identity_node.get_attr("key-index"), Some("1"));

    let replied =
        wa::AdvSignedDeviceIdentity::decode(identity_node.content_bytes().expect("bytes"))?;
    assert!(replied.account_signature_key.is_empty());

    let mut device_message = vec![0x06, 0x01];
    device_message.extend_from_slice(&device_details);
    device_message.extend_from_slice(&identity_pub);
    device_message.extend_from_slice(&account.public);
    assert!(verify_message(
        identity_pub,
        &device_message,
        &replied.device_signature
    ));

    // Credentials were persisted before the events fired.
    let updated = store.credentials()?;
    assert!(updated.registered);
    assert_eq!(
        updated.me.as_ref().map(|me| me.jid.as_str()),
        Some("15550001111:14@s.whatsapp.net")
    );
    assert_eq!(
        updated
            .signal_identities
            .get("15550001111:14@s.whatsapp.net"),
        Some(&account.public)
    );

    let mut saw_new_login = false;
    while let Ok(event) = rx.try_recv() {
        if let Event::ConnectionUpdate {
            is_new_login: true, ..
        } = event
        {
            saw_new_login = true;
        }
    }
    assert!(saw_new_login);
    Ok(())
}

#[test]
fn tampered_hmac_is_rejected() -> anyhow::Result<()> {
    let (mut auth, _store, _rx) = setup();

    let envelope = wa::AdvSignedDeviceIdentityHmac {
        details: vec![1, 2, 3],
        hmac: vec![0; 32],
    }
    .encode_to_vec();

    let node = BinaryNode::new("iq")
        .attr("id", "ps-2")
        .children(vec![BinaryNode::new("pair-success").children(vec![
            BinaryNode::new("device-identity").bytes(envelope),
            BinaryNode::new("device").attr("jid", "1:1@s.whatsapp.net"),
        ])]);

    let result = auth.handle_stanza(&node);
    assert!(matches!(
        result,
        Err(ClientError::Pairing(PairingError::AdvHmacInvalid))
    ));
    assert_eq!(auth.phase(), AuthPhase::Failed);
    Ok(())
}

#[test]
fn success_and_failure_stanzas_drive_terminal_states() -> anyhow::Result<()> {
    let (mut auth, store, _rx) = setup();

    let success = BinaryNode::new("success")
        .attr("jid", "15550001111:0@s.whatsapp.net")
        .attr("pushname", "someone")
        .attr("platform", "web");
    let outcome = auth.handle_stanza(&success)?;
    assert_eq!(outcome.update, Some(AuthUpdate::LoggedIn));
    assert_eq!(auth.phase(), AuthPhase::Authenticated);
    assert_eq!(
        store.credentials()?.platform.as_deref(),
        Some("web")
    );

    let failure = BinaryNode::new("failure").attr("reason", "401");
    let outcome = auth.handle_stanza(&failure)?;
    assert_eq!(
        outcome.update,
        Some(AuthUpdate::Failed(DisconnectReason::LoginFailed(401)))
    );
    assert_eq!(auth.phase(), AuthPhase::Failed);
    Ok(())
}

#[test]
fn offline_preview_is_answered_once() -> anyhow::Result<()> {
    let (mut auth, _store, _rx) = setup();

    let preview =
        BinaryNode::new("ib").children(vec![BinaryNode::new("offline_preview").attr("count", "5")]);

    let first = auth.handle_stanza(&preview)?;
    assert_eq!(first.replies.len(), 1);
    let batch = first.replies[0]
        .find_child("offline_batch")
        .expect("offline_batch");
    assert_eq!(batch.get_attr("count"), Some("30"));

    let second = auth.handle_stanza(&preview)?;
    assert!(second.replies.is_empty());
    Ok(())
}
