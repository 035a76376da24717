mod common;

use std::sync::Arc;
use std::time::Duration;

use prost::Message;

use wha_rs::{
    binary::BinaryNode,
    signal::{ProtocolAddress, SessionCipher},
    store::PreKeyStore,
    Client, ConnectionState, Credentials, Event, InMemoryStore, MeInfo, SocketConfig,
};

use common::noise_server::{install_test_root, test_root, ServerSession};
use common::ws_mock::start_single_client_server;

fn u24_be(value: u32) -> Vec<u8> {
    vec![
        ((value >> 16) & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (value & 0xFF) as u8,
    ]
}

fn bundle_reply(reply_id: &str, peer: &Credentials, one_time_pub: [u8; 32]) -> BinaryNode {
    let user = BinaryNode::new("user")
        .attr("jid", "15550002222@s.whatsapp.net")
        .children(vec![
            BinaryNode::new("registration").bytes(peer.registration_id.to_be_bytes().to_vec()),
            BinaryNode::new("identity").bytes(peer.signed_identity_key.public.to_vec()),
            BinaryNode::new("skey").children(vec![
                BinaryNode::new("id").bytes(u24_be(peer.signed_pre_key.id)),
                BinaryNode::new("value").bytes(peer.signed_pre_key.key_pair.public.to_vec()),
                BinaryNode::new("signature").bytes(peer.signed_pre_key.signature.to_vec()),
            ]),
            BinaryNode::new("key").children(vec![
                BinaryNode::new("id").bytes(u24_be(1)),
                BinaryNode::new("value").bytes(one_time_pub.to_vec()),
            ]),
        ]);

    BinaryNode::new("iq")
        .attr("id", reply_id)
        .attr("type", "result")
        .attr("from", "s.whatsapp.net")
        .children(vec![BinaryNode::new("list").children(vec![user])])
}

#[tokio::test]
async fn first_outbound_message_uses_pkmsg_and_resolves_on_ack() -> anyhow::Result<()> {
    install_test_root();

    // The recipient's store, used by the mock server to decrypt what the
    // client produced.
    let peer_creds = Credentials::new();
    let peer_store = Arc::new(InMemoryStore::new(peer_creds.clone()));
    let peer_one_time = wha_rs::generate_keypair();
    peer_store.store_pre_key(1, peer_one_time)?;
    let server_peer_store = peer_store.clone();
    let server_peer_creds = peer_creds.clone();

    let server = start_single_client_server(move |ws| async move {
        let mut session = ServerSession::new(ws);
        let _ = session.accept_handshake(&test_root()).await?;

        session
            .send_node(&BinaryNode::new("success").attr("jid", "15550001111:0@s.whatsapp.net"))
            .await?;

        // Pre-key fetch for the previously unknown recipient.
        let key_query = session.next_node().await?;
        assert_eq!(key_query.tag, "iq");
        assert_eq!(key_query.get_attr("xmlns"), Some("encrypt"));
        assert_eq!(key_query.get_attr("type"), Some("get"));
        let query_id = key_query.get_attr("id").expect("query id").to_owned();
        session
            .send_node(&bundle_reply(&query_id, &server_peer_creds, peer_one_time.public))
            .await?;

        // The message itself: one stanza, pkmsg payload.
        let message = session.next_node().await?;
        assert_eq!(message.tag, "message");
        assert_eq!(
            message.get_attr("to"),
            Some("15550002222@s.whatsapp.net")
        );
        assert_eq!(message.get_attr("type"), Some("text"));
        let enc = message.find_child("enc").expect("enc child");
        assert_eq!(enc.get_attr("v"), Some("2"));
        assert_eq!(enc.get_attr("type"), Some("pkmsg"));
        let ciphertext = enc.content_bytes().expect("ciphertext").to_vec();

        // Decrypt on the recipient side and check the plaintext.
        let sender = ProtocolAddress::new("15550001111", 0);
        let cipher = SessionCipher::new(server_peer_store.as_ref(), sender);
        let padded = cipher.decrypt_pre_key_whisper_message(&ciphertext)?;
        let pad = *padded.last().expect("padded") as usize;
        let decoded = waproto::wa::Message::decode(&padded[..padded.len() - pad])?;
        assert_eq!(decoded.conversation.as_deref(), Some("hi"));

        // The consumed one-time pre-key is gone.
        assert!(server_peer_store.load_pre_key(1)?.is_none());

        let message_id = message.get_attr("id").expect("message id").to_owned();
        session
            .send_node(&BinaryNode::new("ack").attr("id", message_id))
            .await?;
        Ok(())
    })
    .await?;

    let mut creds = Credentials::new();
    creds.me = Some(MeInfo {
        jid: "15550001111:0@s.whatsapp.net".to_owned(),
        name: None,
        lid: None,
    });
    let store = Arc::new(InMemoryStore::new(creds));
    let config = SocketConfig {
        websocket_url: server.url.clone(),
        origin: None,
        connect_timeout: Duration::from_secs(5),
        default_query_timeout: Duration::from_secs(5),
        ..SocketConfig::default()
    };
    let client = Client::new(config, store);
    let mut events = client.events();

    client.connect().await?;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
        if matches!(
            event,
            Event::ConnectionUpdate {
                connection: Some(ConnectionState::Open),
                ..
            }
        ) {
            break;
        }
    }

    let receipt = client.send_text("15550002222@s.whatsapp.net", "hi").await?;
    assert!(!receipt.message_id.is_empty());

    client.close().await;
    server.finish().await?;
    Ok(())
}
