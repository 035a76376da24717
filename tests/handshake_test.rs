mod common;

use std::sync::Arc;
use std::time::Duration;

use wha_rs::{
    binary::BinaryNode, store::CredsStore, Client, ConnectionState, Credentials,
    DisconnectReason, Event, InMemoryStore, MeInfo, SocketConfig,
};

use common::noise_server::{install_test_root, test_root, ServerSession};
use common::ws_mock::start_single_client_server;

fn test_config(url: &str) -> SocketConfig {
    SocketConfig {
        websocket_url: url.to_owned(),
        origin: None,
        connect_timeout: Duration::from_secs(5),
        default_query_timeout: Duration::from_secs(5),
        ..SocketConfig::default()
    }
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
) -> anyhow::Result<Event> {
    Ok(tokio::time::timeout(Duration::from_secs(5), events.recv()).await??)
}

#[tokio::test]
async fn login_ping_and_stream_restart() -> anyhow::Result<()> {
    install_test_root();

    let server = start_single_client_server(|ws| async move {
        let mut session = ServerSession::new(ws);
        let (payload, _client_static) = session.accept_handshake(&test_root()).await?;

        assert_eq!(payload.username, 15550001111);
        assert!(payload.pull);
        assert!(!payload.passive);
        assert!(payload.device_pairing_data.is_none());

        session
            .send_node(
                &BinaryNode::new("success")
                    .attr("jid", "15550001111:0@s.whatsapp.net")
                    .attr("lid", "98765@lid")
                    .attr("pushname", "tester"),
            )
            .await?;

        session
            .send_node(
                &BinaryNode::new("iq")
                    .attr("from", "s.whatsapp.net")
                    .attr("type", "get")
                    .attr("xmlns", "urn:xmpp:ping")
                    .attr("id", "P1"),
            )
            .await?;

        let pong = session.next_node().await?;
        assert_eq!(pong.tag, "iq");
        assert_eq!(pong.get_attr("type"), Some("result"));
        assert_eq!(pong.get_attr("xmlns"), Some("w:p"));
        assert_eq!(pong.get_attr("id"), Some("P1"));

        session
            .send_node(&BinaryNode::new("stream:error").attr("code", "515"))
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
    let client = Client::new(test_config(&server.url), store.clone());
    let mut events = client.events();

    client.connect().await?;

    let mut saw_open = false;
    let mut close_error = None;
    loop {
        match next_event(&mut events).await? {
            Event::ConnectionUpdate {
                connection: Some(ConnectionState::Open),
                ..
            } => saw_open = true,
            Event::ConnectionUpdate {
                connection: Some(ConnectionState::Closed),
                error,
                ..
            } => {
                close_error = error;
                break;
            }
            _ => {}
        }
    }

    assert!(saw_open, "connection never reached open");
    assert_eq!(close_error, Some(DisconnectReason::RestartRequired));
    assert_eq!(client.state(), ConnectionState::Closed);

    // Login metadata was persisted before the close.
    let creds = store.credentials()?;
    assert_eq!(
        creds.me.as_ref().map(|me| me.name.as_deref()),
        Some(Some("tester"))
    );
    assert_eq!(
        creds.me.as_ref().and_then(|me| me.lid.as_deref()),
        Some("98765@lid")
    );

    server.finish().await?;
    Ok(())
}
