use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::{
    auth::{AuthOutcome, AuthUpdate, Authenticator},
    binary::{self, BinaryNode},
    config::SocketConfig,
    error::{ClientError, TransportError},
    events::{ConnectionState, DisconnectReason, Event, EventBus},
    frame::{FrameDecoder, FrameEncoder},
    handshake::perform_handshake,
    keys::{generate_keypair, random_bytes},
    noise::{NoiseReader, NoiseWriter},
    recv,
    signal::AddressLocks,
    store::{CredsStore, SignalStore},
    transport::{WsSink, WsSource, WsTransport},
};

/// How long the send path waits for a message ack.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the multi-device chat protocol.
///
/// Owns the socket lifecycle: handshake, stanza dispatch, the send lock and
/// reconnection. All I/O beyond `connect` happens on the internal receive
/// task; callers observe it through the event stream.
pub struct Client<S: SignalStore + Send + Sync + 'static> {
    pub(crate) shared: Arc<Shared<S>>,
}

impl<S: SignalStore + Send + Sync + 'static> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) struct Shared<S: SignalStore + Send + Sync + 'static> {
    pub(crate) config: SocketConfig,
    pub(crate) store: Arc<S>,
    pub(crate) events: EventBus,
    pub(crate) state: StdMutex<ConnectionState>,
    pub(crate) sender: Mutex<Option<SendHalf>>,
    pub(crate) pending: DashMap<String, oneshot::Sender<BinaryNode>>,
    pub(crate) address_locks: AddressLocks,
    pub(crate) auth: Mutex<Authenticator<S>>,
    pub(crate) qr_timer: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) retry_sent: DashMap<String, ()>,
    msg_counter: AtomicU64,
}

/// Everything frame emission needs, guarded together by the send lock so
/// AEAD nonces advance monotonically with byte order.
pub(crate) struct SendHalf {
    sink: WsSink,
    encoder: FrameEncoder,
    writer: NoiseWriter,
}

impl<S: SignalStore + Send + Sync + 'static> Client<S> {
    /// Creates an unconnected client around a store.
    pub fn new(config: SocketConfig, store: Arc<S>) -> Self {
        let events = EventBus::default();
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default();

        let shared = Arc::new(Shared {
            config,
            store: store.clone(),
            events: events.clone(),
            state: StdMutex::new(ConnectionState::Closed),
            sender: Mutex::new(None),
            pending: DashMap::new(),
            address_locks: AddressLocks::new(),
            auth: Mutex::new(Authenticator::new(store, events)),
            qr_timer: StdMutex::new(None),
            retry_sent: DashMap::new(),
            msg_counter: AtomicU64::new(epoch),
        });

        Self { shared }
    }

    /// Subscribes to the client event stream; drop the receiver to cancel.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Opens the socket, runs the handshake and starts the receive task.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.shared.state() != ConnectionState::Closed {
            return Err(ClientError::NotConnected);
        }

        match self.connect_inner().await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.shared.set_state(ConnectionState::Closed);
                Err(error)
            }
        }
    }

    async fn connect_inner(&self) -> Result<(), ClientError> {
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.events.emit_connection(ConnectionState::Connecting);

        // Each session handshakes with a fresh ephemeral pair.
        let creds = self.shared.store.update_credentials(&mut |creds| {
            creds.pairing_ephemeral_key = generate_keypair();
        })?;

        let transport = WsTransport::connect(
            &self.shared.config.websocket_url,
            self.shared.config.origin.as_deref(),
            self.shared.config.connect_timeout,
        )
        .await?;
        let (mut sink, mut source) = transport.split();

        self.shared.set_state(ConnectionState::Handshaking);
        let mut encoder = FrameEncoder::new(creds.routing_info.as_deref());
        let mut decoder = FrameDecoder::new();

        let outcome = tokio::time::timeout(
            self.shared.config.connect_timeout,
            perform_handshake(
                &mut sink,
                &mut source,
                &mut encoder,
                &mut decoder,
                &creds,
                &self.shared.config,
            ),
        )
        .await
        .map_err(|_| ClientError::Timeout("handshake"))??;

        {
            let mut guard = self.shared.sender.lock().await;
            *guard = Some(SendHalf {
                sink,
                encoder,
                writer: outcome.writer,
            });
        }

        self.shared.set_state(ConnectionState::Authenticating);
        self.shared
            .events
            .emit_connection(ConnectionState::Authenticating);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            recv_loop(shared, source, decoder, outcome.reader).await;
        });

        Ok(())
    }

    /// Closes the connection and cancels pending waiters.
    pub async fn close(&self) {
        self.shared.close_with(DisconnectReason::Closed, false).await;
    }

    /// Fully tears down and redials; used after `isNewLogin` pairing.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.close().await;
        self.connect().await
    }

    /// Encodes, encrypts and writes one stanza under the send lock.
    pub async fn send_node(&self, node: BinaryNode) -> Result<(), ClientError> {
        self.shared.send_node(node).await
    }

    /// Sends an iq carrying a generated id and awaits the matching reply.
    pub async fn query(&self, mut node: BinaryNode) -> Result<BinaryNode, ClientError> {
        let id = match node.get_attr("id") {
            Some(id) => id.to_owned(),
            None => {
                let id = self.generate_message_id();
                node = node.attr("id", id.clone());
                id
            }
        };

        let rx = self.shared.register_pending(&id);
        self.shared.send_node(node).await?;

        match tokio::time::timeout(self.shared.config.default_query_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(ClientError::Timeout("query reply"))
            }
        }
    }

    /// Generates a message id of the form `ABCD.EF12-<counter>`.
    pub fn generate_message_id(&self) -> String {
        let left: [u8; 2] = random_bytes();
        let right: [u8; 2] = random_bytes();
        let counter = self.shared.msg_counter.fetch_add(1, Ordering::SeqCst);
        format!(
            "{:02X}{:02X}.{:02X}{:02X}-{}",
            left[0], left[1], right[0], right[1], counter
        )
    }
}

impl<S: SignalStore + Send + Sync + 'static> Shared<S> {
    pub(crate) fn state(&self) -> ConnectionState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    pub(crate) fn register_pending(&self, id: &str) -> oneshot::Receiver<BinaryNode> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_owned(), tx);
        rx
    }

    pub(crate) async fn send_node(&self, node: BinaryNode) -> Result<(), ClientError> {
        if !matches!(
            self.state(),
            ConnectionState::Open | ConnectionState::Authenticating
        ) {
            return Err(ClientError::NotConnected);
        }

        let encoded = binary::encode(&node)?;

        let mut guard = self.sender.lock().await;
        let half = guard.as_mut().ok_or(ClientError::NotConnected)?;
        let ciphertext = half.writer.encrypt(&encoded)?;
        let framed = half.encoder.encode(&ciphertext)?;
        half.sink.send_raw(&framed).await?;
        drop(guard);

        self.events.emit(Event::NodeSent(node));
        Ok(())
    }

    pub(crate) async fn close_with(&self, reason: DisconnectReason, emit_error: bool) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closing);

        if let Some(timer) = self
            .qr_timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            timer.abort();
        }

        if let Some(mut half) = self.sender.lock().await.take() {
            let _ = half.sink.close().await;
        }

        // Dropping the senders wakes every ack waiter with ConnectionClosed.
        self.pending.clear();
        self.retry_sent.clear();
        self.auth.lock().await.on_close();

        self.set_state(ConnectionState::Closed);
        self.events.emit(Event::ConnectionUpdate {
            connection: Some(ConnectionState::Closed),
            is_new_login: false,
            qr: None,
            error: if emit_error { Some(reason) } else { None },
        });
    }

    fn schedule_qr_rotation(self: &Arc<Self>, first_validity: Duration) {
        let shared = self.clone();
        let handle = tokio::spawn(async move {
            let mut validity = first_validity;
            loop {
                tokio::time::sleep(validity).await;
                let rotated = {
                    let mut auth = shared.auth.lock().await;
                    auth.rotate_qr()
                };
                match rotated {
                    Ok(outcome) => match outcome.update {
                        Some(AuthUpdate::QrIssued(next)) => validity = next,
                        _ => break,
                    },
                    Err(error) => {
                        tracing::warn!(error = %error, "qr rotation exhausted");
                        shared
                            .close_with(DisconnectReason::Fatal(error.to_string()), true)
                            .await;
                        break;
                    }
                }
            }
        });

        let mut guard = self
            .qr_timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }
}

async fn recv_loop<S: SignalStore + Send + Sync + 'static>(
    shared: Arc<Shared<S>>,
    mut source: WsSource,
    mut decoder: FrameDecoder,
    mut reader: NoiseReader,
) {
    loop {
        let chunk = match source.next_chunk().await {
            Ok(chunk) => chunk,
            Err(error) => {
                handle_transport_end(&shared, error).await;
                return;
            }
        };

        decoder.push(&chunk);
        while let Some(frame) = decoder.pop_frame() {
            if let Err(reason) = handle_frame(&shared, frame, &mut reader).await {
                shared.close_with(reason, true).await;
                return;
            }
        }
    }
}

async fn handle_transport_end<S: SignalStore + Send + Sync + 'static>(
    shared: &Arc<Shared<S>>,
    error: TransportError,
) {
    if matches!(
        shared.state(),
        ConnectionState::Closing | ConnectionState::Closed
    ) {
        return;
    }
    tracing::debug!(error = %error, "socket ended");
    shared
        .close_with(DisconnectReason::Fatal(error.to_string()), true)
        .await;
}

async fn handle_frame<S: SignalStore + Send + Sync + 'static>(
    shared: &Arc<Shared<S>>,
    frame: Bytes,
    reader: &mut NoiseReader,
) -> Result<(), DisconnectReason> {
    let payload = reader
        .decrypt(&frame)
        .map_err(|error| DisconnectReason::Fatal(error.to_string()))?;

    // A stanza that fails to decode is fatal at the transport layer;
    // message-scoped decode problems surface later as decryption errors.
    let node = binary::decode(&payload)
        .map_err(|error| DisconnectReason::Fatal(error.to_string()))?;

    dispatch(shared, node).await
}

async fn dispatch<S: SignalStore + Send + Sync + 'static>(
    shared: &Arc<Shared<S>>,
    node: BinaryNode,
) -> Result<(), DisconnectReason> {
    shared.events.emit(Event::NodeReceived(node.clone()));

    // Replies awaited by id win over every other route.
    if matches!(node.tag.as_str(), "iq" | "ack") {
        if let Some(id) = node.get_attr("id") {
            if let Some((_, tx)) = shared.pending.remove(id) {
                let _ = tx.send(node);
                return Ok(());
            }
        }
    }

    if node.tag == "iq"
        && node.get_attr("xmlns") == Some("urn:xmpp:ping")
        && node.get_attr("type") == Some("get")
    {
        let mut pong = BinaryNode::new("iq")
            .attr("to", node.get_attr("from").unwrap_or("s.whatsapp.net"))
            .attr("type", "result")
            .attr("xmlns", "w:p");
        if let Some(id) = node.get_attr("id") {
            pong = pong.attr("id", id);
        }
        if let Err(error) = shared.send_node(pong).await {
            tracing::warn!(error = %error, "failed to answer ping");
        }
        return Ok(());
    }

    if node.tag == "stream:error" {
        let code = node
            .get_attr("code")
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(0);
        return Err(if code == 515 {
            DisconnectReason::RestartRequired
        } else {
            DisconnectReason::StreamError(code)
        });
    }

    if node.tag == "xmlstreamend" {
        return Err(DisconnectReason::Closed);
    }

    let outcome = {
        let mut auth = shared.auth.lock().await;
        auth.handle_stanza(&node)
            .map_err(|error| DisconnectReason::Fatal(error.to_string()))?
    };
    let handled = outcome.handled;
    apply_auth_outcome(shared, outcome).await?;
    if handled {
        return Ok(());
    }

    if node.tag == "message" {
        recv::process_message(shared, node).await;
    }

    Ok(())
}

async fn apply_auth_outcome<S: SignalStore + Send + Sync + 'static>(
    shared: &Arc<Shared<S>>,
    outcome: AuthOutcome,
) -> Result<(), DisconnectReason> {
    for reply in outcome.replies {
        shared
            .send_node(reply)
            .await
            .map_err(|error| DisconnectReason::Fatal(error.to_string()))?;
    }

    match outcome.update {
        Some(AuthUpdate::QrIssued(validity)) => shared.schedule_qr_rotation(validity),
        Some(AuthUpdate::PairedNewLogin) => {
            // The server closes after pair-success; the caller reconnects on
            // the isNewLogin update the authenticator already emitted.
        }
        Some(AuthUpdate::LoggedIn) => {
            shared.set_state(ConnectionState::Open);
            shared.events.emit_connection(ConnectionState::Open);
        }
        Some(AuthUpdate::Failed(reason)) => return Err(reason),
        None => {}
    }

    Ok(())
}
