use tokio::sync::broadcast;

use crate::{binary::BinaryNode, creds::MeInfo};

/// Lifecycle states of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Handshaking,
    Authenticating,
    Open,
    Closing,
}

/// Why a connection ended, carried on close updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly local or server close.
    Closed,
    /// `stream:error` with code 515; the caller should reconnect.
    RestartRequired,
    /// Server rejected login with the given status.
    LoginFailed(u16),
    /// `stream:error` with any other code.
    StreamError(u16),
    /// Transport or crypto failure, stringified.
    Fatal(String),
}

/// Subset of credential fields that changed, emitted after persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredsDelta {
    pub me: Option<MeInfo>,
    pub platform: Option<String>,
    pub registered: Option<bool>,
}

/// Events emitted to the library caller.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connection lifecycle change, QR payload, or terminal error.
    ConnectionUpdate {
        connection: Option<ConnectionState>,
        is_new_login: bool,
        qr: Option<String>,
        error: Option<DisconnectReason>,
    },
    /// Credentials were mutated and persisted.
    CredsUpdate(CredsDelta),
    /// A stanza arrived (after transport decryption and decoding).
    NodeReceived(BinaryNode),
    /// A stanza was encoded and handed to the socket.
    NodeSent(BinaryNode),
    /// An inbound message decrypted successfully.
    MessageReceived {
        message: waproto::wa::Message,
        sender: String,
        raw: BinaryNode,
    },
    /// An inbound message failed to decrypt.
    MessageDecryptionError {
        error: String,
        sender: Option<String>,
        raw: BinaryNode,
    },
}

/// Broadcast fanout for [`Event`]; receivers cancel by dropping.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus with the given per-receiver buffer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes a new receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emits an event; silently drops it when nobody listens.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Convenience for a bare state-change update.
    pub fn emit_connection(&self, connection: ConnectionState) {
        self.emit(Event::ConnectionUpdate {
            connection: Some(connection),
            is_new_login: false,
            qr: None,
            error: None,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}
