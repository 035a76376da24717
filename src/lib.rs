//! Client library for the WhatsApp multi-device protocol: Noise XX transport,
//! binary stanza codec, QR pairing, and Signal Double Ratchet messaging.

pub mod auth;
pub mod binary;
pub mod config;
pub mod conn;
pub mod creds;
pub mod error;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod keys;
pub mod noise;
pub mod qr;
pub mod recv;
pub mod send;
pub mod signal;
pub mod store;
pub mod transport;

pub use auth::{AuthPhase, Authenticator};
pub use binary::{BinaryNode, Jid, NodeContent};
pub use config::SocketConfig;
pub use conn::Client;
pub use creds::{Credentials, MeInfo};
pub use error::{
    BinaryNodeError, ClientError, HandshakeError, NoiseError, PairingError, SignalError,
    StoreError, TransportError,
};
pub use events::{ConnectionState, DisconnectReason, Event, EventBus};
pub use keys::{generate_keypair, generate_registration_id, KeyPair};
pub use send::SendReceipt;
pub use signal::{ProtocolAddress, SessionCipher};
pub use store::{InMemoryStore, SignalStore};
