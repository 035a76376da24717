use thiserror::Error;

/// Errors for websocket transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to open socket: {0}")]
    SocketOpenFailed(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("invalid websocket request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("socket closed by peer (code {code}, reason {reason})")]
    SocketClosed { code: u16, reason: String },
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("declared frame length {0} exceeds the 16 MiB limit")]
    FrameTooLarge(usize),
}

/// Errors for the Noise processor and its AEAD transport phase.
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("aead authentication failed")]
    AeadAuthFailed,
    #[error("invalid key material for {0}")]
    InvalidKeyMaterial(&'static str),
    #[error("aead nonce counter overflow")]
    NonceOverflow,
}

/// Reasons a handshake may be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailReason {
    /// Server certificate chain did not verify.
    CertInvalid,
    /// A required handshake field was absent.
    MissingField,
    /// Handshake frame could not be decoded.
    BadFrame,
}

impl std::fmt::Display for HandshakeFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CertInvalid => f.write_str("certificate chain invalid"),
            Self::MissingField => f.write_str("missing field"),
            Self::BadFrame => f.write_str("undecodable frame"),
        }
    }
}

/// Errors for handshake operations.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error("handshake failed: {0}")]
    Failed(HandshakeFailReason),
    #[error("handshake proto decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid handshake key length for {0}")]
    InvalidKeyLength(&'static str),
}

/// Errors for the stanza (binary node) codec.
#[derive(Debug, Error)]
pub enum BinaryNodeError {
    #[error("unexpected end of payload")]
    Truncated,
    #[error("invalid tag byte: {0}")]
    InvalidTag(u8),
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    #[error("unknown single-byte token {0}")]
    UnknownToken(u8),
    #[error("unknown token {index} in dictionary {dictionary}")]
    UnknownDictionaryToken { dictionary: u8, index: u8 },
    #[error("trailing bytes after node decode")]
    TrailingBytes,
    #[error("attribute list has odd length")]
    OddAttributeCount,
    #[error("node list size {0} out of range")]
    InvalidListSize(usize),
    #[error("string exceeds encodable length")]
    StringTooLong,
    #[error("inflate failed: {0}")]
    Inflate(String),
}

/// Errors for the pairing flow.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("no more qr references to rotate")]
    NoMoreRefs,
    #[error("device identity hmac mismatch")]
    AdvHmacInvalid,
    #[error("account signature invalid")]
    AccountSigInvalid,
    #[error("missing pairing field: {0}")]
    MissingField(&'static str),
    #[error("device identity decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Errors for the Signal session cipher.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("no session for address {0}")]
    NoSession(String),
    #[error("no stored session matched the incoming message")]
    NoMatchingSession,
    #[error("message counter gap exceeds the skipped-key window")]
    TooManySkipped,
    #[error("message key for counter {0} already consumed")]
    KeyReused(u32),
    #[error("chain already closed")]
    ChainClosed,
    #[error("untrusted identity for address {0}")]
    UntrustedIdentity(String),
    #[error("message mac mismatch")]
    MacMismatch,
    #[error("unsupported message version {0}")]
    InvalidVersion(u8),
    #[error("invalid ciphertext payload")]
    InvalidCiphertext,
    #[error("signed pre-key signature invalid")]
    PreKeySignatureInvalid,
    #[error("missing pre-key id {0}")]
    MissingPreKey(u32),
    #[error("malformed key bundle: missing {0}")]
    BadBundle(&'static str),
    #[error("signal proto decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors for session/credential storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned: {0}")]
    Poisoned(&'static str),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the connection manager and protocol layer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    Node(#[from] BinaryNodeError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stream error code {0}")]
    StreamError(u16),
    #[error("login failed with status {0}")]
    LoginFailed(u16),
    #[error("server requested a stream restart")]
    RestartRequired,
    #[error("unknown enc type {0:?}")]
    UnknownEncType(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("message rejected by server: {0}")]
    SendRejected(String),
    #[error("not connected")]
    NotConnected,
}
