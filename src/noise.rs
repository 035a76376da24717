use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use prost::Message;
use sha2::{Digest, Sha256};

use crate::{
    error::{HandshakeError, HandshakeFailReason, NoiseError},
    keys::{verify_message, KeyPair},
};
use waproto::wa::{cert_chain, CertChain};

/// Noise protocol name, zero-padded to the 32-byte hash width.
pub const NOISE_PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_AESGCM_SHA256\0\0\0\0";

/// Root CA public key that anchors the server certificate chain.
const WA_CERT_ISSUER: [u8; 32] = [
    0x14, 0x23, 0x75, 0x57, 0x4d, 0x0a, 0x58, 0x71, 0x66, 0xaa, 0xe7, 0x1e, 0xbe, 0x51, 0x64,
    0x37, 0xc4, 0xa2, 0x8b, 0x73, 0xe3, 0x69, 0x5c, 0x6c, 0xe1, 0xf7, 0xf9, 0x54, 0x5d, 0xa8,
    0xee, 0x6b,
];

/// Comma-separated hex keys that replace the built-in root, for staging
/// deployments and protocol tests.
const WA_NOISE_CERT_ISSUER_KEYS_ENV: &str = "WA_NOISE_CERT_ISSUER_KEYS";

const CERT_INTERMEDIATE_PREFIX: [u8; 2] = [0x06, 0x02];
const CERT_LEAF_PREFIX: [u8; 2] = [0x06, 0x03];

/// Noise XX handshake state for the three-frame exchange.
#[derive(Debug, Clone)]
pub struct NoiseHandshake {
    hash: [u8; 32],
    salt: [u8; 32],
    key: [u8; 32],
    counter: u64,
}

impl NoiseHandshake {
    /// Initializes the state and mixes prologue plus the client hello key.
    pub fn new(prologue: &[u8], client_hello_public: &[u8; 32]) -> Self {
        let hash = initialize_handshake_hash(NOISE_PROTOCOL_NAME);

        let mut state = Self {
            hash,
            salt: hash,
            key: hash,
            counter: 0,
        };
        state.mix_hash(prologue);
        state.mix_hash(client_hello_public);
        state
    }

    /// Mixes data into the running handshake hash.
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash.copy_from_slice(&hasher.finalize());
    }

    /// Mixes DH output into the chaining key; both AEAD counters restart at 0.
    pub fn mix_key(&mut self, ikm: &[u8]) {
        let (chaining, key) = hkdf_split(&self.salt, ikm);
        self.salt = chaining;
        self.key = key;
        self.counter = 0;
    }

    /// Encrypts with the current key, authenticating the handshake hash.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let nonce = take_nonce(&mut self.counter)?;
        let ciphertext = aes_gcm_encrypt(&self.key, nonce, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypts with the current key; the hash absorbs the ciphertext.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let nonce = take_nonce(&mut self.counter)?;
        let plaintext = aes_gcm_decrypt(&self.key, nonce, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Consumes the server hello: DH mixes, static recovery, cert verification.
    ///
    /// Returns the encrypted client static for the finish frame, leaving the
    /// state ready to encrypt the client payload.
    pub fn process_server_hello(
        &mut self,
        server_hello: &waproto::wa::handshake_message::ServerHello,
        static_key: &KeyPair,
        ephemeral_key: &KeyPair,
    ) -> Result<Vec<u8>, HandshakeError> {
        let server_ephemeral = to_32(&server_hello.ephemeral, "server_hello.ephemeral")?;
        self.mix_hash(&server_ephemeral);
        self.mix_key(&ephemeral_key.diffie_hellman(&server_ephemeral));

        let decrypted_static = self.decrypt(&server_hello.r#static)?;
        let server_static = to_32(&decrypted_static, "server_hello.static")?;
        self.mix_key(&ephemeral_key.diffie_hellman(&server_static));

        let cert_payload = self.decrypt(&server_hello.payload)?;
        verify_cert_chain(&cert_payload, &server_static)?;

        let encrypted_static = self.encrypt(&static_key.public)?;
        self.mix_key(&static_key.diffie_hellman(&server_ephemeral));

        Ok(encrypted_static)
    }

    /// Splits the finished handshake into the two directional transport halves.
    pub fn finish(self) -> (NoiseWriter, NoiseReader) {
        let (send_key, recv_key) = hkdf_split(&self.salt, &[]);
        (
            NoiseWriter {
                cipher: TransportCipher::new(send_key),
            },
            NoiseReader {
                cipher: TransportCipher::new(recv_key),
            },
        )
    }

    /// Responder-role split: the key halves swap direction.
    pub fn finish_responder(self) -> (NoiseWriter, NoiseReader) {
        let (recv_key, send_key) = hkdf_split(&self.salt, &[]);
        (
            NoiseWriter {
                cipher: TransportCipher::new(send_key),
            },
            NoiseReader {
                cipher: TransportCipher::new(recv_key),
            },
        )
    }
}

/// One direction of the post-handshake AEAD transport.
#[derive(Debug, Clone)]
struct TransportCipher {
    key: [u8; 32],
    counter: u64,
}

impl TransportCipher {
    fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }
}

/// Encrypts outbound transport payloads; counters advance with send order.
#[derive(Debug, Clone)]
pub struct NoiseWriter {
    cipher: TransportCipher,
}

impl NoiseWriter {
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let nonce = take_nonce(&mut self.cipher.counter)?;
        aes_gcm_encrypt(&self.cipher.key, nonce, plaintext, &[])
    }
}

/// Decrypts inbound transport payloads in wire order.
#[derive(Debug, Clone)]
pub struct NoiseReader {
    cipher: TransportCipher,
}

impl NoiseReader {
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let nonce = take_nonce(&mut self.cipher.counter)?;
        aes_gcm_decrypt(&self.cipher.key, nonce, ciphertext, &[])
    }
}

fn verify_cert_chain(cert_payload: &[u8], server_static: &[u8; 32]) -> Result<(), HandshakeError> {
    let chain = CertChain::decode(cert_payload)
        .map_err(|_| HandshakeError::Failed(HandshakeFailReason::CertInvalid))?;

    let intermediate = chain
        .intermediate
        .ok_or(HandshakeError::Failed(HandshakeFailReason::CertInvalid))?;
    let leaf = chain
        .leaf
        .ok_or(HandshakeError::Failed(HandshakeFailReason::CertInvalid))?;

    let intermediate_message = prefixed(&CERT_INTERMEDIATE_PREFIX, &intermediate.details);
    let trusted = trusted_issuer_keys()
        .iter()
        .any(|issuer| verify_message(*issuer, &intermediate_message, &intermediate.signature));
    if !trusted {
        return Err(HandshakeError::Failed(HandshakeFailReason::CertInvalid));
    }

    let intermediate_details =
        cert_chain::noise_certificate::Details::decode(intermediate.details.as_slice())
            .map_err(|_| HandshakeError::Failed(HandshakeFailReason::CertInvalid))?;
    let intermediate_key = to_32(&intermediate_details.key, "intermediate.details.key")?;

    if !verify_message(
        intermediate_key,
        &prefixed(&CERT_LEAF_PREFIX, &leaf.details),
        &leaf.signature,
    ) {
        return Err(HandshakeError::Failed(HandshakeFailReason::CertInvalid));
    }

    let leaf_details = cert_chain::noise_certificate::Details::decode(leaf.details.as_slice())
        .map_err(|_| HandshakeError::Failed(HandshakeFailReason::CertInvalid))?;
    if leaf_details.issuer_serial != intermediate_details.serial {
        return Err(HandshakeError::Failed(HandshakeFailReason::CertInvalid));
    }

    let leaf_key = to_32(&leaf_details.key, "leaf.details.key")?;
    if &leaf_key != server_static {
        tracing::warn!("server static does not match leaf certificate key");
        return Err(HandshakeError::Failed(HandshakeFailReason::CertInvalid));
    }

    Ok(())
}

fn trusted_issuer_keys() -> &'static Vec<[u8; 32]> {
    static KEYS: std::sync::OnceLock<Vec<[u8; 32]>> = std::sync::OnceLock::new();
    KEYS.get_or_init(|| {
        let mut keys = Vec::new();
        if let Ok(raw) = std::env::var(WA_NOISE_CERT_ISSUER_KEYS_ENV) {
            for piece in raw.split(',') {
                let item = piece.trim();
                if item.is_empty() {
                    continue;
                }
                let hex = item.strip_prefix("0x").unwrap_or(item);
                if let Some(key) = parse_hex_32(hex) {
                    keys.push(key);
                } else {
                    tracing::warn!(value = item, "ignoring malformed issuer key override");
                }
            }
        }

        if keys.is_empty() {
            keys.push(WA_CERT_ISSUER);
        }
        keys
    })
}

fn parse_hex_32(input: &str) -> Option<[u8; 32]> {
    if input.len() != 64 {
        return None;
    }

    let mut out = [0_u8; 32];
    for (index, byte) in out.iter_mut().enumerate() {
        let start = index * 2;
        *byte = u8::from_str_radix(&input[start..start + 2], 16).ok()?;
    }
    Some(out)
}

fn prefixed(prefix: &[u8], details: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + details.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(details);
    out
}

fn hkdf_split(salt: &[u8; 32], ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut output = [0_u8; 64];
    hk.expand(&[], &mut output)
        .expect("hkdf expand of fixed width cannot fail");

    let mut first = [0_u8; 32];
    first.copy_from_slice(&output[..32]);
    let mut second = [0_u8; 32];
    second.copy_from_slice(&output[32..]);
    (first, second)
}

fn take_nonce(counter: &mut u64) -> Result<[u8; 12], NoiseError> {
    if *counter == u64::MAX {
        return Err(NoiseError::NonceOverflow);
    }

    let mut nonce = [0_u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    *counter += 1;
    Ok(nonce)
}

fn aes_gcm_encrypt(
    key: &[u8; 32],
    nonce: [u8; 12],
    plaintext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| NoiseError::InvalidKeyMaterial("aes-gcm key"))?;
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| NoiseError::AeadAuthFailed)
}

fn aes_gcm_decrypt(
    key: &[u8; 32],
    nonce: [u8; 12],
    ciphertext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| NoiseError::InvalidKeyMaterial("aes-gcm key"))?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| NoiseError::AeadAuthFailed)
}

fn initialize_handshake_hash(protocol_name: &[u8]) -> [u8; 32] {
    let mut hash = [0_u8; 32];
    if protocol_name.len() <= hash.len() {
        hash[..protocol_name.len()].copy_from_slice(protocol_name);
        return hash;
    }

    hash.copy_from_slice(&Sha256::digest(protocol_name));
    hash
}

fn to_32(bytes: &[u8], label: &'static str) -> Result<[u8; 32], HandshakeError> {
    if bytes.len() != 32 {
        return Err(HandshakeError::InvalidKeyLength(label));
    }

    let mut out = [0_u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}
