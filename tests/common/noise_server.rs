//! Server half of the Noise XX exchange, driven directly from tests.

use anyhow::{anyhow, Context};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::protocol::Message as WsMessage, WebSocketStream};

use wha_rs::{
    binary::{self, BinaryNode},
    frame::{FrameDecoder, NOISE_WA_HEADER},
    keys::{generate_keypair, sign_message, KeyPair},
    noise::{NoiseHandshake, NoiseReader, NoiseWriter},
};
use waproto::wa::{self, cert_chain, handshake_message};

/// Deterministic root CA pair shared by every test in the binary.
pub fn test_root() -> KeyPair {
    KeyPair::from_private([0x42; 32])
}

/// Points certificate verification at the test root. Latched process-wide.
pub fn install_test_root() {
    let root = test_root();
    std::env::set_var("WA_NOISE_CERT_ISSUER_KEYS", hex::encode(root.public));
}

pub struct ServerSession {
    ws: WebSocketStream<TcpStream>,
    decoder: FrameDecoder,
    writer: Option<NoiseWriter>,
    reader: Option<NoiseReader>,
    stripped_intro: bool,
}

impl ServerSession {
    pub fn new(ws: WebSocketStream<TcpStream>) -> Self {
        Self {
            ws,
            decoder: FrameDecoder::new(),
            writer: None,
            reader: None,
            stripped_intro: false,
        }
    }

    /// Reads the next length-prefixed frame, stripping the one-shot intro.
    pub async fn next_frame(&mut self) -> anyhow::Result<Bytes> {
        loop {
            if let Some(frame) = self.decoder.pop_frame() {
                return Ok(frame);
            }

            let message = self
                .ws
                .next()
                .await
                .ok_or_else(|| anyhow!("client hung up"))??;
            let WsMessage::Binary(data) = message else {
                continue;
            };

            let mut slice: &[u8] = &data;
            if !self.stripped_intro {
                self.stripped_intro = true;
                if slice.starts_with(&NOISE_WA_HEADER) {
                    slice = &slice[NOISE_WA_HEADER.len()..];
                }
            }
            self.decoder.push(slice);
        }
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let len = payload.len();
        let mut framed = Vec::with_capacity(3 + len);
        framed.push(((len >> 16) & 0xFF) as u8);
        framed.push(((len >> 8) & 0xFF) as u8);
        framed.push((len & 0xFF) as u8);
        framed.extend_from_slice(payload);
        self.ws.send(WsMessage::Binary(framed.into())).await?;
        Ok(())
    }

    /// Runs the responder side of the handshake and switches to transport.
    ///
    /// Returns the decoded client payload and the recovered client static key.
    pub async fn accept_handshake(
        &mut self,
        root: &KeyPair,
    ) -> anyhow::Result<(wa::ClientPayload, [u8; 32])> {
        let hello_frame = self.next_frame().await?;
        let hello = wa::HandshakeMessage::decode(hello_frame.as_ref())?
            .client_hello
            .context("missing client_hello")?;
        let client_ephemeral: [u8; 32] = hello
            .ephemeral
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("bad client ephemeral length"))?;

        let server_ephemeral = generate_keypair();
        let server_static = generate_keypair();

        let mut noise = NoiseHandshake::new(&NOISE_WA_HEADER, &client_ephemeral);
        noise.mix_hash(&server_ephemeral.public);
        noise.mix_key(&server_ephemeral.diffie_hellman(&client_ephemeral));
        let encrypted_static = noise.encrypt(&server_static.public)?;
        noise.mix_key(&server_static.diffie_hellman(&client_ephemeral));
        let cert_chain = build_cert_chain(root, &server_static.public);
        let encrypted_certs = noise.encrypt(&cert_chain)?;

        let server_hello = wa::HandshakeMessage {
            client_hello: None,
            server_hello: Some(handshake_message::ServerHello {
                ephemeral: server_ephemeral.public.to_vec(),
                r#static: encrypted_static,
                payload: encrypted_certs,
            }),
            client_finish: None,
        };
        let mut encoded = Vec::new();
        server_hello.encode(&mut encoded)?;
        self.send_frame(&encoded).await?;

        let finish_frame = self.next_frame().await?;
        let finish = wa::HandshakeMessage::decode(finish_frame.as_ref())?
            .client_finish
            .context("missing client_finish")?;
        let decrypted_static = noise.decrypt(&finish.r#static)?;
        let client_static: [u8; 32] = decrypted_static
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("bad client static length"))?;
        noise.mix_key(&server_ephemeral.diffie_hellman(&client_static));

        let payload_plain = noise.decrypt(&finish.payload)?;
        let client_payload = wa::ClientPayload::decode(payload_plain.as_slice())?;

        let (writer, reader) = noise.finish_responder();
        self.writer = Some(writer);
        self.reader = Some(reader);

        Ok((client_payload, client_static))
    }

    /// Encrypts and sends one stanza on the transport.
    pub async fn send_node(&mut self, node: &BinaryNode) -> anyhow::Result<()> {
        let encoded = binary::encode(node)?;
        let writer = self.writer.as_mut().context("transport not ready")?;
        let ciphertext = writer.encrypt(&encoded)?;
        self.send_frame(&ciphertext).await?;
        Ok(())
    }

    /// Receives and decrypts the next stanza from the client.
    pub async fn next_node(&mut self) -> anyhow::Result<BinaryNode> {
        let frame = self.next_frame().await?;
        let reader = self.reader.as_mut().context("transport not ready")?;
        let plaintext = reader.decrypt(&frame)?;
        Ok(binary::decode(&plaintext)?)
    }
}

/// Builds root → intermediate → leaf, binding the leaf to the server static.
pub fn build_cert_chain(root: &KeyPair, server_static_pub: &[u8; 32]) -> Vec<u8> {
    let intermediate = generate_keypair();

    let intermediate_details = cert_chain::noise_certificate::Details {
        serial: 10,
        issuer_serial: 0,
        key: intermediate.public.to_vec(),
        not_before: 0,
        not_after: u64::MAX,
    };
    let mut intermediate_bytes = Vec::new();
    intermediate_details
        .encode(&mut intermediate_bytes)
        .expect("encode");
    let mut intermediate_message = vec![0x06, 0x02];
    intermediate_message.extend_from_slice(&intermediate_bytes);
    let intermediate_signature = sign_message(root.private, root.public, &intermediate_message);

    let leaf_details = cert_chain::noise_certificate::Details {
        serial: 11,
        issuer_serial: 10,
        key: server_static_pub.to_vec(),
        not_before: 0,
        not_after: u64::MAX,
    };
    let mut leaf_bytes = Vec::new();
    leaf_details.encode(&mut leaf_bytes).expect("encode");
    let mut leaf_message = vec![0x06, 0x03];
    leaf_message.extend_from_slice(&leaf_bytes);
    let leaf_signature = sign_message(intermediate.private, intermediate.public, &leaf_message);

    let chain = wa::CertChain {
        leaf: Some(cert_chain::NoiseCertificate {
            details: leaf_bytes,
            signature: leaf_signature.to_vec(),
        }),
        intermediate: Some(cert_chain::NoiseCertificate {
            details: intermediate_bytes,
            signature: intermediate_signature.to_vec(),
        }),
    };
    let mut out = Vec::new();
    chain.encode(&mut out).expect("encode");
    out
}
