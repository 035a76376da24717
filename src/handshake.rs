use bytes::Bytes;
use prost::Message;
use sha2::{Digest, Sha256};

use crate::{
    config::SocketConfig,
    creds::Credentials,
    error::{HandshakeError, HandshakeFailReason},
    frame::{FrameDecoder, FrameEncoder, NOISE_WA_HEADER},
    noise::{NoiseHandshake, NoiseReader, NoiseWriter},
    transport::{WsSink, WsSource},
};
use waproto::wa::{self, handshake_message};

/// Directional transport keys produced by a completed handshake.
pub struct HandshakeOutcome {
    pub writer: NoiseWriter,
    pub reader: NoiseReader,
}

/// Runs the three-frame Noise XX exchange over an open socket.
pub async fn perform_handshake(
    sink: &mut WsSink,
    source: &mut WsSource,
    encoder: &mut FrameEncoder,
    decoder: &mut FrameDecoder,
    creds: &Credentials,
    config: &SocketConfig,
) -> Result<HandshakeOutcome, HandshakeError> {
    let ephemeral = creds.pairing_ephemeral_key;
    let mut noise = NoiseHandshake::new(&NOISE_WA_HEADER, &ephemeral.public);

    let client_hello = wa::HandshakeMessage {
        client_hello: Some(handshake_message::ClientHello {
            ephemeral: ephemeral.public.to_vec(),
            r#static: Vec::new(),
            payload: Vec::new(),
        }),
        server_hello: None,
        client_finish: None,
    };
    send_handshake_frame(sink, encoder, &client_hello).await?;

    let server_frame = next_frame(source, decoder).await?;
    let server_message = wa::HandshakeMessage::decode(server_frame.as_ref())?;
    let server_hello = server_message
        .server_hello
        .as_ref()
        .ok_or(HandshakeError::Failed(HandshakeFailReason::MissingField))?;

    let encrypted_static = noise.process_server_hello(server_hello, &creds.noise_key, &ephemeral)?;

    let client_payload = build_client_payload(creds, config);
    let mut encoded_payload = Vec::new();
    client_payload
        .encode(&mut encoded_payload)
        .expect("encoding into a Vec cannot fail");
    let encrypted_payload = noise.encrypt(&encoded_payload)?;

    let client_finish = wa::HandshakeMessage {
        client_hello: None,
        server_hello: None,
        client_finish: Some(handshake_message::ClientFinish {
            r#static: encrypted_static,
            payload: encrypted_payload,
        }),
    };
    send_handshake_frame(sink, encoder, &client_finish).await?;

    let (writer, reader) = noise.finish();
    Ok(HandshakeOutcome { writer, reader })
}

async fn send_handshake_frame(
    sink: &mut WsSink,
    encoder: &mut FrameEncoder,
    message: &wa::HandshakeMessage,
) -> Result<(), HandshakeError> {
    let mut encoded = Vec::new();
    message
        .encode(&mut encoded)
        .expect("encoding into a Vec cannot fail");
    let framed = encoder.encode(&encoded)?;
    sink.send_raw(&framed).await?;
    Ok(())
}

/// Reads socket chunks until the decoder yields a complete frame.
pub async fn next_frame(
    source: &mut WsSource,
    decoder: &mut FrameDecoder,
) -> Result<Bytes, HandshakeError> {
    loop {
        if let Some(frame) = decoder.pop_frame() {
            return Ok(frame);
        }

        let chunk = source.next_chunk().await?;
        decoder.push(&chunk);
    }
}

/// Builds the login or registration payload for the client finish frame.
pub fn build_client_payload(creds: &Credentials, config: &SocketConfig) -> wa::ClientPayload {
    let user_agent = wa::client_payload::UserAgent {
        platform: wa::client_payload::user_agent::Platform::Web as i32,
        app_version: Some(wa::client_payload::user_agent::AppVersion {
            primary: config.version[0],
            secondary: config.version[1],
            tertiary: config.version[2],
            quaternary: 0,
            quinary: 0,
        }),
        mcc: "000".to_owned(),
        mnc: "000".to_owned(),
        os_version: config.browser.2.clone(),
        manufacturer: String::new(),
        device: config.browser.1.clone(),
        os_build_number: config.browser.2.clone(),
        phone_id: String::new(),
        release_channel: wa::client_payload::user_agent::ReleaseChannel::Release as i32,
        locale_language_iso_639_1: "en".to_owned(),
        locale_country_iso_3166_1_alpha_2: "US".to_owned(),
    };

    let mut payload = wa::ClientPayload {
        username: 0,
        passive: false,
        user_agent: Some(user_agent),
        web_info: Some(wa::client_payload::WebInfo {
            web_sub_platform: wa::client_payload::web_info::WebSubPlatform::WebBrowser as i32,
        }),
        push_name: String::new(),
        connect_type: wa::client_payload::ConnectType::WifiUnknown as i32,
        connect_reason: wa::client_payload::ConnectReason::UserActivated as i32,
        device: 0,
        device_pairing_data: None,
        pull: false,
    };

    if let Some(me) = creds.me.as_ref() {
        if let Some((username, device)) = parse_jid_for_login(&me.jid) {
            payload.username = username;
            payload.device = device;
            payload.pull = true;
            return payload;
        }
        tracing::warn!(jid = %me.jid, "persisted jid unparseable, registering instead");
    }

    payload.device_pairing_data = Some(build_registration_data(creds, config));
    payload
}

fn build_registration_data(
    creds: &Credentials,
    config: &SocketConfig,
) -> wa::client_payload::DevicePairingRegistrationData {
    let build_hash = Sha256::digest(config.version_string().as_bytes());

    let device_props = wa::DeviceProps {
        os: config.browser.0.clone(),
        version: Some(wa::device_props::AppVersion {
            primary: 0,
            secondary: 1,
            tertiary: 0,
            quaternary: 0,
            quinary: 0,
        }),
        platform_type: wa::device_props::PlatformType::Desktop as i32,
        require_full_sync: false,
    };
    let mut encoded_device_props = Vec::new();
    device_props
        .encode(&mut encoded_device_props)
        .expect("encoding into a Vec cannot fail");

    wa::client_payload::DevicePairingRegistrationData {
        e_regid: creds.registration_id.to_be_bytes().to_vec(),
        e_keytype: vec![5],
        e_ident: creds.signed_identity_key.public.to_vec(),
        e_skey_id: encode_u24_be(creds.signed_pre_key.id),
        e_skey_val: creds.signed_pre_key.key_pair.public.to_vec(),
        e_skey_sig: creds.signed_pre_key.signature.to_vec(),
        build_hash: build_hash.to_vec(),
        device_props: encoded_device_props,
    }
}

fn encode_u24_be(value: u32) -> Vec<u8> {
    vec![
        ((value >> 16) & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (value & 0xFF) as u8,
    ]
}

fn parse_jid_for_login(jid: &str) -> Option<(u64, u32)> {
    let (user_part, _) = jid.split_once('@')?;
    let (user_raw, device_raw) = match user_part.split_once(':') {
        Some((user, device)) => (user, Some(device)),
        None => (user_part, None),
    };
    let username = user_raw.parse::<u64>().ok()?;
    let device = device_raw
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(0);
    Some((username, device))
}

#[cfg(test)]
mod tests {
    use super::{build_client_payload, parse_jid_for_login};
    use crate::{config::SocketConfig, creds::Credentials};

    #[test]
    fn jid_parse_handles_device_suffix() {
        assert_eq!(
            parse_jid_for_login("15550001111:3@s.whatsapp.net"),
            Some((15550001111, 3))
        );
        assert_eq!(
            parse_jid_for_login("15550001111@s.whatsapp.net"),
            Some((15550001111, 0))
        );
        assert_eq!(parse_jid_for_login("not-a-jid"), None);
    }

    #[test]
    fn logged_in_credentials_produce_a_login_payload() {
        let mut creds = Credentials::new();
        creds.me = Some(crate::creds::MeInfo {
            jid: "15550001111:0@s.whatsapp.net".to_owned(),
            name: None,
            lid: None,
        });

        let payload = build_client_payload(&creds, &SocketConfig::default());
        assert_eq!(payload.username, 15550001111);
        assert_eq!(payload.device, 0);
        assert!(payload.pull);
        assert!(!payload.passive);
        assert!(payload.device_pairing_data.is_none());
    }

    #[test]
    fn fresh_credentials_produce_a_registration_payload() {
        let creds = Credentials::new();
        let payload = build_client_payload(&creds, &SocketConfig::default());
        let pairing = payload.device_pairing_data.expect("registration data");
        assert_eq!(pairing.e_keytype, vec![5]);
        assert_eq!(pairing.e_regid.len(), 4);
        assert_eq!(pairing.e_skey_id.len(), 3);
        assert_eq!(pairing.build_hash.len(), 32);
    }
}
