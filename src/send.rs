use prost::Message;

use crate::{
    binary::{BinaryNode, Jid, NodeContent},
    conn::{Client, ACK_TIMEOUT},
    error::{ClientError, SignalError},
    events::{CredsDelta, Event},
    keys::{generate_keypair, random_bytes},
    signal::{init_outgoing_session, PreKeyBundle, ProtocolAddress, SessionCipher},
    store::{CredsStore, IdentityStore, PreKeyStore, SessionStore, SignalStore},
};
use waproto::wa;

/// One-time pre-keys registered per upload batch.
pub const PRE_KEY_UPLOAD_COUNT: u32 = 30;

/// Outcome of a completed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

impl<S: SignalStore + Send + Sync + 'static> Client<S> {
    /// Encrypts and sends a text message to every known device of the target,
    /// then waits for the server ack.
    pub async fn send_text(&self, to: &str, text: &str) -> Result<SendReceipt, ClientError> {
        let jid = Jid::parse(to).ok_or_else(|| {
            ClientError::SendRejected(format!("unparseable recipient jid {to:?}"))
        })?;

        let message = wa::Message {
            conversation: Some(text.to_owned()),
            extended_text_message: None,
        };
        let mut plaintext = Vec::new();
        message
            .encode(&mut plaintext)
            .expect("encoding into a Vec cannot fail");
        let padded = pad_message(plaintext);

        let mut sessions = self.shared.store.sessions_for_user(&jid.user)?;
        if sessions.is_empty() {
            self.fetch_pre_keys(&jid).await?;
            sessions = self.shared.store.sessions_for_user(&jid.user)?;
        }
        if sessions.is_empty() {
            return Err(SignalError::NoSession(jid.to_string()).into());
        }

        let message_id = self.generate_message_id();
        // Register the waiter before the first stanza leaves.
        let ack_rx = self.shared.register_pending(&message_id);

        for (address, _) in sessions {
            let encrypted = {
                let lock = self.shared.address_locks.lock_for(&address);
                let _guard = lock.lock_owned().await;
                SessionCipher::new(self.shared.store.as_ref(), address.clone())
                    .encrypt(&padded)?
            };

            let to_attr = device_jid(&jid, &address);
            let node = BinaryNode::new("message")
                .attr("to", to_attr)
                .attr("id", message_id.clone())
                .attr("type", "text")
                .children(vec![BinaryNode::new("enc")
                    .attr("v", "2")
                    .attr("type", encrypted.kind.enc_type())
                    .bytes(encrypted.bytes)]);
            self.shared.send_node(node).await?;
        }

        let ack = match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.remove(&message_id);
                return Err(ClientError::Timeout("message ack"));
            }
        };

        if let Some(error) = ack.get_attr("error") {
            let detail = ack.get_attr("text").unwrap_or("");
            return Err(ClientError::SendRejected(format!(
                "ack error {error}: {detail}"
            )));
        }

        Ok(SendReceipt { message_id })
    }

    /// Fetches a recipient's key bundles and establishes outgoing sessions.
    pub async fn fetch_pre_keys(&self, jid: &Jid) -> Result<(), ClientError> {
        let query = BinaryNode::new("iq")
            .attr("to", "s.whatsapp.net")
            .attr("type", "get")
            .attr("xmlns", "encrypt")
            .children(vec![BinaryNode::new("key").children(vec![
                BinaryNode::new("user").attr("jid", jid.to_non_ad().to_string()),
            ])]);

        let reply = self.query(query).await?;
        let list = reply
            .find_child("list")
            .ok_or(SignalError::BadBundle("list"))?;

        let local_identity = self.shared.store.local_identity()?;
        for user in list.find_children("user") {
            let (user_jid, bundle) = parse_bundle(user)?;
            let address = ProtocolAddress::from_jid(&user_jid);

            let entry = init_outgoing_session(&local_identity, &bundle)?;
            let lock = self.shared.address_locks.lock_for(&address);
            let _guard = lock.lock_owned().await;
            let mut record = self
                .shared
                .store
                .load_session(&address)?
                .unwrap_or_default();
            record.promote(entry);
            self.shared.store.store_session(&address, &record)?;
            self.shared
                .store
                .store_peer_identity(&address.user, bundle.identity_key)?;
        }

        Ok(())
    }

    /// Generates and uploads the next batch of one-time pre-keys.
    pub async fn upload_pre_keys(&self) -> Result<(), ClientError> {
        let mut range = 0..0;
        let creds = self.shared.store.update_credentials(&mut |creds| {
            range = creds.allocate_pre_key_ids(PRE_KEY_UPLOAD_COUNT);
        })?;

        let mut key_nodes = Vec::with_capacity(range.len());
        for id in range.clone() {
            let pair = generate_keypair();
            self.shared.store.store_pre_key(id, pair)?;
            key_nodes.push(BinaryNode::new("key").children(vec![
                BinaryNode::new("id").bytes(u24_be(id)),
                BinaryNode::new("value").bytes(pair.public.to_vec()),
            ]));
        }

        let signed = creds.signed_pre_key;
        let registration = BinaryNode::new("iq")
            .attr("to", "s.whatsapp.net")
            .attr("type", "set")
            .attr("xmlns", "encrypt")
            .children(vec![
                BinaryNode::new("registration")
                    .bytes(creds.registration_id.to_be_bytes().to_vec()),
                BinaryNode::new("type").bytes(vec![crate::keys::KEY_BUNDLE_TYPE]),
                BinaryNode::new("identity").bytes(creds.signed_identity_key.public.to_vec()),
                BinaryNode::new("list").children(key_nodes),
                BinaryNode::new("skey").children(vec![
                    BinaryNode::new("id").bytes(u24_be(signed.id)),
                    BinaryNode::new("value").bytes(signed.key_pair.public.to_vec()),
                    BinaryNode::new("signature").bytes(signed.signature.to_vec()),
                ]),
            ]);

        self.query(registration).await?;

        self.shared.store.update_credentials(&mut |creds| {
            creds.first_unuploaded_pre_key_id = creds.next_pre_key_id;
        })?;
        self.shared.events.emit(Event::CredsUpdate(CredsDelta::default()));
        Ok(())
    }

    /// Lists the devices registered for a user via a usync query.
    pub async fn get_devices(&self, jid: &Jid) -> Result<Vec<Jid>, ClientError> {
        let sid = self.generate_message_id();
        let query = BinaryNode::new("iq")
            .attr("to", "s.whatsapp.net")
            .attr("type", "get")
            .attr("xmlns", "usync")
            .children(vec![BinaryNode::new("usync")
                .attr("sid", sid)
                .attr("mode", "query")
                .attr("context", "message")
                .attr("index", "0")
                .attr("last", "true")
                .children(vec![
                    BinaryNode::new("query").children(vec![BinaryNode::new("devices")
                        .attr("version", "2")]),
                    BinaryNode::new("list").children(vec![BinaryNode::new("user")
                        .attr("jid", jid.to_non_ad().to_string())]),
                ])]);

        let reply = self.query(query).await?;
        let mut devices = Vec::new();
        collect_device_jids(&reply, &mut devices);
        Ok(devices)
    }
}

fn collect_device_jids(node: &BinaryNode, out: &mut Vec<Jid>) {
    if node.tag == "device" {
        if let Some(jid) = node.get_attr("jid").and_then(Jid::parse) {
            out.push(jid);
        }
    }
    if let NodeContent::Children(children) = &node.content {
        for child in children {
            collect_device_jids(child, out);
        }
    }
}

/// Appends 1..=16 random padding bytes, each carrying the pad length.
fn pad_message(mut payload: Vec<u8>) -> Vec<u8> {
    let pad = (random_bytes::<1>()[0] % 16) + 1;
    payload.extend(std::iter::repeat(pad).take(usize::from(pad)));
    payload
}

fn device_jid(base: &Jid, address: &ProtocolAddress) -> String {
    if address.device == 0 {
        base.to_non_ad().to_string()
    } else {
        format!("{}:{}@{}", address.user, address.device, base.server)
    }
}

fn u24_be(value: u32) -> Vec<u8> {
    vec![
        ((value >> 16) & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (value & 0xFF) as u8,
    ]
}

fn parse_bundle(user: &BinaryNode) -> Result<(Jid, PreKeyBundle), ClientError> {
    let jid = user
        .get_attr("jid")
        .and_then(Jid::parse)
        .ok_or(SignalError::BadBundle("user jid"))?;

    let registration_id = user
        .find_child("registration")
        .and_then(BinaryNode::content_bytes)
        .and_then(read_u32_be)
        .ok_or(SignalError::BadBundle("registration"))?;

    let identity_key = user
        .find_child("identity")
        .and_then(BinaryNode::content_bytes)
        .and_then(to_key_32)
        .ok_or(SignalError::BadBundle("identity"))?;

    let skey = user
        .find_child("skey")
        .ok_or(SignalError::BadBundle("skey"))?;
    let signed_pre_key_id = skey
        .find_child("id")
        .and_then(BinaryNode::content_bytes)
        .and_then(read_u24_be)
        .ok_or(SignalError::BadBundle("skey id"))?;
    let signed_pre_key = skey
        .find_child("value")
        .and_then(BinaryNode::content_bytes)
        .and_then(to_key_32)
        .ok_or(SignalError::BadBundle("skey value"))?;
    let signed_pre_key_signature = skey
        .find_child("signature")
        .and_then(BinaryNode::content_bytes)
        .map(<[u8]>::to_vec)
        .ok_or(SignalError::BadBundle("skey signature"))?;

    let (pre_key_id, pre_key) = match user.find_child("key") {
        Some(key) => {
            let id = key
                .find_child("id")
                .and_then(BinaryNode::content_bytes)
                .and_then(read_u24_be)
                .ok_or(SignalError::BadBundle("key id"))?;
            let value = key
                .find_child("value")
                .and_then(BinaryNode::content_bytes)
                .and_then(to_key_32)
                .ok_or(SignalError::BadBundle("key value"))?;
            (Some(id), Some(value))
        }
        None => (None, None),
    };

    Ok((
        jid,
        PreKeyBundle {
            registration_id,
            identity_key,
            signed_pre_key_id,
            signed_pre_key,
            signed_pre_key_signature,
            pre_key_id,
            pre_key,
        },
    ))
}

fn read_u32_be(bytes: &[u8]) -> Option<u32> {
    let array: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_be_bytes(array))
}

fn read_u24_be(bytes: &[u8]) -> Option<u32> {
    let array: [u8; 3] = bytes.try_into().ok()?;
    Some(((array[0] as u32) << 16) | ((array[1] as u32) << 8) | array[2] as u32)
}

fn to_key_32(bytes: &[u8]) -> Option<[u8; 32]> {
    let stripped = match bytes.len() {
        33 if bytes[0] == crate::keys::KEY_BUNDLE_TYPE => &bytes[1..],
        32 => bytes,
        _ => return None,
    };
    let mut out = [0_u8; 32];
    out.copy_from_slice(stripped);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::pad_message;

    #[test]
    fn padding_is_in_range_and_self_describing() {
        for _ in 0..64 {
            let padded = pad_message(b"payload".to_vec());
            let pad = *padded.last().expect("non-empty");
            assert!((1..=16).contains(&pad));
            assert_eq!(padded.len(), 7 + usize::from(pad));
            assert!(padded[7..].iter().all(|byte| *byte == pad));
        }
    }
}
