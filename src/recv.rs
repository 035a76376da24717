use std::sync::Arc;

use prost::Message;

use crate::{
    binary::{BinaryNode, Jid},
    conn::Shared,
    error::{ClientError, SignalError},
    events::Event,
    signal::{group, ProtocolAddress, SessionCipher},
    store::{CredsStore, IdentityStore, SignalStore},
};
use waproto::wa;

/// Routes one inbound `message` stanza: dedupe, decrypt, unpad, deliver.
pub(crate) async fn process_message<S: SignalStore + Send + Sync + 'static>(
    shared: &Arc<Shared<S>>,
    node: BinaryNode,
) {
    let Some(from) = node.get_attr("from").map(str::to_owned) else {
        return;
    };
    let Some(id) = node.get_attr("id").map(str::to_owned) else {
        return;
    };
    let sender = node
        .get_attr("participant")
        .unwrap_or(&from)
        .to_owned();

    let Some(enc) = node.find_child("enc").cloned() else {
        return;
    };

    // Duplicate deliveries are dropped silently.
    let mut fresh = false;
    let dedupe = shared.store.update_credentials(&mut |creds| {
        fresh = creds.processed_messages.insert(&sender, &id);
    });
    match dedupe {
        Ok(_) if !fresh => return,
        Ok(_) => {}
        Err(error) => {
            tracing::warn!(error = %error, "dedupe cache unavailable");
        }
    }

    match decrypt_enc_payload(shared, &node, &from, &sender, &enc).await {
        Ok(message) => {
            shared.events.emit(Event::MessageReceived {
                message,
                sender: sender.clone(),
                raw: node.clone(),
            });
            send_delivery_receipt(shared, &node, &from, &id).await;
        }
        Err(error) => {
            tracing::debug!(%sender, %id, error = %error, "message decryption failed");
            shared.events.emit(Event::MessageDecryptionError {
                error: error.to_string(),
                sender: Some(sender.clone()),
                raw: node.clone(),
            });
            send_retry_receipt(shared, &node, &from, &id).await;
        }
    }
}

async fn decrypt_enc_payload<S: SignalStore + Send + Sync + 'static>(
    shared: &Arc<Shared<S>>,
    node: &BinaryNode,
    from: &str,
    sender: &str,
    enc: &BinaryNode,
) -> Result<wa::Message, ClientError> {
    let ciphertext = enc
        .content_bytes()
        .ok_or(SignalError::InvalidCiphertext)?
        .to_vec();
    let enc_type = enc.get_attr("type").unwrap_or("").to_owned();

    let sender_jid = Jid::parse(sender).ok_or(SignalError::InvalidCiphertext)?;
    let address = ProtocolAddress::from_jid(&sender_jid);

    let padded = {
        // Per-address serialization for every cipher operation.
        let lock = shared.address_locks.lock_for(&address);
        let _guard = lock.lock_owned().await;
        match enc_type.as_str() {
            "pkmsg" => SessionCipher::new(shared.store.as_ref(), address.clone())
                .decrypt_pre_key_whisper_message(&ciphertext)?,
            "msg" => SessionCipher::new(shared.store.as_ref(), address.clone())
                .decrypt_whisper_message(&ciphertext)?,
            "skmsg" => {
                let name = group::sender_key_name(from, &address);
                group::decrypt_sender_key_message(shared.store.as_ref(), &name, &ciphertext)?
            }
            other => return Err(ClientError::UnknownEncType(other.to_owned())),
        }
    };

    let plaintext = if node.get_attr("type") == Some("plaintext") {
        padded
    } else {
        unpad(&padded)?
    };

    Ok(wa::Message::decode(plaintext.as_slice()).map_err(SignalError::Decode)?)
}

/// Strips the trailing random padding; the last byte is the pad length.
fn unpad(padded: &[u8]) -> Result<Vec<u8>, ClientError> {
    let Some(&pad) = padded.last() else {
        return Err(SignalError::InvalidCiphertext.into());
    };
    if pad == 0 || pad > 16 || usize::from(pad) > padded.len() {
        return Err(SignalError::InvalidCiphertext.into());
    }
    Ok(padded[..padded.len() - usize::from(pad)].to_vec())
}

async fn send_delivery_receipt<S: SignalStore + Send + Sync + 'static>(
    shared: &Arc<Shared<S>>,
    node: &BinaryNode,
    from: &str,
    id: &str,
) {
    let mut receipt = BinaryNode::new("receipt").attr("to", from).attr("id", id);
    if let Some(participant) = node.get_attr("participant") {
        receipt = receipt.attr("participant", participant);
    }
    if let Err(error) = shared.send_node(receipt).await {
        tracing::warn!(error = %error, "failed to send delivery receipt");
    }
}

/// Asks the sender to re-encrypt; sent at most once per message id.
async fn send_retry_receipt<S: SignalStore + Send + Sync + 'static>(
    shared: &Arc<Shared<S>>,
    node: &BinaryNode,
    from: &str,
    id: &str,
) {
    if shared.retry_sent.insert(id.to_owned(), ()).is_some() {
        return;
    }

    let registration_id = match shared.store.local_registration_id() {
        Ok(registration_id) => registration_id,
        Err(error) => {
            tracing::warn!(error = %error, "registration id unavailable for retry receipt");
            return;
        }
    };

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default();
    let mut receipt = BinaryNode::new("receipt")
        .attr("to", from)
        .attr("id", id)
        .attr("type", "retry");
    if let Some(participant) = node.get_attr("participant") {
        receipt = receipt.attr("participant", participant);
    }
    let receipt = receipt.children(vec![
        BinaryNode::new("retry")
            .attr("count", "1")
            .attr("id", id)
            .attr("t", timestamp.to_string())
            .attr("v", "1"),
        BinaryNode::new("registration").bytes(registration_id.to_be_bytes().to_vec()),
    ]);

    if let Err(error) = shared.send_node(receipt).await {
        tracing::warn!(error = %error, "failed to send retry receipt");
    }
}

#[cfg(test)]
mod tests {
    use super::unpad;

    #[test]
    fn unpad_strips_declared_length() {
        let mut payload = b"content".to_vec();
        payload.extend_from_slice(&[3, 3, 3]);
        assert_eq!(unpad(&payload).expect("unpad"), b"content");
    }

    #[test]
    fn unpad_rejects_out_of_range_lengths() {
        assert!(unpad(&[]).is_err());
        assert!(unpad(&[0]).is_err());
        assert!(unpad(&[17]).is_err());
        assert!(unpad(&[5, 9]).is_err());
    }
}
