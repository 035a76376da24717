use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use subtle::ConstantTimeEq;

use crate::{
    binary::BinaryNode,
    creds::MeInfo,
    error::{ClientError, PairingError},
    events::{CredsDelta, DisconnectReason, Event, EventBus},
    keys::sign_message,
    qr::{generate_qr_string, INITIAL_QR_TIMEOUT, SUBSEQUENT_QR_TIMEOUT},
    signal::kdf::hmac_sha256,
    store::{CredsStore, SignalStore},
};
use waproto::wa;

const ACCOUNT_SIGNATURE_PREFIX: [u8; 2] = [0x06, 0x00];
const DEVICE_SIGNATURE_PREFIX: [u8; 2] = [0x06, 0x01];

/// States of the pairing/login state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    AwaitingQr,
    ProcessingPairSuccess,
    Authenticated,
    Failed,
}

/// Control effects the connection manager acts on after a stanza.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthUpdate {
    /// A QR was issued; schedule rotation after the given validity.
    QrIssued(Duration),
    /// Pairing finished; the server will close, caller must reconnect.
    PairedNewLogin,
    /// Login confirmed; the connection is open.
    LoggedIn,
    /// Terminal failure; close with the carried reason.
    Failed(DisconnectReason),
}

/// What a stanza produced: replies to send and an optional control effect.
#[derive(Debug, Default)]
pub struct AuthOutcome {
    pub replies: Vec<BinaryNode>,
    pub update: Option<AuthUpdate>,
    pub handled: bool,
}

/// Pairing and login state machine.
pub struct Authenticator<S: SignalStore> {
    store: Arc<S>,
    events: EventBus,
    phase: AuthPhase,
    qr_refs: VecDeque<String>,
    issued_qr_count: u32,
    sent_offline_batch: bool,
}

impl<S: SignalStore> Authenticator<S> {
    pub fn new(store: Arc<S>, events: EventBus) -> Self {
        Self {
            store,
            events,
            phase: AuthPhase::Idle,
            qr_refs: VecDeque::new(),
            issued_qr_count: 0,
            sent_offline_batch: false,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Resets per-connection state after a socket close.
    pub fn on_close(&mut self) {
        self.phase = AuthPhase::Idle;
        self.qr_refs.clear();
        self.issued_qr_count = 0;
        self.sent_offline_batch = false;
    }

    /// Feeds one inbound stanza through the state machine.
    pub fn handle_stanza(&mut self, node: &BinaryNode) -> Result<AuthOutcome, ClientError> {
        match node.tag.as_str() {
            "iq" if node.find_child("pair-device").is_some() => self.handle_pair_device(node),
            "iq" if node.find_child("pair-success").is_some() => self.handle_pair_success(node),
            "success" => self.handle_success(node),
            "failure" | "fail" => self.handle_failure(node),
            "ib" if node.find_child("offline_preview").is_some() => self.handle_offline_preview(),
            _ => Ok(AuthOutcome::default()),
        }
    }

    /// Rotates to the next QR ref; errors out when none remain.
    pub fn rotate_qr(&mut self) -> Result<AuthOutcome, ClientError> {
        if self.phase != AuthPhase::AwaitingQr {
            return Ok(AuthOutcome::default());
        }
        self.issue_qr()
    }

    fn handle_pair_device(&mut self, node: &BinaryNode) -> Result<AuthOutcome, ClientError> {
        let pair_device = node
            .find_child("pair-device")
            .ok_or(PairingError::MissingField("pair-device"))?;

        self.qr_refs = pair_device
            .find_children("ref")
            .into_iter()
            .filter_map(|child| child.content_bytes())
            .filter_map(|bytes| std::str::from_utf8(bytes).ok())
            .map(str::to_owned)
            .collect();
        self.phase = AuthPhase::AwaitingQr;
        self.issued_qr_count = 0;

        let mut outcome = self.issue_qr()?;
        outcome.replies.insert(0, ack_iq(node));
        Ok(outcome)
    }

    fn issue_qr(&mut self) -> Result<AuthOutcome, ClientError> {
        let Some(reference) = self.qr_refs.pop_front() else {
            self.phase = AuthPhase::Failed;
            return Err(PairingError::NoMoreRefs.into());
        };

        let creds = self.store.credentials()?;
        let qr = generate_qr_string(
            &reference,
            &creds.noise_key.public,
            &creds.signed_identity_key.public,
            &creds.adv_secret_key,
        );

        self.events.emit(Event::ConnectionUpdate {
            connection: None,
            is_new_login: false,
            qr: Some(qr),
            error: None,
        });

        let validity = if self.issued_qr_count == 0 {
            INITIAL_QR_TIMEOUT
        } else {
            SUBSEQUENT_QR_TIMEOUT
        };
        self.issued_qr_count += 1;

        Ok(AuthOutcome {
            replies: Vec::new(),
            update: Some(AuthUpdate::QrIssued(validity)),
            handled: true,
        })
    }

    fn handle_pair_success(&mut self, node: &BinaryNode) -> Result<AuthOutcome, ClientError> {
        self.phase = AuthPhase::ProcessingPairSuccess;

        let pair_success = node
            .find_child("pair-success")
            .ok_or(PairingError::MissingField("pair-success"))?;
        let device_identity_bytes = pair_success
            .find_child("device-identity")
            .and_then(BinaryNode::content_bytes)
            .ok_or(PairingError::MissingField("device-identity"))?;
        let device_jid = pair_success
            .find_child("device")
            .and_then(|device| device.get_attr("jid"))
            .ok_or(PairingError::MissingField("device jid"))?
            .to_owned();
        let device_lid = pair_success
            .find_child("device")
            .and_then(|device| device.get_attr("lid"))
            .map(str::to_owned);
        let platform = pair_success
            .find_child("platform")
            .and_then(|child| child.get_attr("name"))
            .map(str::to_owned);

        let creds = self.store.credentials()?;
        let identity_pub = creds.signed_identity_key.public;

        let envelope = wa::AdvSignedDeviceIdentityHmac::decode(device_identity_bytes)
            .map_err(PairingError::Decode)?;
        let expected = hmac_sha256(&creds.adv_secret_key, &envelope.details);
        if expected.ct_eq(envelope.hmac.as_slice()).unwrap_u8() == 0 {
            self.phase = AuthPhase::Failed;
            return Err(PairingError::AdvHmacInvalid.into());
        }

        let mut identity =
            wa::AdvSignedDeviceIdentity::decode(envelope.details.as_slice())
                .map_err(PairingError::Decode)?;

        let account_signature_key: [u8; 32] = identity
            .account_signature_key
            .as_slice()
            .try_into()
            .map_err(|_| PairingError::MissingField("account_signature_key"))?;

        let mut account_message =
            Vec::with_capacity(2 + identity.details.len() + identity_pub.len());
        account_message.extend_from_slice(&ACCOUNT_SIGNATURE_PREFIX);
        account_message.extend_from_slice(&identity.details);
        account_message.extend_from_slice(&identity_pub);
        if !crate::keys::verify_message(
            account_signature_key,
            &account_message,
            &identity.account_signature,
        ) {
            self.phase = AuthPhase::Failed;
            return Err(PairingError::AccountSigInvalid.into());
        }

        let mut device_message = Vec::with_capacity(
            2 + identity.details.len() + identity_pub.len() + account_signature_key.len(),
        );
        device_message.extend_from_slice(&DEVICE_SIGNATURE_PREFIX);
        device_message.extend_from_slice(&identity.details);
        device_message.extend_from_slice(&identity_pub);
        device_message.extend_from_slice(&account_signature_key);
        identity.device_signature = sign_message(
            creds.signed_identity_key.private,
            identity_pub,
            &device_message,
        )
        .to_vec();

        let device_details = wa::AdvDeviceIdentity::decode(identity.details.as_slice())
            .map_err(PairingError::Decode)?;

        // The signed reply omits the account signature key.
        let mut reply_identity = identity.clone();
        reply_identity.account_signature_key = Vec::new();
        let mut reply_identity_bytes = Vec::new();
        reply_identity
            .encode(&mut reply_identity_bytes)
            .expect("encoding into a Vec cannot fail");

        let reply = ack_iq(node).children(vec![BinaryNode::new("pair-device-sign").children(
            vec![BinaryNode::new("device-identity")
                .attr("key-index", device_details.key_index.to_string())
                .bytes(reply_identity_bytes)],
        )]);

        let mut account_bytes = Vec::new();
        identity
            .encode(&mut account_bytes)
            .expect("encoding into a Vec cannot fail");

        let me = MeInfo {
            jid: device_jid.clone(),
            name: None,
            lid: device_lid,
        };
        self.store.update_credentials(&mut |creds| {
            creds.me = Some(me.clone());
            creds.account = Some(account_bytes.clone());
            creds.platform = platform.clone();
            creds
                .signal_identities
                .insert(device_jid.clone(), account_signature_key);
            creds.registered = true;
        })?;

        self.events.emit(Event::CredsUpdate(CredsDelta {
            me: Some(me),
            platform,
            registered: Some(true),
        }));
        self.events.emit(Event::ConnectionUpdate {
            connection: None,
            is_new_login: true,
            qr: None,
            error: None,
        });

        self.phase = AuthPhase::Authenticated;
        Ok(AuthOutcome {
            replies: vec![reply],
            update: Some(AuthUpdate::PairedNewLogin),
            handled: true,
        })
    }

    fn handle_success(&mut self, node: &BinaryNode) -> Result<AuthOutcome, ClientError> {
        let platform = node.get_attr("platform").map(str::to_owned);
        let pushname = node.get_attr("pushname").map(str::to_owned);
        let lid = node.get_attr("lid").map(str::to_owned);
        let jid = node.get_attr("jid").map(str::to_owned);

        let mut delta = CredsDelta::default();
        let updated = self.store.update_credentials(&mut |creds| {
            if let Some(platform) = platform.clone() {
                creds.platform = Some(platform);
            }
            if let Some(me) = creds.me.as_mut() {
                if let Some(name) = pushname.clone() {
                    me.name = Some(name);
                }
                if let Some(lid) = lid.clone() {
                    me.lid = Some(lid);
                }
            } else if let Some(jid) = jid.clone() {
                creds.me = Some(MeInfo {
                    jid,
                    name: pushname.clone(),
                    lid: lid.clone(),
                });
            }
        })?;
        delta.me = updated.me.clone();
        delta.platform = updated.platform.clone();

        self.events.emit(Event::CredsUpdate(delta));
        self.phase = AuthPhase::Authenticated;
        Ok(AuthOutcome {
            replies: Vec::new(),
            update: Some(AuthUpdate::LoggedIn),
            handled: true,
        })
    }

    fn handle_failure(&mut self, node: &BinaryNode) -> Result<AuthOutcome, ClientError> {
        self.phase = AuthPhase::Failed;
        let code = node
            .get_attr("reason")
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(500);
        Ok(AuthOutcome {
            replies: Vec::new(),
            update: Some(AuthUpdate::Failed(DisconnectReason::LoginFailed(code))),
            handled: true,
        })
    }

    fn handle_offline_preview(&mut self) -> Result<AuthOutcome, ClientError> {
        if self.sent_offline_batch {
            return Ok(AuthOutcome {
                replies: Vec::new(),
                update: None,
                handled: true,
            });
        }
        self.sent_offline_batch = true;

        let reply = BinaryNode::new("ib")
            .children(vec![BinaryNode::new("offline_batch").attr("count", "30")]);
        Ok(AuthOutcome {
            replies: vec![reply],
            update: None,
            handled: true,
        })
    }
}

/// Builds the empty result iq acknowledging a server request.
fn ack_iq(node: &BinaryNode) -> BinaryNode {
    let to = node.get_attr("from").unwrap_or("s.whatsapp.net").to_owned();
    let mut ack = BinaryNode::new("iq").attr("to", to).attr("type", "result");
    if let Some(id) = node.get_attr("id") {
        ack = ack.attr("id", id);
    }
    ack
}
