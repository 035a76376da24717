//! Control tags and token dictionaries for the stanza wire format.

pub const LIST_EMPTY: u8 = 0;
pub const DICTIONARY_0: u8 = 236;
pub const DICTIONARY_1: u8 = 237;
pub const DICTIONARY_2: u8 = 238;
pub const DICTIONARY_3: u8 = 239;
pub const AD_JID: u8 = 247;
pub const LIST_8: u8 = 248;
pub const LIST_16: u8 = 249;
pub const JID_PAIR: u8 = 250;
pub const HEX_8: u8 = 251;
pub const BINARY_8: u8 = 252;
pub const BINARY_20: u8 = 253;
pub const BINARY_32: u8 = 254;
pub const NIBBLE_8: u8 = 255;

/// Longest string eligible for nibble or hex packing.
pub const PACKED_MAX: usize = 254;

/// Strings addressable by a bare token byte (indices 1..=235).
///
/// Index 0 is the LIST_EMPTY control code and never a token.
pub const SINGLE_BYTE_TOKENS: [&str; 236] = [
    "",
    "xmlstreamstart",
    "xmlstreamend",
    "s.whatsapp.net",
    "type",
    "participant",
    "from",
    "receipt",
    "id",
    "broadcast",
    "status",
    "unavailable",
    "notification",
    "notify",
    "to",
    "jid",
    "user",
    "class",
    "offline",
    "g.us",
    "result",
    "mediatype",
    "enc",
    "skmsg",
    "off_cnt",
    "xmlns",
    "presence",
    "participants",
    "ack",
    "t",
    "iq",
    "device_hash",
    "read",
    "value",
    "media",
    "picture",
    "chatstate",
    "unknown",
    "image",
    "device",
    "reason",
    "text",
    "clear",
    "urn:xmpp:whatsapp:push",
    "error",
    "pair-device",
    "extensions",
    "ver",
    "v",
    "ltha",
    "receipts",
    "config",
    "message",
    "composing",
    "available",
    "unread",
    "count",
    "set",
    "get",
    "add",
    "remove",
    "update",
    "delete",
    "success",
    "failure",
    "fail",
    "stream:error",
    "pair-success",
    "pair-device-sign",
    "device-identity",
    "ref",
    "encrypt",
    "registration",
    "keys",
    "key",
    "skey",
    "list",
    "index",
    "identity",
    "collection",
    "category",
    "active",
    "w:p",
    "ping",
    "urn:xmpp:ping",
    "usync",
    "devices",
    "device-list",
    "props",
    "prop",
    "ib",
    "offline_preview",
    "offline_batch",
    "retry",
    "register",
    "platform",
    "lid",
    "name",
    "code",
    "context",
    "sidelist",
    "query",
    "contacts",
    "contact",
    "mode",
    "delta",
    "last",
    "state",
    "group",
    "creator",
    "subject",
    "creation",
    "member_add_mode",
    "invite",
    "description",
    "announcement",
    "locked",
    "not-authorized",
    "item-not-found",
    "internal-server-error",
    "service-unavailable",
    "bad-request",
    "forbidden",
    "conflict",
    "resource-limit",
    "timeout",
    "expired",
    "replaced",
    "malformed",
    "ancient",
    "multicast",
    "web",
    "business",
    "verified_name",
    "profile",
    "picture_id",
    "status_old",
    "stream:features",
    "features",
    "dirty",
    "clean",
    "timestamp",
    "account_sync",
    "groups",
    "blocklist",
    "block",
    "unblock",
    "privacy",
    "phash",
    "recipient",
    "played",
    "delivery",
    "inactive",
    "paused",
    "recording",
    "subscribe",
    "unsubscribe",
    "edge_routing",
    "routing_info",
    "chat",
    "background",
    "plaintext",
    "pkmsg",
    "frskmsg",
    "body",
    "media_conn",
    "host",
    "hostname",
    "auth_ttl",
    "ttl",
    "max_buckets",
    "download",
    "upload",
    "url",
    "uri",
    "direct_path",
    "handle",
    "token",
    "token_id",
    "expiration",
    "latency",
    "interactive",
    "offer",
    "relaylatency",
    "call-creator",
    "call-id",
    "terminate",
    "reject",
    "accept",
    "preaccept",
    "transport",
    "audio",
    "video",
    "call",
    "disconnect",
    "mute",
    "encopt",
    "hash",
    "verify",
    "appdata",
    "side_list",
    "fallback_hostname",
    "fallback_ip4",
    "fallback_ip6",
    "ip4",
    "ip6",
    "is_new",
    "tctoken",
    "tag",
    "attrs",
    "companion",
    "companion_enc_static",
    "link_code_companion_reg",
    "primary_identity_pub",
    "companion_server_auth_key_pub",
    "link_code_pairing_wrapped_companion_ephemeral_pub",
    "link_code_pairing_nonce",
    "link_code_pairing_ref",
    "primary_ephemeral_pub_wrapped",
    "adv_secret",
    "stage",
    "companion_hello",
    "companion_finish",
    "wa:p:whatsapp",
    "passive",
    "version",
    "fullsync",
    "dhash",
    "original_dhash",
    "removed",
    "added",
    "before",
    "after",
    "since",
    "prev_dhash",
    "server",
];

/// Secondary dictionaries selected by the DICTIONARY_0..3 control codes.
pub const DOUBLE_BYTE_TOKENS: [&[&str]; 4] = [
    &[
        "media-gig2-1.cdn.whatsapp.net",
        "media-bog1-1.cdn.whatsapp.net",
        "media-mia3-1.cdn.whatsapp.net",
        "media-for1-1.cdn.whatsapp.net",
        "media-eze1-1.cdn.whatsapp.net",
        "read-self",
        "inactive-list",
        "sender",
        "played-self",
        "server-error",
        "hist_sync",
        "non_ab_retry",
        "urn:xmpp:whatsapp:account",
        "urn:xmpp:whatsapp:dirty",
        "urn:xmpp:whatsapp:mms",
        "w:b",
        "w:g2",
        "w:profile:picture",
        "w:stats",
        "w:sync:app:state",
        "w:comms:chat",
        "w:chatp",
        "w:auth:backup:token",
        "w:m",
        "member_since_text",
        "metadata",
        "identity_key",
        "account_enc",
        "account_sig",
        "account_sig_key",
        "device_sig",
        "key-index-list",
        "key-index",
        "signed_key_index",
        "collection_version",
        "critical_block",
        "critical_unblock_low",
        "regular_high",
        "regular_low",
        "regular",
        "mutation",
        "mutations",
        "snapshot",
        "patch",
        "patches",
        "fatal_exception",
        "app_state_sync_key_share",
        "app_state_sync_key_request",
        "app_state_fatal_exception_notification",
        "initial_security_notification_setting_sync",
        "history_sync_notification",
        "peer_data_operation_request_message",
        "peer_data_operation_request_response_message",
        "sender_key_distribution_message",
        "fbns",
        "smb",
        "smba",
        "smbi",
        "latest",
        "previous",
        "resume",
        "pause",
        "replay",
        "dleq",
        "shard",
        "stream",
        "groupadd",
        "all",
        "contact_blacklist",
        "matched",
        "suspended",
        "deleted",
        "restored",
        "democratize",
        "parent_group_jid",
        "default_sub_group_jid",
        "linked_group_jid",
        "membership_approval_mode",
        "membership_approval_request",
        "created_membership_requests",
        "revoked_membership_requests",
        "allow_non_admin_sub_group_creation",
        "incognito",
        "ephemeral",
        "disappearing_mode",
        "duration",
        "initiator",
        "init",
        "trigger",
        "w:gp2",
        "growth_lock_expiration_ts",
        "growth_lock_type",
    ],
    &[
        "poll_creation",
        "poll_update",
        "reaction",
        "keep_in_chat",
        "edit",
        "pin",
        "unpin",
        "kept",
        "unkept",
        "star",
        "unstar",
        "undo",
        "revoke",
        "peer_msg",
        "bot_msg",
        "newsletter",
        "newsletter_admin_invite",
        "mex",
        "w:mex",
        "queries",
        "payload",
        "variables",
        "operation",
        "operationName",
        "fb:thrift_iq",
        "request_welcome_message",
        "notice",
        "verified_level",
        "privacy_mode_ts",
        "biz_privacy_status",
        "host_storage",
        "actual_actors",
        "tombstoned",
        "processed_votes",
        "vote",
        "senderTimestampMs",
        "messageSecret",
        "pollUpdates",
        "pollCreationMessageKey",
        "unopened",
        "opened",
        "order",
        "catalog",
        "product",
        "cart",
        "invoice",
        "payment",
        "checkout",
    ],
    &[],
    &[],
];

/// Looks up a single-byte token string by its byte value.
pub fn single_byte_token(index: u8) -> Option<&'static str> {
    let entry = *SINGLE_BYTE_TOKENS.get(index as usize)?;
    if entry.is_empty() {
        return None;
    }
    Some(entry)
}

/// Looks up a double-byte token by dictionary and index.
pub fn double_byte_token(dictionary: u8, index: u8) -> Option<&'static str> {
    DOUBLE_BYTE_TOKENS
        .get(dictionary as usize)?
        .get(index as usize)
        .copied()
}

/// Finds the byte value for a string in the single-byte table.
pub fn find_single_byte_token(value: &str) -> Option<u8> {
    SINGLE_BYTE_TOKENS
        .iter()
        .position(|token| !token.is_empty() && *token == value)
        .map(|index| index as u8)
}

/// Finds the `(dictionary, index)` pair for a string in the secondary tables.
pub fn find_double_byte_token(value: &str) -> Option<(u8, u8)> {
    for (dictionary, table) in DOUBLE_BYTE_TOKENS.iter().enumerate() {
        if let Some(index) = table.iter().position(|token| *token == value) {
            return Some((dictionary as u8, index as u8));
        }
    }
    None
}
