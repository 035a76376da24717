use crate::binary::{
    jid::{Jid, DEFAULT_USER_SERVER, LID_SERVER},
    node::{BinaryNode, NodeContent},
    tokens,
};
use crate::error::BinaryNodeError;

/// Encodes a stanza, prefixing the uncompressed-stream marker byte.
pub fn encode(node: &BinaryNode) -> Result<Vec<u8>, BinaryNodeError> {
    let mut out = vec![0_u8];
    write_node(node, &mut out)?;
    Ok(out)
}

fn write_node(node: &BinaryNode, out: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    let has_content = !matches!(node.content, NodeContent::None);
    let list_size = 2 * node.attrs.len() + 1 + usize::from(has_content);
    write_list_header(list_size, out)?;

    write_string(&node.tag, out)?;

    // Sorted keys keep the encoding deterministic.
    let mut keys: Vec<&String> = node.attrs.keys().collect();
    keys.sort_unstable();
    for key in keys {
        write_string(key, out)?;
        write_string(&node.attrs[key], out)?;
    }

    match &node.content {
        NodeContent::None => {}
        NodeContent::Text(text) => write_string(text, out)?,
        NodeContent::Bytes(payload) => write_raw_bytes(payload, out)?,
        NodeContent::Children(children) => {
            write_list_header(children.len(), out)?;
            for child in children {
                write_node(child, out)?;
            }
        }
    }

    Ok(())
}

fn write_list_header(size: usize, out: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    if size == 0 {
        out.push(tokens::LIST_EMPTY);
    } else if size < 256 {
        out.push(tokens::LIST_8);
        out.push(size as u8);
    } else if size < 65536 {
        out.push(tokens::LIST_16);
        out.extend_from_slice(&(size as u16).to_be_bytes());
    } else {
        return Err(BinaryNodeError::InvalidListSize(size));
    }
    Ok(())
}

fn write_string(value: &str, out: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    if value.is_empty() {
        out.push(tokens::LIST_EMPTY);
        return Ok(());
    }

    if let Some(index) = tokens::find_single_byte_token(value) {
        out.push(index);
        return Ok(());
    }

    if let Some((dictionary, index)) = tokens::find_double_byte_token(value) {
        out.push(tokens::DICTIONARY_0 + dictionary);
        out.push(index);
        return Ok(());
    }

    if value.len() <= tokens::PACKED_MAX {
        if value.bytes().all(is_nibble_byte) {
            return write_packed(tokens::NIBBLE_8, value, nibble_value, out);
        }
        if value.bytes().all(is_hex_byte) {
            return write_packed(tokens::HEX_8, value, hex_value, out);
        }
    }

    if let Some(jid) = encodable_jid(value) {
        return write_jid(&jid, out);
    }

    write_raw_bytes(value.as_bytes(), out)
}

/// A string is written as a JID only when re-formatting reproduces it exactly.
fn encodable_jid(value: &str) -> Option<Jid> {
    let jid = Jid::parse(value)?;
    if jid.user.is_empty() || jid.server.contains('@') {
        return None;
    }
    if jid.device.is_some() && jid.server != DEFAULT_USER_SERVER && jid.server != LID_SERVER {
        return None;
    }
    if jid.to_string() != value {
        return None;
    }
    Some(jid)
}

fn write_jid(jid: &Jid, out: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    if let Some(device) = jid.device {
        let domain = if jid.server == LID_SERVER { 1 } else { 0 };
        out.push(tokens::AD_JID);
        out.push(domain);
        out.push(device);
        return write_string(&jid.user, out);
    }

    out.push(tokens::JID_PAIR);
    write_string(&jid.user, out)?;
    write_string(&jid.server, out)
}

fn write_packed(
    tag: u8,
    value: &str,
    to_value: fn(u8) -> u8,
    out: &mut Vec<u8>,
) -> Result<(), BinaryNodeError> {
    let bytes = value.as_bytes();
    let half = bytes.len().div_ceil(2);
    if half > 0x7F {
        return Err(BinaryNodeError::StringTooLong);
    }

    let odd = bytes.len() % 2 == 1;
    out.push(tag);
    out.push((half as u8) | if odd { 0x80 } else { 0 });

    for pair in bytes.chunks(2) {
        let high = to_value(pair[0]);
        let low = if pair.len() == 2 {
            to_value(pair[1])
        } else {
            0x0F
        };
        out.push((high << 4) | low);
    }

    Ok(())
}

fn write_raw_bytes(payload: &[u8], out: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    let len = payload.len();
    if len < 256 {
        out.push(tokens::BINARY_8);
        out.push(len as u8);
    } else if len < (1 << 20) {
        out.push(tokens::BINARY_20);
        out.push(((len >> 16) & 0x0F) as u8);
        out.push(((len >> 8) & 0xFF) as u8);
        out.push((len & 0xFF) as u8);
    } else if u32::try_from(len).is_ok() {
        out.push(tokens::BINARY_32);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        return Err(BinaryNodeError::StringTooLong);
    }

    out.extend_from_slice(payload);
    Ok(())
}

fn is_nibble_byte(byte: u8) -> bool {
    byte.is_ascii_digit() || byte == b'-' || byte == b'.'
}

fn is_hex_byte(byte: u8) -> bool {
    byte.is_ascii_digit() || (b'A'..=b'F').contains(&byte)
}

fn nibble_value(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        b'-' => 10,
        _ => 11,
    }
}

fn hex_value(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        _ => byte - b'A' + 10,
    }
}
