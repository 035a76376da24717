use std::collections::HashMap;
use std::io::Read;

use bytes::Bytes;
use flate2::read::DeflateDecoder;

use crate::binary::{
    jid::{DEFAULT_USER_SERVER, LID_SERVER},
    node::{BinaryNode, NodeContent},
    tokens,
};
use crate::error::BinaryNodeError;

/// Decodes a full stanza payload, inflating when the header flag demands it.
pub fn decode(input: &[u8]) -> Result<BinaryNode, BinaryNodeError> {
    let (&flag, rest) = input.split_first().ok_or(BinaryNodeError::Truncated)?;

    if flag & 0x02 != 0 {
        let mut inflater = DeflateDecoder::new(rest);
        let mut data = Vec::new();
        inflater
            .read_to_end(&mut data)
            .map_err(|error| BinaryNodeError::Inflate(error.to_string()))?;
        decode_raw(&data)
    } else {
        decode_raw(rest)
    }
}

fn decode_raw(data: &[u8]) -> Result<BinaryNode, BinaryNodeError> {
    let mut decoder = Decoder::new(data);
    let node = decoder.read_node()?;
    if !decoder.is_eof() {
        return Err(BinaryNodeError::TrailingBytes);
    }
    Ok(node)
}

struct Decoder<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, position: 0 }
    }

    fn is_eof(&self) -> bool {
        self.position == self.input.len()
    }

    fn read_node(&mut self) -> Result<BinaryNode, BinaryNodeError> {
        let size_tag = self.read_u8()?;
        let size = self.read_list_size(size_tag)?;
        if size == 0 {
            return Err(BinaryNodeError::InvalidListSize(0));
        }

        let tag = self.read_string()?;

        let attr_count = (size - 1) / 2;
        let mut attrs = HashMap::with_capacity(attr_count);
        for _ in 0..attr_count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            attrs.insert(key, value);
        }

        // An even list size means one trailing content element.
        let content = if size % 2 == 0 {
            self.read_content()?
        } else {
            NodeContent::None
        };

        Ok(BinaryNode {
            tag,
            attrs,
            content,
        })
    }

    fn read_content(&mut self) -> Result<NodeContent, BinaryNodeError> {
        let tag = self.read_u8()?;
        match tag {
            tokens::LIST_EMPTY | tokens::LIST_8 | tokens::LIST_16 => {
                let count = self.read_list_size(tag)?;
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    children.push(self.read_node()?);
                }
                Ok(NodeContent::Children(children))
            }
            tokens::BINARY_8 => {
                let len = self.read_u8()? as usize;
                let payload = self.read_bytes(len)?;
                Ok(NodeContent::Bytes(Bytes::copy_from_slice(payload)))
            }
            tokens::BINARY_20 => {
                let len = self.read_u20()?;
                let payload = self.read_bytes(len)?;
                Ok(NodeContent::Bytes(Bytes::copy_from_slice(payload)))
            }
            tokens::BINARY_32 => {
                let len = self.read_u32()? as usize;
                let payload = self.read_bytes(len)?;
                Ok(NodeContent::Bytes(Bytes::copy_from_slice(payload)))
            }
            other => Ok(NodeContent::Text(self.read_string_with_tag(other)?)),
        }
    }

    fn read_list_size(&mut self, tag: u8) -> Result<usize, BinaryNodeError> {
        match tag {
            tokens::LIST_EMPTY => Ok(0),
            tokens::LIST_8 => Ok(self.read_u8()? as usize),
            tokens::LIST_16 => Ok(self.read_u16()? as usize),
            other => Err(BinaryNodeError::InvalidTag(other)),
        }
    }

    fn read_string(&mut self) -> Result<String, BinaryNodeError> {
        let tag = self.read_u8()?;
        self.read_string_with_tag(tag)
    }

    fn read_string_with_tag(&mut self, tag: u8) -> Result<String, BinaryNodeError> {
        match tag {
            // An empty list in string position is the empty string.
            tokens::LIST_EMPTY => Ok(String::new()),
            1..=235 => tokens::single_byte_token(tag)
                .map(str::to_owned)
                .ok_or(BinaryNodeError::UnknownToken(tag)),
            tokens::DICTIONARY_0..=tokens::DICTIONARY_3 => {
                let dictionary = tag - tokens::DICTIONARY_0;
                let index = self.read_u8()?;
                tokens::double_byte_token(dictionary, index)
                    .map(str::to_owned)
                    .ok_or(BinaryNodeError::UnknownDictionaryToken { dictionary, index })
            }
            tokens::NIBBLE_8 => self.read_packed(nibble_char),
            tokens::HEX_8 => self.read_packed(hex_char),
            tokens::JID_PAIR => {
                let user = self.read_string()?;
                let server = self.read_string()?;
                if user.is_empty() {
                    Ok(server)
                } else {
                    Ok(format!("{user}@{server}"))
                }
            }
            tokens::AD_JID => {
                let domain = self.read_u8()?;
                let device = self.read_u8()?;
                let user = self.read_string()?;
                let server = match domain {
                    0 => DEFAULT_USER_SERVER,
                    1 => LID_SERVER,
                    other => return Err(BinaryNodeError::InvalidTag(other)),
                };
                Ok(format!("{user}:{device}@{server}"))
            }
            tokens::BINARY_8 => {
                let len = self.read_u8()? as usize;
                self.read_utf8(len)
            }
            tokens::BINARY_20 => {
                let len = self.read_u20()?;
                self.read_utf8(len)
            }
            tokens::BINARY_32 => {
                let len = self.read_u32()? as usize;
                self.read_utf8(len)
            }
            other => Err(BinaryNodeError::InvalidTag(other)),
        }
    }

    fn read_packed(
        &mut self,
        to_char: fn(u8) -> Result<char, BinaryNodeError>,
    ) -> Result<String, BinaryNodeError> {
        let start = self.read_u8()?;
        let byte_len = (start & 0x7F) as usize;
        let odd = start & 0x80 != 0;

        let packed = self.read_bytes(byte_len)?;
        let mut out = String::with_capacity(byte_len * 2);
        for byte in packed {
            out.push(to_char(byte >> 4)?);
            out.push(to_char(byte & 0x0F)?);
        }

        if odd {
            out.pop();
        }
        Ok(out)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, BinaryNodeError> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BinaryNodeError::InvalidUtf8)
    }

    fn read_u8(&mut self) -> Result<u8, BinaryNodeError> {
        let byte = self
            .input
            .get(self.position)
            .copied()
            .ok_or(BinaryNodeError::Truncated)?;
        self.position += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, BinaryNodeError> {
        let raw = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn read_u20(&mut self) -> Result<usize, BinaryNodeError> {
        let raw = self.read_bytes(3)?;
        Ok((((raw[0] & 0x0F) as usize) << 16) | ((raw[1] as usize) << 8) | raw[2] as usize)
    }

    fn read_u32(&mut self) -> Result<u32, BinaryNodeError> {
        let raw = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], BinaryNodeError> {
        let end = self
            .position
            .checked_add(len)
            .ok_or(BinaryNodeError::Truncated)?;
        if end > self.input.len() {
            return Err(BinaryNodeError::Truncated);
        }

        let bytes = &self.input[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}

fn nibble_char(value: u8) -> Result<char, BinaryNodeError> {
    match value {
        0..=9 => Ok((b'0' + value) as char),
        10 => Ok('-'),
        11 => Ok('.'),
        // Filler nibble behind the odd-length flag; the caller pops it.
        15 => Ok('\0'),
        other => Err(BinaryNodeError::InvalidTag(other)),
    }
}

fn hex_char(value: u8) -> Result<char, BinaryNodeError> {
    match value {
        0..=9 => Ok((b'0' + value) as char),
        10..=15 => Ok((b'A' + value - 10) as char),
        other => Err(BinaryNodeError::InvalidTag(other)),
    }
}
