//! Tagged binary codec for the XML-like stanza tree.

mod decode;
mod encode;
pub mod jid;
mod node;
pub mod tokens;

pub use decode::decode;
pub use encode::encode;
pub use jid::Jid;
pub use node::{BinaryNode, NodeContent};

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{decode, encode, BinaryNode, NodeContent};

    fn roundtrip(node: &BinaryNode) -> BinaryNode {
        let encoded = encode(node).expect("encode");
        decode(&encoded).expect("decode")
    }

    #[test]
    fn empty_node_roundtrips() {
        let node = BinaryNode::new("presence");
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn attributes_and_text_roundtrip() {
        let node = BinaryNode::new("iq")
            .attr("id", "abc-123")
            .attr("type", "get")
            .text("hello world");
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn packed_and_jid_attrs_roundtrip() {
        let node = BinaryNode::new("message")
            .attr("to", "15550002222@s.whatsapp.net")
            .attr("participant", "15550002222:3@s.whatsapp.net")
            .attr("t", "1700000000")
            .attr("id", "3EB0D4FF21A0");
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn nested_children_roundtrip() {
        let node = BinaryNode::new("iq").attr("type", "result").children(vec![
            BinaryNode::new("pair-device").children(vec![
                BinaryNode::new("ref").bytes(Bytes::from_static(b"2@abcdef")),
                BinaryNode::new("ref").bytes(Bytes::from_static(b"2@ghijkl")),
            ]),
        ]);
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn binary_content_length_boundaries_roundtrip() {
        for len in [0_usize, 1, 255, 256, 65535, 1 << 20] {
            let node = BinaryNode::new("enc")
                .attr("v", "2")
                .bytes(Bytes::from(vec![0xA5_u8; len]));
            assert_eq!(roundtrip(&node), node, "length {len}");
        }
    }

    #[test]
    fn decode_then_encode_is_byte_identical() {
        let node = BinaryNode::new("receipt")
            .attr("to", "15550001111@s.whatsapp.net")
            .attr("id", "0A1B2C3D");
        let encoded = encode(&node).expect("encode");
        let reencoded = encode(&decode(&encoded).expect("decode")).expect("encode");
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn unknown_control_tag_fails() {
        // 0x01 list header with an unassigned control byte in tag position.
        let bogus = [0x00, 0xF8, 0x01, 0xF0];
        assert!(decode(&bogus).is_err());
    }

    #[test]
    fn empty_string_decodes_from_empty_list_tag() {
        let node = BinaryNode::new("presence").attr("name", "");
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn homogeneous_child_list_preserves_order() {
        let children: Vec<BinaryNode> = (0..5)
            .map(|index| BinaryNode::new("key").attr("id", index.to_string()))
            .collect();
        let node = BinaryNode::new("list").children(children.clone());
        let decoded = roundtrip(&node);
        let NodeContent::Children(decoded_children) = decoded.content else {
            panic!("expected children");
        };
        assert_eq!(decoded_children, children);
    }
}
