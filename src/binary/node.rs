use std::collections::HashMap;

use bytes::Bytes;

/// A single stanza: the wire unit of application-layer messaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryNode {
    /// Node tag.
    pub tag: String,
    /// Node attributes; keys are unique.
    pub attrs: HashMap<String, String>,
    /// Node body.
    pub content: NodeContent,
}

/// Body content carried by a [`BinaryNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    /// No body.
    None,
    /// Text payload.
    Text(String),
    /// Raw payload bytes.
    Bytes(Bytes),
    /// Nested child nodes, in order.
    Children(Vec<BinaryNode>),
}

impl BinaryNode {
    /// Creates a node with no attributes and no content.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: HashMap::new(),
            content: NodeContent::None,
        }
    }

    /// Adds an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Replaces the content with child nodes.
    pub fn children(mut self, children: Vec<BinaryNode>) -> Self {
        self.content = NodeContent::Children(children);
        self
    }

    /// Replaces the content with raw bytes.
    pub fn bytes(mut self, payload: impl Into<Bytes>) -> Self {
        self.content = NodeContent::Bytes(payload.into());
        self
    }

    /// Replaces the content with text.
    pub fn text(mut self, payload: impl Into<String>) -> Self {
        self.content = NodeContent::Text(payload.into());
        self
    }

    /// Looks up an attribute value.
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Returns the child nodes, or an empty slice for other content kinds.
    pub fn child_nodes(&self) -> &[BinaryNode] {
        match &self.content {
            NodeContent::Children(children) => children,
            _ => &[],
        }
    }

    /// Finds the first child with the given tag.
    pub fn find_child(&self, tag: &str) -> Option<&BinaryNode> {
        self.child_nodes().iter().find(|child| child.tag == tag)
    }

    /// Collects every child with the given tag.
    pub fn find_children<'a>(&'a self, tag: &str) -> Vec<&'a BinaryNode> {
        self.child_nodes()
            .iter()
            .filter(|child| child.tag == tag)
            .collect()
    }

    /// Returns the byte content, if the body is bytes.
    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes.as_ref()),
            _ => None,
        }
    }
}
