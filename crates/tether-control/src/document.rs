//! Control document tree
//!
//! Documents are dictionaries with string keys and typed leaves. The daemon
//! assembles them for notifications and request replies; clients frame and
//! serialize them on the wire.

use std::collections::BTreeMap;

/// A control document value
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Document {
    /// UTF-8 string leaf
    String(String),
    /// Unsigned integer leaf
    UInt(u64),
    /// Boolean leaf
    Bool(bool),
    /// Raw bytes leaf
    Data(Vec<u8>),
    /// Ordered list of values
    Array(Vec<Document>),
    /// String-keyed dictionary
    Dict(BTreeMap<String, Document>),
}

impl Document {
    /// Look up a key in a dictionary document
    pub fn get(&self, key: &str) -> Option<&Document> {
        match self {
            Document::Dict(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Number of entries in a dictionary or array, 0 for leaves
    pub fn len(&self) -> usize {
        match self {
            Document::Array(items) => items.len(),
            Document::Dict(entries) => entries.len(),
            _ => 0,
        }
    }

    /// True for an empty dictionary or array
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the string value, if this is a string leaf
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Document::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the integer value, if this is an unsigned integer leaf
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Document::UInt(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the boolean value, if this is a boolean leaf
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Document::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the raw bytes, if this is a data leaf
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Document::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Get the items, if this is an array
    pub fn as_array(&self) -> Option<&[Document]> {
        match self {
            Document::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Get the entries, if this is a dictionary
    pub fn as_dict(&self) -> Option<&BTreeMap<String, Document>> {
        match self {
            Document::Dict(entries) => Some(entries),
            _ => None,
        }
    }
}

impl From<&str> for Document {
    fn from(s: &str) -> Self {
        Document::String(s.to_string())
    }
}

impl From<String> for Document {
    fn from(s: String) -> Self {
        Document::String(s)
    }
}

impl From<u64> for Document {
    fn from(n: u64) -> Self {
        Document::UInt(n)
    }
}

impl From<u32> for Document {
    fn from(n: u32) -> Self {
        Document::UInt(n as u64)
    }
}

impl From<u16> for Document {
    fn from(n: u16) -> Self {
        Document::UInt(n as u64)
    }
}

impl From<bool> for Document {
    fn from(b: bool) -> Self {
        Document::Bool(b)
    }
}

impl From<Vec<u8>> for Document {
    fn from(bytes: Vec<u8>) -> Self {
        Document::Data(bytes)
    }
}

impl From<Vec<Document>> for Document {
    fn from(items: Vec<Document>) -> Self {
        Document::Array(items)
    }
}

/// Builder for dictionary documents
///
/// Keeps notification assembly readable: every outbound document is a
/// dictionary at the top level.
#[derive(Debug, Default)]
pub struct DocBuilder {
    entries: BTreeMap<String, Document>,
}

impl DocBuilder {
    /// Start an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing any previous value for the key
    pub fn put(mut self, key: &str, value: impl Into<Document>) -> Self {
        self.entries.insert(key.to_string(), value.into());
        self
    }

    /// Add an entry only when the value is present
    pub fn put_opt(self, key: &str, value: Option<impl Into<Document>>) -> Self {
        match value {
            Some(v) => self.put(key, v),
            None => self,
        }
    }

    /// Finish the dictionary
    pub fn build(self) -> Document {
        Document::Dict(self.entries)
    }
}
