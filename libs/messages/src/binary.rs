//! Plugin binary payload.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw plugin binary, carried base64-encoded on the wire.
///
/// `Debug` prints only the length so commands can be logged safely.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginBinary(#[serde(with = "crate::base64_bytes")] Vec<u8>);

impl PluginBinary {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for PluginBinary {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PluginBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginBinary({} bytes)", self.0.len())
    }
}
