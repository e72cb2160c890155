//! Identifier types shared across the vocabularies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Identifier of a remote execution unit (the `reference` field on the wire).
pub type EcuId = i32;

/// Server-visible application identifier.
pub type AppId = i32;

/// Identifier of a plugin port.
pub type PortId = i32;

/// Short-lived identifier correlating an ECU command with its acknowledgment.
///
/// The wire format reserves a single byte. Issued values are in `[1, 255]`;
/// `0` never identifies an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct OperationId(u8);

impl OperationId {
    /// Smallest issued identifier.
    pub const MIN: OperationId = OperationId(1);

    /// Largest issued identifier.
    pub const MAX: OperationId = OperationId(u8::MAX);

    /// Number of distinct identifiers that can be in flight at once.
    pub const CAPACITY: usize = u8::MAX as usize;

    /// Wrap a raw wire value. Returns `None` for the reserved value `0`.
    pub fn new(raw: u8) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Raw wire value.
    pub fn get(self) -> u8 {
        self.0
    }

    /// The identifier issued after this one, wrapping from 255 to 1.
    pub fn successor(self) -> Self {
        match self.0.checked_add(1) {
            Some(next) => Self(next),
            None => Self::MIN,
        }
    }
}

impl TryFrom<u8> for OperationId {
    type Error = MessageError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| MessageError::Malformed("operation id 0 is reserved".into()))
    }
}

impl From<OperationId> for u8 {
    fn from(id: OperationId) -> Self {
        id.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
