//! Client identifier parsing and validation.
//!
//! A client address is a 64-character hex string naming one side of a bridge
//! conversation. Validation happens once, at the HTTP boundary; the rest of
//! the engine only ever sees well-formed [`ClientId`] values.

use std::fmt;

use serde::Serialize;

/// Why a candidate address string was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    Missing,
    Length,
    Format,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::Missing => write!(f, "public address must be set"),
            AddressError::Length => write!(f, "public address must be 64 characters long"),
            AddressError::Format => write!(f, "public address must be a valid hex string"),
        }
    }
}

impl std::error::Error for AddressError {}

/// A validated 64-character hex client identifier.
///
/// Equality is exact byte equality; this is the sole key under which queues
/// and subscriptions are organized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(String);

impl ClientId {
    pub const HEX_LEN: usize = 64;

    /// Parse and validate a candidate address. Surrounding whitespace is
    /// ignored.
    pub fn parse(raw: &str) -> Result<ClientId, AddressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Missing);
        }
        if trimmed.len() != Self::HEX_LEN {
            return Err(AddressError::Length);
        }
        if hex::decode(trimmed).is_err() {
            return Err(AddressError::Format);
        }
        Ok(ClientId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
