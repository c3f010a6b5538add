//! Core types for the avatar synchronization engine

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{AvatarError, AvatarResult};

/// Content hash of an avatar image, used as the cache key and as a cheap
/// "has the avatar changed" comparator.
///
/// The value is the lowercase hex rendering of the BLAKE3 digest of the
/// image bytes. The reserved empty string means "identity explicitly has no
/// avatar"; that is distinct from *absent* (`Option::None`), which means the
/// identity has never advertised a hash at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AvatarHash(String);

impl AvatarHash {
    /// Compute the content hash of raw image bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    /// The reserved "no avatar" value.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Whether this is the reserved "no avatar" value.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a hash token, validating it as either the reserved empty value
    /// or a 32-byte hex digest.
    pub fn parse(s: &str) -> AvatarResult<Self> {
        if s.is_empty() {
            return Ok(Self::empty());
        }
        let bytes = hex::decode(s).map_err(|e| AvatarError::InvalidHash(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(AvatarError::InvalidHash(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// The hex string form of the hash.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AvatarHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "<no-avatar>")
        } else {
            // First 8 hex chars are enough for log lines
            write!(f, "{}", &self.0[..8.min(self.0.len())])
        }
    }
}

/// Stable key identifying an account or a remote contact (bare address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key identifying an active identity provider for lifecycle tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider_{}", self.0)
    }
}

/// Server-stored account details supplied by an identity provider.
///
/// Any field may be missing; a provider that answers the query at all may
/// still only know a subset of the details.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountInfo {
    /// Given name, if the provider stores one
    pub first_name: Option<String>,
    /// Family name, if the provider stores one
    pub last_name: Option<String>,
    /// Free-form display name, lowest-precedence name source
    pub display_name: Option<String>,
    /// Avatar image bytes; `Some` with zero length means "explicitly none"
    pub avatar: Option<Bytes>,
}
