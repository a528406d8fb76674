//! Identity of a rider or driver.
//!
//! Identities are opaque strings chosen by the client (`userID` on the
//! connection handshake). The only rule enforced here is that they are not
//! blank.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Non-empty identity of a user or driver (the "owner id" of an envelope).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap an identity.
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("identity must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_identity_is_rejected() {
        assert!(Identity::parse("").is_err());
        assert!(Identity::parse("   ").is_err());
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let id: Identity = "driver-7".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"driver-7\"");
        assert_eq!(id.as_str(), "driver-7");
    }
}
