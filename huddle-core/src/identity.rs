//! User and transport identities
//!
//! Two distinct identifier spaces meet in a call:
//!
//! - [`UserId`] names an account on the chat server. Signaling messages are
//!   addressed with it.
//! - [`PeerId`] is assigned by the direct-connection transport to one client
//!   instance. It is only meaningful to the transport and is exchanged over
//!   signaling so the counterpart can dial it.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Account identifier on the chat server
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Parse an identifier, refusing blank input
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("user id cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier assigned by the peer transport to a client instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new transport identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Public profile of a call participant
///
/// This is the `{id, username, avatar}` triple carried in signaling payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Account identifier
    pub id: UserId,
    /// Display name
    pub username: String,
    /// Avatar reference (URL or asset key)
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Participant {
    /// Create a participant without an avatar
    pub fn new(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            avatar: None,
        }
    }

    /// Attach an avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_parse_trims() {
        let id = UserId::parse("  alice ").unwrap();
        assert_eq!(id.as_str(), "alice");
        assert!(UserId::parse("   ").is_err());
    }

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let id = UserId::new("u1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"u1\"");
    }

    #[test]
    fn test_participant_avatar_is_optional() {
        let p: Participant = serde_json::from_str(r#"{"id":"u2","username":"bob"}"#).unwrap();
        assert_eq!(p.id, UserId::new("u2"));
        assert_eq!(p.avatar, None);

        let p = Participant::new("u3", "carol").with_avatar("avatars/carol.png");
        assert_eq!(p.avatar.as_deref(), Some("avatars/carol.png"));
    }
}
