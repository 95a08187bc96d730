//! Peer identity, connection handles and socket tokens.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Locally assigned connection handle. `SERVER_HANDLE` always means "the server".
pub type ConnectionHandle = u64;

/// Handle reserved for the server peer from a client's point of view.
pub const SERVER_HANDLE: ConnectionHandle = 0;

/// Socket names on the packet channel are at most this many characters.
pub const MAX_SOCKET_NAME_LEN: usize = 32;

/// Stable peer identity issued by the packet channel (16 opaque bytes).
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Fresh random identity. Used by the loopback channel and tests.
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    /// Non-negative numeric digest of the identity, used as the socket name prefix.
    pub fn socket_hash(&self) -> u32 {
        let digest = Sha256::digest(self.0);
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).map_err(|_| IdentityError::InvalidPeerId(s.to_owned()))?;
        Ok(PeerId(out))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Rendezvous socket name: `{hash of local identity}{session id}`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SocketToken(String);

impl SocketToken {
    /// Token a client uses to reach the server of `session_id`.
    pub fn for_session(local: &PeerId, session_id: &str) -> Result<Self, IdentityError> {
        Self::new(format!("{}{}", local.socket_hash(), session_id))
    }

    /// Wrap a raw socket name, checking the channel's naming rules.
    pub fn new(name: impl Into<String>) -> Result<Self, IdentityError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_SOCKET_NAME_LEN
            && name.bytes().all(|b| b.is_ascii_alphanumeric());
        if !valid {
            return Err(IdentityError::InvalidSocketName(name));
        }
        Ok(SocketToken(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this token was minted for `session_id`.
    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.0.ends_with(session_id)
    }
}

impl fmt::Display for SocketToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid peer id: {0:?}")]
    InvalidPeerId(String),
    #[error("invalid socket name: {0:?}")]
    InvalidSocketName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_serializes_as_hex_string() {
        #[derive(Serialize)]
        struct Entry {
            peer: PeerId,
        }
        let peer = PeerId::from_bytes([0xab; 16]);
        let text = toml::to_string(&Entry { peer }).unwrap();
        assert_eq!(text.trim(), format!("peer = \"{}\"", "ab".repeat(16)));
    }

    #[test]
    fn peer_id_text_roundtrip() {
        let id = PeerId::generate();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn peer_id_rejects_bad_hex() {
        assert!("zz".parse::<PeerId>().is_err());
        assert!("00ff".parse::<PeerId>().is_err());
    }

    #[test]
    fn socket_hash_is_deterministic() {
        let id = PeerId::from_bytes([7u8; 16]);
        assert_eq!(id.socket_hash(), PeerId::from_bytes([7u8; 16]).socket_hash());
    }

    #[test]
    fn token_ends_with_session() {
        let id = PeerId::generate();
        let token = SocketToken::for_session(&id, "lobby42").unwrap();
        assert!(token.as_str().starts_with(&id.socket_hash().to_string()));
        assert!(token.belongs_to("lobby42"));
        assert!(!token.belongs_to("lobby43"));
    }

    #[test]
    fn token_rejects_dash_and_overlong_names() {
        assert!(SocketToken::new("12-lobby").is_err());
        assert!(SocketToken::new("").is_err());
        assert!(SocketToken::new("a".repeat(MAX_SOCKET_NAME_LEN + 1)).is_err());
        assert!(SocketToken::new("a".repeat(MAX_SOCKET_NAME_LEN)).is_ok());
    }
}
