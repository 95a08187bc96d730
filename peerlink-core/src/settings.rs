//! Transport settings: who we are, who the server is, and which session we belong to.

use serde::Deserialize;

use crate::identity::{PeerId, MAX_SOCKET_NAME_LEN};

/// Digits of the largest socket hash prefix (`u32::MAX`).
const SOCKET_HASH_DIGITS: usize = 10;

/// Longest session id that still fits in a socket name after the hash prefix.
pub const MAX_SESSION_ID_LEN: usize = MAX_SOCKET_NAME_LEN - SOCKET_HASH_DIGITS;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportSettings {
    /// Identity of the hosting peer (handle 0 for clients).
    pub server_peer: PeerId,
    /// Identity of this peer on the packet channel.
    pub local_peer: PeerId,
    /// Logical session; only connection requests whose socket name ends with it are accepted.
    pub session_id: String,
}

impl TransportSettings {
    pub fn new(server_peer: PeerId, local_peer: PeerId, session_id: impl Into<String>) -> Self {
        Self {
            server_peer,
            local_peer,
            session_id: session_id.into(),
        }
    }

    /// Check the session id can be embedded in a socket name.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let id = &self.session_id;
        if id.is_empty() {
            return Err(SettingsError::EmptySessionId);
        }
        if !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(SettingsError::InvalidSessionId(id.clone()));
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(SettingsError::SessionIdTooLong(id.len()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("session id is empty")]
    EmptySessionId,
    #[error("session id {0:?} must be ASCII alphanumeric")]
    InvalidSessionId(String),
    #[error("session id is {0} characters, at most {MAX_SESSION_ID_LEN} allowed")]
    SessionIdTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SocketToken;

    fn settings(session: &str) -> TransportSettings {
        TransportSettings::new(PeerId::generate(), PeerId::generate(), session)
    }

    #[test]
    fn validate_session_id() {
        assert!(settings("lobby1").validate().is_ok());
        assert_eq!(settings("").validate(), Err(SettingsError::EmptySessionId));
        assert!(matches!(
            settings("my-lobby").validate(),
            Err(SettingsError::InvalidSessionId(_))
        ));
        assert_eq!(
            settings(&"x".repeat(MAX_SESSION_ID_LEN + 1)).validate(),
            Err(SettingsError::SessionIdTooLong(MAX_SESSION_ID_LEN + 1))
        );
    }

    #[test]
    fn settings_from_toml() {
        let s: TransportSettings = toml::from_str(
            r#"
            server_peer = "000102030405060708090a0b0c0d0e0f"
            local_peer = "ffeeddccbbaa99887766554433221100"
            session_id = "lobby"
            "#,
        )
        .unwrap();
        assert_eq!(s.server_peer, PeerId::from_bytes(core::array::from_fn(|i| i as u8)));
        assert_eq!(s.local_peer.to_string(), "ffeeddccbbaa99887766554433221100");
        assert!(s.validate().is_ok());

        let bad_id = r#"
            server_peer = "nothex"
            local_peer = "ffeeddccbbaa99887766554433221100"
            session_id = "lobby"
        "#;
        assert!(toml::from_str::<TransportSettings>(bad_id).is_err());
        let unknown = r#"
            server_peer = "000102030405060708090a0b0c0d0e0f"
            local_peer = "ffeeddccbbaa99887766554433221100"
            session_id = "lobby"
            port = 7
        "#;
        assert!(toml::from_str::<TransportSettings>(unknown).is_err());
    }

    #[test]
    fn longest_session_id_always_makes_a_token() {
        let s = settings(&"x".repeat(MAX_SESSION_ID_LEN));
        assert!(s.validate().is_ok());
        let worst = PeerId::from_bytes([0xff; 16]);
        assert!(SocketToken::for_session(&worst, &s.session_id).is_ok());
        assert!(SocketToken::for_session(&s.local_peer, &s.session_id).is_ok());
    }
}
