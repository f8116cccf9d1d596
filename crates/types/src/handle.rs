use crate::{DomainId, KeyId, ServerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Separator between the handle components.
pub const HANDLE_DELIMITER: char = '-';

/// Errors raised while decoding a presented handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("handle is empty")]
    Empty,
    #[error("handle `{handle}` does not have the form server-domain-username-keyid")]
    Malformed { handle: String },
    #[error("handle `{handle}` has a non-numeric {component}")]
    InvalidComponent {
        handle: String,
        component: &'static str,
    },
}

/// Textual credential identifier `"{server}-{domain}-{username}-{key_id}"`.
///
/// The same string is the display form of the composite primary key and the
/// bearer token callers present to activate or deactivate the credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Build the canonical handle for a credential identity.
    pub fn compose(
        server_id: ServerId,
        domain_id: DomainId,
        username: &str,
        key_id: KeyId,
    ) -> Self {
        Self(format!(
            "{server_id}{d}{domain_id}{d}{username}{d}{key_id}",
            d = HANDLE_DELIMITER
        ))
    }

    /// Wrap a caller-supplied string without checking it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a presented handle into its components.
    ///
    /// Server and domain are the first two tokens; the key id is the token
    /// after the last delimiter. Everything in between is the embedded
    /// username, which may itself contain the delimiter because the other
    /// three components are purely numeric.
    pub fn decode(raw: &str) -> Result<DecodedHandle, HandleError> {
        if raw.is_empty() {
            return Err(HandleError::Empty);
        }
        let malformed = || HandleError::Malformed {
            handle: raw.to_string(),
        };

        let mut parts = raw.splitn(3, HANDLE_DELIMITER);
        let server = parts.next().ok_or_else(malformed)?;
        let domain = parts.next().ok_or_else(malformed)?;
        let remainder = parts.next().ok_or_else(malformed)?;
        let (username, key) = remainder
            .rsplit_once(HANDLE_DELIMITER)
            .ok_or_else(malformed)?;
        if username.is_empty() {
            return Err(malformed());
        }

        Ok(DecodedHandle {
            server_id: parse_component(raw, server, "server id")?,
            domain_id: parse_component(raw, domain, "domain id")?,
            embedded_username: username.to_string(),
            key_id: parse_component(raw, key, "key id")?,
        })
    }
}

fn parse_component<T: std::str::FromStr>(
    handle: &str,
    token: &str,
    component: &'static str,
) -> Result<T, HandleError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HandleError::InvalidComponent {
            handle: handle.to_string(),
            component,
        });
    }
    token.parse().map_err(|_| HandleError::InvalidComponent {
        handle: handle.to_string(),
        component,
    })
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Components recovered from a presented handle.
///
/// `embedded_username` is informational only: authorization always
/// recomputes the handle from the caller's authenticated username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHandle {
    pub server_id: ServerId,
    pub domain_id: DomainId,
    pub embedded_username: String,
    pub key_id: KeyId,
}

impl DecodedHandle {
    /// Recompute the canonical handle for `username` in `domain_id` using
    /// the server and key id carried by this handle.
    pub fn recompute(&self, domain_id: DomainId, username: &str) -> Handle {
        Handle::compose(self.server_id, domain_id, username, self.key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_matches_documented_layout() {
        assert_eq!(Handle::compose(5, 1, "alice", 7).as_str(), "5-1-alice-7");
    }

    #[test]
    fn decode_round_trips_issued_handle() {
        let handle = Handle::compose(5, 1, "alice", 7);
        let decoded = Handle::decode(handle.as_str()).unwrap();
        assert_eq!(decoded.server_id, 5);
        assert_eq!(decoded.domain_id, 1);
        assert_eq!(decoded.embedded_username, "alice");
        assert_eq!(decoded.key_id, 7);
        assert_eq!(decoded.recompute(1, "alice"), handle);
    }

    #[test]
    fn usernames_with_delimiter_decode_unambiguously() {
        let handle = Handle::compose(2, 10, "mary-jane-doe", 42);
        let decoded = Handle::decode(handle.as_str()).unwrap();
        assert_eq!(decoded.embedded_username, "mary-jane-doe");
        assert_eq!(decoded.key_id, 42);
        assert_eq!(decoded.recompute(10, "mary-jane-doe"), handle);
    }

    #[test]
    fn recompute_with_other_user_differs() {
        let decoded = Handle::decode("5-1-bob-7").unwrap();
        assert_ne!(decoded.recompute(1, "alice").as_str(), "5-1-bob-7");
    }

    #[test]
    fn rejects_malformed_handles() {
        assert_eq!(Handle::decode(""), Err(HandleError::Empty));
        assert!(matches!(
            Handle::decode("5-1-7"),
            Err(HandleError::Malformed { .. })
        ));
        assert!(matches!(
            Handle::decode("5-1"),
            Err(HandleError::Malformed { .. })
        ));
        assert!(matches!(
            Handle::decode("x-1-alice-7"),
            Err(HandleError::InvalidComponent {
                component: "server id",
                ..
            })
        ));
        assert!(matches!(
            Handle::decode("5-1-alice-seven"),
            Err(HandleError::InvalidComponent {
                component: "key id",
                ..
            })
        ));
        assert!(matches!(
            Handle::decode("+5-1-alice-7"),
            Err(HandleError::InvalidComponent { .. })
        ));
    }
}
