use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol literal that is recognised but never accepted for key records.
pub const LEGACY_PROTOCOL: &str = "UAF";

/// Error returned when a version/protocol/status literal is not recognised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported {kind} literal: {value}")]
pub struct LiteralError {
    pub kind: &'static str,
    pub value: String,
}

impl LiteralError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// FIDO standard version a credential was produced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FidoVersion {
    #[serde(rename = "U2F_V2")]
    U2fV2,
    #[serde(rename = "2.0")]
    Fido2,
}

impl FidoVersion {
    pub const ALL: [FidoVersion; 2] = [FidoVersion::U2fV2, FidoVersion::Fido2];

    pub fn as_str(&self) -> &'static str {
        match self {
            FidoVersion::U2fV2 => "U2F_V2",
            FidoVersion::Fido2 => "2.0",
        }
    }
}

impl FromStr for FidoVersion {
    type Err = LiteralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| LiteralError::new("fido version", s))
    }
}

impl fmt::Display for FidoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticator protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FidoProtocol {
    #[serde(rename = "U2F")]
    U2f,
    #[serde(rename = "2.0")]
    Fido2,
}

impl FidoProtocol {
    pub const ALL: [FidoProtocol; 2] = [FidoProtocol::U2f, FidoProtocol::Fido2];

    pub fn as_str(&self) -> &'static str {
        match self {
            FidoProtocol::U2f => "U2F",
            FidoProtocol::Fido2 => "2.0",
        }
    }
}

impl FromStr for FidoProtocol {
    type Err = LiteralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| LiteralError::new("fido protocol", s))
    }
}

impl fmt::Display for FidoProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a credential. Credentials are never deleted here,
/// only toggled between these two states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    #[default]
    Active,
    Inactive,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "ACTIVE",
            KeyStatus::Inactive => "INACTIVE",
        }
    }
}

impl FromStr for KeyStatus {
    type Err = LiteralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(KeyStatus::Active),
            "INACTIVE" => Ok(KeyStatus::Inactive),
            _ => Err(LiteralError::new("key status", s)),
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
