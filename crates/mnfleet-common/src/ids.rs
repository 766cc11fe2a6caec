//! ---
//! mnf_section: "01-core-functionality"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Shared primitives and utilities for the fleet runtime."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Validated identifier types.
//!
//! Every type here is constructed through `FromStr`/`TryFrom<String>` and
//! rejects malformed input with a [`ValidationError`], so an instantiated
//! value is always well-formed. The original text is stored verbatim and
//! returned unchanged by `Display`/`as_str`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum label length accepted by [`Label`].
pub const MAX_LABEL_LEN: usize = 64;

/// Errors raised when a value fails shape validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),
    #[error("invalid label {value:?}: {reason}")]
    InvalidLabel { value: String, reason: &'static str },
    #[error("invalid genkey {0:?}: expected 50 alphanumeric characters")]
    InvalidGenkey(String),
    #[error("invalid receiving address {0:?}: expected 34 alphanumeric characters")]
    InvalidReceivingAddress(String),
    #[error("invalid instance id {0:?}")]
    InvalidInstanceId(String),
    #[error("invalid transaction hash {0:?}: expected 64 word characters")]
    InvalidTxHash(String),
    #[error("label scheme {scheme:?} contains no '#' placeholder")]
    MissingPlaceholder { scheme: String },
    #[error(
        "iterator {iterator} needs {digits} digits but the placeholder in {scheme:?} is {width} wide"
    )]
    LabelOverflow {
        scheme: String,
        iterator: u64,
        width: usize,
        digits: usize,
    },
    #[error("{0}")]
    Other(String),
}

macro_rules! string_identifier {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

/// An IPv4 address in dotted-quad notation.
///
/// Octets may carry leading zeros (`010.0.0.1`) as long as each is at most
/// three digits and no greater than 255.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ip(String);

impl FromStr for Ip {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.split('.').collect();
        let valid = octets.len() == 4
            && octets.iter().all(|octet| {
                !octet.is_empty()
                    && octet.len() <= 3
                    && octet.bytes().all(|b| b.is_ascii_digit())
                    && octet.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
            });
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(ValidationError::InvalidAddress(s.to_owned()))
        }
    }
}

string_identifier!(Ip);

/// Fleet-wide unique instance label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    /// Derive the hostname announced to the provider for this label.
    pub fn hostname(&self) -> Hostname {
        Hostname::from_label(self)
    }
}

impl FromStr for Label {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reason = if s.is_empty() {
            Some("label must not be empty")
        } else if s.chars().any(char::is_whitespace) {
            Some("label must not contain whitespace")
        } else if s.chars().count() > MAX_LABEL_LEN {
            Some("label exceeds 64 characters")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ValidationError::InvalidLabel {
                value: s.to_owned(),
                reason,
            }),
            None => Ok(Self(s.to_owned())),
        }
    }
}

string_identifier!(Label);

/// Hostname derived from a [`Label`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hostname(String);

impl Hostname {
    pub fn from_label(label: &Label) -> Self {
        let mapped: String = label
            .as_str()
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_alphanumeric() || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let trimmed = mapped.trim_matches('-');
        if trimmed.is_empty() {
            Self("node".to_owned())
        } else {
            Self(trimmed.to_owned())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-assigned instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

impl FromStr for InstanceId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            Ok(Self(s.to_owned()))
        } else {
            Err(ValidationError::InvalidInstanceId(s.to_owned()))
        }
    }
}

string_identifier!(InstanceId);

/// Masternode private key as produced by `masternode genkey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Genkey(String);

impl FromStr for Genkey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 50 && s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(s.to_owned()))
        } else {
            Err(ValidationError::InvalidGenkey(s.to_owned()))
        }
    }
}

string_identifier!(Genkey);

/// Wallet receiving address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReceivingAddress(String);

impl FromStr for ReceivingAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 34 && s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(s.to_owned()))
        } else {
            Err(ValidationError::InvalidReceivingAddress(s.to_owned()))
        }
    }
}

string_identifier!(ReceivingAddress);

/// Collateral transaction hash (64 word characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash(String);

impl TxHash {
    /// Whether `token` has the shape of a transaction hash.
    pub fn is_hash_like(token: &str) -> bool {
        token.len() == 64 && token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    }
}

impl FromStr for TxHash {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_hash_like(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(ValidationError::InvalidTxHash(s.to_owned()))
        }
    }
}

string_identifier!(TxHash);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_quads_round_trip() {
        for raw in ["0.0.0.0", "255.255.255.255", "192.168.1.10", "010.001.0.9"] {
            let ip: Ip = raw.parse().expect("valid address");
            assert_eq!(ip.to_string(), raw);
            assert_eq!(ip.as_str(), raw);
        }
    }

    #[test]
    fn malformed_addresses_rejected() {
        for raw in [
            "",
            "1.2.3",
            "1.2.3.4.5",
            "256.1.1.1",
            "1.2.3.-4",
            "a.b.c.d",
            "1..2.3",
            "0001.2.3.4",
            " 1.2.3.4",
            "example.com",
        ] {
            assert_eq!(
                raw.parse::<Ip>(),
                Err(ValidationError::InvalidAddress(raw.to_owned())),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn every_octet_boundary_is_checked() {
        for octet in 0..=255u16 {
            let raw = format!("10.{octet}.0.1");
            assert!(raw.parse::<Ip>().is_ok());
        }
        for octet in [256u16, 300, 999] {
            let raw = format!("10.0.{octet}.1");
            assert!(raw.parse::<Ip>().is_err());
        }
    }

    #[test]
    fn label_rules() {
        assert!("COIN-W001-MN001".parse::<Label>().is_ok());
        assert!("".parse::<Label>().is_err());
        assert!("two words".parse::<Label>().is_err());
        assert!("x".repeat(65).parse::<Label>().is_err());
    }

    #[test]
    fn hostname_is_derived_from_label() {
        let label: Label = "Coin_W001.MN007".parse().unwrap();
        assert_eq!(label.hostname().as_str(), "coin-w001-mn007");
        let odd: Label = "__".parse().unwrap();
        assert_eq!(odd.hostname().as_str(), "node");
    }

    #[test]
    fn key_shapes() {
        assert!("a".repeat(50).parse::<Genkey>().is_ok());
        assert!("a".repeat(49).parse::<Genkey>().is_err());
        assert!(format!("{}!", "a".repeat(49)).parse::<Genkey>().is_err());
        assert!("G".repeat(34).parse::<ReceivingAddress>().is_ok());
        assert!("G".repeat(35).parse::<ReceivingAddress>().is_err());
        assert!("f".repeat(64).parse::<TxHash>().is_ok());
        assert!("f".repeat(63).parse::<TxHash>().is_err());
        assert!("12345678".parse::<InstanceId>().is_ok());
        assert!("".parse::<InstanceId>().is_err());
    }

    #[test]
    fn serde_goes_through_validation() {
        let ip: Ip = serde_json::from_str("\"10.0.0.1\"").unwrap();
        assert_eq!(ip.as_str(), "10.0.0.1");
        assert!(serde_json::from_str::<Ip>("\"10.0.0\"").is_err());
        assert_eq!(serde_json::to_string(&ip).unwrap(), "\"10.0.0.1\"");
    }
}
