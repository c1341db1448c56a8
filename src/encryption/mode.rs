//! # Encryption Mode
//!
//! The symmetric algorithm (or the lack of one) a key is used with.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the dummy key carried by `identity` keys
const IDENTITY_KEY_LEN: usize = 16;

/// Length of randomly generated `aescbc` and `secretbox` keys
const RANDOM_KEY_LEN: usize = 32;

/// Encryption mode of a key.
///
/// `Identity` means encryption is disabled. Identity keys still carry a dummy key so
/// they move through the same lifecycle as real keys.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    AesCbc,
    SecretBox,
    #[default]
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown encryption mode {0:?}")]
pub struct UnknownModeError(pub String);

impl Mode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Mode::AesCbc => "aescbc",
            Mode::SecretBox => "secretbox",
            Mode::Identity => "identity",
        }
    }

    /// Generate fresh key material for this mode.
    ///
    /// Identity keys are all zeroes; the other modes draw from the OS CSPRNG.
    pub fn generate_key(self) -> Vec<u8> {
        match self {
            Mode::Identity => vec![0; IDENTITY_KEY_LEN],
            Mode::AesCbc | Mode::SecretBox => {
                let mut key = vec![0; RANDOM_KEY_LEN];
                rand::rngs::OsRng.fill_bytes(&mut key);
                key
            }
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = UnknownModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aescbc" => Ok(Mode::AesCbc),
            "secretbox" => Ok(Mode::SecretBox),
            "identity" => Ok(Mode::Identity),
            other => Err(UnknownModeError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_round_trips_known_modes() {
        for mode in [Mode::AesCbc, Mode::SecretBox, Mode::Identity] {
            assert_eq!(mode.as_str().parse::<Mode>(), Ok(mode));
        }
    }

    #[test]
    fn test_mode_rejects_unknown() {
        assert_eq!(
            "kms".parse::<Mode>(),
            Err(UnknownModeError("kms".to_string()))
        );
        assert!("AESCBC".parse::<Mode>().is_err());
    }

    #[test]
    fn test_generated_key_lengths() {
        assert_eq!(Mode::AesCbc.generate_key().len(), 32);
        assert_eq!(Mode::SecretBox.generate_key().len(), 32);

        let identity = Mode::Identity.generate_key();
        assert_eq!(identity.len(), 16);
        assert!(identity.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_random_keys_differ() {
        assert_ne!(Mode::AesCbc.generate_key(), Mode::AesCbc.generate_key());
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        assert_eq!(
            serde_json::to_string(&Mode::SecretBox).unwrap(),
            "\"secretbox\""
        );
        assert_eq!(
            serde_json::from_str::<Mode>("\"aescbc\"").unwrap(),
            Mode::AesCbc
        );
    }
}
