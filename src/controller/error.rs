//! # Controller Errors

use thiserror::Error;

use crate::encryption::codec::CodecError;
use crate::encryption::config::ConfigError;
use crate::encryption::revision::RevisionError;
use crate::store::StoreError;

/// Error returned by a single reconciliation
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Revision(#[from] RevisionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// An existing key object does not match what minting would have produced.
    /// Never retried automatically.
    #[error("key secret {name} failed validation: {reason}")]
    KeyIntegrity { name: String, reason: String },
    #[error("{}", join(.0))]
    Aggregate(Vec<ControllerError>),
}

fn join(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControllerError {
    /// Fatal errors halt the controller until the state is corrected externally
    pub fn is_fatal(&self) -> bool {
        match self {
            ControllerError::KeyIntegrity { .. } => true,
            ControllerError::Aggregate(errors) => errors.iter().any(ControllerError::is_fatal),
            _ => false,
        }
    }

    /// Machine readable reason used in degraded conditions
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Store(_) => "StoreError",
            ControllerError::Config(_) => "InvalidEncryptionConfig",
            ControllerError::Revision(_) => "InstanceStateUnknown",
            ControllerError::Codec(_) => "KeyEncodingFailed",
            ControllerError::KeyIntegrity { .. } => "KeyIntegrityViolation",
            ControllerError::Aggregate(errors) => {
                if self.is_fatal() {
                    "KeyIntegrityViolation"
                } else if errors.len() == 1 {
                    errors[0].reason()
                } else {
                    "MultipleErrors"
                }
            }
        }
    }

    /// Collapse collected errors: none is success, one is returned as is
    pub fn aggregate(mut errors: Vec<ControllerError>) -> Result<(), ControllerError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ControllerError::Aggregate(errors)),
        }
    }
}
