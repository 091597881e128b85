//! Crate-wide error taxonomy.
//!
//! Every component boundary returns one of its own `thiserror`-derived enums;
//! this module defines the sum type those enums funnel into, mirroring the
//! abstract error kinds from the relayer design (`ValidationError`,
//! `UpstreamUnavailable`, `CircuitOpen`, `RateLimited`, `ChainError`,
//! `StorageError`).

use std::fmt;

/// Whether a [`ChainError`] should be retried by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorKind {
    /// RPC timeout, nonce-too-low/too-high, underpriced — retry.
    Transient,
    /// Insufficient funds, invalid recipient, execution reverted — never retry.
    Permanent,
}

impl fmt::Display for ChainErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainErrorKind::Transient => write!(f, "transient"),
            ChainErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// The crate-wide error sum type. Component-local errors convert into this
/// via `#[from]` at the point they cross a component boundary.
#[derive(Debug, thiserror::Error)]
pub enum RelayerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("circuit open, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    #[error("rate limited")]
    RateLimited,

    #[error("chain error ({kind}): {message}")]
    Chain {
        kind: ChainErrorKind,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl RelayerError {
    pub fn validation(message: impl Into<String>) -> Self {
        RelayerError::Validation(message.into())
    }

    pub fn chain_transient(message: impl Into<String>) -> Self {
        RelayerError::Chain {
            kind: ChainErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn chain_permanent(message: impl Into<String>) -> Self {
        RelayerError::Chain {
            kind: ChainErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayerError::UpstreamUnavailable(_)
                | RelayerError::RateLimited
                | RelayerError::Chain {
                    kind: ChainErrorKind::Transient,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RelayerError::chain_transient("nonce too low").is_transient());
        assert!(!RelayerError::chain_permanent("execution reverted").is_transient());
        assert!(RelayerError::UpstreamUnavailable("timeout".into()).is_transient());
        assert!(!RelayerError::validation("bad amount").is_transient());
    }
}
