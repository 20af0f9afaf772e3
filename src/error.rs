//! Error types for the admission engines and their collaborators.

use std::fmt;

/// Unified error type for engine construction, configuration parsing, and
/// shared-store access.
#[derive(Debug, Clone)]
pub enum RateLimitError {
    /// Invalid policy or configuration input: non-positive capacity, rate,
    /// or window, or an unknown algorithm tag. Surfaced at construction and
    /// prevents the engine from serving any request.
    Configuration { message: String },
    /// The shared store could not be reached or rejected the admission
    /// script. The admission pipeline maps this to its failure mode.
    Transport { message: String },
    /// Stored per-key state violated an engine invariant (negative count,
    /// non-finite level). The engine erases the key and denies the
    /// triggering request.
    StateCorruption { key: String, detail: String },
}

impl RateLimitError {
    /// Construct a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Construct a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Construct a state-corruption error for `key`.
    pub fn state_corruption(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StateCorruption { key: key.into(), detail: detail.into() }
    }

    /// Check if this error is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Check if this error is a transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Check if this error reports corrupted per-key state.
    pub fn is_state_corruption(&self) -> bool {
        matches!(self, Self::StateCorruption { .. })
    }
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { message } => {
                write!(f, "invalid rate limit configuration: {}", message)
            }
            Self::Transport { message } => {
                write!(f, "rate limit store unreachable: {}", message)
            }
            Self::StateCorruption { key, detail } => {
                write!(f, "corrupted rate limit state for key '{}': {}", key, detail)
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_display() {
        let err = RateLimitError::configuration("capacity must be at least 1");
        let msg = format!("{}", err);
        assert!(msg.contains("invalid rate limit configuration"));
        assert!(msg.contains("capacity"));
    }

    #[test]
    fn transport_display() {
        let err = RateLimitError::transport("connection refused");
        assert!(format!("{}", err).contains("unreachable"));
    }

    #[test]
    fn corruption_display_names_key() {
        let err = RateLimitError::state_corruption("42", "negative count");
        let msg = format!("{}", err);
        assert!(msg.contains("'42'"));
        assert!(msg.contains("negative count"));
    }

    #[test]
    fn predicates_cover_all_variants() {
        let config = RateLimitError::configuration("x");
        assert!(config.is_configuration());
        assert!(!config.is_transport());
        assert!(!config.is_state_corruption());

        let transport = RateLimitError::transport("x");
        assert!(transport.is_transport());

        let corruption = RateLimitError::state_corruption("k", "d");
        assert!(corruption.is_state_corruption());
    }

    #[test]
    fn implements_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(RateLimitError::transport("io"));
        assert!(err.source().is_none());
    }
}
