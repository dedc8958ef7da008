//! Error types for image resolution

use thiserror::Error;

/// Result type alias for resolver operations
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Errors that can occur while resolving an image reference
///
/// Errors are `Clone` so a single registry round-trip can hand its outcome to
/// every caller waiting on the same reference.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The reference does not parse as an image name
    #[error("Malformed image reference '{reference}': {reason}")]
    MalformedReference { reference: String, reason: String },

    /// The registry could not produce the image's config
    #[error("Registry resolution failed for '{reference}': {source}")]
    Registry {
        reference: String,
        #[source]
        source: RegistryError,
    },
}

/// Registry-side failures
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Connection, DNS or timeout failure
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    /// Every attempt hit a transient failure
    #[error("still failing after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// Authentication challenge could not be satisfied
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Registry returned a non-success status
    #[error("registry returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Manifest media type is neither an image nor an index
    #[error("unsupported manifest media type '{0}'")]
    UnsupportedMediaType(String),

    /// Manifest or config document could not be interpreted
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

impl ResolveError {
    pub fn malformed(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn registry(reference: impl Into<String>, source: RegistryError) -> Self {
        Self::Registry {
            reference: reference.into(),
            source,
        }
    }

    /// Check if this error is a validation failure (no I/O was attempted)
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedReference { .. })
    }

    /// Check if this error came from exhausting transient retries
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(
            self,
            Self::Registry {
                source: RegistryError::RetryExhausted { .. },
                ..
            }
        )
    }
}
