//! Controller error types
//!
//! One enum per layer: repositories talk to the API server, the builder
//! turns a task into a pod, the reconciler ties both together and bootstrap
//! registers the resource type.

use ordertask_registry::ResolveError;
use std::time::Duration;
use thiserror::Error;

/// Failures of the cluster-facing repositories
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Create hit an object with the same name
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Replace carried a stale resourceVersion
    #[error("{kind} '{name}' was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

impl RepositoryError {
    /// Maps a kube error, splitting 409 responses into their two meanings
    pub fn from_kube(kind: &'static str, name: &str, error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 409 => {
                if response.reason == "AlreadyExists" {
                    Self::AlreadyExists {
                        kind,
                        name: name.to_string(),
                    }
                } else {
                    Self::Conflict {
                        kind,
                        name: name.to_string(),
                    }
                }
            }
            _ => Self::Api(error),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Failures turning a task into a pod spec
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("task has no name")]
    MissingName,

    #[error("task has no steps")]
    NoSteps,

    /// Task lacks the uid needed for an owner reference
    #[error("task '{0}' has no uid yet")]
    MissingUid(String),

    /// Step image has no command and the registry could not provide one
    #[error("step {step}: could not resolve default command of '{image}': {source}")]
    ImageResolution {
        step: u32,
        image: String,
        #[source]
        source: ResolveError,
    },

    #[error("step {step}: image '{image}' has no entry for platform {platform}")]
    MissingPlatform {
        step: u32,
        image: String,
        platform: String,
    },

    /// Neither the step nor the image declares anything to run
    #[error("step {step}: image '{image}' declares no entrypoint or cmd")]
    EmptyCommand { step: u32, image: String },
}

/// Failures of a single reconciliation pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("task '{0}' has no namespace")]
    MissingNamespace(String),

    #[error("failed to build pod: {0}")]
    Build(#[from] BuildError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Every marker update lost the compare-and-swap race
    #[error("order marker update on pod '{pod}' still conflicting after {attempts} attempts")]
    UpdateExhausted { pod: String, attempts: u32 },

    #[error("marker update retry policy allows no attempts")]
    InvalidRetryPolicy,
}

/// Fatal startup failures while registering the resource type
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to create CustomResourceDefinition '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: RepositoryError,
    },

    #[error("failed to read CustomResourceDefinition '{name}': {source}")]
    Poll {
        name: String,
        #[source]
        source: RepositoryError,
    },

    /// The definition never reported Established; it has been removed
    #[error("CustomResourceDefinition '{name}' not established within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// Establishment failed and removing the definition failed too
    #[error("CustomResourceDefinition '{name}' rollback failed after {cause}: {source}")]
    RollbackFailed {
        name: String,
        cause: String,
        #[source]
        source: RepositoryError,
    },
}

impl BootstrapError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
