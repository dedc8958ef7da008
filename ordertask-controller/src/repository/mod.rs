//! Repository layer
//!
//! Thin, trait-based wrappers over the Kubernetes API. They carry no
//! business logic; the reconciler and bootstrap depend only on the traits so
//! tests can substitute the in-memory implementations.

mod crds;
#[cfg(test)]
pub mod memory;
mod pods;
mod tasks;

// Re-export traits
pub use crds::CrdRepository;
pub use pods::PodRepository;
pub use tasks::TaskRepository;

// Re-export implementations
pub use crds::KubeCrdRepository;
pub use pods::KubePodRepository;
pub use tasks::KubeTaskRepository;
