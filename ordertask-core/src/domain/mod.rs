//! Core domain types
//!
//! The order marker is the only piece of state shared between the controller
//! (single writer) and the sequencers (many readers). Everything else here is
//! immutable once constructed.

pub mod image;
pub mod order;
#[cfg(feature = "crd")]
pub mod task;
