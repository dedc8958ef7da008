//! OrderTask Core
//!
//! Core types and protocol constants shared by the OrderTask controller and
//! the step sequencer that runs inside every step container.
//!
//! This crate contains:
//! - Domain types: order marker, wait semantics, resolved image facts and,
//!   behind the `crd` feature, the `OrderTask` custom resource
//! - Layout: the names and paths the pod builder and the sequencer agree on
//! - Retry: a bounded, fixed-delay retry helper

pub mod domain;
pub mod layout;
pub mod retry;
