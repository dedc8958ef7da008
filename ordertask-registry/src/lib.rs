//! OrderTask image resolution
//!
//! Looks up an image's default `Entrypoint` and `Cmd` for every platform it
//! ships by reading manifests and config blobs from an OCI / Docker v2
//! registry. Results are cached by canonical reference, and concurrent
//! lookups of the same image share a single registry round-trip.
//!
//! # Example
//!
//! ```no_run
//! use ordertask_core::domain::image::Platform;
//! use ordertask_registry::{ImageCache, ImageInfoProvider, ImageResolver, RegistryClient, RegistryConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RegistryClient::new(RegistryConfig::default())?;
//! let resolver = ImageResolver::new(Arc::new(client), ImageCache::default());
//!
//! let info = resolver.resolve("alpine:3.19").await?;
//! if let Some(command) = info.command_for(&Platform::local()) {
//!     println!("cmd: {:?}", command.cmd);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod manifest;
pub mod reference;
pub mod resolver;

pub use cache::ImageCache;
pub use client::{FetchedManifest, ManifestSource, RegistryClient, RegistryConfig};
pub use error::{RegistryError, ResolveError, Result};
pub use reference::ImageReference;
pub use resolver::{ImageInfoProvider, ImageResolver};
