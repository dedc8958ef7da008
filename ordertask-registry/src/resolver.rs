//! Image resolution with caching and single-flight
//!
//! Concurrent lookups of the same canonical reference share one registry
//! round-trip: the first caller becomes the leader and everyone else waits
//! on a broadcast of its result. If the leader is cancelled, a waiter takes
//! over instead of failing.

use async_trait::async_trait;
use ordertask_core::domain::image::ImageInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::ImageCache;
use crate::client::ManifestSource;
use crate::error::{RegistryError, ResolveError, Result};
use crate::manifest::{ImageConfigFile, Manifest, ManifestKind};
use crate::reference::ImageReference;

type Shared = Result<Arc<ImageInfo>>;
type InFlight = Mutex<HashMap<String, broadcast::Sender<Shared>>>;

/// Source of per-platform image defaults
#[async_trait]
pub trait ImageInfoProvider: Send + Sync {
    /// Returns the default entrypoint and command of `image` for every platform it ships
    ///
    /// # Arguments
    /// * `image` - Image reference as written in a task step
    async fn resolve(&self, image: &str) -> Result<Arc<ImageInfo>>;
}

/// Registry-backed [`ImageInfoProvider`]
pub struct ImageResolver {
    source: Arc<dyn ManifestSource>,
    cache: ImageCache,
    in_flight: InFlight,
}

impl ImageResolver {
    pub fn new(source: Arc<dyn ManifestSource>, cache: ImageCache) -> Self {
        Self {
            source,
            cache,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<Shared>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch(&self, reference: &ImageReference) -> Result<ImageInfo> {
        let key = reference.canonical();
        self.fetch_info(reference)
            .await
            .map_err(|e| ResolveError::registry(key, e))
    }

    async fn fetch_info(&self, reference: &ImageReference) -> std::result::Result<ImageInfo, RegistryError> {
        let fetched = self
            .source
            .fetch_manifest(reference, reference.target())
            .await?;
        let manifest = Manifest::parse(&fetched.body)?;
        let mut image = ImageInfo::new(reference.canonical(), fetched.digest.clone());

        match manifest.kind(fetched.media_type.as_deref())? {
            ManifestKind::Image => {
                let config = self.image_config(reference, &manifest).await?;
                let platform = config.platform().ok_or_else(|| {
                    RegistryError::InvalidManifest(
                        "image config declares no os/architecture".to_string(),
                    )
                })?;
                image.add_command(platform, config.command());
            }
            ManifestKind::Index => {
                for (descriptor, platform) in manifest.platform_entries() {
                    let child = self
                        .source
                        .fetch_manifest(reference, &descriptor.digest)
                        .await?;
                    let child_manifest = Manifest::parse(&child.body)?;
                    if child_manifest.kind(child.media_type.as_deref())? != ManifestKind::Image {
                        return Err(RegistryError::InvalidManifest(format!(
                            "index entry {} is not an image manifest",
                            descriptor.digest
                        )));
                    }
                    let config = self.image_config(reference, &child_manifest).await?;
                    image.add_command(platform, config.command());
                }
            }
        }

        if image.is_empty() {
            return Err(RegistryError::InvalidManifest(
                "manifest lists no runnable platform".to_string(),
            ));
        }
        Ok(image)
    }

    async fn image_config(
        &self,
        reference: &ImageReference,
        manifest: &Manifest,
    ) -> std::result::Result<ImageConfigFile, RegistryError> {
        let config = manifest.config.as_ref().ok_or_else(|| {
            RegistryError::InvalidManifest("image manifest has no config descriptor".to_string())
        })?;
        let body = self.source.fetch_blob(reference, &config.digest).await?;
        ImageConfigFile::parse(&body)
    }
}

#[async_trait]
impl ImageInfoProvider for ImageResolver {
    async fn resolve(&self, image: &str) -> Result<Arc<ImageInfo>> {
        let reference = ImageReference::parse(image)?;
        let key = reference.canonical();

        loop {
            if let Some(info) = self.cache.get(&key) {
                debug!(image = %key, "Image cache hit");
                return Ok(info);
            }

            let waiter = {
                let mut in_flight = self.lock_in_flight();
                // a leader may have finished between the cache check and the lock
                if let Some(info) = self.cache.get(&key) {
                    return Ok(info);
                }
                match in_flight.get(&key) {
                    Some(sender) => Some(sender.subscribe()),
                    None => {
                        let (sender, _) = broadcast::channel(1);
                        in_flight.insert(key.clone(), sender);
                        None
                    }
                }
            };

            if let Some(mut receiver) = waiter {
                match receiver.recv().await {
                    Ok(result) => return result,
                    Err(_) => {
                        debug!(image = %key, "Resolution leader went away, retrying");
                        continue;
                    }
                }
            }

            let flight = Flight {
                in_flight: &self.in_flight,
                key: key.clone(),
                done: false,
            };

            info!(image = %key, "Resolving image from registry");
            let result = self.fetch(&reference).await.map(Arc::new);
            match &result {
                Ok(info) => self.cache.put(key.clone(), info.clone()),
                Err(e) => warn!(image = %key, "Image resolution failed: {}", e),
            }
            flight.complete(&result);
            return result;
        }
    }
}

/// Leadership of one in-flight resolution
///
/// Dropping it without completing removes the entry, which closes the
/// channel and wakes every waiter.
struct Flight<'a> {
    in_flight: &'a InFlight,
    key: String,
    done: bool,
}

impl Flight<'_> {
    fn take_sender(&mut self) -> Option<broadcast::Sender<Shared>> {
        self.done = true;
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key)
    }

    fn complete(mut self, result: &Shared) {
        if let Some(sender) = self.take_sender() {
            // no receivers is fine
            let _ = sender.send(result.clone());
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.take_sender();
        }
    }
}
