//! Resource type registration
//!
//! Runs once at startup, before the controller watches anything: create the
//! OrderTask CustomResourceDefinition and block until the API server reports
//! it Established. A definition this run created is deleted again if it
//! never gets there.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::BootstrapError;
use crate::repository::CrdRepository;

/// Polling bounds for the Established wait
#[derive(Debug, Clone, Copy)]
pub struct BootstrapSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Whether the definition carries an `Established=True` condition
pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

/// Registers `crd` and waits until it is Established
///
/// # Arguments
/// * `crds` - Definition store
/// * `crd` - Definition to register
/// * `settings` - Poll interval and overall timeout
pub async fn install_crd(
    crds: &dyn CrdRepository,
    crd: &CustomResourceDefinition,
    settings: BootstrapSettings,
) -> Result<(), BootstrapError> {
    let name = crd.metadata.name.clone().unwrap_or_default();

    let created = match crds.create(crd).await {
        Ok(()) => {
            info!(crd = %name, "Created CustomResourceDefinition");
            true
        }
        Err(e) if e.is_already_exists() => {
            info!(crd = %name, "CustomResourceDefinition already registered");
            false
        }
        Err(source) => return Err(BootstrapError::Create { name, source }),
    };

    let outcome =
        tokio::time::timeout(settings.timeout, wait_established(crds, &name, settings.poll_interval))
            .await;

    let failure = match outcome {
        Ok(Ok(())) => {
            info!(crd = %name, "CustomResourceDefinition established");
            return Ok(());
        }
        Ok(Err(e)) => e,
        Err(_) => BootstrapError::Timeout {
            name: name.clone(),
            timeout: settings.timeout,
        },
    };

    if !created {
        return Err(failure);
    }

    warn!(crd = %name, "Rolling back CustomResourceDefinition: {}", failure);
    match crds.delete(&name).await {
        Ok(()) => Err(failure),
        Err(source) => {
            error!(crd = %name, "Rollback failed: {}", source);
            Err(BootstrapError::RollbackFailed {
                name,
                cause: failure.to_string(),
                source,
            })
        }
    }
}

async fn wait_established(
    crds: &dyn CrdRepository,
    name: &str,
    poll_interval: Duration,
) -> Result<(), BootstrapError> {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;
        let crd = crds
            .get(name)
            .await
            .map_err(|source| BootstrapError::Poll {
                name: name.to_string(),
                source,
            })?;

        match crd {
            Some(crd) if is_established(&crd) => return Ok(()),
            Some(_) => debug!(crd = %name, "Waiting for CustomResourceDefinition to be established"),
            None => debug!(crd = %name, "CustomResourceDefinition not visible yet"),
        }
    }
}
