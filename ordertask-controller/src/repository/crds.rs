//! CustomResourceDefinition repository

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};

use crate::error::RepositoryError;

const KIND: &str = "CustomResourceDefinition";

/// Repository trait for resource type registration
#[async_trait]
pub trait CrdRepository: Send + Sync {
    /// Creates a definition; `AlreadyExists` when it is already registered
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), RepositoryError>;

    /// Fetches a definition by name
    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>, RepositoryError>;

    /// Deletes a definition by name
    async fn delete(&self, name: &str) -> Result<(), RepositoryError>;
}

/// Kubernetes implementation of CrdRepository
pub struct KubeCrdRepository {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdRepository {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdRepository for KubeCrdRepository {
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), RepositoryError> {
        let name = crd.metadata.name.as_deref().unwrap_or_default();
        self.api
            .create(&PostParams::default(), crd)
            .await
            .map_err(|e| RepositoryError::from_kube(KIND, name, e))?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>, RepositoryError> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| RepositoryError::from_kube(KIND, name, e))
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| RepositoryError::from_kube(KIND, name, e))?;
        Ok(())
    }
}
