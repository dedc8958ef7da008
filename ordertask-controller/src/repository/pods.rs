//! Pods repository

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, PostParams};

use crate::error::RepositoryError;

const KIND: &str = "Pod";

/// Repository trait for step pods
#[async_trait]
pub trait PodRepository: Send + Sync {
    /// Fetches a pod, `None` when it does not exist
    ///
    /// # Arguments
    /// * `namespace` - Namespace of the owning task
    /// * `name` - Derived pod name
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, RepositoryError>;

    /// Creates a pod
    ///
    /// Fails with `RepositoryError::AlreadyExists` when the name is taken.
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod, RepositoryError>;

    /// Replaces a pod, guarded by the `resourceVersion` it carries
    ///
    /// Fails with `RepositoryError::Conflict` when the stored version moved on.
    async fn replace(&self, namespace: &str, pod: &Pod) -> Result<Pod, RepositoryError>;
}

/// Kubernetes implementation of PodRepository
pub struct KubePodRepository {
    client: Client,
}

impl KubePodRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

#[async_trait]
impl PodRepository for KubePodRepository {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, RepositoryError> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| RepositoryError::from_kube(KIND, name, e))
    }

    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod, RepositoryError> {
        self.api(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| RepositoryError::from_kube(KIND, pod_name(pod), e))
    }

    async fn replace(&self, namespace: &str, pod: &Pod) -> Result<Pod, RepositoryError> {
        let name = pod_name(pod);
        self.api(namespace)
            .replace(name, &PostParams::default(), pod)
            .await
            .map_err(|e| RepositoryError::from_kube(KIND, name, e))
    }
}
