//! Tasks repository

use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use ordertask_core::domain::task::{OrderTask, OrderTaskStatus};
use serde_json::{Value, json};

use crate::error::RepositoryError;

const KIND: &str = "OrderTask";

/// Merge-patch body recording `status` on a task
///
/// `currentStep` and `message` are sent as `null` when absent, which removes
/// them from the stored status.
pub fn status_patch(status: &OrderTaskStatus) -> Value {
    json!({ "status": status })
}

/// Repository trait for OrderTask resources
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Merges `status` into the task's status subresource
    ///
    /// # Arguments
    /// * `namespace` - Namespace of the task
    /// * `name` - Task name
    /// * `status` - Observed state to record
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &OrderTaskStatus,
    ) -> Result<(), RepositoryError>;
}

/// Kubernetes implementation of TaskRepository
pub struct KubeTaskRepository {
    client: Client,
}

impl KubeTaskRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskRepository for KubeTaskRepository {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &OrderTaskStatus,
    ) -> Result<(), RepositoryError> {
        let api: Api<OrderTask> = Api::namespaced(self.client.clone(), namespace);
        let patch = Patch::Merge(status_patch(status));

        api.patch_status(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| RepositoryError::from_kube(KIND, name, e))?;

        Ok(())
    }
}
