//! OrderTask custom resource
//!
//! Structure shared between the controller (reconciles) and anything that
//! needs to create tasks. The step list is treated as immutable once the
//! task exists: the controller reads it once, when it builds the pod.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "ordertask.io";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "OrderTask";
pub const PLURAL: &str = "ordertasks";
/// Name of the CustomResourceDefinition object
pub const CRD_NAME: &str = "ordertasks.ordertask.io";

/// Desired state of an OrderTask: an ordered list of steps
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "ordertask.io",
    version = "v1alpha1",
    kind = "OrderTask",
    plural = "ordertasks",
    shortname = "ot",
    status = "OrderTaskStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OrderTaskSpec {
    pub steps: Vec<Step>,
}

/// One step: an image and, optionally, the command to run in it
///
/// When `command` is absent the image's default entrypoint is resolved from
/// the registry at pod-build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

impl Step {
    pub fn has_command(&self) -> bool {
        self.command.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// Lifecycle phase reported on the task's status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum TaskPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Pending => write!(f, "Pending"),
            TaskPhase::Running => write!(f, "Running"),
            TaskPhase::Succeeded => write!(f, "Succeeded"),
            TaskPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed state of an OrderTask
///
/// Written with JSON merge-patch. `current_step` and `message` always
/// serialize, as `null` when absent, so a patch clears stale values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderTaskStatus {
    pub phase: TaskPhase,

    /// 1-based index of the step currently allowed to run
    #[serde(default)]
    pub current_step: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}
