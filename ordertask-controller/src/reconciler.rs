//! Task reconciliation
//!
//! Level-triggered: every pass re-reads the pod and derives the next action
//! from what it observes, so missed or duplicated events are harmless.
//!
//! Per task the flow is:
//! 1. Create the pod if it does not exist (built once, never rebuilt)
//! 2. Inspect the container of the step the order marker points at
//! 3. Advance the marker, pin it to the failure sentinel, or leave it alone
//! 4. Record the outcome on the task's status
//!
//! Marker writes are compare-and-swap replaces against the pod's
//! `resourceVersion`; a conflict re-reads the pod and decides again.

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use ordertask_core::domain::order::OrderMarker;
use ordertask_core::domain::task::{OrderTask, OrderTaskStatus, TaskPhase};
use ordertask_core::layout::{ORDER_ANNOTATION, pod_name_for, step_container_name};
use ordertask_core::retry::{Attempt, RetryError, RetryPolicy, retry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::builder::PodBuilder;
use crate::error::{ReconcileError, RepositoryError};
use crate::repository::{PodRepository, TaskRepository};

const POD_SUCCEEDED: &str = "Succeeded";
const POD_FAILED: &str = "Failed";

/// Reconciliation timing and retry bounds
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Safety-net requeue for tasks that are still running
    pub requeue_interval: Duration,
    /// Bounds for marker updates that lose the compare-and-swap race
    pub update_retry: RetryPolicy,
}

/// Shared state handed to every reconciliation
pub struct Context {
    pub pods: Arc<dyn PodRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub builder: PodBuilder,
    pub settings: ReconcileSettings,
}

/// What one pass decided for a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The current step has not terminated yet
    Wait { step: u32 },
    /// The current step succeeded; the marker moves to `to`
    Advance { from: u32, to: OrderMarker },
    /// The current step (or the pod) failed; the marker pins to the sentinel
    Fail { step: u32, reason: String },
    /// The pod is done; the marker will not be written again
    Finished {
        phase: TaskPhase,
        failure: Option<StepFailure>,
    },
    /// The order annotation is missing or unparseable and is left untouched
    Unreadable { raw: Option<String> },
}

/// The first step of a failed pod that did not exit cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: u32,
    pub reason: String,
}

/// Reads the order marker annotation
///
/// Returns the raw value on failure so it can be reported.
pub fn read_marker(pod: &Pod) -> Result<OrderMarker, Option<String>> {
    let raw = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ORDER_ANNOTATION));

    match raw {
        Some(value) => value.parse().map_err(|_| Some(value.clone())),
        None => Err(None),
    }
}

/// Exit code of a step container, once it has terminated
fn step_exit_code(pod: &Pod, step: u32) -> Option<i32> {
    let name = step_container_name(step);
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|status| status.name == name)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|terminated| terminated.exit_code)
}

fn exit_reason(step: u32, code: i32) -> String {
    format!("step {} exited with code {}", step, code)
}

fn pending_reason(step: u32) -> String {
    format!("pod failed while step {} was pending", step)
}

/// Finds the step a failed pod stopped at
///
/// Steps after the failing one only terminate once the marker is pinned, so
/// the lowest step that did not exit 0 is the one that failed.
fn first_failure(pod: &Pod, step_count: usize) -> Option<StepFailure> {
    (1..=step_count as u32).find_map(|step| match step_exit_code(pod, step) {
        Some(0) => None,
        Some(code) => Some(StepFailure {
            step,
            reason: exit_reason(step, code),
        }),
        None => Some(StepFailure {
            step,
            reason: pending_reason(step),
        }),
    })
}

/// Decides the next marker transition for a pod running `step_count` steps
pub fn decide(pod: &Pod, step_count: usize) -> Decision {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase == Some(POD_SUCCEEDED) {
        return Decision::Finished {
            phase: TaskPhase::Succeeded,
            failure: None,
        };
    }

    let marker = match read_marker(pod) {
        Ok(marker) => marker,
        Err(raw) => return Decision::Unreadable { raw },
    };

    let step = match marker {
        OrderMarker::Failed => {
            return Decision::Finished {
                phase: TaskPhase::Failed,
                failure: first_failure(pod, step_count),
            };
        }
        OrderMarker::Step(_) if marker.is_complete(step_count) => {
            return Decision::Finished {
                phase: TaskPhase::Succeeded,
                failure: None,
            };
        }
        OrderMarker::Step(step) => step,
    };

    match step_exit_code(pod, step) {
        Some(0) => Decision::Advance {
            from: step,
            to: marker.advance(),
        },
        Some(code) => Decision::Fail {
            step,
            reason: exit_reason(step, code),
        },
        None if phase == Some(POD_FAILED) => Decision::Fail {
            step,
            reason: pending_reason(step),
        },
        None => Decision::Wait { step },
    }
}

/// Reconciles one task
///
/// # Arguments
/// * `task` - The observed task
/// * `ctx` - Repositories, builder and settings
pub async fn reconcile(task: Arc<OrderTask>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = task.name_any();
    let namespace = task
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;
    let pod_name = pod_name_for(&name);
    let step_count = task.spec.steps.len();

    debug!(task = %name, namespace = %namespace, "Reconciling task");

    if ctx.pods.get(&namespace, &pod_name).await?.is_none() {
        ensure_pod(&ctx, &task, &namespace, &pod_name).await?;
    }

    let Some(decision) = advance(&ctx, &namespace, &pod_name, step_count).await? else {
        warn!(task = %name, pod = %pod_name, "Pod disappeared during reconciliation");
        return Ok(Action::requeue(ctx.settings.requeue_interval));
    };

    if let Some(status) = status_for(&decision, &pod_name, step_count) {
        publish_status(&ctx, &task, &namespace, status).await;
    }

    Ok(match decision {
        Decision::Finished { .. } => Action::await_change(),
        _ => Action::requeue(ctx.settings.requeue_interval),
    })
}

/// Requeues a task after a failed pass
pub fn error_policy(task: Arc<OrderTask>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    error!(task = %task.name_any(), "Reconciliation failed: {}", error);
    Action::requeue(ctx.settings.requeue_interval)
}

/// Builds and creates the task's pod
///
/// Losing a creation race is not an error: the pod exists either way.
async fn ensure_pod(
    ctx: &Context,
    task: &OrderTask,
    namespace: &str,
    pod_name: &str,
) -> Result<(), ReconcileError> {
    let pod = match ctx.builder.build(task).await {
        Ok(pod) => pod,
        Err(e) => {
            let status = OrderTaskStatus {
                phase: TaskPhase::Pending,
                message: Some(format!("cannot build pod: {}", e)),
                ..Default::default()
            };
            publish_status(ctx, task, namespace, status).await;
            return Err(e.into());
        }
    };

    match ctx.pods.create(namespace, &pod).await {
        Ok(_) => {
            info!(task = %task.name_any(), pod = %pod_name, "Created step pod");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!(pod = %pod_name, "Pod already exists, continuing");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Applies one marker transition with compare-and-swap
///
/// Returns `None` when the pod no longer exists.
async fn advance(
    ctx: &Context,
    namespace: &str,
    pod_name: &str,
    step_count: usize,
) -> Result<Option<Decision>, ReconcileError> {
    let pods = ctx.pods.as_ref();

    let result = retry(ctx.settings.update_retry, move |attempt| {
        advance_once(pods, namespace, pod_name, step_count, attempt)
    })
    .await;

    result.map_err(|e| match e {
        RetryError::Exhausted { attempts } => ReconcileError::UpdateExhausted {
            pod: pod_name.to_string(),
            attempts,
        },
        RetryError::Failed(e) => e.into(),
        RetryError::InvalidPolicy => ReconcileError::InvalidRetryPolicy,
    })
}

/// Reads the pod, decides, and writes the new marker if there is one
async fn advance_once(
    pods: &dyn PodRepository,
    namespace: &str,
    pod_name: &str,
    step_count: usize,
    attempt: u32,
) -> Result<Attempt<Option<Decision>>, RepositoryError> {
    let Some(mut pod) = pods.get(namespace, pod_name).await? else {
        return Ok(Attempt::Done(None));
    };

    let decision = decide(&pod, step_count);
    let next = match &decision {
        Decision::Advance { from, to } => {
            debug!(pod = %pod_name, step = from, "Step succeeded");
            *to
        }
        Decision::Fail { step, reason } => {
            warn!(pod = %pod_name, step = step, "Step failed: {}", reason);
            OrderMarker::Failed
        }
        Decision::Unreadable { raw } => {
            warn!(pod = %pod_name, raw = ?raw, "Order marker unreadable, leaving it untouched");
            return Ok(Attempt::Done(Some(decision)));
        }
        Decision::Wait { .. } | Decision::Finished { .. } => {
            return Ok(Attempt::Done(Some(decision)));
        }
    };

    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ORDER_ANNOTATION.to_string(), next.to_string());

    match pods.replace(namespace, &pod).await {
        Ok(_) => {
            info!(pod = %pod_name, marker = %next, "Order marker updated");
            Ok(Attempt::Done(Some(decision)))
        }
        Err(e) if e.is_conflict() => {
            debug!(pod = %pod_name, attempt = attempt, "Marker update conflicted, re-reading");
            Ok(Attempt::Retry)
        }
        Err(e) => Err(e),
    }
}

/// Task status implied by a decision, `None` when nothing is known
///
/// Every field is set explicitly: the patch replaces `currentStep` and
/// `message` wholesale, clearing whatever an earlier pass left there.
fn status_for(decision: &Decision, pod_name: &str, step_count: usize) -> Option<OrderTaskStatus> {
    let succeeded = || Some(format!("all {} steps succeeded", step_count));

    let (phase, current_step, message) = match decision {
        Decision::Wait { step } => (TaskPhase::Running, Some(*step), None),
        Decision::Advance { to, .. } if to.is_complete(step_count) => {
            (TaskPhase::Succeeded, None, succeeded())
        }
        Decision::Advance {
            to: OrderMarker::Step(next),
            ..
        } => (TaskPhase::Running, Some(*next), None),
        Decision::Advance { .. } => return None,
        Decision::Fail { step, reason } => (TaskPhase::Failed, Some(*step), Some(reason.clone())),
        Decision::Finished {
            phase: TaskPhase::Succeeded,
            ..
        } => (TaskPhase::Succeeded, None, succeeded()),
        Decision::Finished {
            phase,
            failure: Some(failure),
        } => (*phase, Some(failure.step), Some(failure.reason.clone())),
        Decision::Finished {
            phase,
            failure: None,
        } => (*phase, None, None),
        Decision::Unreadable { .. } => return None,
    };

    Some(OrderTaskStatus {
        phase,
        current_step,
        pod_name: Some(pod_name.to_string()),
        message,
        last_updated: None,
    })
}

/// Patches the task status, skipping writes that change nothing
///
/// Failures are logged; the marker is the source of truth, not the status.
async fn publish_status(ctx: &Context, task: &OrderTask, namespace: &str, mut status: OrderTaskStatus) {
    let unchanged = task.status.as_ref().is_some_and(|current| {
        current.phase == status.phase
            && current.current_step == status.current_step
            && current.pod_name == status.pod_name
            && current.message == status.message
    });
    if unchanged {
        return;
    }

    status.last_updated = Some(Utc::now());
    let name = task.name_any();
    if let Err(e) = ctx.tasks.patch_status(namespace, &name, &status).await {
        warn!(task = %name, "Failed to update task status: {}", e);
    }
}
