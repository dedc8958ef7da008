//! Pod layout shared by the pod builder and the step sequencer
//!
//! The builder writes these names into the pod spec and the sequencer reads
//! the same paths at runtime, so both sides must take them from here.

/// Annotation holding the order marker
pub const ORDER_ANNOTATION: &str = "ordertask.io/order";

/// Prefix of every pod created for an OrderTask
pub const POD_NAME_PREFIX: &str = "order-task-";

/// Volume holding the staged sequencer binary
pub const ENTRYPOINT_VOLUME: &str = "entrypoint-volume";
/// Directory the setup container copies the sequencer into
pub const ENTRYPOINT_DIR: &str = "/entrypoint/bin";
/// Path of the sequencer binary inside every step container
pub const ENTRYPOINT_BINARY: &str = "/entrypoint/bin/entrypoint";
/// Location of the sequencer binary inside the entrypoint image
pub const ENTRYPOINT_SOURCE: &str = "/app/entrypoint";

/// General scratch volume shared by all steps
pub const SCRATCH_VOLUME: &str = "scratch-volume";
pub const SCRATCH_DIR: &str = "/workspace";

/// Downward-API volume projecting the order annotation
pub const PODINFO_VOLUME: &str = "podinfo";
pub const PODINFO_DIR: &str = "/etc/podinfo";
/// File name of the projected marker, relative to `PODINFO_DIR`
pub const ORDER_FILE: &str = "order";
/// Absolute path the sequencer polls
pub const ORDER_FILE_PATH: &str = "/etc/podinfo/order";

/// Output destination meaning "inherit the container's stdout"
pub const STDOUT_OUTPUT: &str = "stdout";

/// Exit status of a sequencer that saw the quit marker
pub const QUIT_EXIT_CODE: i32 = 3;

/// Derives the pod name for a task
///
/// One task maps to exactly one pod name, which lets the controller find the
/// pod again without an index.
pub fn pod_name_for(task_name: &str) -> String {
    format!("{}{}", POD_NAME_PREFIX, task_name.replace('_', "-")).to_lowercase()
}

/// Name of the container running the 1-based step `index`
pub fn step_container_name(index: u32) -> String {
    format!("step-{}", index)
}

/// Downward-API field path of the order annotation
pub fn order_field_path() -> String {
    format!("metadata.annotations['{}']", ORDER_ANNOTATION)
}
