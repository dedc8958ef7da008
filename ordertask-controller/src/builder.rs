//! Pod spec builder
//!
//! Turns an OrderTask into the single pod that runs all of its steps. Every
//! step container runs the sequencer binary, which the init container stages
//! into a shared volume, and reads the order marker from a downward-API file.

use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource,
    ObjectFieldSelector, Pod, PodSpec, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use ordertask_core::domain::image::{ImageCommand, Platform};
use ordertask_core::domain::order::{FAILED_SENTINEL, OrderMarker, WaitMode};
use ordertask_core::domain::task::{OrderTask, Step};
use ordertask_core::layout::{
    ENTRYPOINT_BINARY, ENTRYPOINT_DIR, ENTRYPOINT_SOURCE, ENTRYPOINT_VOLUME, ORDER_ANNOTATION,
    ORDER_FILE, ORDER_FILE_PATH, PODINFO_DIR, PODINFO_VOLUME, SCRATCH_DIR, SCRATCH_VOLUME,
    STDOUT_OUTPUT, order_field_path, pod_name_for, step_container_name,
};
use ordertask_registry::ImageInfoProvider;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::BuildError;

pub const INIT_CONTAINER_NAME: &str = "install-entrypoint";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const TASK_LABEL: &str = "ordertask.io/task";
pub const MANAGER: &str = "ordertask-controller";

/// Knobs that shape every pod the builder produces
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Image whose filesystem carries the sequencer binary
    pub entrypoint_image: String,
    /// Platform used to pick an image's default command
    pub platform: Platform,
    pub wait_mode: WaitMode,
    /// How often the sequencer polls the order file
    pub poll_interval: Duration,
}

pub struct PodBuilder {
    images: Arc<dyn ImageInfoProvider>,
    settings: BuildSettings,
}

impl PodBuilder {
    /// Creates a new pod builder
    ///
    /// # Arguments
    /// * `images` - Resolver for steps that omit their command
    /// * `settings` - Sequencer image, target platform and wait behavior
    pub fn new(images: Arc<dyn ImageInfoProvider>, settings: BuildSettings) -> Self {
        Self { images, settings }
    }

    /// Builds the pod for `task`
    ///
    /// Steps without a command are resolved through the image resolver; a
    /// resolution failure fails the whole build instead of producing a pod
    /// with a step that cannot run.
    pub async fn build(&self, task: &OrderTask) -> Result<Pod, BuildError> {
        let task_name = task.metadata.name.clone().ok_or(BuildError::MissingName)?;
        if task.spec.steps.is_empty() {
            return Err(BuildError::NoSteps);
        }
        let owner = task
            .controller_owner_ref(&())
            .ok_or_else(|| BuildError::MissingUid(task_name.clone()))?;

        let mut containers = Vec::with_capacity(task.spec.steps.len());
        for (position, step) in task.spec.steps.iter().enumerate() {
            let index = position as u32 + 1;
            let argv = self.step_argv(index, step).await?;
            containers.push(self.step_container(index, step, argv));
        }

        let pod_name = pod_name_for(&task_name);
        debug!(task = %task_name, pod = %pod_name, steps = containers.len(), "Built pod spec");

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(pod_name),
                namespace: task.namespace(),
                labels: Some(BTreeMap::from([
                    (MANAGED_BY_LABEL.to_string(), MANAGER.to_string()),
                    (TASK_LABEL.to_string(), task_name),
                ])),
                annotations: Some(BTreeMap::from([(
                    ORDER_ANNOTATION.to_string(),
                    OrderMarker::INITIAL.to_string(),
                )])),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(vec![self.init_container()]),
                containers,
                volumes: Some(volumes()),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            status: None,
        })
    }

    /// Full command line of a step, resolving image defaults when needed
    async fn step_argv(&self, index: u32, step: &Step) -> Result<Vec<String>, BuildError> {
        if step.has_command() {
            let mut argv = step.command.clone().unwrap_or_default();
            argv.extend(step.args.clone().unwrap_or_default());
            return Ok(argv);
        }

        let info = self
            .images
            .resolve(&step.image)
            .await
            .map_err(|source| BuildError::ImageResolution {
                step: index,
                image: step.image.clone(),
                source,
            })?;

        let command =
            info.command_for(&self.settings.platform)
                .ok_or_else(|| BuildError::MissingPlatform {
                    step: index,
                    image: step.image.clone(),
                    platform: self.settings.platform.to_string(),
                })?;

        let argv = image_argv(command, step.args.as_deref());
        if argv.is_empty() {
            return Err(BuildError::EmptyCommand {
                step: index,
                image: step.image.clone(),
            });
        }
        Ok(argv)
    }

    fn init_container(&self) -> Container {
        Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(self.settings.entrypoint_image.clone()),
            command: Some(vec![
                "cp".to_string(),
                ENTRYPOINT_SOURCE.to_string(),
                ENTRYPOINT_BINARY.to_string(),
            ]),
            volume_mounts: Some(vec![mount(ENTRYPOINT_VOLUME, ENTRYPOINT_DIR, false)]),
            ..Default::default()
        }
    }

    fn step_container(&self, index: u32, step: &Step, argv: Vec<String>) -> Container {
        Container {
            name: step_container_name(index),
            image: Some(step.image.clone()),
            command: Some(vec![ENTRYPOINT_BINARY.to_string()]),
            args: Some(self.sequencer_args(index, argv)),
            volume_mounts: Some(vec![
                mount(ENTRYPOINT_VOLUME, ENTRYPOINT_DIR, true),
                mount(SCRATCH_VOLUME, SCRATCH_DIR, false),
                mount(PODINFO_VOLUME, PODINFO_DIR, true),
            ]),
            ..Default::default()
        }
    }

    /// Sequencer flags followed by the real command after `--`
    fn sequencer_args(&self, index: u32, argv: Vec<String>) -> Vec<String> {
        let mut argv = argv.into_iter();
        let program = argv.next().unwrap_or_default();

        let flags = [
            ("--wait", ORDER_FILE_PATH.to_string()),
            ("--wait-content", index.to_string()),
            ("--out", STDOUT_OUTPUT.to_string()),
            ("--quit", FAILED_SENTINEL.to_string()),
            ("--wait-mode", self.settings.wait_mode.to_string()),
            (
                "--interval-ms",
                self.settings.poll_interval.as_millis().to_string(),
            ),
            ("--command", program),
        ];

        let mut args: Vec<String> = flags
            .into_iter()
            .flat_map(|(flag, value)| [flag.to_string(), value])
            .collect();
        args.push("--".to_string());
        args.extend(argv);
        args
    }
}

/// Docker semantics: entrypoint, then step args if given, else the image cmd
fn image_argv(command: &ImageCommand, args: Option<&[String]>) -> Vec<String> {
    let tail = match args {
        Some(args) if !args.is_empty() => args.to_vec(),
        _ => command.cmd.clone(),
    };
    command.entrypoint.iter().cloned().chain(tail).collect()
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn volumes() -> Vec<Volume> {
    vec![
        Volume {
            name: ENTRYPOINT_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: SCRATCH_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: PODINFO_VOLUME.to_string(),
            downward_api: Some(DownwardAPIVolumeSource {
                items: Some(vec![DownwardAPIVolumeFile {
                    path: ORDER_FILE.to_string(),
                    field_ref: Some(ObjectFieldSelector {
                        field_path: order_field_path(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use ordertask_core::domain::image::ImageInfo;
    use ordertask_core::domain::task::OrderTaskSpec;
    use ordertask_registry::{RegistryError, ResolveError};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Resolver serving fixed image facts and counting lookups
    #[derive(Default)]
    pub struct StaticImages {
        images: HashMap<String, Arc<ImageInfo>>,
        lookups: Mutex<u32>,
    }

    impl StaticImages {
        pub fn with(mut self, image: &str, platform: Platform, command: ImageCommand) -> Self {
            let mut info = ImageInfo::new(image, "sha256:fake");
            info.add_command(platform, command);
            self.images.insert(image.to_string(), Arc::new(info));
            self
        }

        pub fn lookups(&self) -> u32 {
            *self.lookups.lock().unwrap()
        }
    }

    #[async_trait]
    impl ImageInfoProvider for StaticImages {
        async fn resolve(&self, image: &str) -> ordertask_registry::Result<Arc<ImageInfo>> {
            *self.lookups.lock().unwrap() += 1;
            self.images.get(image).cloned().ok_or_else(|| {
                ResolveError::registry(
                    image,
                    RegistryError::Status {
                        status: 404,
                        message: "Not Found".to_string(),
                    },
                )
            })
        }
    }

    pub fn linux_amd64() -> Platform {
        Platform::new("linux", "amd64")
    }

    pub fn settings() -> BuildSettings {
        BuildSettings {
            entrypoint_image: "registry.local/entrypoint:test".to_string(),
            platform: linux_amd64(),
            wait_mode: WaitMode::AtLeast,
            poll_interval: Duration::from_millis(20),
        }
    }

    pub fn step(image: &str, command: &[&str]) -> Step {
        Step {
            image: image.to_string(),
            command: (!command.is_empty()).then(|| command.iter().map(|s| s.to_string()).collect()),
            args: None,
        }
    }

    pub fn task(name: &str, steps: Vec<Step>) -> OrderTask {
        let mut task = OrderTask::new(name, OrderTaskSpec { steps });
        task.metadata.namespace = Some("jobs".to_string());
        task.metadata.uid = Some(format!("uid-{}", name));
        task
    }

    fn args_of(pod: &Pod, index: usize) -> Vec<String> {
        pod.spec.as_ref().unwrap().containers[index]
            .args
            .clone()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_wraps_every_step() {
        let builder = PodBuilder::new(Arc::new(StaticImages::default()), settings());
        let task = task(
            "nightly_build",
            vec![
                step("alpine", &["sh", "-c", "echo one"]),
                step("busybox", &["true"]),
            ],
        );

        let pod = builder.build(&task).await.unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("order-task-nightly-build"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("jobs"));
        assert_eq!(
            pod.metadata.annotations.as_ref().unwrap()[ORDER_ANNOTATION],
            "1"
        );
        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "OrderTask");
        assert_eq!(owner.uid, "uid-nightly_build");
        assert_eq!(owner.controller, Some(true));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.init_containers.as_ref().unwrap().len(), 1);
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[0].name, "step-1");
        assert_eq!(spec.containers[1].name, "step-2");
        assert_eq!(
            spec.containers[0].command,
            Some(vec![ENTRYPOINT_BINARY.to_string()])
        );

        assert_eq!(
            args_of(&pod, 0),
            vec![
                "--wait", ORDER_FILE_PATH, "--wait-content", "1", "--out", "stdout", "--quit",
                "-1", "--wait-mode", "at-least", "--interval-ms", "20", "--command", "sh", "--",
                "-c", "echo one",
            ]
        );
        assert_eq!(args_of(&pod, 1)[3], "2");
    }

    #[tokio::test]
    async fn test_build_declares_shared_volumes() {
        let builder = PodBuilder::new(Arc::new(StaticImages::default()), settings());
        let pod = builder
            .build(&task("t", vec![step("alpine", &["true"])]))
            .await
            .unwrap();

        let spec = pod.spec.unwrap();
        let volumes = spec.volumes.unwrap();
        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec![ENTRYPOINT_VOLUME, SCRATCH_VOLUME, PODINFO_VOLUME]);

        let projected = volumes[2].downward_api.as_ref().unwrap().items.as_ref().unwrap();
        assert_eq!(projected[0].path, ORDER_FILE);
        assert_eq!(
            projected[0].field_ref.as_ref().unwrap().field_path,
            "metadata.annotations['ordertask.io/order']"
        );

        let mounts: Vec<&str> = spec.containers[0]
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert_eq!(mounts, vec![ENTRYPOINT_DIR, SCRATCH_DIR, PODINFO_DIR]);
    }

    #[tokio::test]
    async fn test_build_resolves_image_defaults() {
        let images = Arc::new(StaticImages::default().with(
            "nginx",
            linux_amd64(),
            ImageCommand {
                entrypoint: vec!["/docker-entrypoint.sh".to_string()],
                cmd: vec!["nginx".to_string(), "-g".to_string()],
            },
        ));
        let builder = PodBuilder::new(images.clone(), settings());

        let mut with_args = step("nginx", &[]);
        with_args.args = Some(vec!["-v".to_string()]);
        let pod = builder
            .build(&task("t", vec![step("nginx", &[]), with_args]))
            .await
            .unwrap();

        let first = args_of(&pod, 0);
        let tail = &first[first.len() - 4..];
        assert_eq!(tail, ["/docker-entrypoint.sh", "--", "nginx", "-g"]);

        let second = args_of(&pod, 1);
        let tail = &second[second.len() - 3..];
        assert_eq!(tail, ["/docker-entrypoint.sh", "--", "-v"]);
        assert_eq!(images.lookups(), 2);
    }

    #[tokio::test]
    async fn test_build_fails_without_platform_entry() {
        let images = Arc::new(StaticImages::default().with(
            "armonly",
            Platform::new("linux", "arm64"),
            ImageCommand {
                entrypoint: vec![],
                cmd: vec!["run".to_string()],
            },
        ));
        let builder = PodBuilder::new(images, settings());

        let err = builder
            .build(&task("t", vec![step("armonly", &[])]))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingPlatform { step: 1, .. }));
    }

    #[tokio::test]
    async fn test_build_surfaces_registry_failure() {
        let builder = PodBuilder::new(Arc::new(StaticImages::default()), settings());

        let err = builder
            .build(&task("t", vec![step("alpine", &["true"]), step("missing", &[])]))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::ImageResolution { step: 2, .. }));
    }

    #[tokio::test]
    async fn test_build_rejects_empty_tasks() {
        let builder = PodBuilder::new(Arc::new(StaticImages::default()), settings());
        let err = builder.build(&task("t", vec![])).await.unwrap_err();
        assert!(matches!(err, BuildError::NoSteps));

        let mut orphan = task("t", vec![step("alpine", &["true"])]);
        orphan.metadata.uid = None;
        let err = builder.build(&orphan).await.unwrap_err();
        assert!(matches!(err, BuildError::MissingUid(_)));
    }

    #[test]
    fn test_image_argv_follows_docker_semantics() {
        let command = ImageCommand {
            entrypoint: vec![],
            cmd: vec!["python".to_string(), "app.py".to_string()],
        };
        assert_eq!(image_argv(&command, None), vec!["python", "app.py"]);
        assert_eq!(
            image_argv(&command, Some(&["python".to_string(), "-V".to_string()][..])),
            vec!["python", "-V"]
        );
        assert!(image_argv(&ImageCommand::default(), None).is_empty());
    }
}
