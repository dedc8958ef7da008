//! Controller configuration
//!
//! Flags (with `ORDERTASK_*` environment fallbacks) are parsed by clap and
//! turned into a validated [`Config`].

use anyhow::Result;
use clap::Parser;
use ordertask_core::domain::image::Platform;
use ordertask_core::domain::order::WaitMode;
use ordertask_core::retry::RetryPolicy;
use ordertask_registry::RegistryConfig;
use std::path::Path;
use std::time::Duration;

use crate::bootstrap::BootstrapSettings;
use crate::builder::BuildSettings;
use crate::reconciler::ReconcileSettings;

pub const DEFAULT_ENTRYPOINT_IMAGE: &str = "docker.io/ordertask/entrypoint:latest";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Parser, Debug)]
#[command(name = "ordertask-controller")]
#[command(about = "Runs OrderTask steps one after another inside a single pod", long_about = None)]
pub struct Args {
    /// Namespace to watch (defaults to the controller's own namespace)
    #[arg(long, env = "ORDERTASK_NAMESPACE")]
    pub namespace: Option<String>,

    /// Watch OrderTasks in every namespace
    #[arg(long, env = "ORDERTASK_ALL_NAMESPACES")]
    pub all_namespaces: bool,

    /// Image the init container copies the sequencer binary from
    #[arg(long, env = "ORDERTASK_ENTRYPOINT_IMAGE", default_value = DEFAULT_ENTRYPOINT_IMAGE)]
    pub entrypoint_image: String,

    /// Maximum number of resolved images kept in memory
    #[arg(long, env = "ORDERTASK_IMAGE_CACHE_SIZE", default_value_t = 1024)]
    pub image_cache_size: usize,

    /// Platform (`os/arch`) used to pick image default commands
    #[arg(long, env = "ORDERTASK_PLATFORM")]
    pub platform: Option<String>,

    /// Tasks reconciled in parallel
    #[arg(long, env = "ORDERTASK_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Seconds between safety-net reconciliations of running tasks
    #[arg(long, env = "ORDERTASK_REQUEUE_SECS", default_value_t = 10)]
    pub requeue_secs: u64,

    /// Milliseconds between CRD establishment checks
    #[arg(long, env = "ORDERTASK_CRD_POLL_MS", default_value_t = 500)]
    pub crd_poll_ms: u64,

    /// Seconds to wait for the CRD to become established
    #[arg(long, env = "ORDERTASK_CRD_TIMEOUT_SECS", default_value_t = 60)]
    pub crd_timeout_secs: u64,

    /// Skip registering the CRD (it is managed elsewhere)
    #[arg(long, env = "ORDERTASK_SKIP_CRD_INSTALL")]
    pub skip_crd_install: bool,

    /// Attempts for an order marker update that keeps conflicting
    #[arg(long, env = "ORDERTASK_UPDATE_RETRIES", default_value_t = 5)]
    pub update_retries: u32,

    /// Milliseconds between conflicting marker update attempts
    #[arg(long, env = "ORDERTASK_UPDATE_RETRY_DELAY_MS", default_value_t = 200)]
    pub update_retry_delay_ms: u64,

    /// Registry request timeout in seconds
    #[arg(long, env = "ORDERTASK_REGISTRY_TIMEOUT_SECS", default_value_t = 30)]
    pub registry_timeout_secs: u64,

    /// Attempts for registry requests hitting transient failures
    #[arg(long, env = "ORDERTASK_REGISTRY_RETRIES", default_value_t = 3)]
    pub registry_retries: u32,

    /// Milliseconds between registry attempts
    #[arg(long, env = "ORDERTASK_REGISTRY_RETRY_DELAY_MS", default_value_t = 500)]
    pub registry_retry_delay_ms: u64,

    /// Registries reached over plain HTTP (comma separated)
    #[arg(long, env = "ORDERTASK_INSECURE_REGISTRIES", value_delimiter = ',')]
    pub insecure_registries: Vec<String>,

    /// How often step containers poll the order file, in milliseconds
    #[arg(long, env = "ORDERTASK_SEQUENCER_INTERVAL_MS", default_value_t = 20)]
    pub sequencer_interval_ms: u64,

    /// When a step may start: `at-least` (marker >= index) or `exact`
    #[arg(long, env = "ORDERTASK_WAIT_MODE", default_value = "at-least")]
    pub wait_mode: WaitMode,
}

/// Validated controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch, `None` for all namespaces
    pub namespace: Option<String>,
    pub entrypoint_image: String,
    pub image_cache_size: usize,
    pub platform: Platform,
    pub concurrency: u16,
    pub requeue_interval: Duration,
    pub crd_poll_interval: Duration,
    pub crd_timeout: Duration,
    pub skip_crd_install: bool,
    pub update_retry: RetryPolicy,
    pub registry_timeout: Duration,
    pub registry_retry: RetryPolicy,
    pub insecure_registries: Vec<String>,
    pub sequencer_interval: Duration,
    pub wait_mode: WaitMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            entrypoint_image: DEFAULT_ENTRYPOINT_IMAGE.to_string(),
            image_cache_size: 1024,
            platform: Platform::new("linux", "amd64"),
            concurrency: 4,
            requeue_interval: Duration::from_secs(10),
            crd_poll_interval: Duration::from_millis(500),
            crd_timeout: Duration::from_secs(60),
            skip_crd_install: false,
            update_retry: RetryPolicy::new(5, Duration::from_millis(200)),
            registry_timeout: Duration::from_secs(30),
            registry_retry: RetryPolicy::new(3, Duration::from_millis(500)),
            insecure_registries: Vec::new(),
            sequencer_interval: Duration::from_millis(20),
            wait_mode: WaitMode::AtLeast,
        }
    }
}

impl Config {
    /// Builds the configuration from parsed flags
    ///
    /// The platform defaults to `linux` on the controller's architecture,
    /// since step containers always run Linux images.
    pub fn from_args(args: Args) -> Result<Self> {
        let namespace = if args.all_namespaces {
            None
        } else {
            Some(discover_namespace(
                args.namespace,
                std::env::var("POD_NAMESPACE").ok(),
                Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE),
            ))
        };

        let platform = match args.platform {
            Some(platform) => platform.parse().map_err(anyhow::Error::msg)?,
            None => Platform::new("linux", Platform::local().arch()),
        };

        let config = Self {
            namespace,
            entrypoint_image: args.entrypoint_image,
            image_cache_size: args.image_cache_size,
            platform,
            concurrency: args.concurrency,
            requeue_interval: Duration::from_secs(args.requeue_secs),
            crd_poll_interval: Duration::from_millis(args.crd_poll_ms),
            crd_timeout: Duration::from_secs(args.crd_timeout_secs),
            skip_crd_install: args.skip_crd_install,
            update_retry: RetryPolicy::new(
                args.update_retries,
                Duration::from_millis(args.update_retry_delay_ms),
            ),
            registry_timeout: Duration::from_secs(args.registry_timeout_secs),
            registry_retry: RetryPolicy::new(
                args.registry_retries,
                Duration::from_millis(args.registry_retry_delay_ms),
            ),
            insecure_registries: args
                .insecure_registries
                .into_iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            sequencer_interval: Duration::from_millis(args.sequencer_interval_ms),
            wait_mode: args.wait_mode,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.as_deref().is_some_and(str::is_empty) {
            anyhow::bail!("namespace cannot be empty");
        }

        if self.entrypoint_image.trim().is_empty() {
            anyhow::bail!("entrypoint_image cannot be empty");
        }

        if self.image_cache_size == 0 {
            anyhow::bail!("image_cache_size must be greater than 0");
        }

        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        if self.requeue_interval.is_zero() {
            anyhow::bail!("requeue interval must be greater than 0");
        }

        if self.crd_poll_interval.is_zero() {
            anyhow::bail!("CRD poll interval must be greater than 0");
        }

        if self.crd_timeout < self.crd_poll_interval {
            anyhow::bail!("CRD timeout must be at least one poll interval");
        }

        if self.update_retry.max_attempts == 0 || self.registry_retry.max_attempts == 0 {
            anyhow::bail!("retry counts must be greater than 0");
        }

        if self.sequencer_interval.is_zero() {
            anyhow::bail!("sequencer interval must be greater than 0");
        }

        Ok(())
    }

    pub fn bootstrap_settings(&self) -> BootstrapSettings {
        BootstrapSettings {
            poll_interval: self.crd_poll_interval,
            timeout: self.crd_timeout,
        }
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            entrypoint_image: self.entrypoint_image.clone(),
            platform: self.platform.clone(),
            wait_mode: self.wait_mode,
            poll_interval: self.sequencer_interval,
        }
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            requeue_interval: self.requeue_interval,
            update_retry: self.update_retry,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            timeout: self.registry_timeout,
            insecure_registries: self.insecure_registries.clone(),
            retry: self.registry_retry,
        }
    }
}

/// Picks the namespace to watch
///
/// Order: explicit flag, `POD_NAMESPACE`, the service account namespace
/// file, then `default`. Blank values are skipped.
pub fn discover_namespace(flag: Option<String>, env: Option<String>, file: &Path) -> String {
    let non_blank = |value: String| {
        let value = value.trim().to_string();
        (!value.is_empty()).then_some(value)
    };

    flag.and_then(non_blank)
        .or_else(|| env.and_then(non_blank))
        .or_else(|| std::fs::read_to_string(file).ok().and_then(non_blank))
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("ordertask-controller").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_from_args() {
        let config = Config::from_args(parse(&[
            "--namespace",
            "jobs",
            "--platform",
            "linux/arm64",
            "--wait-mode",
            "exact",
            "--insecure-registries",
            "localhost:5000, registry.lan",
            "--update-retries",
            "7",
        ]))
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("jobs"));
        assert_eq!(config.platform, Platform::new("linux", "arm64"));
        assert_eq!(config.wait_mode, WaitMode::Exact);
        assert_eq!(config.insecure_registries, vec!["localhost:5000", "registry.lan"]);
        assert_eq!(config.update_retry.max_attempts, 7);
        assert_eq!(config.build_settings().poll_interval, Duration::from_millis(20));
    }

    #[test]
    fn test_all_namespaces_overrides_namespace() {
        let config = Config::from_args(parse(&["--all-namespaces", "--namespace", "jobs"])).unwrap();
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn test_from_args_rejects_bad_values() {
        assert!(Config::from_args(parse(&["--platform", "linux", "--namespace", "x"])).is_err());
        assert!(Config::from_args(parse(&["--concurrency", "0", "--namespace", "x"])).is_err());
        assert!(
            Config::from_args(parse(&[
                "--crd-timeout-secs",
                "0",
                "--crd-poll-ms",
                "500",
                "--namespace",
                "x"
            ]))
            .is_err()
        );
        assert!(Args::try_parse_from(["ordertask-controller", "--wait-mode", "sometimes"]).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = Config {
            sequencer_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            update_retry: RetryPolicy::new(0, Duration::from_millis(1)),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_discover_namespace_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        let missing = Path::new("/nonexistent/namespace");

        assert_eq!(
            discover_namespace(Some("flag".into()), Some("env".into()), file.path()),
            "flag"
        );
        assert_eq!(
            discover_namespace(None, Some("env".into()), file.path()),
            "env"
        );
        assert_eq!(
            discover_namespace(Some("  ".into()), None, file.path()),
            "from-file"
        );
        assert_eq!(discover_namespace(None, None, missing), "default");
    }
}
