//! OrderTask Entrypoint
//!
//! The step sequencer staged into every step container of an OrderTask pod.
//!
//! Architecture:
//! - Configuration: Flags written by the pod builder, validated up front
//! - Waiter: Polls the projected order file until this step may run
//! - Execution: Runs the step's real command and forwards its exit status
//!
//! Exit codes: 2 for configuration or wait errors, 3 when the quit marker is
//! observed, 127 when the command cannot be started, otherwise the command's
//! own status.

mod config;
mod execution;
mod waiter;

use clap::Parser;
use ordertask_core::layout::{QUIT_EXIT_CODE, SCRATCH_DIR};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Args, Config};
use crate::execution::{ExecError, SPAWN_FAILURE_EXIT_CODE};
use crate::waiter::{WaitOutcome, Waiter};

/// Exit status for invalid flags, wait failures and interrupted waits
const USAGE_EXIT_CODE: i32 = 2;

/// Exit status when the command started but could not be waited on
const EXEC_FAILURE_EXIT_CODE: i32 = 1;

/// How a sequencer run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    InvalidConfig,
    WaitFailed,
    Interrupted,
    Quit,
    SpawnFailed,
    ExecFailed,
    Exited(i32),
}

impl RunOutcome {
    fn exit_code(self) -> i32 {
        match self {
            RunOutcome::InvalidConfig | RunOutcome::WaitFailed | RunOutcome::Interrupted => {
                USAGE_EXIT_CODE
            }
            RunOutcome::Quit => QUIT_EXIT_CODE,
            RunOutcome::SpawnFailed => SPAWN_FAILURE_EXIT_CODE,
            RunOutcome::ExecFailed => EXEC_FAILURE_EXIT_CODE,
            RunOutcome::Exited(code) => code,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Step output owns stdout, logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ordertask_entrypoint=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let outcome = run().await;
    ExitCode::from(process_status(outcome.exit_code()))
}

async fn run() -> RunOutcome {
    let config = match Config::from_args(Args::parse(), Path::new(SCRATCH_DIR)) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return RunOutcome::InvalidConfig;
        }
    };

    let waiter = Waiter::new(
        &config.wait_file,
        config.step,
        config.wait_mode,
        config.quit.clone(),
        config.interval,
    );

    let outcome = tokio::select! {
        outcome = waiter.wait() => outcome,
        _ = shutdown_signal() => {
            warn!("Interrupted while waiting for step {}", config.step);
            return RunOutcome::Interrupted;
        }
    };

    match outcome {
        Ok(WaitOutcome::Ready(marker)) => {
            info!("Starting step {} at marker {}", config.step, marker);
        }
        Ok(WaitOutcome::Quit) => {
            info!("Step {} will not run", config.step);
            return RunOutcome::Quit;
        }
        Err(e) => {
            error!("Wait failed: {}", e);
            return RunOutcome::WaitFailed;
        }
    }

    match execution::run(&config.command, &config.args, &config.output, shutdown_signal()).await {
        Ok(code) => RunOutcome::Exited(code),
        Err(e @ ExecError::Spawn { .. }) => {
            error!("{}", e);
            RunOutcome::SpawnFailed
        }
        Err(e) => {
            error!("{}", e);
            RunOutcome::ExecFailed
        }
    }
}

/// Narrows an exit code to a process status, out-of-range codes become 1
fn process_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::InvalidConfig.exit_code(), 2);
        assert_eq!(RunOutcome::WaitFailed.exit_code(), 2);
        assert_eq!(RunOutcome::Interrupted.exit_code(), 2);
        assert_eq!(RunOutcome::Quit.exit_code(), 3);
        assert_eq!(RunOutcome::SpawnFailed.exit_code(), 127);
        assert_eq!(RunOutcome::ExecFailed.exit_code(), 1);
    }

    #[test]
    fn test_command_status_passes_through() {
        assert_eq!(RunOutcome::Exited(0).exit_code(), 0);
        assert_eq!(RunOutcome::Exited(7).exit_code(), 7);
        assert_eq!(RunOutcome::Exited(137).exit_code(), 137);
    }

    #[test]
    fn test_process_status_range() {
        assert_eq!(process_status(0), 0);
        assert_eq!(process_status(255), 255);
        assert_eq!(process_status(256), 1);
        assert_eq!(process_status(-1), 1);
    }
}
