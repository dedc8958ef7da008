//! Command execution
//!
//! Spawns the step's program with the chosen output wiring and reports its
//! exit status as the sequencer's own.

use crate::config::Output;
use std::fs::OpenOptions;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit status reported when the program could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to open output file '{path}': {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// Runs `command` with `args` until it exits or `shutdown` resolves
///
/// On shutdown the child is killed and its resulting status is returned.
///
/// # Returns
/// The exit code to report for the step
pub async fn run<F>(
    command: &str,
    args: &[String],
    output: &Output,
    shutdown: F,
) -> Result<i32, ExecError>
where
    F: Future<Output = ()>,
{
    let (stdout, stderr) = stdio_for(output)?;

    info!("Running {} {:?}", command, args);

    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown => {
            warn!("Shutdown requested, stopping {}", command);
            if let Err(e) = child.start_kill() {
                debug!("Kill failed: {}", e);
            }
            child.wait().await
        }
    }
    .map_err(|source| ExecError::Wait {
        command: command.to_string(),
        source,
    })?;

    let code = exit_code_of(status);
    info!("{} exited with {}", command, code);

    Ok(code)
}

fn stdio_for(output: &Output) -> Result<(Stdio, Stdio), ExecError> {
    match output {
        Output::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
        Output::File(path) => {
            let open_err = |source: io::Error| ExecError::Output {
                path: path.clone(),
                source,
            };
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(open_err)?;
            let err_file = file.try_clone().map_err(open_err)?;
            Ok((Stdio::from(file), Stdio::from(err_file)))
        }
    }
}

/// Maps a process status to a shell-style exit code
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
