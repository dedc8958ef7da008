//! Order file polling
//!
//! The kubelet refreshes the projected marker file on its own schedule, so the
//! waiter simply re-reads it on a fixed interval until the step may start or
//! the quit marker shows up.

use ordertask_core::domain::order::{OrderMarker, WaitMode};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("wait path '{0}' is a directory")]
    IsDirectory(PathBuf),

    #[error("failed to read wait path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of a finished wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The marker allows this step to run
    Ready(OrderMarker),
    /// The marker matched the quit content
    Quit,
}

pub struct Waiter {
    path: PathBuf,
    step: u32,
    mode: WaitMode,
    quit: Option<String>,
    interval: Duration,
}

impl Waiter {
    /// Creates a waiter for step `step`
    ///
    /// # Arguments
    /// * `path` - Order file to poll
    /// * `step` - 1-based index of this step
    /// * `mode` - How the marker is compared against `step`
    /// * `quit` - Trimmed marker content that aborts the wait
    /// * `interval` - Delay between reads
    pub fn new(
        path: impl Into<PathBuf>,
        step: u32,
        mode: WaitMode,
        quit: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            step,
            mode,
            quit,
            interval,
        }
    }

    /// Blocks until the step may run or the quit marker is observed
    pub async fn wait(&self) -> Result<WaitOutcome, WaitError> {
        info!(
            "Waiting on {} for step {} ({})",
            self.path.display(),
            self.step,
            self.mode
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Some(outcome) = self.check().await? {
                return Ok(outcome);
            }
        }
    }

    /// Reads the order file once
    ///
    /// A missing file or unreadable content means "not yet"; only a directory
    /// or a real I/O failure is an error.
    pub async fn check(&self) -> Result<Option<WaitOutcome>, WaitError> {
        let content = match read_marker_file(&self.path).await? {
            Some(content) => content,
            None => return Ok(None),
        };
        let trimmed = content.trim();

        if self.quit.as_deref() == Some(trimmed) {
            info!("Quit marker '{}' observed", trimmed);
            return Ok(Some(WaitOutcome::Quit));
        }

        match trimmed.parse::<OrderMarker>() {
            Ok(marker) if self.mode.is_satisfied(marker, self.step) => {
                info!("Marker {} allows step {}", marker, self.step);
                Ok(Some(WaitOutcome::Ready(marker)))
            }
            Ok(marker) => {
                debug!("Marker {} does not allow step {} yet", marker, self.step);
                Ok(None)
            }
            Err(e) => {
                debug!("Ignoring order file content: {}", e);
                Ok(None)
            }
        }
    }
}

async fn read_marker_file(path: &Path) -> Result<Option<String>, WaitError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => return Err(WaitError::IsDirectory(path.to_path_buf())),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(WaitError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        // Swapped out by the kubelet between the two calls
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(WaitError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
