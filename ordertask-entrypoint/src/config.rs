//! Sequencer configuration
//!
//! Flags are parsed by clap and validated before the wait phase begins, so
//! a misconfigured step fails immediately instead of blocking forever.

use anyhow::{Context, Result};
use clap::Parser;
use ordertask_core::domain::order::{OrderMarker, WaitMode};
use ordertask_core::layout::STDOUT_OUTPUT;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Poll interval used when none (or zero) is given
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "entrypoint")]
#[command(about = "Waits until the order file allows this step, then runs its command", long_about = None)]
pub struct Args {
    /// File holding the order marker
    #[arg(long, default_value = "")]
    pub wait: String,

    /// Step index the marker must reach
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub wait_content: String,

    /// `stdout`, or a file the command's output is appended to. Relative
    /// paths land in the scratch volume.
    #[arg(long, default_value = "")]
    pub out: String,

    /// Program to run once unblocked
    #[arg(long, default_value = "")]
    pub command: String,

    /// Arguments passed to the program
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Milliseconds between checks of the order file
    #[arg(long, env = "ORDERTASK_SEQUENCER_INTERVAL_MS")]
    pub interval_ms: Option<u64>,

    /// `at-least` (marker >= step) or `exact` (marker == step)
    #[arg(long, default_value = "at-least")]
    pub wait_mode: WaitMode,

    /// Marker content that makes the step give up without running
    #[arg(long, allow_hyphen_values = true)]
    pub quit: Option<String>,
}

/// Where the command's output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Inherit the sequencer's stdout and stderr
    Inherit,
    /// Append stdout and stderr to a file
    File(PathBuf),
}

/// Validated sequencer configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub wait_file: PathBuf,
    pub step: u32,
    pub output: Output,
    pub command: String,
    pub args: Vec<String>,
    pub interval: Duration,
    pub wait_mode: WaitMode,
    pub quit: Option<String>,
}

impl Config {
    /// Validates flags and resolves the output destination
    ///
    /// # Arguments
    /// * `args` - Parsed flags
    /// * `output_dir` - Writable directory relative output paths land in
    pub fn from_args(args: Args, output_dir: &Path) -> Result<Self> {
        if args.wait.trim().is_empty() {
            anyhow::bail!("--wait cannot be empty");
        }

        if args.wait_content.trim().is_empty() {
            anyhow::bail!("--wait-content cannot be empty");
        }

        if args.out.trim().is_empty() {
            anyhow::bail!("--out cannot be empty");
        }

        if args.command.trim().is_empty() {
            anyhow::bail!("--command cannot be empty");
        }

        let step = match args
            .wait_content
            .parse::<OrderMarker>()
            .with_context(|| format!("--wait-content '{}' is not a step index", args.wait_content))?
        {
            OrderMarker::Step(step) => step,
            OrderMarker::Failed => {
                anyhow::bail!("--wait-content cannot be the failure sentinel")
            }
        };

        let output = resolve_output(args.out.trim(), output_dir);
        let interval = args
            .interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INTERVAL);
        let quit = args
            .quit
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());

        Ok(Self {
            wait_file: PathBuf::from(args.wait),
            step,
            output,
            command: args.command,
            args: args.args,
            interval,
            wait_mode: args.wait_mode,
            quit,
        })
    }
}

fn resolve_output(out: &str, output_dir: &Path) -> Output {
    if out == STDOUT_OUTPUT {
        return Output::Inherit;
    }

    let path = PathBuf::from(out);
    if path.is_relative() {
        Output::File(output_dir.join(path))
    } else {
        Output::File(path)
    }
}
