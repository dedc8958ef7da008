//! Order marker and wait semantics

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reserved marker value meaning "a step failed, nothing else may run"
pub const FAILED_SENTINEL: &str = "-1";

/// Value of the order annotation on a step pod
///
/// `Step(n)` allows the 1-based step `n` to run. Once every step has
/// succeeded the marker holds `Step(step_count + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderMarker {
    Step(u32),
    Failed,
}

impl OrderMarker {
    /// Marker written on a freshly built pod
    pub const INITIAL: OrderMarker = OrderMarker::Step(1);

    /// Returns the marker that follows a successful run of the current step
    ///
    /// The failure sentinel never moves.
    pub fn advance(self) -> OrderMarker {
        match self {
            OrderMarker::Step(n) => OrderMarker::Step(n.saturating_add(1)),
            OrderMarker::Failed => OrderMarker::Failed,
        }
    }

    /// Whether every one of `step_count` steps has completed
    pub fn is_complete(self, step_count: usize) -> bool {
        matches!(self, OrderMarker::Step(n) if n as usize > step_count)
    }

    /// Whether the controller will never write this marker again
    pub fn is_terminal(self, step_count: usize) -> bool {
        self == OrderMarker::Failed || self.is_complete(step_count)
    }

    /// Whether moving from `self` to `next` respects the ordering invariant
    ///
    /// Markers only move forward one step at a time, or pin to the failure
    /// sentinel.
    pub fn can_transition_to(self, next: OrderMarker) -> bool {
        match (self, next) {
            (OrderMarker::Failed, _) => false,
            (OrderMarker::Step(_), OrderMarker::Failed) => true,
            (OrderMarker::Step(a), OrderMarker::Step(b)) => b == a.saturating_add(1),
        }
    }
}

impl fmt::Display for OrderMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderMarker::Step(n) => write!(f, "{}", n),
            OrderMarker::Failed => write!(f, "{}", FAILED_SENTINEL),
        }
    }
}

/// Error returned when a marker value cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid order marker: {0:?}")]
pub struct InvalidMarker(pub String);

impl FromStr for OrderMarker {
    type Err = InvalidMarker;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == FAILED_SENTINEL {
            return Ok(OrderMarker::Failed);
        }
        match trimmed.parse::<u32>() {
            Ok(n) if n >= 1 => Ok(OrderMarker::Step(n)),
            _ => Err(InvalidMarker(s.to_string())),
        }
    }
}

/// How a sequencer compares the marker against its own step index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitMode {
    /// Proceed once the marker is greater than or equal to the step index.
    /// Tolerates a reader that missed an intermediate value.
    #[default]
    AtLeast,
    /// Proceed only when the marker equals the step index
    Exact,
}

impl WaitMode {
    /// Returns true when step `index` may start under `marker`
    pub fn is_satisfied(self, marker: OrderMarker, index: u32) -> bool {
        match marker {
            OrderMarker::Failed => false,
            OrderMarker::Step(current) => match self {
                WaitMode::AtLeast => current >= index,
                WaitMode::Exact => current == index,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WaitMode::AtLeast => "at-least",
            WaitMode::Exact => "exact",
        }
    }
}

impl fmt::Display for WaitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "at-least" | "atleast" | "ge" => Ok(WaitMode::AtLeast),
            "exact" | "eq" => Ok(WaitMode::Exact),
            other => Err(format!("unknown wait mode '{}'", other)),
        }
    }
}
