/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt;

/// Failures that callers may want to tell apart. Everything else travels as a plain
/// `anyhow::Error`; these are wrapped in it too and recovered with `downcast_ref`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentError {
    /// A condition that must hold before anything is spawned (missing binary, missing
    /// experiment directory, not running on a server host, ...). Never retried.
    Precondition(String),

    /// Two application instances share a name.
    DuplicateName(String),

    /// A client host was given more instances than it has cores.
    CoreBudgetExceeded {
        host: String,
        instances: usize,
        cores: usize,
    },

    /// The process exited before its grace period elapsed.
    LaunchFailure { name: String, status: String },

    /// Host clocks never agreed within the retry budget.
    ClockSkew { attempts: usize, samples: Vec<i64> },

    /// The run was cancelled while `0` was still being waited for.
    Interrupted(String),
}

impl ExperimentError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        ExperimentError::Precondition(msg.into())
    }

    /// Everything except a launch failure or an interruption is raised before any process
    /// starts.
    pub fn is_precondition(&self) -> bool {
        !matches!(
            self,
            ExperimentError::LaunchFailure { .. } | ExperimentError::Interrupted(_)
        )
    }

    pub fn error_message(&self) -> String {
        match self {
            ExperimentError::Precondition(msg) => format!("precondition violated: {}", msg),
            ExperimentError::DuplicateName(name) => {
                format!("application name {} is used more than once", name)
            }
            ExperimentError::CoreBudgetExceeded {
                host,
                instances,
                cores,
            } => format!(
                "client host {} was assigned {} instances but only has {} cores",
                host, instances, cores
            ),
            ExperimentError::LaunchFailure { name, status } => {
                format!("{} exited during its grace period ({})", name, status)
            }
            ExperimentError::ClockSkew { attempts, samples } => format!(
                "host clocks disagree after {} attempts, last sample {:?}",
                attempts, samples
            ),
            ExperimentError::Interrupted(what) => format!("interrupted while waiting for {}", what),
        }
    }
}

impl fmt::Display for ExperimentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_message())
    }
}

impl std::error::Error for ExperimentError {}
