/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod client;
pub mod daemons;
pub mod launcher;
pub mod observer;
pub mod process_control;
pub mod replay;
pub mod server;

/// The role this invocation plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Coordinates the run from the server host.
    Server,
    /// Runs load generators for one client host.
    Client,
    /// Records runtime statistics for every instance.
    Observer,
    /// Re-executes a captured manifest from the server host.
    Replay,
}

impl ExecutionMode {
    /// Roles the server starts over the remote shell.
    pub fn is_remote(&self) -> bool {
        matches!(self, ExecutionMode::Client | ExecutionMode::Observer)
    }
}
