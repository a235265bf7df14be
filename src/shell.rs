/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{anyhow, Context};
use subprocess::{Exec, Redirection};
use tracing::debug;

/// Runs one-shot shell commands (module loading, driver binding, `pkill`, ...) and returns
/// their stdout. Long-running processes go through `process_control` instead.
pub trait Shell: Send + Sync {
    fn run(&self, command: &str) -> anyhow::Result<String>;

    /// Runs `command` and swallows any failure. Used where "already gone" is success.
    fn run_best_effort(&self, command: &str) {
        if let Err(err) = self.run(command) {
            debug!("ignoring failure of `{}`: {}", command, err);
        }
    }
}

/// `sh -c` on this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalShell;

impl Shell for LocalShell {
    fn run(&self, command: &str) -> anyhow::Result<String> {
        debug!("$ {}", command);
        let capture = Exec::shell(command)
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .context(format!("Failed to spawn shell for `{}`", command))?;

        if capture.success() {
            Ok(capture.stdout_str())
        } else {
            Err(anyhow!(
                "`{}` failed ({:?}): {}",
                command,
                capture.exit_status,
                capture.stderr_str().trim()
            ))
        }
    }
}
