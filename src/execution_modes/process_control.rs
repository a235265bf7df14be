/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::ExperimentError;
use anyhow::Context;
use colored::*;
use std::{
    path::Path,
    time::{Duration, Instant},
};
use subprocess::{Exec, ExitStatus, Popen};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A child process started by netexp. Output redirection is part of the command line so the
/// log file names stay under the caller's control.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    command: String,
    popen: Popen,
}

impl ProcessHandle {
    /// Spawns `command` through `sh -c` as a detached process. This function does not block.
    ///
    /// # Arguments
    ///
    /// * name - Label used in logs and errors.
    /// * command - Full shell command, including redirections.
    /// * cwd - Working directory, usually the experiment directory.
    pub fn spawn(name: &str, command: &str, cwd: Option<&Path>) -> anyhow::Result<Self> {
        let mut exec = Exec::shell(command);
        if let Some(dir) = cwd {
            exec = exec.cwd(dir);
        }

        let popen = exec
            .detached()
            .popen()
            .context(format!("Failed to spawn {}, command: {}", name, command))?;
        debug!("spawned {} (pid {:?}): {}", name, popen.pid(), command);

        Ok(ProcessHandle {
            name: name.to_string(),
            command: command.to_string(),
            popen,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.popen.pid()
    }

    /// Exit status if the process has finished, `None` while it is still running.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        self.popen.poll()
    }

    pub fn is_running(&mut self) -> bool {
        self.poll().is_none()
    }

    pub fn wait(&mut self) -> anyhow::Result<ExitStatus> {
        self.popen
            .wait()
            .context(format!("Failed waiting for {}", self.name))
    }

    /// Sends SIGTERM and waits a little for the process to go away, then SIGKILL. Never fails:
    /// a process that is already gone is the desired outcome.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        if let Err(err) = self.popen.terminate() {
            debug!("terminate {} failed: {}", self.name, err);
        }
        match self.popen.wait_timeout(Duration::from_secs(5)) {
            Ok(Some(_)) => {}
            _ => {
                if let Err(err) = self.popen.kill() {
                    warn!("Failed to kill {}: {}", self.name, err);
                }
                let _ = self.popen.wait_timeout(Duration::from_secs(1));
            }
        }
    }
}

/// How long a freshly spawned process must stay alive before it counts as running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub grace: Duration,
    pub interval: Duration,
}

impl Readiness {
    pub fn survive(grace: Duration) -> Self {
        Readiness {
            grace,
            interval: Duration::from_millis(250),
        }
    }

    /// Only checks that the process did not die while being spawned.
    pub fn immediate() -> Self {
        Readiness::survive(Duration::ZERO)
    }
}

/// Polls `handle` until the grace period has elapsed. Exiting early, with any status, is a
/// launch failure; cancelling `token` ends the wait with `Interrupted`.
pub async fn await_ready(
    handle: &mut ProcessHandle,
    readiness: &Readiness,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + readiness.grace;
    loop {
        if let Some(status) = handle.poll() {
            return Err(ExperimentError::LaunchFailure {
                name: handle.name.clone(),
                status: format!("{:?}", status),
            }
            .into());
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(readiness.interval.min(deadline - now)) => {}
            _ = token.cancelled() => {
                return Err(ExperimentError::Interrupted(handle.name.clone()).into());
            }
        }
    }
}

/// Spawns `command` and returns once it has survived its grace period. A process that is
/// interrupted during its grace period is stopped again.
pub async fn launch(
    name: &str,
    command: &str,
    cwd: Option<&Path>,
    readiness: &Readiness,
    token: &CancellationToken,
) -> anyhow::Result<ProcessHandle> {
    println!("> starting {}", name.green());
    println!("\t{}", command.bright_black());

    let mut handle = ProcessHandle::spawn(name, command, cwd)?;
    if let Err(err) = await_ready(&mut handle, readiness, token).await {
        println!("\t{}", "✗".red());
        handle.stop();
        return Err(err);
    }
    Ok(handle)
}

/// Waits until any of `handles` exits and returns its name, or `None` if `token` is
/// cancelled first.
pub async fn wait_for_first_exit(
    handles: &mut [ProcessHandle],
    interval: Duration,
    token: &CancellationToken,
) -> Option<String> {
    loop {
        for handle in handles.iter_mut() {
            if let Some(status) = handle.poll() {
                debug!("{} exited with {:?}", handle.name, status);
                return Some(handle.name.clone());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.cancelled() => return None,
        }
    }
}

/// Waits until every one of `handles` has exited and returns their exit statuses in order, or
/// `None` if `token` is cancelled first.
pub async fn wait_for_all(
    handles: &mut [ProcessHandle],
    interval: Duration,
    token: &CancellationToken,
) -> Option<Vec<ExitStatus>> {
    let mut statuses: Vec<Option<ExitStatus>> = vec![None; handles.len()];
    loop {
        for (handle, status) in handles.iter_mut().zip(statuses.iter_mut()) {
            if status.is_none() {
                *status = handle.poll();
            }
        }
        if statuses.iter().all(Option::is_some) {
            return Some(statuses.into_iter().flatten().collect());
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.cancelled() => return None,
        }
    }
}

pub fn shutdown_processes(handles: &mut [ProcessHandle]) {
    for handle in handles.iter_mut() {
        print!("> stopping process {}", handle.name.green());
        handle.stop();
        println!("\t{}", "✓".green());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;
        use sysinfo::{Pid, System};

        fn quick(grace_ms: u64) -> Readiness {
            Readiness {
                grace: Duration::from_millis(grace_ms),
                interval: Duration::from_millis(20),
            }
        }

        #[tokio::test]
        async fn can_run_a_long_lived_process() -> anyhow::Result<()> {
            let token = CancellationToken::new();
            let mut handle = launch("sleep", "sleep 15", None, &quick(200), &token).await?;
            let pid = handle.pid().context("process should have a pid")?;

            let mut system = System::new();
            system.refresh_all();
            assert!(system.process(Pid::from_u32(pid)).is_some());

            handle.stop();
            assert!(!handle.is_running());
            Ok(())
        }

        #[tokio::test]
        async fn early_exit_is_a_launch_failure() {
            let token = CancellationToken::new();
            let err = launch("false", "exit 1", None, &quick(500), &token)
                .await
                .unwrap_err();
            match err.downcast_ref::<ExperimentError>() {
                Some(ExperimentError::LaunchFailure { name, .. }) => assert_eq!(name, "false"),
                other => panic!("expected a launch failure, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn clean_exit_inside_grace_period_is_still_a_failure() {
            let token = CancellationToken::new();
            assert!(launch("short", "sleep 0.05", None, &quick(1000), &token)
                .await
                .is_err());
        }

        #[tokio::test]
        async fn cancellation_cuts_the_grace_period_short() -> anyhow::Result<()> {
            let token = CancellationToken::new();
            let canceller = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                canceller.cancel();
            });

            let started = Instant::now();
            let err = launch("daemon", "sleep 15", None, &quick(20_000), &token)
                .await
                .unwrap_err();
            assert!(started.elapsed() < Duration::from_secs(10));
            assert_eq!(
                err.downcast_ref::<ExperimentError>(),
                Some(&ExperimentError::Interrupted("daemon".to_string()))
            );
            Ok(())
        }

        #[test]
        fn runs_in_the_given_directory() -> anyhow::Result<()> {
            let tmp = tempfile::tempdir()?;
            let mut handle =
                ProcessHandle::spawn("touch", "touch marker.out", Some(tmp.path()))?;
            handle.wait()?;
            assert!(tmp.path().join("marker.out").exists());
            Ok(())
        }

        #[test]
        fn stopping_twice_is_harmless() -> anyhow::Result<()> {
            let mut handle = ProcessHandle::spawn("sleep", "sleep 15", None)?;
            handle.stop();
            handle.stop();
            Ok(())
        }

        #[tokio::test]
        async fn first_exit_is_reported() -> anyhow::Result<()> {
            let mut handles = vec![
                ProcessHandle::spawn("long", "sleep 15", None)?,
                ProcessHandle::spawn("short", "sleep 0.1", None)?,
            ];
            let token = CancellationToken::new();
            let first =
                wait_for_first_exit(&mut handles, Duration::from_millis(20), &token).await;
            assert_eq!(first.as_deref(), Some("short"));
            shutdown_processes(&mut handles);
            Ok(())
        }

        #[tokio::test]
        async fn waits_for_every_process() -> anyhow::Result<()> {
            let mut handles = vec![
                ProcessHandle::spawn("ok", "sleep 0.1", None)?,
                ProcessHandle::spawn("bad", "sleep 0.2; exit 3", None)?,
            ];
            let token = CancellationToken::new();
            let statuses = wait_for_all(&mut handles, Duration::from_millis(20), &token)
                .await
                .context("wait was not cancelled")?;
            assert_eq!(statuses, vec![ExitStatus::Exited(0), ExitStatus::Exited(3)]);
            Ok(())
        }

        #[tokio::test]
        async fn cancellation_ends_the_wait() -> anyhow::Result<()> {
            let mut handles = vec![ProcessHandle::spawn("long", "sleep 15", None)?];
            let token = CancellationToken::new();
            token.cancel();
            let first =
                wait_for_first_exit(&mut handles, Duration::from_millis(20), &token).await;
            assert!(first.is_none());
            shutdown_processes(&mut handles);
            Ok(())
        }
    }
}
