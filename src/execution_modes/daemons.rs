/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Long-running helpers started next to the applications: the runtimes' own daemons and the
//! per-host monitors whose logs end up in the experiment directory.

use super::process_control::{launch, ProcessHandle, Readiness};
use crate::{error::ExperimentError, experiment::Experiment, testbed::Testbed};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shell line that starts the I/O kernel daemon, logging with timestamps.
pub fn iokerneld_command(experiment: &Experiment, testbed: &Testbed) -> String {
    // only the server runs with hyperthreads disabled
    let noht = experiment.noht && testbed.hostname == experiment.server_hostname;
    format!(
        "sudo {} 2>&1 | ts %s > iokernel.{}.log",
        testbed.config.paths.iokerneld(noht),
        testbed.hostname
    )
}

/// The bespoke runtime's I/O kernel daemon. Every runtime process on the host depends on it,
/// so it has to survive device initialization before anything else starts.
pub async fn start_iokerneld(
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<ProcessHandle> {
    setup_machine(testbed)?;
    let dir = experiment.dir();
    launch(
        "iokerneld",
        &iokerneld_command(experiment, testbed),
        Some(&dir),
        &Readiness::survive(Duration::from_secs(10)),
        token,
    )
    .await
}

/// Core-allocation daemon of the user-level threading runtime. Server only, and it cannot run
/// with hyperthreads disabled.
pub async fn start_corearbiter(
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<ProcessHandle> {
    testbed.require_server()?;
    if experiment.noht {
        return Err(ExperimentError::precondition(
            "the core arbiter cannot run with hyperthreads disabled",
        )
        .into());
    }
    setup_machine(testbed)?;

    let command = format!(
        "sudo numactl -N 0 -m 0 {} > corearbiter.{}.log 2>&1",
        testbed.config.paths.corearbiter(),
        testbed.hostname
    );
    let dir = experiment.dir();
    launch(
        "corearbiter",
        &command,
        Some(&dir),
        &Readiness::survive(Duration::from_secs(5)),
        token,
    )
    .await
}

/// Keeps the CPUs out of deep C-states for the duration of the run.
pub async fn start_cstate(
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<ProcessHandle> {
    let dir = experiment.dir();
    launch(
        "cstate",
        &format!("sudo {} 0", testbed.config.paths.script("cstate")),
        Some(&dir),
        &Readiness::immediate(),
        token,
    )
    .await
}

/// Per-second CPU utilization of both NUMA nodes.
pub async fn start_mpstat(
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<ProcessHandle> {
    let dir = experiment.dir();
    launch(
        "mpstat",
        &format!("mpstat 1 -N 0,1 2>&1| ts %s > mpstat.{}.log", testbed.hostname),
        Some(&dir),
        &Readiness::immediate(),
        token,
    )
    .await
}

fn setup_machine(testbed: &Testbed) -> anyhow::Result<()> {
    testbed.run(&format!(
        "sudo {} || true",
        testbed.config.paths.script("setup_machine.sh")
    ))?;
    Ok(())
}
