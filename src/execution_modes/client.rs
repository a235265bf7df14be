/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{
    daemons,
    launcher::launch_instance,
    process_control::{shutdown_processes, wait_for_all, ProcessHandle},
};
use crate::{
    adapter::adapter_for,
    error::ExperimentError,
    experiment::{ClientInstance, Experiment},
    system::System,
    testbed::Testbed,
};
use anyhow::anyhow;
use std::{path::Path, time::Duration};
use subprocess::ExitStatus;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The load generators this host is responsible for.
pub fn instances_for_host<'a>(
    experiment: &'a Experiment,
    host: &str,
) -> anyhow::Result<&'a [ClientInstance]> {
    match experiment.clients.get(host) {
        Some(instances) if !instances.is_empty() => Ok(instances),
        _ => Err(ExperimentError::precondition(format!(
            "{} has no client instances for {}",
            experiment.name, host
        ))
        .into()),
    }
}

/// Client side of a run, invoked remotely by the server with the replicated experiment
/// directory. Load generators always use the bespoke runtime, whatever the server runs.
pub async fn run_client(
    dir: &Path,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let mut experiment = Experiment::read_manifest(dir)?;
    // the replicated copy is this host's working directory
    experiment.name = dir.to_string_lossy().into_owned();
    let instances = instances_for_host(&experiment, &testbed.hostname)?;
    info!(
        "{} running {} load generators for {}",
        testbed.hostname,
        instances.len(),
        experiment.name
    );

    let adapter = adapter_for(System::Shenango);
    adapter.switch_environment(testbed)?;
    let mut support = adapter.start_daemons(&experiment, testbed, token).await?;

    let mut clients: Vec<ProcessHandle> = vec![];
    let launched =
        start_clients(instances, &experiment, testbed, token, &mut support, &mut clients).await;
    if let Err(err) = launched {
        shutdown_processes(&mut clients);
        shutdown_processes(&mut support);
        return Err(err);
    }

    let interval = Duration::from_millis(testbed.config.cluster.poll_interval_ms);
    let statuses = wait_for_all(&mut clients, interval, token).await;
    shutdown_processes(&mut clients);
    shutdown_processes(&mut support);

    let statuses = statuses.ok_or_else(|| anyhow!("{} was interrupted", experiment.name))?;
    check_exits(&clients, &statuses)
}

async fn start_clients(
    instances: &[ClientInstance],
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
    support: &mut Vec<ProcessHandle>,
    clients: &mut Vec<ProcessHandle>,
) -> anyhow::Result<()> {
    let adapter = adapter_for(System::Shenango);
    support.push(daemons::start_cstate(experiment, testbed, token).await?);
    for instance in instances {
        clients.push(launch_instance(instance, adapter, experiment, testbed, token).await?);
    }
    Ok(())
}

fn check_exits(clients: &[ProcessHandle], statuses: &[ExitStatus]) -> anyhow::Result<()> {
    let failed: Vec<String> = clients
        .iter()
        .zip(statuses)
        .filter(|(_, status)| !status.success())
        .map(|(client, status)| format!("{} ({:?})", client.name(), status))
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("load generators failed: {}", failed.join(", ")))
    }
}
