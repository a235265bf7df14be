/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::process_control::{launch, shutdown_processes, ProcessHandle};
use crate::{
    adapter::{self, SystemAdapter},
    experiment::{Experiment, Instance},
    hooks::run_hooks,
    testbed::Testbed,
};
use anyhow::Context;
use std::fs;
use tokio_util::sync::CancellationToken;

/// Starts one instance from the experiment directory. The binary is checked and the
/// runtime config written before anything runs; `before` hooks then run right ahead of the
/// spawn and `after` hooks once the process has survived its grace period.
pub async fn launch_instance(
    instance: &dyn Instance,
    adapter: &dyn SystemAdapter,
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<ProcessHandle> {
    let dir = experiment.dir();

    let binary = adapter::resolve_binary(instance, adapter.system(), testbed)?;
    adapter::check_executable(&binary, &dir)?;

    if let Some(config) = adapter.render_config(instance, experiment, testbed)? {
        let path = dir.join(adapter::config_file_name(instance));
        fs::write(&path, config)
            .context(format!("Unable to write {}", path.to_string_lossy()))?;
    }
    let command = adapter.launch_command(instance, experiment, testbed, &binary)?;

    run_hooks(instance.before(), instance, experiment, testbed, token).await?;
    let mut handle = launch(
        instance.name(),
        &command,
        Some(&dir),
        &adapter.readiness(instance),
        token,
    )
    .await?;

    let started = match adapter.post_launch(&handle, instance, testbed) {
        Ok(()) => run_hooks(instance.after(), instance, experiment, testbed, token).await,
        Err(err) => Err(err),
    };
    if let Err(err) = started {
        handle.stop();
        return Err(err);
    }
    Ok(handle)
}

/// Launches every app of the experiment in declaration order. If one fails, the ones already
/// running are stopped before the error is returned.
pub async fn launch_apps(
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<Vec<ProcessHandle>> {
    let adapter = adapter::adapter_for(experiment.system);
    let mut handles = vec![];
    for app in &experiment.apps {
        match launch_instance(app, adapter, experiment, testbed, token).await {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                shutdown_processes(&mut handles);
                return Err(err.context(format!("Unable to launch {}", app.name)));
            }
        }
    }
    Ok(handles)
}
