/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Side-effect steps an instance can ask for immediately before or after it is spawned.

use crate::{
    error::ExperimentError,
    experiment::{Experiment, Instance},
    system::{AppKind, System},
    testbed::Testbed,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    /// Writes the gdnsd `config` file and links the zone files into the experiment directory.
    ConfigureDnsEnvironment,
    /// Staggers follower load generators behind the cohort leader.
    #[serde(rename = "sleep_5")]
    Sleep5,
}

impl Hook {
    pub async fn run(
        &self,
        instance: &dyn Instance,
        experiment: &Experiment,
        testbed: &Testbed,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            Hook::ConfigureDnsEnvironment => {
                configure_dns_environment(instance, experiment, testbed)
            }
            Hook::Sleep5 => sleep_5(instance, token).await,
        }
    }
}

/// Runs `hooks` in list order, stopping at the first failure.
pub async fn run_hooks(
    hooks: &[Hook],
    instance: &dyn Instance,
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    for hook in hooks {
        debug!("running hook {:?} for {}", hook, instance.name());
        hook.run(instance, experiment, testbed, token)
            .await
            .context(format!("Hook {:?} failed for {}", hook, instance.name()))?;
    }
    Ok(())
}

fn configure_dns_environment(
    instance: &dyn Instance,
    experiment: &Experiment,
    testbed: &Testbed,
) -> anyhow::Result<()> {
    // the bespoke runtime listens on the address from its own runtime config
    let contents = if experiment.system != System::Shenango {
        let port = instance
            .net()
            .port
            .context("DNS server needs a port on the kernel stack")?;
        format!(
            "options => {{listen => {{0.0.0.0:{} => {{udp_threads = {}}}}}}}",
            port,
            instance.resources().threads
        )
    } else {
        String::new()
    };
    fs::write(experiment.dir().join("config"), contents)?;

    let gdnsd = testbed
        .config
        .binary(AppKind::Gdnsd, System::Linux)
        .context("No gdnsd binary configured")?;
    let zones = Path::new(&gdnsd)
        .parent()
        .context("gdnsd binary path has no parent directory")?
        .join("../etc/gdnsd/zones/");
    testbed.run(&format!(
        "ln -s {} {}/",
        zones.to_string_lossy(),
        experiment.dir().to_string_lossy()
    ))?;

    Ok(())
}

async fn sleep_5(instance: &dyn Instance, token: &CancellationToken) -> anyhow::Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
        _ = token.cancelled() => {
            Err(ExperimentError::Interrupted(instance.name().to_string()).into())
        }
    }
}
