/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Per-experiment address, port and MAC allocation. All counters live on the `Experiment`, so
//! two experiments assembled in the same process never interfere.

use crate::{config::Config, error::ExperimentError, experiment::Experiment};
use itertools::Itertools;
use rand::Rng;

/// Returns a fresh subnet address when the experiment runs the bespoke runtime or when the
/// caller asks for a synthetic identity (clients of every system). Otherwise every instance
/// shares the server's kernel-stack address.
pub fn allocate_ip(
    experiment: &mut Experiment,
    config: &Config,
    synthetic: bool,
) -> anyhow::Result<String> {
    if experiment.system.uses_synthetic_addresses() || synthetic {
        let ip = config.ip(experiment.nextip)?;
        experiment.nextip += 1;
        return Ok(ip);
    }

    config
        .linux_ip(&experiment.server_hostname)
        .map(|ip| ip.to_string())
}

/// Next unused port. The base is randomized when the experiment is created.
pub fn allocate_port(experiment: &mut Experiment) -> anyhow::Result<u16> {
    let port = experiment.nextport;
    experiment.nextport = port.checked_add(1).ok_or_else(|| {
        ExperimentError::precondition(format!("{} ran out of ports", experiment.name))
    })?;
    Ok(port)
}

/// A locally administered unicast MAC address.
pub fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    std::iter::once("02".to_string())
        .chain((0..5).map(|_| format!("{:02x}", rng.gen::<u8>())))
        .join(":")
}
