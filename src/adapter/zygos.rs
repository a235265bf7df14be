/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{config_file_name, join_command, SystemAdapter};
use crate::{
    environment,
    error::ExperimentError,
    execution_modes::process_control::Readiness,
    experiment::{Experiment, Instance},
    system::System,
    testbed::Testbed,
};
use anyhow::Context;
use itertools::Itertools;
use std::{path::Path, time::Duration};

const BATCH: usize = 64;
const LOADER_PATH: &str = "/lib64/ld-linux-x86-64.so.2";

/// The alternate kernel-bypass stack. Apps are started through the `ix` dataplane, which
/// reads a `key="value"` config.
#[derive(Debug)]
pub struct ZygosAdapter;

impl SystemAdapter for ZygosAdapter {
    fn system(&self) -> System {
        System::Zygos
    }

    fn render_config(
        &self,
        instance: &dyn Instance,
        experiment: &Experiment,
        testbed: &Testbed,
    ) -> anyhow::Result<Option<String>> {
        // the cpu layout below is that of the server machines
        testbed.require_server()?;

        let net = instance.net();
        let port = net.port.ok_or_else(|| {
            ExperimentError::precondition(format!("{} has no port", instance.name()))
        })?;
        let cpus = dataplane_cpus(instance.resources().threads, experiment.noht);
        let lines = [
            format!("host_addr=\"{}/24\"", net.ip),
            format!("gateway_addr=\"{}\"", testbed.config.gateway()?),
            format!("port={}", port),
            format!("devices=\"{}\"", testbed.config.network.nic_pci),
            format!("cpu=[{}]", cpus.iter().join(", ")),
            format!("batch={}", BATCH),
            format!("loader_path=\"{}\"", LOADER_PATH),
        ];

        let mut text = lines.join("\n");
        text.push('\n');
        Ok(Some(text))
    }

    fn launch_command(
        &self,
        instance: &dyn Instance,
        experiment: &Experiment,
        testbed: &Testbed,
        binary: &str,
    ) -> anyhow::Result<String> {
        let prio = match instance.resources().nice {
            nice if nice >= 0 => format!("nice -n {}", nice),
            _ => String::new(),
        };
        let config = absolute(&experiment.dir().join(config_file_name(instance)))?;
        let dataplane = format!(
            "{} -c {} --",
            testbed.config.paths.ix_dataplane(),
            config.to_string_lossy()
        );
        let args = self.render_args(instance)?;
        let redirect = format!("> {}.out 2>&1", instance.name());
        Ok(join_command(&[
            "sudo numactl -N 0 -m 0",
            &prio,
            &dataplane,
            binary,
            &args,
            &redirect,
        ]))
    }

    fn readiness(&self, _instance: &dyn Instance) -> Readiness {
        Readiness::survive(Duration::from_secs(20))
    }

    fn switch_environment(&self, testbed: &Testbed) -> anyhow::Result<()> {
        environment::switch_to_zygos(testbed)
    }
}

/// First `threads` cores of the dataplane layout, sorted. Without hyperthreads only the even
/// cores of the first socket are used, otherwise each core comes with its sibling.
pub fn dataplane_cpus(threads: usize, noht: bool) -> Vec<usize> {
    let layout: Vec<usize> = if noht {
        (0..24).step_by(2).collect()
    } else {
        (0..24)
            .step_by(2)
            .zip((24..48).step_by(2))
            .flat_map(|(core, sibling)| [core, sibling])
            .collect()
    };
    layout.into_iter().take(threads).sorted().collect()
}

fn absolute(path: &Path) -> anyhow::Result<std::path::PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Unable to resolve the working directory")?
        .join(path))
}
