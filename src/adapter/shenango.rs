/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{config_file_name, SystemAdapter};
use crate::{
    environment,
    execution_modes::{
        daemons,
        process_control::{ProcessHandle, Readiness},
    },
    experiment::{Experiment, Instance},
    system::System,
    testbed::Testbed,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The userspace runtime. Load generators always run through this adapter, whatever the
/// system under test on the server.
#[derive(Debug)]
pub struct ShenangoAdapter;

#[async_trait]
impl SystemAdapter for ShenangoAdapter {
    fn system(&self) -> System {
        System::Shenango
    }

    fn render_config(
        &self,
        instance: &dyn Instance,
        experiment: &Experiment,
        testbed: &Testbed,
    ) -> anyhow::Result<Option<String>> {
        runtime_config(instance, experiment, testbed).map(Some)
    }

    fn launch_command(
        &self,
        instance: &dyn Instance,
        _experiment: &Experiment,
        _testbed: &Testbed,
        binary: &str,
    ) -> anyhow::Result<String> {
        let name = instance.name();
        Ok(format!(
            "numactl -N 0 -m 0 {} {} {} > {}.out 2> {}.err",
            binary,
            config_file_name(instance),
            self.render_args(instance)?,
            name,
            name
        ))
    }

    fn readiness(&self, _instance: &dyn Instance) -> Readiness {
        Readiness::survive(Duration::from_secs(3))
    }

    fn switch_environment(&self, testbed: &Testbed) -> anyhow::Result<()> {
        environment::switch_to_shenango(testbed)
    }

    async fn start_daemons(
        &self,
        experiment: &Experiment,
        testbed: &Testbed,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<ProcessHandle>> {
        Ok(vec![daemons::start_iokerneld(experiment, testbed, token).await?])
    }
}

/// `key value` lines read by the runtime at startup. Every peer the instance may talk to gets
/// a `static_arp` entry since the runtime does no address resolution of its own.
pub fn runtime_config(
    instance: &dyn Instance,
    experiment: &Experiment,
    testbed: &Testbed,
) -> anyhow::Result<String> {
    let cfg = &testbed.config;
    let net = instance.net();
    let res = instance.resources();

    let mut lines = vec![
        format!("host_addr {}", net.ip),
        format!("host_netmask {}", cfg.network.netmask),
        format!("host_gateway {}", cfg.gateway()?),
        format!("runtime_kthreads {}", res.threads),
        format!("runtime_guaranteed_kthreads {}", res.guaranteed),
        format!("runtime_spinning_kthreads {}", res.spin),
        format!("host_mac {}", net.mac),
    ];
    if res.guaranteed > 0 {
        lines.push("disable_watchdog true".to_string());
    }

    if experiment.system == System::Shenango {
        for app in experiment.apps.iter().filter(|app| app.net.ip != net.ip) {
            lines.push(static_arp(&app.net.ip, &app.net.mac));
        }
    } else {
        // kernel-stack servers answer on their fixed addresses
        for server in &cfg.servers {
            lines.push(static_arp(&server.linux_ip, &server.mac));
        }
    }
    for client in experiment.all_clients().filter(|c| c.net.ip != net.ip) {
        lines.push(static_arp(&client.net.ip, &client.net.mac));
    }
    if let Some(observer) = &cfg.observer {
        lines.push(static_arp(&observer.ip, &observer.mac));
    }

    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}

fn static_arp(ip: &str, mac: &str) -> String {
    format!("static_arp {} {}", ip, mac)
}
