/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{join_command, SystemAdapter};
use crate::{
    environment,
    error::ExperimentError,
    execution_modes::process_control::{ProcessHandle, Readiness},
    experiment::{Experiment, Instance},
    system::System,
    testbed::Testbed,
};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind};
use tracing::debug;

/// The kernel network stack. Serves both the pinned and the floating variant; they differ
/// only in which binaries the apps resolve to.
#[derive(Debug)]
pub struct LinuxAdapter {
    pub system: System,
}

impl SystemAdapter for LinuxAdapter {
    fn system(&self) -> System {
        self.system
    }

    fn render_config(
        &self,
        _instance: &dyn Instance,
        _experiment: &Experiment,
        _testbed: &Testbed,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn launch_command(
        &self,
        instance: &dyn Instance,
        _experiment: &Experiment,
        testbed: &Testbed,
        binary: &str,
    ) -> anyhow::Result<String> {
        require_host_address(instance, testbed)?;
        let cpu_bind = format!("-C {}", testbed.config.usable_cpus_str());
        let args = self.render_args(instance)?;
        let redirect = format!("> {}.out 2>&1", instance.name());
        Ok(join_command(&[
            "numactl -N 0 -m 0",
            &cpu_bind,
            idle_priority(instance),
            binary,
            &args,
            &redirect,
        ]))
    }

    fn readiness(&self, instance: &dyn Instance) -> Readiness {
        if instance.resources().nice < 0 {
            Readiness::survive(Duration::from_secs(2))
        } else {
            Readiness::immediate()
        }
    }

    fn switch_environment(&self, testbed: &Testbed) -> anyhow::Result<()> {
        environment::switch_to_linux(testbed)
    }

    /// `numactl` does not pass priorities on, so high priority apps get every task of the
    /// spawned children reniced.
    fn post_launch(
        &self,
        handle: &ProcessHandle,
        instance: &dyn Instance,
        testbed: &Testbed,
    ) -> anyhow::Result<()> {
        let nice = instance.resources().nice;
        if nice >= 0 {
            return Ok(());
        }
        let Some(pid) = handle.pid() else {
            return Ok(());
        };
        for child in child_pids(pid) {
            debug!("renicing {} (child of {}) to {}", child, pid, nice);
            testbed.run(&format!(
                "sudo renice -n {} -p $(ls /proc/{}/task)",
                nice, child
            ))?;
        }
        Ok(())
    }
}

/// Kernel-stack apps bind the host's own address, so the instance must carry it.
pub(super) fn require_host_address(
    instance: &dyn Instance,
    testbed: &Testbed,
) -> anyhow::Result<()> {
    let host_ip = testbed.config.linux_ip(&testbed.hostname)?;
    if instance.net().ip != host_ip {
        return Err(ExperimentError::precondition(format!(
            "{} is bound to {} but {} uses {}",
            instance.name(),
            instance.net().ip,
            testbed.hostname,
            host_ip
        ))
        .into());
    }
    Ok(())
}

/// Background work runs in the idle scheduling class.
pub(super) fn idle_priority(instance: &dyn Instance) -> &'static str {
    if instance.resources().nice >= 0 {
        "chrt --idle 0"
    } else {
        ""
    }
}

fn child_pids(parent: u32) -> Vec<u32> {
    let system = sysinfo::System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    let parent = Pid::from_u32(parent);
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.parent() == Some(parent))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}
