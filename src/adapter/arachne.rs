/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{
    join_command,
    linux::{idle_priority, require_host_address},
    SystemAdapter,
};
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
use tokio_util::sync::CancellationToken;

/// User-level threading on top of the kernel stack. Cores are handed out by the core
/// arbiter, so nothing is pinned here.
#[derive(Debug)]
pub struct ArachneAdapter;

#[async_trait]
impl SystemAdapter for ArachneAdapter {
    fn system(&self) -> System {
        System::Arachne
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
        let args = self.render_args(instance)?;
        let redirect = format!("> {}.out 2>&1", instance.name());
        Ok(join_command(&[
            "numactl -N 0 -m 0",
            idle_priority(instance),
            binary,
            &args,
            &redirect,
        ]))
    }

    fn readiness(&self, _instance: &dyn Instance) -> Readiness {
        Readiness::immediate()
    }

    fn switch_environment(&self, testbed: &Testbed) -> anyhow::Result<()> {
        environment::switch_to_linux(testbed)
    }

    async fn start_daemons(
        &self,
        experiment: &Experiment,
        testbed: &Testbed,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<ProcessHandle>> {
        Ok(vec![daemons::start_corearbiter(experiment, testbed, token).await?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing;

    #[test]
    fn command_is_not_pinned() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let exp = testing::synthetic(System::Arachne, &testbed)?;
        let server = &exp.apps[0];

        let cmd = ArachneAdapter.launch_command(server, &exp, &testbed, "/bin/spin-arachne")?;
        assert!(cmd.starts_with("numactl -N 0 -m 0 /bin/spin-arachne --minNumCores 2 --maxNumCores 4"));
        assert!(!cmd.contains(" -C "));
        assert!(cmd.ends_with("> synth.out 2>&1"));
        Ok(())
    }
}
