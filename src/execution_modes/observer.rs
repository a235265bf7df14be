/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::process_control::{shutdown_processes, wait_for_all, ProcessHandle};
use crate::{experiment::Experiment, system::System, testbed::Testbed};
use std::{path::Path, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Polls the runtime statistics of the instance at `ip` once a second.
pub fn rstat_command(name: &str, ip: &str, script: &str) -> String {
    format!(
        "sudo arp -d {ip} || true; go run {script} {ip} 1 | ts %s > rstat.{name}.log",
        ip = ip,
        script = script,
        name = name
    )
}

/// Every instance of the experiment as `(name, ip)`, apps first.
pub fn observed_instances(experiment: &Experiment) -> Vec<(&str, &str)> {
    experiment
        .apps
        .iter()
        .map(|app| (app.name.as_str(), app.net.ip.as_str()))
        .chain(
            experiment
                .all_clients()
                .map(|client| (client.name.as_str(), client.net.ip.as_str())),
        )
        .collect()
}

/// Observer side of a run. Only the bespoke runtime exposes statistics, so experiments on
/// other systems are a no-op.
pub async fn run_observer(
    dir: &Path,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let mut experiment = Experiment::read_manifest(dir)?;
    experiment.name = dir.to_string_lossy().into_owned();
    if experiment.system != System::Shenango {
        info!("nothing to observe for {} experiments", experiment.system);
        return Ok(());
    }

    let script_path = testbed.config.rstat_script();
    let script = Path::new(&script_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(script_path.clone());

    let mut handles: Vec<ProcessHandle> = vec![];
    for (name, ip) in observed_instances(&experiment) {
        let spawned = ProcessHandle::spawn(
            &format!("rstat.{}", name),
            &rstat_command(name, ip, &script),
            Some(&experiment.dir()),
        );
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                shutdown_processes(&mut handles);
                return Err(err);
            }
        }
    }

    let interval = Duration::from_millis(testbed.config.cluster.poll_interval_ms);
    if wait_for_all(&mut handles, interval, token).await.is_none() {
        shutdown_processes(&mut handles);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing;

    #[test]
    fn rstat_logs_are_named_after_the_instance() {
        assert_eq!(
            rstat_command("synth", "192.168.18.100", "rstat.go"),
            "sudo arp -d 192.168.18.100 || true; go run rstat.go 192.168.18.100 1 | ts %s > rstat.synth.log"
        );
    }

    #[test]
    fn every_app_and_client_is_observed() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let exp = testing::synthetic(System::Shenango, &testbed)?;
        let observed = observed_instances(&exp);
        assert_eq!(observed.len(), exp.apps.len() + exp.all_clients().count());
        assert_eq!(observed[0].0, "synth");
        Ok(())
    }

    #[tokio::test]
    async fn other_systems_are_not_observed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut exp = testing::synthetic(System::Linux, &testing::testbed("zig")?)?;
        exp.name = tmp.path().to_string_lossy().into_owned();
        exp.write_manifest()?;

        let observer = testing::testbed("pd1")?;
        run_observer(tmp.path(), &observer, &CancellationToken::new()).await?;
        assert_eq!(std::fs::read_dir(tmp.path())?.count(), 1);
        Ok(())
    }
}
