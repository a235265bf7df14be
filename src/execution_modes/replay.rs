/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::server;
use crate::{cluster::Cluster, experiment::Experiment, testbed::Testbed};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Loads a captured experiment for a second run. Only the recorded driver files are swapped
/// for the ones of this invocation; everything else is kept as it was.
pub fn prepare_replay(path: &Path, testbed: &Testbed) -> anyhow::Result<Experiment> {
    testbed.require_server()?;
    let mut experiment = Experiment::read_manifest(path)?;

    let driver = testbed.driver_name();
    let config = testbed.config_name();
    experiment.client_files.retain(|file| {
        let name = Path::new(file)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        name.as_deref() != Some(driver.as_str()) && name.as_deref() != Some(config.as_str())
    });
    for file in testbed.driver_files() {
        experiment.add_client_file(file);
    }

    experiment.name.push_str("-replay");
    Ok(experiment)
}

pub async fn replay(
    path: &Path,
    testbed: &Testbed,
    cluster: &Cluster,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let experiment = prepare_replay(path, testbed)?;
    server::execute(&experiment, testbed, cluster, token).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter::testing, experiment::MANIFEST_FILE, system::System};

    #[test]
    fn replay_swaps_driver_files_and_renames() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let testbed = testing::testbed("zig")?;
        let mut exp = testing::synthetic(System::Shenango, &testbed)?;
        exp.client_files = vec![
            "/old/place/netexp".to_string(),
            "/old/place/netexp.toml".to_string(),
            "/home/bench/synthetic".to_string(),
        ];
        std::fs::write(tmp.path().join(MANIFEST_FILE), serde_json::to_string(&exp)?)?;

        let replayed = prepare_replay(tmp.path(), &testbed)?;
        assert_eq!(replayed.name, format!("{}-replay", exp.name));
        assert_eq!(replayed.client_files, vec!["/home/bench/synthetic".to_string()]);
        assert_eq!(replayed.apps, exp.apps);
        assert_eq!(replayed.clients, exp.clients);
        Ok(())
    }

    #[test]
    fn replay_runs_on_the_server_only() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(prepare_replay(tmp.path(), &testing::testbed("pd3")?).is_err());
        Ok(())
    }
}
