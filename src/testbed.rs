/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::Config,
    error::ExperimentError,
    shell::{LocalShell, Shell},
};
use anyhow::Context;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// The cluster configuration as seen from the host this process runs on.
#[derive(Clone)]
pub struct Testbed {
    pub config: Config,
    pub hostname: String,
    pub shell: Arc<dyn Shell>,
    config_path: Option<PathBuf>,
    driver_path: Option<PathBuf>,
}

impl Testbed {
    /// Resolves this host's short name (config override first) and remembers the running
    /// binary and config file so they can be replicated to remote hosts.
    pub fn new(config: Config, config_path: &Path) -> anyhow::Result<Self> {
        let hostname = match &config.cluster.hostname {
            Some(name) => name.clone(),
            None => short_hostname().context("Unable to determine this host's name")?,
        };
        let driver_path = std::env::current_exe().context("Unable to locate the netexp binary")?;

        Ok(Testbed {
            config,
            hostname,
            shell: Arc::new(LocalShell),
            config_path: Some(config_path.to_path_buf()),
            driver_path: Some(driver_path),
        })
    }

    pub fn with_shell(config: Config, hostname: &str, shell: Arc<dyn Shell>) -> Self {
        Testbed {
            config,
            hostname: hostname.to_string(),
            shell,
            config_path: None,
            driver_path: None,
        }
    }

    /// Server hosts are recognized by having a hardware address entry in the config.
    pub fn is_server(&self) -> bool {
        self.config.is_server(&self.hostname)
    }

    pub fn require_server(&self) -> anyhow::Result<()> {
        if self.is_server() {
            Ok(())
        } else {
            Err(ExperimentError::precondition(format!(
                "{} is not one of the configured server hosts",
                self.hostname
            ))
            .into())
        }
    }

    pub fn run(&self, command: &str) -> anyhow::Result<String> {
        self.shell.run(command)
    }

    /// Files every remote host needs to act as a driver: this binary and its config.
    pub fn driver_files(&self) -> Vec<String> {
        [&self.driver_path, &self.config_path]
            .into_iter()
            .flatten()
            .map(|path| path.to_string_lossy().into_owned())
            .collect()
    }

    pub fn driver_name(&self) -> String {
        file_name_or(&self.driver_path, "netexp")
    }

    pub fn config_name(&self) -> String {
        file_name_or(&self.config_path, "netexp.toml")
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// The shell command that re-runs this program on a remote host in `role` (`client` or
    /// `observer`) against the replicated experiment directory.
    pub fn remote_driver_command(&self, dir: &Path, role: &str, host: &str) -> String {
        let dir = dir.to_string_lossy();
        format!(
            "ulimit -S -c unlimited; {dir}/{driver} --config {dir}/{config} {role} {dir} > {dir}/driver.{host}.log 2>&1",
            dir = dir,
            driver = self.driver_name(),
            config = self.config_name(),
            role = role,
            host = host,
        )
    }
}

fn file_name_or(path: &Option<PathBuf>, fallback: &str) -> String {
    path.as_ref()
        .and_then(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

fn short_hostname() -> Option<String> {
    sysinfo::System::host_name().and_then(|name| name.split('.').next().map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::EXAMPLE_CONFIG, shell::testing::RecordingShell};

    fn testbed(host: &str) -> anyhow::Result<Testbed> {
        let cfg = Config::try_from_str(EXAMPLE_CONFIG)?;
        Ok(Testbed::with_shell(cfg, host, Arc::new(RecordingShell::default())))
    }

    #[test]
    fn servers_are_recognized_by_hostname() -> anyhow::Result<()> {
        assert!(testbed("zig")?.is_server());
        assert!(testbed("pd3")?.require_server().is_err());
        Ok(())
    }

    #[test]
    fn remote_driver_command_points_into_the_experiment_dir() -> anyhow::Result<()> {
        let cmd = testbed("zig")?.remote_driver_command(Path::new("run.1-shenango"), "client", "pd3");
        assert_eq!(
            cmd,
            "ulimit -S -c unlimited; run.1-shenango/netexp --config run.1-shenango/netexp.toml client run.1-shenango > run.1-shenango/driver.pd3.log 2>&1"
        );
        Ok(())
    }
}
