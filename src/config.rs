/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    error::ExperimentError,
    recipes::PlanEntry,
    system::{AppKind, System},
};
use anyhow::Context;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

pub static EXAMPLE_CONFIG: &str = include_str!("templates/netexp.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub paths: Paths,
    pub network: Network,
    #[serde(rename(serialize = "server", deserialize = "server"))]
    pub servers: Vec<ServerHost>,
    pub observer: Option<Observer>,
    pub clients: Clients,
    #[serde(default)]
    pub cpus: Cpus,
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub binaries: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(
        default,
        rename(serialize = "experiment", deserialize = "experiment")
    )]
    pub experiments: Vec<PlanEntry>,
}
impl Config {
    /// Writes the example configuration to `path`. Refuses to overwrite an existing file.
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Unable to create {}", path.to_string_lossy()))?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config {}", path.to_string_lossy()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.servers.is_empty() {
            return Err(ExperimentError::precondition("at least one [[server]] is required").into());
        }
        if self.clients.cores == 0 {
            return Err(ExperimentError::precondition("clients.cores must be positive").into());
        }
        if let Some(dup) = self.servers.iter().map(|s| &s.name).duplicates().next() {
            return Err(ExperimentError::precondition(format!("server {} listed twice", dup)).into());
        }
        Ok(())
    }

    pub fn find_server(&self, host: &str) -> Option<&ServerHost> {
        self.servers.iter().find(|server| server.name == host)
    }

    pub fn is_server(&self, host: &str) -> bool {
        self.find_server(host).is_some()
    }

    /// Address of `node` inside the experiment subnet.
    pub fn ip(&self, node: u32) -> anyhow::Result<String> {
        if node == 0 || node >= 255 {
            return Err(ExperimentError::precondition(format!(
                "node {} is outside the {}.0/24 subnet",
                node, self.network.prefix
            ))
            .into());
        }
        Ok(format!("{}.{}", self.network.prefix, node))
    }

    pub fn gateway(&self) -> anyhow::Result<String> {
        self.ip(self.network.gateway_node)
    }

    /// The fixed kernel-stack address of a server host.
    pub fn linux_ip(&self, host: &str) -> anyhow::Result<&str> {
        self.find_server(host)
            .map(|server| server.linux_ip.as_str())
            .context(format!("{} is not a server host", host))
    }

    /// The out-of-band (management network) address of any host.
    pub fn oob_ip(&self, host: &str) -> anyhow::Result<&str> {
        self.clients
            .oob_ips
            .get(host)
            .map(|ip| ip.as_str())
            .or_else(|| self.find_server(host).map(|server| server.oob_ip.as_str()))
            .context(format!("No out-of-band address configured for {}", host))
    }

    pub fn usable_cpus(&self) -> Vec<usize> {
        if let Some(list) = &self.cpus.list {
            return list.clone();
        }
        if self.cpus.restrict {
            (0..16).step_by(2).chain((24..40).step_by(2)).collect()
        } else {
            (0..48).step_by(2).collect()
        }
    }

    pub fn usable_cpus_str(&self) -> String {
        self.usable_cpus().iter().join(",")
    }

    /// Path of `app` built for `system`. Explicit overrides win over the built-in table.
    pub fn binary(&self, app: AppKind, system: System) -> Option<String> {
        if let Some(path) = self
            .binaries
            .get(app.as_str())
            .and_then(|by_system| by_system.get(system.as_str()))
        {
            return Some(path.clone());
        }
        self.paths.default_binary(app, system)
    }

    /// The load generator replicated to every client host.
    pub fn client_binary(&self) -> String {
        self.paths.client_binary.clone().unwrap_or_else(|| {
            format!(
                "{}/apps/synthetic/target/release/synthetic",
                self.paths.shenango_dir
            )
        })
    }

    pub fn rstat_script(&self) -> String {
        self.paths
            .rstat_script
            .clone()
            .unwrap_or_else(|| format!("{}/scripts/rstat.go", self.paths.shenango_dir))
    }

    /// Hosts that receive artifacts and run remote drivers: clients first, then the observer.
    pub fn remote_hosts<'a>(&'a self, clients: impl Iterator<Item = &'a String>) -> Vec<String> {
        let mut hosts = clients.cloned().collect_vec();
        if let Some(observer) = &self.observer {
            if !hosts.contains(&observer.host) {
                hosts.push(observer.host.clone());
            }
        }
        hosts
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Paths {
    pub base_dir: String,
    pub shenango_dir: String,
    pub client_binary: Option<String>,
    pub rstat_script: Option<String>,
}
impl Paths {
    fn default_binary(&self, app: AppKind, system: System) -> Option<String> {
        let base = &self.base_dir;
        let sdir = &self.shenango_dir;
        let pthreads_swaptions = format!(
            "{}/parsec/pkgs/apps/swaptions/inst/amd64-linux.gcc-pthreads/bin/swaptions",
            base
        );
        let path = match (app, system) {
            (AppKind::Memcached, System::Linux) => format!("{}/memcached-linux/memcached", base),
            (AppKind::Memcached, System::Shenango) => format!("{}/memcached/memcached", base),
            (AppKind::Memcached, System::Arachne) => {
                format!("{}/memcached-arachne/memcached", base)
            }
            (AppKind::Memcached, System::Zygos) => format!("{}/memcached-ix/memcached", base),
            (AppKind::Gdnsd, System::Linux) => {
                format!("{}/gdnsd-stripped/build/sbin/gdnsd", base)
            }
            (AppKind::Gdnsd, System::Shenango) => {
                format!("{}/shenango-gdnsd/build/sbin/gdnsd", base)
            }
            (AppKind::Swaptions, System::Shenango) => format!(
                "{}/parsec/pkgs/apps/swaptions/inst/amd64-linux.gcc-shenango/bin/swaptions",
                base
            ),
            (AppKind::Swaptions, System::Linux | System::Arachne | System::LinuxFloating) => {
                pthreads_swaptions
            }
            (AppKind::Synthetic, System::Linux) => {
                format!("{}/apps/synthetic/target/release/synthetic", sdir)
            }
            (AppKind::Synthetic, System::Shenango) => {
                format!("{}/apps/synthetic/target/release/synthetic --config", sdir)
            }
            (AppKind::Synthetic, System::Arachne) => {
                format!("{}/bench/servers/spin-arachne", base)
            }
            (AppKind::Synthetic, System::Zygos) => format!("{}/bench/servers/spin-ix", base),
            (AppKind::Synthetic, System::LinuxFloating) => {
                format!("{}/bench/servers/spin-linux", base)
            }
            _ => return None,
        };
        Some(path)
    }

    pub fn iokerneld(&self, noht: bool) -> String {
        if noht {
            format!("{}/iokerneld-noht", self.shenango_dir)
        } else {
            format!("{}/iokerneld", self.shenango_dir)
        }
    }

    pub fn corearbiter(&self) -> String {
        format!(
            "{}/memcached-arachne/arachne-all/CoreArbiter/bin/coreArbiterServer",
            self.base_dir
        )
    }

    pub fn script(&self, name: &str) -> String {
        format!("{}/scripts/{}", self.shenango_dir, name)
    }

    pub fn ix_dataplane(&self) -> String {
        format!("{}/zygos/dp/ix", self.base_dir)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Network {
    pub prefix: String,
    pub netmask: String,
    pub gateway_node: u32,
    pub nic_pci: String,
    pub nic_ifname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerHost {
    pub name: String,
    pub mac: String,
    pub linux_ip: String,
    pub oob_ip: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Observer {
    pub host: String,
    pub ip: String,
    pub mac: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Clients {
    pub hosts: Vec<String>,
    pub cores: usize,
    #[serde(default)]
    pub oob_ips: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Cpus {
    #[serde(default = "default_true")]
    pub restrict: bool,
    pub list: Option<Vec<usize>>,
}
impl Default for Cpus {
    fn default() -> Self {
        Cpus {
            restrict: true,
            list: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTransport {
    /// ssh/scp to the named hosts.
    Ssh,
    /// Every "host" is a sandbox directory under `cluster.local_root` on this machine.
    Local,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub transport: RemoteTransport,
    pub local_root: PathBuf,
    pub clock_retries: usize,
    pub clock_backoff_ms: u64,
    pub settle_secs: u64,
    pub poll_interval_ms: u64,
    pub hostname: Option<String>,
}
impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterSettings {
            transport: RemoteTransport::Ssh,
            local_root: PathBuf::from(".netexp-hosts"),
            clock_retries: 3,
            clock_backoff_ms: 1000,
            settle_secs: 10,
            poll_interval_ms: 3000,
            hostname: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> anyhow::Result<Config> {
        Config::try_from_str(EXAMPLE_CONFIG)
    }

    #[test]
    fn can_load_example_config() -> anyhow::Result<()> {
        let cfg = example()?;
        assert_eq!(cfg.clients.hosts, vec!["pd3", "pd4"]);
        assert_eq!(cfg.clients.cores, 6);
        assert_eq!(cfg.cluster.transport, RemoteTransport::Ssh);
        assert_eq!(cfg.experiments.len(), 2);
        Ok(())
    }

    #[test]
    fn can_find_server_by_name() -> anyhow::Result<()> {
        let cfg = example()?;
        assert!(cfg.is_server("zig"));
        assert!(!cfg.is_server("pd3"));
        assert_eq!(cfg.linux_ip("zag")?, "192.168.18.8");
        assert!(cfg.linux_ip("pd3").is_err());
        Ok(())
    }

    #[test]
    fn oob_ips_cover_clients_and_servers() -> anyhow::Result<()> {
        let cfg = example()?;
        assert_eq!(cfg.oob_ip("pd4")?, "18.26.5.4");
        assert_eq!(cfg.oob_ip("zig")?, "18.26.4.39");
        assert!(cfg.oob_ip("nope").is_err());
        Ok(())
    }

    #[test]
    fn subnet_addresses_are_bounded() -> anyhow::Result<()> {
        let cfg = example()?;
        assert_eq!(cfg.ip(100)?, "192.168.18.100");
        assert_eq!(cfg.gateway()?, "192.168.18.1");
        assert!(cfg.ip(0).is_err());
        assert!(cfg.ip(255).is_err());
        Ok(())
    }

    #[test]
    fn restricted_cpus_skip_hyperthreads_and_second_socket_tail() -> anyhow::Result<()> {
        let cfg = example()?;
        assert_eq!(
            cfg.usable_cpus_str(),
            "0,2,4,6,8,10,12,14,24,26,28,30,32,34,36,38"
        );
        Ok(())
    }

    #[test]
    fn binary_overrides_win() -> anyhow::Result<()> {
        let mut cfg = example()?;
        assert_eq!(
            cfg.binary(AppKind::Synthetic, System::Shenango).as_deref(),
            Some("/home/bench/shenango/apps/synthetic/target/release/synthetic --config")
        );
        assert!(cfg.binary(AppKind::Gdnsd, System::Zygos).is_none());

        cfg.binaries.insert(
            "gdnsd".to_string(),
            BTreeMap::from([("zygos".to_string(), "/opt/gdnsd".to_string())]),
        );
        assert_eq!(
            cfg.binary(AppKind::Gdnsd, System::Zygos).as_deref(),
            Some("/opt/gdnsd")
        );
        Ok(())
    }

    #[test]
    fn local_transport_parses() -> anyhow::Result<()> {
        let conf = EXAMPLE_CONFIG.replace(
            "transport = \"ssh\"",
            "transport = \"local\"\nlocal_root = \"/tmp/hosts\"",
        );
        let cfg = Config::try_from_str(&conf)?;
        assert_eq!(cfg.cluster.transport, RemoteTransport::Local);
        assert_eq!(cfg.cluster.local_root, PathBuf::from("/tmp/hosts"));
        assert_eq!(cfg.cluster.poll_interval_ms, 3000);
        Ok(())
    }

    #[test]
    fn rejects_config_without_servers() {
        let conf = EXAMPLE_CONFIG
            .split("[[server]]")
            .next()
            .map(|head| format!("{}\n[clients]\nhosts = []\ncores = 6\n", head))
            .unwrap_or_default();
        assert!(Config::try_from_str(&conf).is_err());
    }
}
