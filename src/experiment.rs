/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    error::ExperimentError,
    hooks::Hook,
    system::{AppKind, System},
    template,
};
use anyhow::Context;
use chrono::Local;
use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const MANIFEST_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// Where an instance can be reached. Clients and background jobs have no port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetIdentity {
    pub ip: String,
    pub port: Option<u16>,
    pub mac: String,
}

/// Kernel threads the runtime may use, how many of them are guaranteed and how many spin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub threads: usize,
    pub guaranteed: usize,
    pub spin: usize,
    pub nice: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Background,
    /// A load generator running on the server itself (no client hosts).
    LocalLoad,
}

/// Anything the orchestrator can launch. Implemented by server-side apps and clients.
pub trait Instance {
    fn name(&self) -> &str;
    fn app(&self) -> AppKind;
    fn net(&self) -> &NetIdentity;
    fn resources(&self) -> &Resources;
    fn args_template(&self) -> &str;
    fn binary_override(&self) -> Option<&str>;
    fn before(&self) -> &[Hook];
    fn after(&self) -> &[Hook];

    /// Every field of the instance, flattened to strings, for argument templates.
    fn template_fields(&self) -> anyhow::Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInstance {
    pub name: String,
    pub role: Role,
    pub app: AppKind,
    #[serde(flatten)]
    pub net: NetIdentity,
    #[serde(flatten)]
    pub resources: Resources,
    pub protocol: Option<String>,
    pub transport: Option<Transport>,
    pub args: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<Hook>,
    /// App specific template values (`meml`, `fakework`, `stype`, ...).
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl AppInstance {
    pub fn param(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

impl Instance for AppInstance {
    fn name(&self) -> &str {
        &self.name
    }
    fn app(&self) -> AppKind {
        self.app
    }
    fn net(&self) -> &NetIdentity {
        &self.net
    }
    fn resources(&self) -> &Resources {
        &self.resources
    }
    fn args_template(&self) -> &str {
        &self.args
    }
    fn binary_override(&self) -> Option<&str> {
        self.binary.as_deref()
    }
    fn before(&self) -> &[Hook] {
        &self.before
    }
    fn after(&self) -> &[Hook] {
        &self.after
    }
    fn template_fields(&self) -> anyhow::Result<BTreeMap<String, String>> {
        template::fields_of(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInstance {
    pub name: String,
    pub host: String,
    pub app: AppKind,
    #[serde(flatten)]
    pub net: NetIdentity,
    /// Assigned when the cohort is finalized.
    #[serde(flatten)]
    pub resources: Resources,
    pub binary: String,
    pub serverip: String,
    pub serverport: Option<u16>,
    pub protocol: String,
    pub transport: Transport,
    pub output: String,
    pub mpps: f64,
    pub start_mpps: f64,
    pub distribution: String,
    pub mean: u64,
    pub client_threads: usize,
    pub warmup: String,
    pub args: String,
    #[serde(default)]
    pub runtime: u64,
    #[serde(default)]
    pub samples: usize,
    #[serde(default)]
    pub npeers: usize,
    /// Out-of-band address of the cohort leader, or the leader's own host name.
    #[serde(default)]
    pub leader: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<Hook>,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl Instance for ClientInstance {
    fn name(&self) -> &str {
        &self.name
    }
    fn app(&self) -> AppKind {
        self.app
    }
    fn net(&self) -> &NetIdentity {
        &self.net
    }
    fn resources(&self) -> &Resources {
        &self.resources
    }
    fn args_template(&self) -> &str {
        &self.args
    }
    fn binary_override(&self) -> Option<&str> {
        Some(&self.binary)
    }
    fn before(&self) -> &[Hook] {
        &self.before
    }
    fn after(&self) -> &[Hook] {
        &[]
    }
    fn template_fields(&self) -> anyhow::Result<BTreeMap<String, String>> {
        template::fields_of(self)
    }
}

/// The unit of work. Written to `<name>/config.json` before anything runs and read back
/// verbatim by the remote drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub system: System,
    pub server_hostname: String,
    pub apps: Vec<AppInstance>,
    pub clients: BTreeMap<String, Vec<ClientInstance>>,
    pub client_files: Vec<String>,
    pub nextip: u32,
    pub nextport: u16,
    #[serde(default)]
    pub next_client_assign: usize,
    #[serde(default)]
    pub noht: bool,
    #[serde(default)]
    pub transport: Option<Transport>,
}

impl Experiment {
    pub fn new(system: System, server_hostname: &str, driver_files: &[String]) -> Self {
        let mut rng = rand::thread_rng();
        Experiment {
            name: format!(
                "run.{}-{}",
                Local::now().format("%Y%m%d%H%M%S"),
                system.as_str()
            ),
            system,
            server_hostname: server_hostname.to_string(),
            apps: vec![],
            clients: BTreeMap::new(),
            client_files: driver_files.to_vec(),
            nextip: 100,
            nextport: 5000 + rng.gen_range(0..=255),
            next_client_assign: 0,
            noht: false,
            transport: None,
        }
    }

    /// Working directory of the experiment, relative to where the driver runs.
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(&self.name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir().join(MANIFEST_FILE)
    }

    pub fn add_client_file(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.client_files.contains(&path) {
            self.client_files.push(path);
        }
    }

    pub fn app_mut(&mut self, name: &str) -> Option<&mut AppInstance> {
        self.apps.iter_mut().find(|app| app.name == name)
    }

    pub fn all_clients(&self) -> impl Iterator<Item = &ClientInstance> {
        self.clients.values().flatten()
    }

    pub fn client_hosts(&self) -> impl Iterator<Item = &String> {
        self.clients.keys()
    }

    /// App names key config and log files, so they must be unique.
    pub fn check_unique_names(&self) -> anyhow::Result<()> {
        let names = self
            .apps
            .iter()
            .map(|app| app.name.as_str())
            .chain(self.all_clients().map(|client| client.name.as_str()));
        if let Some(dup) = names.duplicates().next() {
            return Err(ExperimentError::DuplicateName(dup.to_string()).into());
        }
        Ok(())
    }

    pub fn write_manifest(&self) -> anyhow::Result<PathBuf> {
        let path = self.manifest_path();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).context(format!(
            "Unable to write manifest {}",
            path.to_string_lossy()
        ))?;
        Ok(path)
    }

    /// Loads a manifest from `path`, which is either the manifest itself or an experiment
    /// directory containing one.
    pub fn read_manifest(path: &Path) -> anyhow::Result<Experiment> {
        if !path.exists() {
            return Err(ExperimentError::precondition(format!(
                "{} does not exist",
                path.to_string_lossy()
            ))
            .into());
        }
        let manifest = if path.is_dir() {
            path.join(MANIFEST_FILE)
        } else {
            path.to_path_buf()
        };
        let json = fs::read_to_string(&manifest).context(format!(
            "Unable to read manifest {}",
            manifest.to_string_lossy()
        ))?;
        serde_json::from_str(&json).context("Malformed experiment manifest")
    }
}
