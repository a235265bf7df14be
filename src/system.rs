/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// The networking stack under test. Selects the adapter, the environment switch and the
/// per-system argument quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum System {
    Linux,
    Shenango,
    Arachne,
    Zygos,
    LinuxFloating,
}

impl System {
    pub const ALL: [System; 5] = [
        System::Linux,
        System::Shenango,
        System::Arachne,
        System::Zygos,
        System::LinuxFloating,
    ];

    /// Name used in manifests, experiment names and binary tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            System::Linux => "linux",
            System::Shenango => "shenango",
            System::Arachne => "arachne",
            System::Zygos => "zygos",
            System::LinuxFloating => "linux-floating",
        }
    }

    /// Only the bespoke runtime gets a private address per instance.
    pub fn uses_synthetic_addresses(&self) -> bool {
        matches!(self, System::Shenango)
    }

    /// Which flavour of the synthetic server implementation runs on this system.
    pub fn implementation(&self) -> Implementation {
        match self {
            System::Shenango | System::Linux => Implementation::Rust,
            System::Arachne | System::Zygos | System::LinuxFloating => Implementation::Cpp,
        }
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for System {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        System::ALL
            .into_iter()
            .find(|sys| sys.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown system {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Implementation {
    Rust,
    Cpp,
}

/// The external program an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Memcached,
    Gdnsd,
    Synthetic,
    Swaptions,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::Memcached => "memcached",
            AppKind::Gdnsd => "gdnsd",
            AppKind::Synthetic => "synthetic",
            AppKind::Swaptions => "swaptions",
        }
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mean service time (in fake-work iterations) that yields `target_us` microseconds of work
/// for the default `stridedmem:1024:7` fake-work descriptor.
pub fn mean_service_time(target_us: f64, system: System, noht: bool) -> u64 {
    let per_us = match (system.implementation(), noht) {
        (Implementation::Rust, true) => 83.89,
        (Implementation::Rust, false) => 59.37,
        (Implementation::Cpp, true) => 78.0,
        (Implementation::Cpp, false) => 65.0,
    };
    (target_us * per_us) as u64
}
