/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod arachne;
pub mod linux;
pub mod shenango;
pub mod zygos;

use crate::{
    error::ExperimentError,
    execution_modes::process_control::{ProcessHandle, Readiness},
    experiment::{Experiment, Instance},
    system::System,
    template,
    testbed::Testbed,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Everything that differs between the systems under test. Call sites dispatch through
/// `adapter_for` instead of comparing system names.
#[async_trait]
pub trait SystemAdapter: Send + Sync {
    fn system(&self) -> System;

    /// The runtime config written to `<experiment>/<name>.config`, if this system uses one.
    fn render_config(
        &self,
        instance: &dyn Instance,
        experiment: &Experiment,
        testbed: &Testbed,
    ) -> anyhow::Result<Option<String>>;

    fn render_args(&self, instance: &dyn Instance) -> anyhow::Result<String> {
        template::render(instance.args_template(), &instance.template_fields()?)
    }

    /// The full shell command, run from the experiment directory, including pinning,
    /// priority and output redirection.
    fn launch_command(
        &self,
        instance: &dyn Instance,
        experiment: &Experiment,
        testbed: &Testbed,
        binary: &str,
    ) -> anyhow::Result<String>;

    fn readiness(&self, instance: &dyn Instance) -> Readiness;

    fn switch_environment(&self, testbed: &Testbed) -> anyhow::Result<()>;

    /// Daemons that must be alive before any application of this system starts.
    async fn start_daemons(
        &self,
        _experiment: &Experiment,
        _testbed: &Testbed,
        _token: &CancellationToken,
    ) -> anyhow::Result<Vec<ProcessHandle>> {
        Ok(vec![])
    }

    fn post_launch(
        &self,
        _handle: &ProcessHandle,
        _instance: &dyn Instance,
        _testbed: &Testbed,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

static SHENANGO: shenango::ShenangoAdapter = shenango::ShenangoAdapter;
static LINUX: linux::LinuxAdapter = linux::LinuxAdapter {
    system: System::Linux,
};
static LINUX_FLOATING: linux::LinuxAdapter = linux::LinuxAdapter {
    system: System::LinuxFloating,
};
static ARACHNE: arachne::ArachneAdapter = arachne::ArachneAdapter;
static ZYGOS: zygos::ZygosAdapter = zygos::ZygosAdapter;

pub fn adapter_for(system: System) -> &'static dyn SystemAdapter {
    match system {
        System::Shenango => &SHENANGO,
        System::Linux => &LINUX,
        System::LinuxFloating => &LINUX_FLOATING,
        System::Arachne => &ARACHNE,
        System::Zygos => &ZYGOS,
    }
}

pub fn config_file_name(instance: &dyn Instance) -> String {
    format!("{}.config", instance.name())
}

/// Explicit per-instance binary, or the default for this app on `system`.
pub fn resolve_binary(
    instance: &dyn Instance,
    system: System,
    testbed: &Testbed,
) -> anyhow::Result<String> {
    match instance.binary_override() {
        Some(binary) => Ok(binary.to_string()),
        None => testbed.config.binary(instance.app(), system).ok_or_else(|| {
            ExperimentError::precondition(format!(
                "no {} binary is known for {}",
                instance.app(),
                system
            ))
            .into()
        }),
    }
}

/// The program part of `binary` (which may carry flags) must exist and be executable.
/// Relative paths are resolved against `cwd`.
pub fn check_executable(binary: &str, cwd: &Path) -> anyhow::Result<PathBuf> {
    let program = shlex::split(binary)
        .and_then(|words| words.into_iter().next())
        .ok_or_else(|| ExperimentError::precondition(format!("empty binary \"{}\"", binary)))?;
    let path = Path::new(&program);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };

    let metadata = std::fs::metadata(&path).map_err(|_| {
        ExperimentError::precondition(format!("{} does not exist", path.to_string_lossy()))
    })?;
    if !metadata.is_file() || !is_executable(&metadata) {
        return Err(ExperimentError::precondition(format!(
            "{} is not executable",
            path.to_string_lossy()
        ))
        .into());
    }
    Ok(path)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// Joins non-empty command fragments with single spaces.
pub(crate) fn join_command(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::{
        assembly,
        config::{Config, EXAMPLE_CONFIG},
        experiment::{Experiment, Transport},
        shell::testing::RecordingShell,
        system::System,
        testbed::Testbed,
    };
    use std::sync::Arc;

    pub fn testbed(host: &str) -> anyhow::Result<Testbed> {
        let cfg = Config::try_from_str(EXAMPLE_CONFIG)?;
        Ok(Testbed::with_shell(cfg, host, Arc::new(RecordingShell::default())))
    }

    /// A synthetic server plus one client per client host, finalized.
    pub fn synthetic(system: System, testbed: &Testbed) -> anyhow::Result<Experiment> {
        let mut exp = Experiment::new(system, &testbed.hostname, &[]);
        let server = assembly::new_synthetic_server(
            4,
            &mut exp,
            testbed,
            assembly::SyntheticOptions {
                transport: Transport::Tcp,
                ..Default::default()
            },
        )?;
        let hosts = testbed.config.clients.hosts.len();
        assembly::new_measurement_instances(
            hosts,
            &server,
            1.0,
            &mut exp,
            testbed,
            assembly::MeasurementOptions::default(),
        )?;
        assembly::finalize_measurement_cohort(&mut exp, testbed, 10, 10)?;
        Ok(exp)
    }
}
