/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{
    daemons,
    launcher::launch_apps,
    process_control::{shutdown_processes, wait_for_first_exit, ProcessHandle},
};
use crate::{
    adapter::adapter_for,
    cluster::{collect_clients, fan_out, setup_clients, Cluster, FailurePolicy},
    error::ExperimentError,
    experiment::Experiment,
    lifecycle::CleanupGuard,
    recipes::PlanEntry,
    testbed::Testbed,
};
use anyhow::{anyhow, Context};
use chrono::Utc;
use colored::*;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates the experiment directory and fills it with everything needed to understand or
/// replay the run later: this binary, its config, the manifest and the state of the runtime
/// sources.
pub fn prepare_experiment_dir(experiment: &Experiment, testbed: &Testbed) -> anyhow::Result<()> {
    let dir = experiment.dir();
    fs::create_dir_all(&dir).context(format!(
        "Unable to create experiment directory {}",
        dir.to_string_lossy()
    ))?;

    for file in testbed.driver_files() {
        let source = Path::new(&file);
        if let Some(name) = source.file_name() {
            fs::copy(source, dir.join(name)).context(format!("Unable to copy {}", file))?;
        }
    }
    experiment.write_manifest()?;

    testbed.shell.run_best_effort(&format!(
        "(cd {}; git status; git diff) > {}/gitstatus.{}.log",
        testbed.config.paths.shenango_dir,
        dir.to_string_lossy(),
        testbed.hostname
    ));
    Ok(())
}

/// Brings the server side of `experiment` up: monitors, network environment, runtime daemons
/// and finally the apps. Returns every process started, apps last.
pub async fn go_server(
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<Vec<ProcessHandle>> {
    testbed.require_server()?;
    prepare_experiment_dir(experiment, testbed)?;

    let mut handles = vec![];
    let started = start_server_side(experiment, testbed, token, &mut handles).await;
    if let Err(err) = started {
        shutdown_processes(&mut handles);
        return Err(err);
    }
    Ok(handles)
}

async fn start_server_side(
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
    handles: &mut Vec<ProcessHandle>,
) -> anyhow::Result<()> {
    handles.push(daemons::start_mpstat(experiment, testbed, token).await?);
    handles.push(daemons::start_cstate(experiment, testbed, token).await?);

    let adapter = adapter_for(experiment.system);
    adapter.switch_environment(testbed)?;
    handles.extend(adapter.start_daemons(experiment, testbed, token).await?);

    handles.extend(launch_apps(experiment, testbed, token).await?);
    Ok(())
}

/// Runs an experiment with load generators on the client hosts. Artifacts are pulled back and
/// every host is cleaned up whether or not the run succeeded.
pub async fn execute_experiment(
    experiment: &Experiment,
    testbed: &Testbed,
    cluster: &Cluster,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let guard = CleanupGuard::new(testbed);
    let handles = go_server(experiment, testbed, token).await?;
    finish_with_clients(experiment, testbed, cluster, token, handles, guard).await
}

/// Everything after the server side is up: replicate, run the clients, then collect their
/// artifacts, stop the observer and the server's processes and clean up. The last steps run
/// in that order whatever the clients did, and the clients' failure is returned afterwards.
pub async fn finish_with_clients(
    experiment: &Experiment,
    testbed: &Testbed,
    cluster: &Cluster,
    token: &CancellationToken,
    mut handles: Vec<ProcessHandle>,
    guard: CleanupGuard,
) -> anyhow::Result<()> {
    let mut observer = None;
    let result = run_clients(experiment, testbed, cluster, token, &mut observer).await;
    if let Err(err) = &result {
        warn!("{} failed: {:#}", experiment.name, err);
    }

    collect_clients(experiment, testbed, cluster).await;
    if let Some(child) = observer.as_mut() {
        stop_observer(child).await;
    }
    shutdown_processes(&mut handles);
    guard.run();

    result
}

async fn run_clients(
    experiment: &Experiment,
    testbed: &Testbed,
    cluster: &Cluster,
    token: &CancellationToken,
    observer: &mut Option<Child>,
) -> anyhow::Result<()> {
    setup_clients(experiment, testbed, cluster, token).await?;

    let settle = Duration::from_secs(testbed.config.cluster.settle_secs);
    debug!("letting the server settle for {:?}", settle);
    tokio::select! {
        _ = tokio::time::sleep(settle) => {}
        _ = token.cancelled() => return Err(anyhow!("{} was interrupted", experiment.name)),
    }

    let dir = PathBuf::from(cluster.remote_dir(&experiment.name));
    if let Some(host) = testbed.config.observer.as_ref().map(|o| o.host.clone()) {
        let command =
            cluster.remote_command(&host, &testbed.remote_driver_command(&dir, "observer", &host));
        debug!("[{}] $ {}", host, command);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .kill_on_drop(true)
            .spawn()
            .context(format!("Failed to start the observer on {}", host))?;
        *observer = Some(child);
    }

    let hosts: Vec<String> = experiment.client_hosts().cloned().collect();
    println!("> running clients on {}", hosts.join(", ").green());
    fan_out(&hosts, FailurePolicy::HaltOnFailure, token, |host| {
        cluster.remote_command(host, &testbed.remote_driver_command(&dir, "client", host))
    })
    .await
    .context("A client host failed")?;
    println!("\t{}", "✓".green());

    Ok(())
}

async fn stop_observer(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!("observer already gone: {}", err);
    }
    if let Err(err) = child.wait().await {
        debug!("waiting for the observer failed: {}", err);
    }
}

/// Runs an experiment that generates its own load on the server. The run is over as soon as
/// any of its processes exits.
pub async fn execute_experiment_noclients(
    experiment: &Experiment,
    testbed: &Testbed,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    if experiment.clients.values().any(|clients| !clients.is_empty()) {
        return Err(ExperimentError::precondition(format!(
            "{} has client instances",
            experiment.name
        ))
        .into());
    }

    let guard = CleanupGuard::new(testbed);
    let mut handles = go_server(experiment, testbed, token).await?;

    let interval = Duration::from_millis(testbed.config.cluster.poll_interval_ms);
    match wait_for_first_exit(&mut handles, interval, token).await {
        Some(name) => info!("{} exited, ending {}", name, experiment.name),
        None => info!("{} was interrupted", experiment.name),
    }

    shutdown_processes(&mut handles);
    guard.run();
    Ok(())
}

/// Picks the right runner for the experiment's shape.
pub async fn execute(
    experiment: &Experiment,
    testbed: &Testbed,
    cluster: &Cluster,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    println!("> running experiment {}", experiment.name.green());
    if experiment.all_clients().next().is_none() {
        execute_experiment_noclients(experiment, testbed, token).await
    } else {
        execute_experiment(experiment, testbed, cluster, token).await
    }
}

#[derive(Debug, Clone)]
struct Outcome {
    name: String,
    recipe: &'static str,
    duration: Option<f64>,
    status: ColoredString,
}

/// Assembles and executes every entry of the plan in order, stopping at the first failure.
/// With `dry_run` the experiments are only assembled and described.
pub async fn run_plan(
    plan: &[PlanEntry],
    testbed: &Testbed,
    cluster: &Cluster,
    token: &CancellationToken,
    dry_run: bool,
) -> anyhow::Result<()> {
    testbed.require_server()?;
    if plan.is_empty() {
        warn!("no [[experiment]] entries configured, nothing to do");
        return Ok(());
    }

    let mut outcomes = vec![];
    let mut failure = None;
    'plan: for entry in plan {
        let experiments = match entry.build(testbed) {
            Ok(experiments) => experiments,
            Err(err) => {
                failure = Some(err.context(format!("Unable to assemble {}", entry.recipe.label())));
                break;
            }
        };

        for experiment in experiments {
            if dry_run {
                describe(&experiment)?;
                outcomes.push(Outcome {
                    name: experiment.name.clone(),
                    recipe: entry.recipe.label(),
                    duration: None,
                    status: "assembled".bright_black(),
                });
                continue;
            }
            if token.is_cancelled() {
                failure = Some(anyhow!("interrupted before {}", experiment.name));
                break 'plan;
            }

            let start = Utc::now().timestamp_millis();
            let result = execute(&experiment, testbed, cluster, token).await;
            let duration = (Utc::now().timestamp_millis() - start) as f64 / 1000.0;
            outcomes.push(Outcome {
                name: experiment.name.clone(),
                recipe: entry.recipe.label(),
                duration: Some(duration),
                status: if result.is_ok() { "ok".green() } else { "failed".red() },
            });
            if let Err(err) = result {
                failure = Some(err.context(format!("Experiment {} failed", experiment.name)));
                break 'plan;
            }
        }
    }

    print_summary(&outcomes);
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn describe(experiment: &Experiment) -> anyhow::Result<()> {
    println!("> assembled {}", experiment.name.green());
    for app in &experiment.apps {
        println!(
            "\t{} {} threads={} {}:{}",
            app.name,
            app.app,
            app.resources.threads,
            app.net.ip,
            app.net.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    for (host, clients) in &experiment.clients {
        println!("\t{} x{} on {}", "client".bright_black(), clients.len(), host);
    }
    debug!("{}", serde_json::to_string_pretty(experiment)?);
    Ok(())
}

fn print_summary(outcomes: &[Outcome]) {
    if outcomes.is_empty() {
        return;
    }
    println!("\n{}", " Summary ".reversed().green());

    let mut rows = rows![row![
        TableCell::builder("Experiment".bold()).build(),
        TableCell::builder("Recipe".bold()).build(),
        TableCell::builder("Duration (s)".bold()).build(),
        TableCell::builder("Status".bold()).build()
    ]];
    for outcome in outcomes {
        rows.push(row![
            TableCell::new(&outcome.name),
            TableCell::new(outcome.recipe),
            TableCell::new(
                outcome
                    .duration
                    .map(|secs| format!("{:.1}s", secs))
                    .unwrap_or("--".to_string())
            ),
            TableCell::new(&outcome.status)
        ]);
    }

    let table = Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build();
    println!("{}", table.render());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter::testing, system::System};

    #[tokio::test]
    async fn only_servers_run_experiments() -> anyhow::Result<()> {
        let testbed = testing::testbed("pd3")?;
        let exp = Experiment::new(System::Shenango, "zig", &[]);
        let err = go_server(&exp, &testbed, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::Precondition(_))
        ));
        Ok(())
    }

    #[test]
    fn experiment_dir_holds_manifest_and_git_state() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let testbed = testing::testbed("zig")?;
        let mut exp = testing::synthetic(System::Linux, &testbed)?;
        exp.name = tmp.path().join("run.1-linux").to_string_lossy().into_owned();

        prepare_experiment_dir(&exp, &testbed)?;
        assert_eq!(Experiment::read_manifest(&exp.dir())?, exp);
        Ok(())
    }

    #[tokio::test]
    async fn noclient_runner_rejects_experiments_with_clients() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let exp = testing::synthetic(System::Shenango, &testbed)?;
        let token = CancellationToken::new();
        let err = execute_experiment_noclients(&exp, &testbed, &token)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::Precondition(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_assembles_without_launching() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        #[derive(serde::Deserialize)]
        struct Plan {
            experiment: Vec<PlanEntry>,
        }
        let plan: Plan = toml::from_str(
            r#"
            [[experiment]]
            recipe = "synthetic"
            system = "shenango"
            threads = 14
            background = "swaptions"
            "#,
        )?;

        let cluster = Cluster::new(&testbed.config.cluster);
        run_plan(&plan.experiment, &testbed, &cluster, &CancellationToken::new(), true).await?;
        Ok(())
    }

    #[cfg(target_family = "unix")]
    #[tokio::test]
    async fn failed_clients_are_collected_before_cleanup() -> anyhow::Result<()> {
        use crate::{
            config::{ClusterSettings, Config, RemoteTransport, EXAMPLE_CONFIG},
            shell::testing::RecordingShell,
        };
        use std::{os::unix::fs::PermissionsExt, sync::Arc};
        use sysinfo::{Pid, System as Processes};

        let tmp = tempfile::tempdir()?;
        let mut config = Config::try_from_str(EXAMPLE_CONFIG)?;
        config.observer = None;
        config.cluster = ClusterSettings {
            transport: RemoteTransport::Local,
            local_root: tmp.path().join("hosts"),
            clock_backoff_ms: 1,
            settle_secs: 0,
            ..Default::default()
        };
        let rstat = tmp.path().join("rstat.go");
        fs::write(&rstat, "package main\n")?;
        config.paths.rstat_script = Some(rstat.to_string_lossy().into_owned());

        // replicated driver: `netexp --config <file> client <dir>` leaves an output behind and
        // fails, pd3 first
        let driver = tmp.path().join("netexp");
        fs::write(
            &driver,
            "#!/bin/sh\n\
             echo samples > \"$4/$NETEXP_HOSTNAME.synth.out\"\n\
             [ \"$NETEXP_HOSTNAME\" = pd3 ] || sleep 1\n\
             exit 1\n",
        )?;
        fs::set_permissions(&driver, fs::Permissions::from_mode(0o755))?;

        let shell = Arc::new(RecordingShell::default());
        let testbed = Testbed::with_shell(config, "zig", shell.clone());
        let cluster = Cluster::new(&testbed.config.cluster);
        let mut exp = testing::synthetic(System::Shenango, &testbed)?;
        exp.name = tmp.path().join("run.1-shenango").to_string_lossy().into_owned();
        exp.client_files = vec![driver.to_string_lossy().into_owned()];
        fs::create_dir_all(exp.dir())?;
        exp.write_manifest()?;

        let app = ProcessHandle::spawn("synth", "sleep 15", None)?;
        let pid = app.pid().context("process should have a pid")?;

        let result = finish_with_clients(
            &exp,
            &testbed,
            &cluster,
            &CancellationToken::new(),
            vec![app],
            CleanupGuard::new(&testbed),
        )
        .await;
        assert!(result.is_err());

        // artifacts came back before the client copies were removed
        assert_eq!(fs::read_to_string(exp.dir().join("pd3.synth.out"))?.trim(), "samples");
        assert!(exp.dir().join("driver.pd3.log").exists());
        assert!(exp.manifest_path().exists());
        let remote = cluster.remote_dir(&exp.name);
        for host in ["pd3", "pd4"] {
            assert!(!tmp.path().join("hosts").join(host).join(&remote).exists());
        }

        // server processes stopped, then the host cleaned up
        let mut processes = Processes::new();
        processes.refresh_all();
        assert!(processes.process(Pid::from_u32(pid)).is_none());
        let commands = shell.commands();
        assert!(commands.contains(&"sudo pkill iokerneld".to_string()));
        assert!(commands.contains(&"sudo rmmod dune 2>/dev/null || true".to_string()));
        Ok(())
    }
}
