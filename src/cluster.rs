/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Everything that touches more than one host: running a command on many hosts at once,
//! checking that their clocks agree, replicating the experiment to them and pulling the
//! results back.

use crate::{
    config::{ClusterSettings, RemoteTransport},
    error::ExperimentError,
    experiment::Experiment,
    testbed::Testbed,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::{borrow::Cow, path::PathBuf, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort every other host's command as soon as one fails.
    HaltOnFailure,
    /// Let every command finish, then report the first failure.
    WaitAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutput {
    pub host: String,
    pub stdout: String,
}

/// Runs the shell command produced by `command` for every host concurrently.
///
/// # Arguments
///
/// * hosts - Hosts to fan out to, one local `sh -c` per host.
/// * policy - Whether the first failure aborts the rest of the batch.
/// * token - Cancelling it kills every command still running.
/// * command - Builds the local shell command for a host (usually an ssh or scp line).
///
/// # Returns
///
/// The stdout of every host, in completion order.
pub async fn fan_out<F>(
    hosts: &[String],
    policy: FailurePolicy,
    token: &CancellationToken,
    command: F,
) -> anyhow::Result<Vec<HostOutput>>
where
    F: Fn(&str) -> String,
{
    let mut join_set = JoinSet::new();
    for host in hosts {
        let cmd = command(host);
        let host = host.clone();
        debug!("[{}] $ {}", host, cmd);

        join_set.spawn(async move {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .kill_on_drop(true)
                .output()
                .await
                .context(format!("Failed to run `{}` for {}", cmd, host))?;

            if output.status.success() {
                Ok(HostOutput {
                    host,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                })
            } else {
                Err(anyhow!(
                    "`{}` failed on {} ({}): {}",
                    cmd,
                    host,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            }
        });
    }

    let mut outputs = Vec::with_capacity(hosts.len());
    let mut first_failure = None;
    loop {
        tokio::select! {
            next = join_set.join_next() => match next {
                None => break,
                Some(joined) => match joined.context("Fan-out task panicked")? {
                    Ok(output) => outputs.push(output),
                    Err(err) if policy == FailurePolicy::HaltOnFailure => {
                        // dropping the remaining tasks kills their children
                        join_set.abort_all();
                        return Err(err);
                    }
                    Err(err) => {
                        warn!("{}", err);
                        first_failure.get_or_insert(err);
                    }
                },
            },
            _ = token.cancelled() => {
                join_set.abort_all();
                return Err(anyhow!("fan-out cancelled"));
            }
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(outputs),
    }
}

/// How commands and files reach the other hosts.
#[derive(Debug, Clone)]
pub struct Cluster {
    transport: RemoteTransport,
    local_root: PathBuf,
}

impl Cluster {
    pub fn new(settings: &ClusterSettings) -> Self {
        Cluster {
            transport: settings.transport,
            local_root: settings.local_root.clone(),
        }
    }

    fn sandbox(&self, host: &str) -> String {
        self.local_root.join(host).to_string_lossy().into_owned()
    }

    /// Path of the experiment directory `dir` as seen by commands run on a remote host. Local
    /// sandboxes are the hosts' working directories, so absolute paths are re-rooted inside
    /// them instead of pointing back at this host's copy.
    pub fn remote_dir(&self, dir: &str) -> String {
        match self.transport {
            RemoteTransport::Ssh => dir.to_string(),
            RemoteTransport::Local => dir.trim_start_matches('/').to_string(),
        }
    }

    /// Local shell line that runs `command` on `host`.
    pub fn remote_command(&self, host: &str, command: &str) -> String {
        match self.transport {
            RemoteTransport::Ssh => format!("ssh -t -t {} {}", host, quote(command)),
            RemoteTransport::Local => format!(
                "mkdir -p {dir} && cd {dir} && NETEXP_HOSTNAME={host} sh -c {cmd}",
                dir = quote(&self.sandbox(host)),
                host = host,
                cmd = quote(command)
            ),
        }
    }

    /// Local shell line that copies `file` into `dir` on `host`.
    pub fn push_command(&self, host: &str, file: &str, dir: &str) -> String {
        match self.transport {
            RemoteTransport::Ssh => format!("scp {} {}:{}/", quote(file), host, dir),
            RemoteTransport::Local => {
                let dest = format!("{}/{}", self.sandbox(host), self.remote_dir(dir));
                format!(
                    "mkdir -p {dest} && cp {file} {dest}/",
                    dest = quote(&dest),
                    file = quote(file)
                )
            }
        }
    }

    /// Local shell line that copies every `*.<extension>` file of `dir` on `host` into the
    /// local `dir`. Missing files are not an error.
    pub fn pull_command(&self, host: &str, dir: &str, extension: &str) -> String {
        match self.transport {
            RemoteTransport::Ssh => {
                format!("scp {}:{}/*.{} {}/ || true", host, dir, extension, dir)
            }
            RemoteTransport::Local => format!(
                "cp {}/{}/*.{} {}/ || true",
                self.sandbox(host),
                self.remote_dir(dir),
                extension,
                dir
            ),
        }
    }

    pub async fn run_remote(
        &self,
        command: &str,
        hosts: &[String],
        policy: FailurePolicy,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<HostOutput>> {
        fan_out(hosts, policy, token, |host| self.remote_command(host, command)).await
    }
}

fn quote(s: &str) -> Cow<'_, str> {
    shlex::try_quote(s).unwrap_or(Cow::Borrowed(s))
}

/// Reads the wall clock of a set of hosts.
#[async_trait]
pub trait ClockSource: Send + Sync {
    async fn sample(&self, hosts: &[String]) -> anyhow::Result<Vec<i64>>;
}

/// `date +%s` on every host.
pub struct RemoteClocks<'a> {
    pub cluster: &'a Cluster,
    pub token: &'a CancellationToken,
}

#[async_trait]
impl ClockSource for RemoteClocks<'_> {
    async fn sample(&self, hosts: &[String]) -> anyhow::Result<Vec<i64>> {
        let outputs = self
            .cluster
            .run_remote("date +%s", hosts, FailurePolicy::WaitAll, self.token)
            .await?;
        outputs
            .iter()
            .map(|out| {
                out.stdout
                    .trim()
                    .parse::<i64>()
                    .context(format!("{} returned a malformed date {:?}", out.host, out.stdout))
            })
            .collect()
    }
}

/// Clocks agree when no two samples are more than a second apart.
pub fn clocks_agree(samples: &[i64]) -> bool {
    match (samples.iter().min(), samples.iter().max()) {
        (Some(min), Some(max)) => max - min <= 1,
        _ => false,
    }
}

/// Samples the clocks of `hosts` up to `retries` times, `backoff` apart. A sample that cannot
/// be taken at all (a host is unreachable, say) uses up an attempt like a skewed one does.
pub async fn verify_clocks(
    source: &dyn ClockSource,
    hosts: &[String],
    retries: usize,
    backoff: Duration,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    if hosts.is_empty() {
        return Ok(());
    }

    let mut last: anyhow::Result<Vec<i64>> = Ok(vec![]);
    for attempt in 1..=retries {
        last = source.sample(hosts).await;
        match &last {
            Ok(samples) if clocks_agree(samples) => {
                debug!("clocks agree on attempt {}: {:?}", attempt, samples);
                return Ok(());
            }
            Ok(samples) => warn!("host clocks disagree on attempt {}: {:?}", attempt, samples),
            Err(err) => warn!("unable to sample host clocks on attempt {}: {:#}", attempt, err),
        }

        if attempt < retries {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = token.cancelled() => {
                    return Err(ExperimentError::Interrupted("host clocks".to_string()).into());
                }
            }
        }
    }

    match last {
        Ok(samples) => Err(ExperimentError::ClockSkew {
            attempts: retries,
            samples,
        }
        .into()),
        Err(err) => Err(err.context(format!("Host clocks unreadable after {} attempts", retries))),
    }
}

/// Checks clocks, creates the experiment directory on every client and observer host and
/// copies the declared client files, the manifest and the rstat script into it. Must finish
/// before any client process starts.
pub async fn setup_clients(
    experiment: &Experiment,
    testbed: &Testbed,
    cluster: &Cluster,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let hosts = testbed.config.remote_hosts(experiment.client_hosts());
    let settings = &testbed.config.cluster;

    let clocks = RemoteClocks { cluster, token };
    verify_clocks(
        &clocks,
        &hosts,
        settings.clock_retries,
        Duration::from_millis(settings.clock_backoff_ms),
        token,
    )
    .await?;

    let dir = &experiment.name;
    cluster
        .run_remote(
            &format!("mkdir -p {}", cluster.remote_dir(dir)),
            &hosts,
            FailurePolicy::HaltOnFailure,
            token,
        )
        .await?;

    let manifest = experiment.manifest_path().to_string_lossy().into_owned();
    let files = experiment
        .client_files
        .iter()
        .cloned()
        .chain([manifest, testbed.config.rstat_script()]);
    for file in files {
        info!("pushing {} to {}", file, hosts.join(", "));
        fan_out(&hosts, FailurePolicy::HaltOnFailure, token, |host| {
            cluster.push_command(host, &file, dir)
        })
        .await
        .context(format!("Unable to replicate {}", file))?;
    }

    Ok(())
}

/// Pulls logs from every client and observer host (plus outputs from the clients), then
/// deletes their copy of the experiment. Never fails.
pub async fn collect_clients(
    experiment: &Experiment,
    testbed: &Testbed,
    cluster: &Cluster,
) {
    // collection must finish even when the run was cancelled
    let token = CancellationToken::new();
    let clients: Vec<String> = experiment.client_hosts().cloned().collect();
    let everyone = testbed.config.remote_hosts(experiment.client_hosts());
    let dir = &experiment.name;

    let pulls = [
        (&everyone, "log"),
        (&clients, "out"),
        (&clients, "err"),
    ];
    for (hosts, extension) in pulls {
        if let Err(err) = fan_out(hosts, FailurePolicy::WaitAll, &token, |host| {
            cluster.pull_command(host, dir, extension)
        })
        .await
        {
            debug!("ignoring failed pull of *.{}: {}", extension, err);
        }
    }

    if let Err(err) = cluster
        .run_remote(
            &format!("rm -rf {}", cluster.remote_dir(dir)),
            &everyone,
            FailurePolicy::WaitAll,
            &token,
        )
        .await
    {
        debug!("ignoring failed remote cleanup: {}", err);
    }
}
