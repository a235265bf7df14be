/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The experiments an `[[experiment]]` entry can ask for. Each recipe turns its parameters
//! into one or more fully assembled `Experiment`s.

use crate::{
    assembly::{
        finalize_measurement_cohort, new_gdnsd_server, new_measurement_instances,
        new_memcached_server, new_swaptions_inst, new_synthetic_server, MeasurementOptions,
        SyntheticOptions, DEFAULT_FAKEWORK,
    },
    allocator::{allocate_ip, allocate_port, random_mac},
    error::ExperimentError,
    experiment::{AppInstance, Experiment, NetIdentity, Resources, Role, Transport},
    system::{mean_service_time, AppKind, System},
    testbed::Testbed,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Background {
    Swaptions,
}

impl Background {
    pub fn as_str(&self) -> &'static str {
        match self {
            Background::Swaptions => "swaptions",
        }
    }
}

/// One entry of the plan in the cluster config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanEntry {
    #[serde(flatten)]
    pub recipe: Recipe,
    /// Run one independent experiment per load point instead of one sweep.
    #[serde(default)]
    pub per_point: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "recipe", rename_all = "snake_case")]
pub enum Recipe {
    Synthetic(SyntheticParams),
    Memcached(MemcachedParams),
    Dns(DnsParams),
    MultiappIo(MultiappParams),
    Loadshift(LoadshiftParams),
    LocalSynth(LocalSynthParams),
    MemcachedThreadSweep(ThreadSweepParams),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyntheticParams {
    pub system: System,
    pub threads: usize,
    #[serde(default = "default_distribution")]
    pub distribution: String,
    #[serde(default)]
    pub spin: bool,
    #[serde(default)]
    pub noht: bool,
    pub background: Option<Background>,
    #[serde(default = "default_time")]
    pub time: u64,
    #[serde(default = "default_synthetic_samples")]
    pub samples: usize,
    #[serde(default = "default_synthetic_mpps")]
    pub mpps: f64,
    #[serde(default = "default_target_us")]
    pub target_us: f64,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default)]
    pub min_mpps: f64,
    #[serde(default = "default_nconns")]
    pub nconns: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemcachedParams {
    pub system: System,
    pub threads: usize,
    #[serde(default)]
    pub spin: bool,
    pub background: Option<Background>,
    #[serde(default = "default_memcached_samples")]
    pub samples: usize,
    #[serde(default = "default_time")]
    pub time: u64,
    #[serde(default = "default_memcached_mpps")]
    pub mpps: f64,
    #[serde(default)]
    pub noht: bool,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default = "default_nconns")]
    pub nconns: usize,
    #[serde(default)]
    pub start_mpps: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsParams {
    pub system: System,
    #[serde(default)]
    pub spin: bool,
    pub background: Option<Background>,
    #[serde(default = "default_dns_samples")]
    pub samples: usize,
    #[serde(default = "default_time")]
    pub time: u64,
    #[serde(default = "default_dns_mpps")]
    pub mpps: f64,
    #[serde(default)]
    pub noht: bool,
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultiappParams {
    pub system: System,
    pub samples: Option<usize>,
    #[serde(default = "default_multiapp_background")]
    pub background: Option<Background>,
    #[serde(default)]
    pub spin: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadshiftParams {
    pub system: System,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalSynthParams {
    pub mpps: f64,
    pub producers: usize,
    pub consumers: usize,
    #[serde(default = "default_time")]
    pub time: u64,
    #[serde(default = "default_local_samples")]
    pub samples: usize,
    #[serde(default = "default_distribution")]
    pub distribution: String,
    pub mean: Option<u64>,
    #[serde(default)]
    pub start_mpps: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThreadSweepParams {
    pub system: System,
    pub threads: Vec<usize>,
    #[serde(default)]
    pub start_mpps: f64,
    pub mpps: f64,
    pub samples: usize,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default)]
    pub background: bool,
    #[serde(default = "default_sweep_time")]
    pub time: u64,
}

fn default_distribution() -> String {
    "exponential".to_string()
}
fn default_time() -> u64 {
    10
}
fn default_sweep_time() -> u64 {
    20
}
fn default_synthetic_samples() -> usize {
    40
}
fn default_memcached_samples() -> usize {
    55
}
fn default_dns_samples() -> usize {
    54
}
fn default_local_samples() -> usize {
    20
}
fn default_synthetic_mpps() -> f64 {
    1.6
}
fn default_memcached_mpps() -> f64 {
    6.0
}
fn default_dns_mpps() -> f64 {
    5.4
}
fn default_target_us() -> f64 {
    10.0
}
fn default_transport() -> Transport {
    Transport::Tcp
}
fn default_nconns() -> usize {
    1200
}
fn default_multiapp_background() -> Option<Background> {
    Some(Background::Swaptions)
}

impl PlanEntry {
    /// Assembles every experiment this entry stands for, in run order.
    pub fn build(&self, testbed: &Testbed) -> anyhow::Result<Vec<Experiment>> {
        if !self.per_point {
            return self.recipe.build(testbed);
        }

        let (mpps, samples) = self.recipe.load_points().ok_or_else(|| {
            ExperimentError::precondition(format!(
                "{} cannot be split into one experiment per point",
                self.recipe.label()
            ))
        })?;
        let mut experiments = vec![];
        for i in 1..=samples {
            let point = mpps * i as f64 / samples as f64;
            for mut exp in self.recipe.at_point(point).build(testbed)? {
                exp.name.push_str(&format!("-{}mpps", point));
                experiments.push(exp);
            }
        }
        Ok(experiments)
    }
}

impl Recipe {
    pub fn label(&self) -> &'static str {
        match self {
            Recipe::Synthetic(_) => "synthetic",
            Recipe::Memcached(_) => "memcached",
            Recipe::Dns(_) => "dns",
            Recipe::MultiappIo(_) => "multiapp_io",
            Recipe::Loadshift(_) => "loadshift",
            Recipe::LocalSynth(_) => "local_synth",
            Recipe::MemcachedThreadSweep(_) => "memcached_thread_sweep",
        }
    }

    pub fn build(&self, testbed: &Testbed) -> anyhow::Result<Vec<Experiment>> {
        match self {
            Recipe::Synthetic(p) => Ok(vec![assemble_synthetic(p, testbed)?]),
            Recipe::Memcached(p) => Ok(vec![bench_memcached(p, testbed)?]),
            Recipe::Dns(p) => Ok(vec![bench_dns(p, testbed)?]),
            Recipe::MultiappIo(p) => Ok(vec![multiapp_io(p, testbed)?]),
            Recipe::Loadshift(p) => Ok(vec![loadshift(p, testbed)?]),
            Recipe::LocalSynth(p) => Ok(vec![assemble_local_synth(p, testbed)?]),
            Recipe::MemcachedThreadSweep(p) => memcached_thread_sweep(p, testbed),
        }
    }

    fn load_points(&self) -> Option<(f64, usize)> {
        match self {
            Recipe::Synthetic(p) => Some((p.mpps, p.samples)),
            Recipe::Memcached(p) => Some((p.mpps, p.samples)),
            Recipe::Dns(p) => Some((p.mpps, p.samples)),
            _ => None,
        }
    }

    /// The same recipe offering a single load point.
    fn at_point(&self, mpps: f64) -> Recipe {
        let mut recipe = self.clone();
        match &mut recipe {
            Recipe::Synthetic(p) => (p.mpps, p.samples) = (mpps, 1),
            Recipe::Memcached(p) => (p.mpps, p.samples) = (mpps, 1),
            Recipe::Dns(p) => (p.mpps, p.samples) = (mpps, 1),
            _ => {}
        }
        recipe
    }
}

fn require_system(recipe: &str, system: System, allowed: &[System]) -> anyhow::Result<()> {
    if allowed.contains(&system) {
        Ok(())
    } else {
        Err(ExperimentError::precondition(format!(
            "{} cannot run on {} (supported: {})",
            recipe,
            system,
            allowed.iter().join(", ")
        ))
        .into())
    }
}

fn require_noht_support(system: System, noht: bool) -> anyhow::Result<()> {
    if noht && system != System::Shenango {
        return Err(ExperimentError::precondition(format!(
            "noht is only available for shenango, not {}",
            system
        ))
        .into());
    }
    Ok(())
}

fn new_experiment(system: System, testbed: &Testbed) -> Experiment {
    Experiment::new(system, &testbed.hostname, &testbed.driver_files())
}

fn spin_all(experiment: &mut Experiment, app: &AppInstance) {
    if let Some(app) = experiment.app_mut(&app.name) {
        app.resources.spin = app.resources.threads;
    }
}

fn add_background(
    experiment: &mut Experiment,
    testbed: &Testbed,
    background: Option<Background>,
    threads: usize,
) -> anyhow::Result<()> {
    match background {
        Some(Background::Swaptions) => new_swaptions_inst(threads, experiment, testbed).map(|_| ()),
        None => Ok(()),
    }
}

pub fn assemble_synthetic(p: &SyntheticParams, testbed: &Testbed) -> anyhow::Result<Experiment> {
    require_noht_support(p.system, p.noht)?;
    let mut exp = new_experiment(p.system, testbed);
    exp.name.push_str(&format!("-synthetic-{}", p.distribution));
    if let Some(bg) = p.background {
        exp.name.push_str(&format!("-{}", bg.as_str()));
    }
    exp.transport = Some(p.transport);
    exp.noht = p.noht;

    let mean = mean_service_time(p.target_us, p.system, p.noht);
    let synth = new_synthetic_server(
        p.threads,
        &mut exp,
        testbed,
        SyntheticOptions {
            transport: p.transport,
            ..Default::default()
        },
    )?;
    if p.spin {
        exp.name.push_str("-spin");
        spin_all(&mut exp, &synth);
    }
    add_background(
        &mut exp,
        testbed,
        p.background,
        testbed.config.usable_cpus().len(),
    )?;

    let options = MeasurementOptions {
        mean,
        distribution: p.distribution.clone(),
        nconns: p.nconns,
        start_mpps: p.min_mpps,
        ..Default::default()
    };
    let hosts = testbed.config.clients.hosts.len();
    new_measurement_instances(hosts, &synth, p.mpps, &mut exp, testbed, options)?;
    finalize_measurement_cohort(&mut exp, testbed, p.samples, p.time)?;
    Ok(exp)
}

pub fn bench_memcached(p: &MemcachedParams, testbed: &Testbed) -> anyhow::Result<Experiment> {
    require_system(
        "memcached",
        p.system,
        &[System::Shenango, System::Linux, System::Arachne, System::Zygos],
    )?;
    require_noht_support(p.system, p.noht)?;

    let mut exp = new_experiment(p.system, testbed);
    exp.name.push_str(&format!("-memcached-{}", p.transport.as_str()));
    if p.spin {
        exp.name.push_str("-spin");
    }
    if let Some(bg) = p.background {
        exp.name.push_str(&format!("-{}", bg.as_str()));
    }
    exp.noht = p.noht;

    let memcached = new_memcached_server(p.threads, &mut exp, testbed, "memcached", p.transport)?;
    if p.spin {
        spin_all(&mut exp, &memcached);
    }
    add_background(
        &mut exp,
        testbed,
        p.background,
        testbed.config.usable_cpus().len(),
    )?;

    let options = MeasurementOptions {
        nconns: p.nconns,
        start_mpps: p.start_mpps,
        ..Default::default()
    };
    let hosts = testbed.config.clients.hosts.len();
    new_measurement_instances(hosts, &memcached, p.mpps, &mut exp, testbed, options)?;
    finalize_measurement_cohort(&mut exp, testbed, p.samples, p.time)?;
    Ok(exp)
}

pub fn bench_dns(p: &DnsParams, testbed: &Testbed) -> anyhow::Result<Experiment> {
    require_system("dns", p.system, &[System::Shenango, System::Linux])?;
    require_noht_support(p.system, p.noht)?;

    let mut exp = new_experiment(p.system, testbed);
    exp.name.push_str("-dns");
    if let Some(bg) = p.background {
        exp.name.push_str(&format!("-{}", bg.as_str()));
    }
    if p.spin {
        exp.name.push_str("-spin");
    }
    exp.noht = p.noht;

    let threads = match (p.threads, p.system) {
        (Some(threads), _) => threads,
        (None, System::Shenango) if p.noht => 5,
        (None, System::Shenango) => 6,
        (None, _) => 24,
    };
    let dns = new_gdnsd_server(threads, &mut exp, testbed, "dns")?;
    if p.spin {
        spin_all(&mut exp, &dns);
    }
    add_background(
        &mut exp,
        testbed,
        p.background,
        testbed.config.usable_cpus().len(),
    )?;

    let options = MeasurementOptions {
        nconns: 1200,
        warmup: Some(false),
        ..Default::default()
    };
    let hosts = testbed.config.clients.hosts.len();
    new_measurement_instances(hosts, &dns, p.mpps, &mut exp, testbed, options)?;
    finalize_measurement_cohort(&mut exp, testbed, p.samples, p.time)?;
    Ok(exp)
}

/// memcached and DNS side by side, each measured by half of the client hosts.
pub fn multiapp_io(p: &MultiappParams, testbed: &Testbed) -> anyhow::Result<Experiment> {
    require_system("multiapp_io", p.system, &[System::Shenango, System::Linux])?;
    if p.spin && p.system != System::Shenango {
        return Err(ExperimentError::precondition("spinning is only available for shenango").into());
    }

    let mut exp = new_experiment(p.system, testbed);
    exp.name.push_str("-multiapp_io");

    let (max_memcached_mpps, samples, dns_threads, memcached_threads, bg_threads) =
        if p.system == System::Shenango {
            (1.125, p.samples.unwrap_or(45), 4, 3, 22)
        } else {
            (0.3, p.samples.unwrap_or(12), 24, 5, 24)
        };

    let memcached =
        new_memcached_server(memcached_threads, &mut exp, testbed, "memcached", Transport::Tcp)?;
    let dns = new_gdnsd_server(dns_threads, &mut exp, testbed, "dns")?;
    if p.spin {
        spin_all(&mut exp, &memcached);
        spin_all(&mut exp, &dns);
    }
    add_background(&mut exp, testbed, p.background, bg_threads)?;

    let half = testbed.config.clients.hosts.len() / 2;
    new_measurement_instances(
        half,
        &memcached,
        max_memcached_mpps,
        &mut exp,
        testbed,
        Default::default(),
    )?;
    new_measurement_instances(
        half,
        &dns,
        3.0 * max_memcached_mpps,
        &mut exp,
        testbed,
        Default::default(),
    )?;
    finalize_measurement_cohort(&mut exp, testbed, samples, 30)?;
    Ok(exp)
}

/// `rate:duration_us` steps, alternating a low baseline with increasing load. Rates are per
/// client host.
pub fn loadshift_schedule(system: System, client_hosts: usize) -> String {
    let baseline = (100_000.0, 1_000_000);
    let mut points = vec![baseline];
    for krps in (400..1200).step_by(200) {
        points.push(baseline);
        points.push((krps as f64 * 1000.0, 1_000_000));
    }
    if system == System::Shenango {
        for mrps in 2..6 {
            points.push(baseline);
            points.push((mrps as f64 * 1e6, 1_000_000));
        }
    }
    points
        .into_iter()
        .map(|(rate, duration)| format!("{}:{}", (rate / client_hosts as f64) as u64, duration))
        .join(",")
}

pub fn loadshift(p: &LoadshiftParams, testbed: &Testbed) -> anyhow::Result<Experiment> {
    require_system(
        "loadshift",
        p.system,
        &[System::Shenango, System::Arachne, System::LinuxFloating],
    )?;
    let threads = match p.system {
        System::Arachne => 15,
        System::LinuxFloating => 16,
        _ => 14,
    };

    let mut exp = new_experiment(p.system, testbed);
    exp.name.push_str("-loadshift");

    let hosts = testbed.config.clients.hosts.len();
    let synth = new_synthetic_server(threads, &mut exp, testbed, SyntheticOptions::default())?;
    new_swaptions_inst(testbed.config.usable_cpus().len(), &mut exp, testbed)?;

    let options = MeasurementOptions {
        mean: mean_service_time(1.0, p.system, false),
        distribution: "exponential".to_string(),
        nconns: 1200,
        extra_args: Some(format!("--loadshift={}", loadshift_schedule(p.system, hosts))),
        ..Default::default()
    };
    new_measurement_instances(hosts, &synth, 0.0, &mut exp, testbed, options)?;
    finalize_measurement_cohort(&mut exp, testbed, 0, 0)?;
    Ok(exp)
}

/// No client hosts: the runtime generates and serves its own load on the server.
pub fn assemble_local_synth(p: &LocalSynthParams, testbed: &Testbed) -> anyhow::Result<Experiment> {
    let mut exp = new_experiment(System::Shenango, testbed);
    exp.noht = true;
    exp.name.push_str(&format!("-localsynth-{}", p.distribution));

    let mut inst = AppInstance {
        name: "localsynth".to_string(),
        role: Role::LocalLoad,
        app: AppKind::Synthetic,
        net: NetIdentity {
            ip: allocate_ip(&mut exp, &testbed.config, false)?,
            port: Some(allocate_port(&mut exp)?),
            mac: random_mac(),
        },
        resources: Resources {
            threads: p.producers + p.consumers,
            guaranteed: 1,
            spin: 0,
            nice: 0,
        },
        protocol: Some("synthetic".to_string()),
        transport: None,
        args: "{ip}:{port} --rampup=0 --output={output} --protocol {protocol} --mode local-client --threads {client_threads} --runtime {runtime} --mean={mean} --distribution={distribution} --mpps={mpps} --samples={samples} --start_mpps {start_mpps}".to_string(),
        binary: None,
        before: vec![],
        after: vec![],
        params: BTreeMap::new(),
    };
    inst.param("samples", p.samples)
        .param("runtime", p.time)
        .param("output", "normal")
        .param("mpps", p.mpps)
        .param("distribution", p.distribution.as_str())
        .param(
            "mean",
            p.mean
                .unwrap_or_else(|| mean_service_time(10.0, System::Shenango, true)),
        )
        .param("client_threads", p.producers)
        .param("start_mpps", p.start_mpps)
        .param("fakework", DEFAULT_FAKEWORK);

    exp.apps.push(inst);
    Ok(exp)
}

/// One memcached experiment per thread count.
pub fn memcached_thread_sweep(
    p: &ThreadSweepParams,
    testbed: &Testbed,
) -> anyhow::Result<Vec<Experiment>> {
    require_system(
        "memcached_thread_sweep",
        p.system,
        &[System::Shenango, System::Linux, System::Arachne],
    )?;
    let hosts = testbed.config.clients.hosts.len();

    p.threads
        .iter()
        .map(|&threads| {
            let mut exp = new_experiment(p.system, testbed);
            exp.name
                .push_str(&format!("-memcached-{}-{}threads", p.transport.as_str(), threads));
            let memcached =
                new_memcached_server(threads, &mut exp, testbed, "memcached", p.transport)?;
            if p.background {
                new_swaptions_inst(24, &mut exp, testbed)?;
            }
            let options = MeasurementOptions {
                start_mpps: p.start_mpps,
                nconns: 200 * hosts,
                ..Default::default()
            };
            new_measurement_instances(hosts, &memcached, p.mpps, &mut exp, testbed, options)?;
            finalize_measurement_cohort(&mut exp, testbed, p.samples, p.time)?;
            Ok(exp)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter::testing, config::Config};

    fn plan(toml_entries: &str) -> anyhow::Result<Vec<PlanEntry>> {
        let base = crate::config::EXAMPLE_CONFIG
            .split("[[experiment]]")
            .next()
            .unwrap_or_default();
        Ok(Config::try_from_str(&format!("{}\n{}", base, toml_entries))?.experiments)
    }

    #[test]
    fn plan_entries_parse_with_defaults() -> anyhow::Result<()> {
        let entries = plan(
            r#"
[[experiment]]
recipe = "dns"
system = "linux"

[[experiment]]
recipe = "memcached_thread_sweep"
system = "arachne"
threads = [4, 8]
mpps = 2.0
samples = 10
per_point = false
"#,
        )?;
        assert_eq!(entries.len(), 2);
        match &entries[0].recipe {
            Recipe::Dns(p) => {
                assert_eq!((p.samples, p.mpps, p.time), (54, 5.4, 10));
                assert!(p.threads.is_none());
            }
            other => panic!("unexpected recipe {:?}", other),
        }
        assert!(matches!(entries[1].recipe, Recipe::MemcachedThreadSweep(_)));
        Ok(())
    }

    #[test]
    fn synthetic_with_background() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let params = SyntheticParams {
            system: System::Shenango,
            threads: 14,
            distribution: "exponential".to_string(),
            spin: false,
            noht: false,
            background: Some(Background::Swaptions),
            time: 10,
            samples: 20,
            mpps: 1.4,
            target_us: 10.0,
            transport: Transport::Tcp,
            min_mpps: 0.0,
            nconns: 1200,
        };
        let exp = assemble_synthetic(&params, &testbed)?;
        assert!(exp.name.ends_with("-shenango-synthetic-exponential-swaptions"));
        assert_eq!(exp.apps.len(), 2);
        assert_eq!(exp.apps[0].role, Role::Server);
        assert_eq!(exp.apps[1].role, Role::Background);
        assert_eq!(exp.apps[1].resources.threads, 16);
        for client in exp.all_clients() {
            assert_eq!(client.mean, 593);
            assert_eq!(client.mpps, 0.7);
        }
        Ok(())
    }

    #[test]
    fn dns_thread_defaults_depend_on_system() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let mut params = DnsParams {
            system: System::Shenango,
            spin: true,
            background: None,
            samples: 54,
            time: 10,
            mpps: 5.4,
            noht: true,
            threads: None,
        };
        let exp = bench_dns(&params, &testbed)?;
        assert_eq!(exp.apps[0].resources.threads, 5);
        assert_eq!(exp.apps[0].resources.spin, 5);
        assert!(exp.all_clients().all(|c| c.warmup.is_empty()));

        params.system = System::Linux;
        assert!(bench_dns(&params, &testbed).is_err(), "noht needs shenango");
        params.noht = false;
        assert_eq!(bench_dns(&params, &testbed)?.apps[0].resources.threads, 24);
        Ok(())
    }

    #[test]
    fn multiapp_splits_the_client_hosts() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let params = MultiappParams {
            system: System::Shenango,
            samples: None,
            background: default_multiapp_background(),
            spin: false,
        };
        let exp = multiapp_io(&params, &testbed)?;
        let names = exp.apps.iter().map(|a| a.name.as_str()).collect_vec();
        assert_eq!(names, vec!["memcached", "dns", "swaptions"]);
        assert_eq!(exp.clients["pd3"][0].serverport, exp.apps[0].net.port);
        assert_eq!(exp.clients["pd4"][0].serverport, Some(53));
        assert!(exp.all_clients().all(|c| c.samples == 45 && c.runtime == 30));
        Ok(())
    }

    #[test]
    fn loadshift_schedule_is_split_per_host() {
        let schedule = loadshift_schedule(System::Arachne, 2);
        assert_eq!(
            schedule,
            "50000:1000000,50000:1000000,200000:1000000,50000:1000000,300000:1000000,50000:1000000,400000:1000000,50000:1000000,500000:1000000"
        );
        assert_eq!(loadshift_schedule(System::Shenango, 1).split(',').count(), 17);
    }

    #[test]
    fn loadshift_rejects_pinned_linux() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let params = LoadshiftParams {
            system: System::Linux,
        };
        assert!(loadshift(&params, &testbed).is_err());
        Ok(())
    }

    #[test]
    fn local_synth_has_no_clients() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let params = LocalSynthParams {
            mpps: 1.0,
            producers: 2,
            consumers: 3,
            time: 10,
            samples: 20,
            distribution: "bimodal".to_string(),
            mean: None,
            start_mpps: 0.0,
        };
        let exp = assemble_local_synth(&params, &testbed)?;
        assert!(exp.clients.is_empty());
        assert!(exp.noht);
        assert!(exp.name.ends_with("-localsynth-bimodal"));

        let app = &exp.apps[0];
        assert_eq!(app.role, Role::LocalLoad);
        let args = crate::template::render(&app.args, &crate::template::fields_of(app)?)?;
        assert!(args.contains("--mode local-client --threads 2 --runtime 10 --mean=838"));
        Ok(())
    }

    #[test]
    fn per_point_runs_one_experiment_per_load_level() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let entry = PlanEntry {
            recipe: Recipe::Memcached(MemcachedParams {
                system: System::Zygos,
                threads: 8,
                spin: false,
                background: None,
                samples: 4,
                time: 10,
                mpps: 2.0,
                noht: false,
                transport: Transport::Tcp,
                nconns: 1200,
                start_mpps: 0.0,
            }),
            per_point: true,
        };
        let experiments = entry.build(&testbed)?;
        assert_eq!(experiments.len(), 4);
        assert!(experiments[0].name.ends_with("-0.5mpps"));
        assert!(experiments[3].name.ends_with("-2mpps"));
        for exp in &experiments {
            assert!(exp.all_clients().all(|c| c.samples == 1));
        }

        let local = PlanEntry {
            recipe: Recipe::Loadshift(LoadshiftParams {
                system: System::Shenango,
            }),
            per_point: true,
        };
        assert!(local.build(&testbed).is_err());
        Ok(())
    }

    #[test]
    fn thread_sweep_builds_one_experiment_per_count() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let params = ThreadSweepParams {
            system: System::Linux,
            threads: vec![2, 4, 8],
            start_mpps: 0.1,
            mpps: 1.0,
            samples: 10,
            transport: Transport::Udp,
            background: true,
            time: 20,
        };
        let experiments = memcached_thread_sweep(&params, &testbed)?;
        assert_eq!(experiments.len(), 3);
        assert!(experiments[2].name.ends_with("-memcached-udp-8threads"));
        assert_eq!(experiments[0].apps[1].resources.threads, 24);
        assert_eq!(experiments[0].all_clients().next().map(|c| c.client_threads), Some(200));
        Ok(())
    }
}
