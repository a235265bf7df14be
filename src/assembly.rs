/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Building blocks for experiments. Each helper appends instances to an explicit
//! `&mut Experiment` and draws addresses and ports from its counters.

use crate::{
    allocator::{allocate_ip, allocate_port, random_mac},
    error::ExperimentError,
    experiment::{
        AppInstance, ClientInstance, Experiment, NetIdentity, Resources, Role, Transport,
    },
    hooks::Hook,
    system::{AppKind, System},
    testbed::Testbed,
};
use std::{cmp::Reverse, collections::BTreeMap};
use tracing::warn;

pub const DEFAULT_FAKEWORK: &str = "stridedmem:1024:7";

/// Load generators are copied into the experiment directory and run from there.
const CLIENT_BINARY: &str = "./synthetic --config";

const CLIENT_ARGS: &str = "{serverip}:{serverport} {warmup} --output={output} --protocol {protocol} --mode runtime-client --threads {client_threads} --runtime {runtime} --barrier-peers {npeers} --barrier-leader {leader} --mean={mean} --distribution={distribution} --mpps={mpps} --samples={samples} --transport {transport} --start_mpps {start_mpps}";

fn server_instance(
    name: &str,
    app: AppKind,
    threads: usize,
    net: NetIdentity,
    transport: Transport,
    protocol: &str,
) -> AppInstance {
    AppInstance {
        name: name.to_string(),
        role: Role::Server,
        app,
        net,
        resources: Resources {
            threads,
            guaranteed: threads,
            spin: 0,
            nice: -20,
        },
        protocol: Some(protocol.to_string()),
        transport: Some(transport),
        args: String::new(),
        binary: None,
        before: vec![],
        after: vec![],
        params: BTreeMap::new(),
    }
}

pub fn new_memcached_server(
    threads: usize,
    experiment: &mut Experiment,
    testbed: &Testbed,
    name: &str,
    transport: Transport,
) -> anyhow::Result<AppInstance> {
    let options = match experiment.system {
        System::Arachne => ",no_hashexpand,no_lru_crawler,no_lru_maintainer,no_slab_reassign",
        System::Linux | System::Shenango => ",no_hashexpand,lru_crawler,lru_maintainer,idle_timeout=0",
        System::Zygos => ",lru_crawler",
        System::LinuxFloating => {
            return Err(ExperimentError::precondition("memcached has no linux-floating build").into())
        }
    };

    let net = NetIdentity {
        ip: allocate_ip(experiment, &testbed.config, false)?,
        port: Some(allocate_port(experiment)?),
        mac: random_mac(),
    };
    let mut inst = server_instance(name, AppKind::Memcached, threads, net, transport, "memcached");
    inst.param("meml", 32000).param("hashpower", 28);

    let common = format!(
        "-U {{port}} -p {{port}} -c 32768 -m {{meml}} -b 32768 -o hashpower={{hashpower}}{}",
        options
    );
    inst.args = match experiment.system {
        System::Arachne => format!("--minNumCores 2 --maxNumCores {{threads}} -t 1 {}", common),
        _ => format!("-t {{threads}} {}", common),
    };

    // the kernel stack spreads UDP load with one SO_REUSEPORT socket per listen entry
    if transport == Transport::Udp && matches!(experiment.system, System::Arachne | System::Linux) {
        let listen = vec!["{ip}:{port}"; 4 * threads].join(",");
        inst.args.push_str(&format!(" -l {}", listen));
    }

    experiment.apps.push(inst.clone());
    Ok(inst)
}

pub fn new_gdnsd_server(
    threads: usize,
    experiment: &mut Experiment,
    testbed: &Testbed,
    name: &str,
) -> anyhow::Result<AppInstance> {
    let ip = allocate_ip(experiment, &testbed.config, false)?;
    let port = if experiment.system == System::Shenango {
        53
    } else {
        allocate_port(experiment)?
    };
    let net = NetIdentity {
        ip,
        port: Some(port),
        mac: random_mac(),
    };
    let mut inst = server_instance(name, AppKind::Gdnsd, threads, net, Transport::Udp, "dns");
    inst.args = "-f start -c ./".to_string();
    inst.before = vec![Hook::ConfigureDnsEnvironment];

    experiment.apps.push(inst.clone());
    Ok(inst)
}

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    pub name: String,
    pub transport: Transport,
    pub fakework: String,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        SyntheticOptions {
            name: "synth".to_string(),
            transport: Transport::Tcp,
            fakework: DEFAULT_FAKEWORK.to_string(),
        }
    }
}

pub fn new_synthetic_server(
    threads: usize,
    experiment: &mut Experiment,
    testbed: &Testbed,
    options: SyntheticOptions,
) -> anyhow::Result<AppInstance> {
    if options.transport != Transport::Tcp
        && matches!(experiment.system, System::Arachne | System::Zygos)
    {
        return Err(ExperimentError::precondition(format!(
            "the {} synthetic server only speaks tcp",
            experiment.system
        ))
        .into());
    }

    let net = NetIdentity {
        ip: allocate_ip(experiment, &testbed.config, false)?,
        port: Some(allocate_port(experiment)?),
        mac: random_mac(),
    };
    let mut inst = server_instance(
        &options.name,
        AppKind::Synthetic,
        threads,
        net,
        options.transport,
        "synthetic",
    );
    inst.param("fakework", options.fakework);

    let generic = "--mode={stype}-server {ip}:{port} --threads {threads} --transport {transport} --fakework {fakework}";
    inst.args = match experiment.system {
        System::Shenango => {
            inst.param("stype", "spawner");
            generic.to_string()
        }
        System::Linux => {
            inst.param("stype", "linux");
            generic.to_string()
        }
        System::Arachne => "--minNumCores 2 --maxNumCores {threads} {fakework} {port}".to_string(),
        System::Zygos => "{fakework}".to_string(),
        System::LinuxFloating => "{fakework} {threads} {port}".to_string(),
    };

    experiment.apps.push(inst.clone());
    Ok(inst)
}

/// A CPU-bound background job that soaks up whatever cores the servers leave idle.
pub fn new_swaptions_inst(
    threads: usize,
    experiment: &mut Experiment,
    testbed: &Testbed,
) -> anyhow::Result<AppInstance> {
    let inst = AppInstance {
        name: "swaptions".to_string(),
        role: Role::Background,
        app: AppKind::Swaptions,
        net: NetIdentity {
            ip: allocate_ip(experiment, &testbed.config, false)?,
            port: None,
            mac: random_mac(),
        },
        resources: Resources {
            threads,
            guaranteed: 0,
            spin: 0,
            nice: 20,
        },
        protocol: None,
        transport: None,
        args: "-ns {threads} -sm 40000 -nt {threads} 2>&1 | ts %s".to_string(),
        binary: None,
        before: vec![],
        after: vec![],
        params: BTreeMap::new(),
    };
    experiment.apps.push(inst.clone());
    Ok(inst)
}

#[derive(Debug, Clone)]
pub struct MeasurementOptions {
    /// Mean service time passed to the load generator.
    pub mean: u64,
    /// Connections across the whole cohort.
    pub nconns: usize,
    pub output: String,
    pub distribution: String,
    pub start_mpps: f64,
    /// Defaults to on, except for arachne and zygos.
    pub warmup: Option<bool>,
    pub rampup: Option<f64>,
    /// Appended verbatim to every client's argument template.
    pub extra_args: Option<String>,
}

impl Default for MeasurementOptions {
    fn default() -> Self {
        MeasurementOptions {
            mean: 842,
            nconns: 300,
            output: "buckets".to_string(),
            distribution: "zero".to_string(),
            start_mpps: 0.0,
            warmup: None,
            rampup: None,
            extra_args: None,
        }
    }
}

/// Adds `count` load generators aimed at `server`, spread round-robin over the client hosts.
/// Offered load and connections are split evenly between them.
pub fn new_measurement_instances(
    count: usize,
    server: &AppInstance,
    mpps: f64,
    experiment: &mut Experiment,
    testbed: &Testbed,
    options: MeasurementOptions,
) -> anyhow::Result<Vec<ClientInstance>> {
    let hosts = &testbed.config.clients.hosts;
    if count == 0 || hosts.is_empty() {
        return Err(ExperimentError::precondition(format!(
            "cannot place {} load generators on {} client hosts",
            count,
            hosts.len()
        ))
        .into());
    }
    let protocol = server.protocol.clone().ok_or_else(|| {
        ExperimentError::precondition(format!("{} does not speak a protocol", server.name))
    })?;
    let transport = server.transport.unwrap_or(Transport::Tcp);
    let warmup = options
        .warmup
        .unwrap_or(!matches!(experiment.system, System::Arachne | System::Zygos));

    let mut args = CLIENT_ARGS.to_string();
    if options.rampup.is_some() {
        args.push_str(" --rampup={rampup}");
    }
    if let Some(extra) = &options.extra_args {
        args.push(' ');
        args.push_str(extra);
    }

    let mut created = Vec::with_capacity(count);
    for i in 0..count {
        let host = hosts[(experiment.next_client_assign + i) % hosts.len()].clone();
        let mut client = ClientInstance {
            name: format!("{}-{}.{}", i, host, server.name),
            host: host.clone(),
            app: AppKind::Synthetic,
            net: NetIdentity {
                ip: allocate_ip(experiment, &testbed.config, true)?,
                port: None,
                mac: random_mac(),
            },
            resources: Resources::default(),
            binary: CLIENT_BINARY.to_string(),
            serverip: server.net.ip.clone(),
            serverport: server.net.port,
            protocol: protocol.clone(),
            transport,
            output: options.output.clone(),
            mpps: mpps / count as f64,
            start_mpps: options.start_mpps / count as f64,
            distribution: options.distribution.clone(),
            mean: options.mean,
            client_threads: options.nconns / count,
            warmup: if warmup { "--warmup".to_string() } else { String::new() },
            args: args.clone(),
            runtime: 0,
            samples: 0,
            npeers: 0,
            leader: String::new(),
            before: vec![],
            params: BTreeMap::new(),
        };
        if let Some(rampup) = options.rampup {
            client
                .params
                .insert("rampup".to_string(), (rampup / count as f64).into());
        }

        experiment
            .clients
            .entry(host)
            .or_default()
            .push(client.clone());
        created.push(client);
    }
    experiment.next_client_assign += count;

    Ok(created)
}

/// Fixes the per-client thread budget and the synchronization roles once every client has
/// been placed. Client 0 (in host order) leads; every follower is told the leader's
/// out-of-band address and starts a few seconds late.
pub fn finalize_measurement_cohort(
    experiment: &mut Experiment,
    testbed: &Testbed,
    samples: usize,
    runtime: u64,
) -> anyhow::Result<()> {
    let cores = testbed.config.clients.cores;
    let (busiest, max_per_host) = experiment
        .clients
        .iter()
        .map(|(host, clients)| (host.clone(), clients.len()))
        .min_by_key(|(_, n)| Reverse(*n))
        .ok_or_else(|| ExperimentError::precondition("experiment has no clients to finalize"))?;
    if max_per_host > cores {
        return Err(ExperimentError::CoreBudgetExceeded {
            host: busiest,
            instances: max_per_host,
            cores,
        }
        .into());
    }
    experiment.check_unique_names()?;

    let threads_per_client = cores / max_per_host;
    if threads_per_client % 2 != 0 {
        warn!(
            "{} threads per client leaves hyperthread siblings split across instances",
            threads_per_client
        );
    }

    let leader_host = experiment
        .all_clients()
        .next()
        .map(|client| client.host.clone())
        .unwrap_or_default();
    let leader_oob = testbed.config.oob_ip(&leader_host)?.to_string();
    let npeers = experiment.all_clients().count();

    for (i, client) in experiment.clients.values_mut().flatten().enumerate() {
        client.resources.threads = threads_per_client;
        client.resources.guaranteed = threads_per_client;
        client.resources.spin = threads_per_client;
        client.runtime = runtime;
        client.samples = samples;
        client.npeers = npeers;
        if i == 0 {
            client.leader = client.host.clone();
        } else {
            client.leader = leader_oob.clone();
            client.before = vec![Hook::Sleep5];
        }
    }

    experiment.add_client_file(testbed.config.client_binary());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter::testing, template};
    use itertools::Itertools;

    #[test]
    fn memcached_args_follow_the_system() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;

        let mut exp = Experiment::new(System::Arachne, "zig", &[]);
        let mc = new_memcached_server(8, &mut exp, &testbed, "memcached", Transport::Tcp)?;
        assert!(mc.args.starts_with("--minNumCores 2 --maxNumCores {threads} -t 1 -U {port}"));
        assert!(mc.args.ends_with("no_slab_reassign"));

        let mut exp = Experiment::new(System::Linux, "zig", &[]);
        let mc = new_memcached_server(2, &mut exp, &testbed, "memcached", Transport::Udp)?;
        let args = template::render(&mc.args, &template::fields_of(&mc)?)?;
        let port = mc.net.port.unwrap_or_default();
        assert!(args.starts_with(&format!("-t 2 -U {port} -p {port} -c 32768 -m 32000", port = port)));
        assert_eq!(args.matches(&format!("192.168.18.9:{}", port)).count(), 8);

        let mut exp = Experiment::new(System::LinuxFloating, "zig", &[]);
        assert!(new_memcached_server(2, &mut exp, &testbed, "memcached", Transport::Tcp).is_err());
        Ok(())
    }

    #[test]
    fn dns_on_the_runtime_listens_on_53() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let mut exp = Experiment::new(System::Shenango, "zig", &[]);
        let port_before = exp.nextport;
        let dns = new_gdnsd_server(6, &mut exp, &testbed, "dns")?;
        assert_eq!(dns.net.port, Some(53));
        assert_eq!(exp.nextport, port_before);
        assert_eq!(dns.before, vec![Hook::ConfigureDnsEnvironment]);
        Ok(())
    }

    #[test]
    fn udp_synthetic_is_rejected_where_unsupported() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let mut exp = Experiment::new(System::Zygos, "zig", &[]);
        let options = SyntheticOptions {
            transport: Transport::Udp,
            ..Default::default()
        };
        assert!(new_synthetic_server(4, &mut exp, &testbed, options).is_err());
        assert!(exp.apps.is_empty());
        Ok(())
    }

    #[test]
    fn clients_are_spread_round_robin_across_calls() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let mut exp = Experiment::new(System::Shenango, "zig", &[]);
        let mc = new_memcached_server(3, &mut exp, &testbed, "memcached", Transport::Tcp)?;
        let dns = new_gdnsd_server(4, &mut exp, &testbed, "dns")?;

        let first = new_measurement_instances(1, &mc, 1.0, &mut exp, &testbed, Default::default())?;
        let second = new_measurement_instances(1, &dns, 3.0, &mut exp, &testbed, Default::default())?;
        assert_eq!(first[0].host, "pd3");
        assert_eq!(second[0].host, "pd4");
        assert_eq!(exp.next_client_assign, 2);
        Ok(())
    }

    #[test]
    fn load_and_connections_are_split_evenly() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let mut exp = Experiment::new(System::Arachne, "zig", &[]);
        let synth = new_synthetic_server(4, &mut exp, &testbed, SyntheticOptions::default())?;
        let options = MeasurementOptions {
            nconns: 1200,
            rampup: Some(4.0),
            ..Default::default()
        };
        let clients = new_measurement_instances(4, &synth, 2.0, &mut exp, &testbed, options)?;

        assert_eq!(clients.len(), 4);
        for client in &clients {
            assert_eq!(client.mpps, 0.5);
            assert_eq!(client.client_threads, 300);
            assert_eq!(client.warmup, "");
            assert_eq!(client.params.get("rampup"), Some(&serde_json::json!(1.0)));
            assert!(client.args.ends_with(" --rampup={rampup}"));
        }
        assert_eq!(exp.clients["pd3"].len(), 2);
        assert_eq!(exp.clients["pd4"].len(), 2);
        Ok(())
    }

    #[test]
    fn finalization_assigns_roles() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let mut exp = Experiment::new(System::Shenango, "zig", &[]);
        let synth = new_synthetic_server(14, &mut exp, &testbed, SyntheticOptions::default())?;
        new_measurement_instances(4, &synth, 1.0, &mut exp, &testbed, Default::default())?;
        finalize_measurement_cohort(&mut exp, &testbed, 20, 10)?;

        let clients = exp.all_clients().collect_vec();
        assert_eq!(clients[0].leader, "pd3");
        assert!(clients[0].before.is_empty());
        for follower in &clients[1..] {
            assert_eq!(follower.leader, "18.26.5.3");
            assert_eq!(follower.before, vec![Hook::Sleep5]);
        }
        for client in &clients {
            assert_eq!(client.resources.threads, 3);
            assert_eq!(client.npeers, 4);
            assert_eq!((client.samples, client.runtime), (20, 10));
        }
        assert!(exp
            .client_files
            .contains(&"/home/bench/shenango/apps/synthetic/target/release/synthetic".to_string()));

        let rendered = template::render(&clients[1].args, &template::fields_of(clients[1])?)?;
        assert!(rendered.contains("--barrier-peers 4 --barrier-leader 18.26.5.3"));
        assert!(rendered.contains(" --warmup "));
        Ok(())
    }

    #[test]
    fn finalization_rejects_overloaded_hosts() -> anyhow::Result<()> {
        let testbed = testing::testbed("zig")?;
        let mut exp = Experiment::new(System::Shenango, "zig", &[]);
        let synth = new_synthetic_server(14, &mut exp, &testbed, SyntheticOptions::default())?;
        new_measurement_instances(14, &synth, 1.0, &mut exp, &testbed, Default::default())?;

        let err = finalize_measurement_cohort(&mut exp, &testbed, 20, 10).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ExperimentError>(),
            Some(&ExperimentError::CoreBudgetExceeded {
                host: "pd3".to_string(),
                instances: 7,
                cores: 6,
            })
        );
        Ok(())
    }
}
