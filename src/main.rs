/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use colored::Colorize;
use netexp::{
    clap_args::{self, Commands},
    cluster::Cluster,
    config::{Config, RemoteTransport},
    execution_modes::{client, observer, replay, server},
    lifecycle::{install_interrupt_handler, CleanupGuard},
    testbed::Testbed,
};
use tracing::{error, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    init_subscriber(get_subscriber(level.into()));

    let command = args.command();
    let Some(mode) = command.mode() else {
        Config::write_example_to_file(&args.config)?;
        println!("> wrote {}", args.config.to_string_lossy().green());
        return Ok(());
    };

    let mut config = Config::try_from_path(&args.config)?;
    if let Some(hostname) = args.hostname {
        config.cluster.hostname = Some(hostname);
    }
    let testbed = Testbed::new(config, &args.config)?;
    let cluster = Cluster::new(&testbed.config.cluster);
    let token = install_interrupt_handler(&testbed)?;

    // with the local transport every "host" shares this machine's processes
    let shares_process_table =
        mode.is_remote() && testbed.config.cluster.transport == RemoteTransport::Local;
    let dry_run = matches!(command, Commands::Server { dry_run: true });
    let guard = (!shares_process_table && !dry_run).then(|| CleanupGuard::new(&testbed));

    let result = match &command {
        Commands::Server { dry_run } => {
            server::run_plan(
                &testbed.config.experiments,
                &testbed,
                &cluster,
                &token,
                *dry_run,
            )
            .await
        }
        Commands::Client { dir } => client::run_client(dir, &testbed, &token).await,
        Commands::Observer { dir } => observer::run_observer(dir, &testbed, &token).await,
        Commands::Replay { path } => replay::replay(path, &testbed, &cluster, &token).await,
        Commands::Init => Ok(()),
    };

    if let Some(guard) = guard {
        guard.run();
    }
    if let Err(err) = &result {
        error!("{:#}", err);
    }
    result
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) {
    if let Err(err) = set_global_default(subscriber) {
        eprintln!("Unable to install the log subscriber: {}", err);
    }
}
