/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Returns a host to a clean, re-runnable state whatever happened before: every benchmark
//! process is killed and, on servers, the bypass stack's kernel modules are unloaded.

use crate::testbed::Testbed;
use colored::*;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Process names (as matched by `pkill`) of everything an experiment may leave running.
pub const BENCHMARK_PROCESSES: [&str; 11] = [
    "iokerneld",
    "cstate",
    "memcached",
    "swaptions",
    "mpstat",
    "synthetic",
    "gdnsd",
    "coreArbit",
    "ix",
    "spin-arachne",
    "spin-linux",
];

const SERVER_MODULES: [&str; 2] = ["dune", "pcidma"];

/// SIGTERM then SIGKILL to every benchmark process, then module removal on servers. Safe to
/// call any number of times; nothing here can fail.
pub fn cleanup(testbed: &Testbed) {
    println!("> cleaning up {}", testbed.hostname.green());

    for signal in ["", "-9 "] {
        for name in BENCHMARK_PROCESSES {
            testbed
                .shell
                .run_best_effort(&format!("sudo pkill {}{}", signal, name));
        }
    }

    if testbed.is_server() {
        for module in SERVER_MODULES {
            testbed
                .shell
                .run_best_effort(&format!("sudo rmmod {} 2>/dev/null || true", module));
        }
    }

    let survivors = surviving_processes();
    if survivors.is_empty() {
        println!("\t{}", "✓".green());
    } else {
        warn!("still running after cleanup: {}", survivors.join(", "));
    }
}

/// Benchmark processes visible to this user after cleanup.
pub fn surviving_processes() -> Vec<String> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    let mut names: Vec<String> = system
        .processes()
        .values()
        .map(|process| process.name().to_string_lossy().into_owned())
        .filter(|name| BENCHMARK_PROCESSES.iter().any(|target| name.starts_with(target)))
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Runs `cleanup` when dropped, so every exit path out of a run (including `?` and panics)
/// leaves the host clean.
pub struct CleanupGuard {
    testbed: Testbed,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(testbed: &Testbed) -> Self {
        CleanupGuard {
            testbed: testbed.clone(),
            armed: true,
        }
    }

    /// Cleans up now instead of on drop.
    pub fn run(mut self) {
        self.armed = false;
        cleanup(&self.testbed);
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            cleanup(&self.testbed);
        }
    }
}

/// The first Ctrl-C cancels the returned token so the current run can unwind (collect what
/// exists, stop its processes, clean up). A second one cleans up and exits immediately.
pub fn install_interrupt_handler(testbed: &Testbed) -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let interrupts = Arc::new(AtomicUsize::new(0));

    let handler_token = token.clone();
    let testbed = testbed.clone();
    ctrlc::set_handler(move || {
        if interrupts.fetch_add(1, Ordering::SeqCst) == 0 {
            info!("interrupted, stopping the current experiment (press Ctrl-C again to abort)");
            handler_token.cancel();
        } else {
            cleanup(&testbed);
            std::process::exit(130);
        }
    })?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, EXAMPLE_CONFIG},
        shell::testing::RecordingShell,
    };

    fn testbed(host: &str, shell: Arc<RecordingShell>) -> anyhow::Result<Testbed> {
        Ok(Testbed::with_shell(
            Config::try_from_str(EXAMPLE_CONFIG)?,
            host,
            shell,
        ))
    }

    #[test]
    fn term_before_kill_for_every_process() -> anyhow::Result<()> {
        let shell = Arc::new(RecordingShell::default());
        cleanup(&testbed("pd3", shell.clone())?);

        let commands = shell.commands();
        assert_eq!(commands.len(), 2 * BENCHMARK_PROCESSES.len());
        assert_eq!(commands[0], "sudo pkill iokerneld");
        assert_eq!(commands[BENCHMARK_PROCESSES.len()], "sudo pkill -9 iokerneld");
        assert!(!commands.iter().any(|c| c.contains("rmmod")));
        Ok(())
    }

    #[test]
    fn servers_also_unload_modules() -> anyhow::Result<()> {
        let shell = Arc::new(RecordingShell::default());
        cleanup(&testbed("zig", shell.clone())?);

        let commands = shell.commands();
        assert!(commands.contains(&"sudo rmmod dune 2>/dev/null || true".to_string()));
        assert!(commands.contains(&"sudo rmmod pcidma 2>/dev/null || true".to_string()));
        Ok(())
    }

    #[test]
    fn cleanup_twice_with_everything_already_gone() -> anyhow::Result<()> {
        // every command fails, as it does once nothing is left to kill
        let shell = Arc::new(RecordingShell::failing(&["pkill", "rmmod"]));
        let testbed = testbed("zig", shell.clone())?;
        cleanup(&testbed);
        let first = shell.commands().len();
        cleanup(&testbed);
        assert_eq!(shell.commands().len(), 2 * first);
        Ok(())
    }

    #[test]
    fn guard_cleans_up_exactly_once() -> anyhow::Result<()> {
        let shell = Arc::new(RecordingShell::default());
        let testbed = testbed("pd3", shell.clone())?;
        {
            let _guard = CleanupGuard::new(&testbed);
        }
        let after_drop = shell.commands().len();
        assert_eq!(after_drop, 2 * BENCHMARK_PROCESSES.len());

        CleanupGuard::new(&testbed).run();
        assert_eq!(shell.commands().len(), 2 * after_drop);
        Ok(())
    }
}
