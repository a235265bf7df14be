/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Brings the server NIC into the mode the next experiment needs. Every step tolerates the
//! state it is trying to reach already being in place, so switching twice is harmless.

use crate::testbed::Testbed;
use tracing::info;

/// Standard kernel driver: unbind any userspace driver, rebind `ixgbe`, steer IRQs to the
/// usable CPUs and put the kernel-stack address back on the interface.
pub fn switch_to_linux(testbed: &Testbed) -> anyhow::Result<()> {
    testbed.require_server()?;
    info!("switching {} to the kernel network stack", testbed.hostname);

    let paths = &testbed.config.paths;
    let net = &testbed.config.network;
    let devbind = format!("{}/dpdk/usertools/dpdk-devbind.py", paths.shenango_dir);
    let linux_ip = testbed.config.linux_ip(&testbed.hostname)?;

    testbed.run(&format!("sudo ifdown {} || true", net.nic_ifname))?;
    testbed.run(&format!("sudo {} || true", paths.script("setup_machine.sh")))?;
    testbed.run(&format!("sudo {} -b none {} || true", devbind, net.nic_pci))?;
    testbed.run("sudo modprobe ixgbe")?;
    testbed.run(&format!("sudo {} -b ixgbe {}", devbind, net.nic_pci))?;
    testbed.run(&format!(
        "sudo ethtool -N {} rx-flow-hash udp4 sdfn",
        net.nic_ifname
    ))?;
    testbed.run(&format!(
        "sudo {} {} {}",
        paths.script("set_irq_affinity"),
        testbed.config.usable_cpus_str(),
        net.nic_ifname
    ))?;
    testbed.run(&format!("sudo ip addr flush {}", net.nic_ifname))?;
    testbed.run(&format!(
        "sudo ip addr add {}/24 dev {}",
        linux_ip, net.nic_ifname
    ))?;
    testbed.run("sudo sysctl net.ipv4.tcp_syncookies=1")?;

    Ok(())
}

/// Bespoke runtime: detach the kernel driver and hand the NIC to `igb_uio`. Non-server hosts
/// only run the machine setup script; their NICs stay untouched.
pub fn switch_to_shenango(testbed: &Testbed) -> anyhow::Result<()> {
    let paths = &testbed.config.paths;
    let net = &testbed.config.network;

    testbed.run(&format!("sudo {} || true", paths.script("setup_machine.sh")))?;
    if !testbed.is_server() {
        return Ok(());
    }
    info!("switching {} to the userspace I/O driver", testbed.hostname);

    testbed.run(&format!("sudo ifdown {} || true", net.nic_ifname))?;
    testbed.run("sudo modprobe uio")?;
    testbed.run(&format!(
        "(lsmod | grep -q igb_uio) || sudo insmod {}/dpdk/build/kmod/igb_uio.ko",
        paths.shenango_dir
    ))?;
    testbed.run(&format!(
        "sudo {}/dpdk/usertools/dpdk-devbind.py -b igb_uio {}",
        paths.shenango_dir, net.nic_pci
    ))?;

    Ok(())
}

/// Alternate kernel-bypass stack: swap the kernel modules for its own `dune`/`pcidma`/`igb_uio`
/// builds and rebind the NIC with its bind tool.
pub fn switch_to_zygos(testbed: &Testbed) -> anyhow::Result<()> {
    testbed.require_server()?;
    info!("switching {} to the ix dataplane", testbed.hostname);

    let paths = &testbed.config.paths;
    let deps = format!("{}/zygos/deps", paths.base_dir);
    let nic_pci = &testbed.config.network.nic_pci;

    testbed.run("sudo find /dev/hugepages -type f -delete")?;
    testbed.run(&format!("sudo {} || true", paths.script("setup_machine.sh")))?;
    testbed.run("sudo modprobe -r ixgbe || true")?;
    testbed.run("sudo rmmod dune 2>&1 || true")?;
    testbed.run("sudo rmmod pcidma 2>&1 || true")?;
    testbed.run(&format!("sudo insmod {}/dune/kern/dune.ko", deps))?;
    testbed.run(&format!("sudo insmod {}/pcidma/pcidma.ko", deps))?;
    testbed.run("sudo modprobe uio")?;
    testbed.run("sudo rmmod igb_uio 2>&1 || true")?;
    testbed.run(&format!("sudo insmod {}/dpdk/build/kmod/igb_uio.ko", deps))?;
    testbed.run(&format!(
        "sudo {}/dpdk/tools/dpdk_nic_bind.py -b igb_uio {}",
        deps, nic_pci
    ))?;
    testbed.run("sudo rm -fr /var/run/.rte_config")?;

    Ok(())
}
