//! Host environment checks.

use anyhow::Result;
use tracing::{info, warn};

use hyperfleet_daemon::config::Configuration;

fn check_binary(label: &str, path: &std::path::Path) {
    if path.exists() {
        info!("{}: {} found", label, path.display());
    } else {
        warn!("{}: {} not found", label, path.display());
    }
}

fn check_cli(label: &str, cli: &str) {
    match std::process::Command::new(cli).arg("version").output() {
        Ok(output) if output.status.success() => info!("{}: {} responds", label, cli),
        Ok(_) => warn!("{}: {} errored", label, cli),
        Err(e) => warn!("{}: {} unavailable ({})", label, cli, e),
    }
}

pub async fn run(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path)?;

    check_binary("firecracker", &config.runtimes.firecracker_path);
    if let Some(jailer) = &config.runtimes.jailer_path {
        check_binary("jailer", jailer);
    }
    check_binary("cloud-hypervisor", &config.runtimes.cloud_hypervisor_path);
    check_cli("docker", &config.runtimes.docker_cli);
    check_cli("nftables", "nft");

    if std::path::Path::new("/dev/net/tun").exists() {
        info!("tun: /dev/net/tun present");
    } else {
        warn!("tun: /dev/net/tun missing; guest networking will not work");
    }

    match std::fs::read_to_string("/proc/sys/net/ipv4/ip_forward") {
        Ok(value) if value.trim() == "1" => info!("ip_forward: enabled"),
        Ok(_) => info!("ip_forward: disabled (the daemon enables it at startup)"),
        Err(e) => warn!("ip_forward: unreadable ({})", e),
    }

    Ok(())
}
