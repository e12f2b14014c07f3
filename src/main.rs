use std::net::IpAddr;

use log::{error, info};

use nds_core::config::{DeviceConfig, DhcpPoolV4, DnsRecord, SimulatorConfig};
use nds_core::lifecycle::Simulator;
use nds_core::utils::logger::init_logger;

/// Built-in demonstration topology. The real configuration loaders (YAML,
/// REST) live outside this crate and hand the core a normalized
/// [`SimulatorConfig`] just like this one.
fn demo_config(interface: String) -> SimulatorConfig {
    let mut cfg = SimulatorConfig::new(interface);

    let mut router = DeviceConfig::new(
        "edge-router",
        "router",
        "02:00:00:00:10:01".parse().expect("static MAC"),
    );
    router.ips.push("10.0.10.1".parse::<IpAddr>().expect("static IP"));
    router.icmp.enabled = true;
    router.lldp.enabled = true;
    router.snmp.enabled = true;
    router.snmp.sysdescr = Some("Edge Router, simulated".into());
    let mut pool = DhcpPoolV4::new(
        "10.0.10.0/24".parse().expect("static CIDR"),
        "10.0.10.100".parse().expect("static IP"),
        "10.0.10.200".parse().expect("static IP"),
    );
    pool.gateway = Some("10.0.10.1".parse().expect("static IP"));
    pool.dns_servers = vec!["10.0.10.2".parse().expect("static IP")];
    router.dhcp.enabled = true;
    router.dhcp.pools.push(pool);
    cfg.devices.push(router);

    let mut server = DeviceConfig::new(
        "file-server",
        "server",
        "02:00:00:00:10:02".parse().expect("static MAC"),
    );
    server.ips.push("10.0.10.2".parse::<IpAddr>().expect("static IP"));
    server.icmp.enabled = true;
    server.dns.enabled = true;
    server
        .dns
        .forward_records
        .push(DnsRecord::new("files.lab.local", "10.0.10.2".parse().expect("static IP")));
    server.netbios.enabled = true;
    server.netbios.name = "FILESRV".into();
    cfg.devices.push(server);

    cfg
}

#[tokio::main]
async fn main() {
    init_logger("log", 2).expect("logger init failed");

    let interface = std::env::args().nth(1).unwrap_or_else(|| "eth0".to_string());
    info!("simulating on {interface}");

    let mut simulator = match Simulator::new(demo_config(interface)) {
        Ok(sim) => sim,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = simulator.start().await {
        error!("start failed: {e}");
        std::process::exit(1);
    }

    tokio::signal::ctrl_c().await.expect("signal handler");
    info!("shutting down");
    let report = simulator.stop().await;
    if !report.completed {
        error!("{} task(s) did not stop in time", report.unfinished_tasks);
    }
}
