//! Lifecycle controller: builds a run out of the normalized configuration,
//! starts every task the run needs, and tears it all down again.
//!
//! The shutdown signal is a fresh `watch` channel per run; a stopped
//! controller can always be started again. `stop()` closes the capture
//! handle first so an in-flight read returns within one read timeout, then
//! fires the signal, then waits on the task set with a bounded deadline.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::SimulatorConfig;
use crate::core::device::{CounterSnapshot, Device, DeviceCounters, DeviceState};
use crate::core::errors::CoreError;
use crate::core::table::DeviceTable;
use crate::dispatch::{DispatchStats, DispatchStatsSnapshot, Dispatcher, HandlerRegistry};
use crate::errorinj::{ErrorKind, ErrorRecord, ErrorStateManager};
use crate::netio::capture::{
    CaptureEngine, CaptureOptions, FrameSink, FrameSource, OpenCapture,
};
use crate::netio::ratelimit::RateLimiter;
use crate::netio::replay::ReplaySource;
use crate::proto::arp;
use crate::proto::discovery::{advertise_loop, DiscoveryProtocol};
use crate::proto::stp::bpdu_loop;
use crate::proto::{dns::DnsHandler, ftp::FtpHandler, http::HttpHandler, icmp::IcmpHandler,
    icmpv6::Icmpv6Handler, netbios::NetbiosHandler};
use crate::dhcp::v4::{DhcpV4Handler, DhcpV4Server};
use crate::dhcp::v6::{DhcpV6Handler, DhcpV6Server};
use crate::snmp::mib::well_known;
use crate::snmp::trap::{ThresholdPoller, TrapSender};
use crate::snmp::value::MibValue;
use crate::snmp::SnmpHandler;
use crate::traffic::TrafficGenerator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: bool,
    pub unfinished_tasks: usize,
}

struct RunState {
    run_id: Uuid,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
    capture: Option<CaptureEngine>,
    table: Arc<DeviceTable>,
    stats: Arc<DispatchStats>,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn FrameSink>,
    trap_senders: HashMap<String, Arc<TrapSender>>,
    replay_stop: Option<watch::Sender<bool>>,
}

pub struct Simulator {
    config: SimulatorConfig,
    errors: Arc<ErrorStateManager>,
    run: Option<RunState>,
}

impl Simulator {
    /// Validates the configuration; the core refuses to exist otherwise.
    pub fn new(config: SimulatorConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            config,
            errors: Arc::new(ErrorStateManager::new()),
            run: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Opens the configured interface and starts the run on it.
    pub async fn start(&mut self) -> Result<(), CoreError> {
        if self.run.is_some() {
            return Err(CoreError::AlreadyRunning);
        }
        let opts = CaptureOptions {
            interface: self.config.interface.clone(),
            snaplen: self.config.snaplen,
            promiscuous: self.config.promiscuous,
            read_timeout: self.config.read_timeout,
        };
        let mut open = OpenCapture::open(&opts)?;
        if let Some(filter) = &self.config.capture_filter {
            open.set_filter(filter)?;
        }
        let (engine, source, sink) = open.start();
        self.start_inner(Box::new(source), Arc::new(sink), Some(engine))
            .await
    }

    /// Starts the run on caller-provided frame seams. Used by embedders and
    /// every integration test.
    pub async fn start_with_link(
        &mut self,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<(), CoreError> {
        if self.run.is_some() {
            return Err(CoreError::AlreadyRunning);
        }
        self.start_inner(source, sink, None).await
    }

    async fn start_inner(
        &mut self,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        capture: Option<CaptureEngine>,
    ) -> Result<(), CoreError> {
        let run_id = Uuid::new_v4();
        info!("starting run {run_id} with {} devices", self.config.devices.len());

        // Fresh per run: a closed signal is never reused.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limiter = RateLimiter::new(self.config.rate_limit_pps, shutdown_rx.clone());
        let mut tasks: JoinSet<()> = JoinSet::new();

        // Devices, SNMP agents, trap senders, DHCP servers.
        let walk_base = self.config.walk_base_dir.as_deref();
        let mut devices = Vec::with_capacity(self.config.devices.len());
        let mut trap_senders: HashMap<String, Arc<TrapSender>> = HashMap::new();
        let mut v4_servers: HashMap<String, Arc<DhcpV4Server>> = HashMap::new();
        let mut v6_servers: HashMap<String, Arc<DhcpV6Server>> = HashMap::new();

        for dev_cfg in &self.config.devices {
            let counters = Arc::new(DeviceCounters::default());
            let agent = if dev_cfg.snmp.enabled {
                Some(crate::snmp::agent::SnmpAgent::new(
                    dev_cfg,
                    walk_base,
                    counters.clone(),
                    self.errors.clone(),
                )?)
            } else {
                None
            };
            let device = Arc::new(Device::new(dev_cfg.clone(), agent, counters));

            if dev_cfg.snmp.enabled
                && dev_cfg.snmp.traps.enabled
                && !dev_cfg.snmp.traps.receivers.is_empty()
            {
                let sender = Arc::new(TrapSender::bind(&dev_cfg.snmp.traps).await?);
                trap_senders.insert(dev_cfg.name.clone(), sender);
            }
            if dev_cfg.dhcp.enabled {
                let server_id = dev_cfg
                    .first_ipv4()
                    .or_else(|| dev_cfg.dhcp.pools.first().and_then(|p| p.gateway))
                    .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
                v4_servers.insert(
                    dev_cfg.name.clone(),
                    Arc::new(DhcpV4Server::new(&dev_cfg.dhcp, server_id)),
                );
            }
            if dev_cfg.dhcpv6.enabled {
                v6_servers.insert(
                    dev_cfg.name.clone(),
                    Arc::new(DhcpV6Server::new(&dev_cfg.dhcpv6, device.mac())),
                );
            }
            devices.push(device);
        }
        let table = Arc::new(DeviceTable::new(devices));

        // Handler registration.
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(arp::ArpHandler));
        registry.register(Arc::new(IcmpHandler));
        registry.register(Arc::new(Icmpv6Handler));
        registry.register(Arc::new(DnsHandler));
        registry.register(Arc::new(NetbiosHandler));
        registry.register(Arc::new(SnmpHandler::new(trap_senders.clone())));
        registry.register(Arc::new(DhcpV4Handler::new(v4_servers.clone())));
        registry.register(Arc::new(DhcpV6Handler::new(v6_servers.clone())));
        let http_ports = self
            .config
            .devices
            .iter()
            .filter(|d| d.http.enabled)
            .map(|d| d.http.port);
        registry.register(Arc::new(HttpHandler::new(http_ports)));
        let ftp_ports = self
            .config
            .devices
            .iter()
            .filter(|d| d.ftp.enabled)
            .map(|d| d.ftp.port);
        registry.register(Arc::new(FtpHandler::new(ftp_ports)));

        // Dispatcher task.
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(
            table.clone(),
            registry.clone(),
            sink.clone(),
            limiter.clone(),
            stats.clone(),
            shutdown_rx.clone(),
        );
        tasks.spawn(dispatcher.run(source));

        // Per-device periodic tasks.
        for device in table.all() {
            device.set_state(DeviceState::Up);
            let cfg = device.config();

            for protocol in [
                DiscoveryProtocol::Lldp,
                DiscoveryProtocol::Cdp,
                DiscoveryProtocol::Edp,
                DiscoveryProtocol::Fdp,
            ] {
                if protocol.enabled(cfg) {
                    tasks.spawn(advertise_loop(
                        device.clone(),
                        protocol,
                        sink.clone(),
                        limiter.clone(),
                        shutdown_rx.clone(),
                    ));
                }
            }
            if cfg.stp.enabled {
                tasks.spawn(bpdu_loop(
                    device.clone(),
                    sink.clone(),
                    limiter.clone(),
                    shutdown_rx.clone(),
                ));
            }
            if cfg.traffic.enabled {
                let generator =
                    TrafficGenerator::new(device.clone(), sink.clone(), limiter.clone());
                tasks.spawn(generator.run(shutdown_rx.clone()));
            }
            if let Some(server) = v4_servers.get(device.name()) {
                tasks.spawn(sweeper_loop(server.clone(), shutdown_rx.clone(), "dhcpv4"));
            }
            if let Some(server) = v6_servers.get(device.name()) {
                tasks.spawn(sweeper_v6_loop(server.clone(), shutdown_rx.clone()));
            }
            if let Some(sender) = trap_senders.get(device.name()) {
                let traps = &cfg.snmp.traps;
                if traps.thresholds.high_cpu.is_some()
                    || traps.thresholds.high_memory.is_some()
                    || traps.thresholds.high_disk.is_some()
                    || traps.thresholds.interface_errors.is_some()
                {
                    let poller = ThresholdPoller::new(
                        device.clone(),
                        self.errors.clone(),
                        sender.clone(),
                        traps.thresholds.clone(),
                        traps.poll_interval,
                    );
                    tasks.spawn(poller.run(shutdown_rx.clone()));
                }
            }

            // Announce presence once on entering Up.
            if let Some(ip) = cfg.first_ipv4() {
                if limiter.acquire().await {
                    let _ = sink.send_frame(arp::build_gratuitous(device.mac(), ip)).await;
                }
            }
        }

        // coldStart traps once everything is live.
        for device in table.all() {
            if let Some(sender) = trap_senders.get(device.name()) {
                if sender.toggles().cold_start {
                    let uptime = device.agent().map(|a| a.uptime_ticks()).unwrap_or(0);
                    sender
                        .send(uptime, well_known::trap_cold_start(), Vec::new())
                        .await;
                }
            }
        }

        self.run = Some(RunState {
            run_id,
            shutdown_tx,
            tasks,
            capture,
            table,
            stats,
            limiter,
            sink,
            trap_senders,
            replay_stop: None,
        });
        info!("run {run_id} started");
        Ok(())
    }

    /// Graceful shutdown. Idempotent; safe to call on a stopped controller.
    pub async fn stop(&mut self) -> ShutdownReport {
        let Some(mut run) = self.run.take() else {
            return ShutdownReport { completed: true, unfinished_tasks: 0 };
        };
        info!("stopping run {}", run.run_id);

        for device in run.table.all() {
            device.set_state(DeviceState::Stopping);
        }
        // Capture first, so an in-flight read unblocks promptly.
        if let Some(mut engine) = run.capture.take() {
            engine.close();
        }
        if let Some(replay) = run.replay_stop.take() {
            let _ = replay.send(true);
        }
        let _ = run.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, run.tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "shutdown deadline reached with {} task(s) unfinished",
                        run.tasks.len()
                    );
                    let unfinished = run.tasks.len();
                    run.tasks.abort_all();
                    return ShutdownReport { completed: false, unfinished_tasks: unfinished };
                }
            }
        }
        debug!("run {} fully stopped", run.run_id);
        ShutdownReport { completed: true, unfinished_tasks: 0 }
    }

    // In-process control surface consumed by the admin collaborators.

    pub fn inject_error(&self, device_ip: IpAddr, interface: &str, kind: ErrorKind, magnitude: u8) {
        self.errors.set(device_ip, interface, kind, magnitude);
    }

    pub fn clear_errors(&self, device_ip: IpAddr, interface: &str) {
        self.errors.clear(device_ip, interface);
    }

    pub fn clear_all_errors(&self) {
        self.errors.clear_all();
    }

    pub fn list_errors(&self) -> Vec<ErrorRecord> {
        self.errors.list()
    }

    pub fn error_state(&self) -> Arc<ErrorStateManager> {
        self.errors.clone()
    }

    /// Operator-driven state transition; fires linkUp/linkDown traps on the
    /// Up/Down edges when the device has them enabled.
    pub async fn set_device_state(&mut self, name: &str, state: DeviceState) -> Result<(), CoreError> {
        let run = self.run.as_ref().ok_or(CoreError::NotRunning)?;
        let device = run
            .table
            .get(name)
            .ok_or_else(|| CoreError::UnknownDevice(name.to_string()))?;
        let previous = device.set_state(state);
        info!("device {name}: {previous:?} -> {state:?}");

        let trap = match (previous, state) {
            (DeviceState::Up, DeviceState::Down) => Some((well_known::trap_link_down(), 2)),
            (DeviceState::Down, DeviceState::Up) => Some((well_known::trap_link_up(), 1)),
            _ => None,
        };
        if let Some((trap_oid, oper_status)) = trap {
            if let Some(sender) = run.trap_senders.get(name) {
                let wanted = match oper_status {
                    1 => sender.toggles().link_up,
                    _ => sender.toggles().link_down,
                };
                if wanted {
                    let uptime = device.agent().map(|a| a.uptime_ticks()).unwrap_or(0);
                    sender
                        .send(
                            uptime,
                            trap_oid,
                            vec![(
                                well_known::if_column(well_known::IF_OPER_STATUS, 1),
                                MibValue::Integer32(oper_status),
                            )],
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    pub fn device_counters(&self, name: &str) -> Option<CounterSnapshot> {
        let run = self.run.as_ref()?;
        run.table.get(name).map(|d| d.counters().snapshot())
    }

    pub fn dispatch_stats(&self) -> Option<DispatchStatsSnapshot> {
        self.run.as_ref().map(|r| r.stats.snapshot())
    }

    pub fn rate_limit_drops(&self) -> u64 {
        self.run.as_ref().map(|r| r.limiter.dropped()).unwrap_or(0)
    }

    /// Streams a replay source onto the wire, paced by its recorded gaps.
    pub fn start_replay(&mut self, mut source: Box<dyn ReplaySource>) -> Result<(), CoreError> {
        let run = self.run.as_mut().ok_or(CoreError::NotRunning)?;
        if let Some(previous) = run.replay_stop.take() {
            let _ = previous.send(true);
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let sink = run.sink.clone();
        let limiter = run.limiter.clone();
        let mut shutdown = run.shutdown_tx.subscribe();
        run.tasks.spawn(async move {
            while let Some((gap, frame)) = source.next_frame() {
                tokio::select! {
                    _ = tokio::time::sleep(gap) => {}
                    stopped = stop_rx.changed() => {
                        if stopped.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if limiter.acquire().await {
                    let _ = sink.send_frame(frame).await;
                }
            }
            debug!("replay task finished");
        });
        run.replay_stop = Some(stop_tx);
        Ok(())
    }

    pub fn stop_replay(&mut self) {
        if let Some(run) = self.run.as_mut() {
            if let Some(stop) = run.replay_stop.take() {
                let _ = stop.send(true);
            }
        }
    }
}

async fn sweeper_loop(
    server: Arc<DhcpV4Server>,
    mut shutdown: watch::Receiver<bool>,
    label: &'static str,
) {
    let mut ticker = tokio::time::interval(server.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let expired = server.sweep();
                if expired > 0 {
                    debug!("{label} sweeper expired {expired} lease(s)");
                }
            }
        }
    }
}

async fn sweeper_v6_loop(server: Arc<DhcpV6Server>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(server.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let expired = server.sweep();
                if expired > 0 {
                    debug!("dhcpv6 sweeper expired {expired} lease(s)");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, DhcpPoolV4, DhcpV4Config, SimulatorConfig};
    use crate::core::frame::{self, decode, NetLayer};
    use crate::dhcp::options::{DhcpMessageType, DhcpOption, DhcpV4Packet, OP_REQUEST};
    use crate::netio::capture::ChannelLink;
    use mac_address::MacAddress;
    use pnet::util::MacAddr;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn base_config() -> SimulatorConfig {
        let mut cfg = SimulatorConfig::new("test0");
        cfg.shutdown_grace = Duration::from_millis(500);
        let mut dev = DeviceConfig::new("r1", "router", MacAddress::new([2, 0, 0, 0, 0, 1]));
        dev.ips.push("10.0.0.5".parse().unwrap());
        dev.icmp.enabled = true;
        cfg.devices.push(dev);
        cfg
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_link_stops_within_grace_period() {
        let mut sim = Simulator::new(base_config()).unwrap();
        let (source, sink, _inject, _observe) = ChannelLink::pair(Duration::from_millis(20));
        sim.start_with_link(Box::new(source), Arc::new(sink)).await.unwrap();

        let begun = std::time::Instant::now();
        let report = sim.stop().await;
        assert!(report.completed, "tasks leaked: {}", report.unfinished_tasks);
        assert!(begun.elapsed() < Duration::from_millis(500));

        // Idempotent.
        let report = sim.stop().await;
        assert!(report.completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn arp_request_is_answered_through_the_whole_stack() {
        let mut sim = Simulator::new(base_config()).unwrap();
        let (source, sink, inject, mut observe) = ChannelLink::pair(Duration::from_millis(20));
        sim.start_with_link(Box::new(source), Arc::new(sink)).await.unwrap();

        // The start-up gratuitous ARP announcement comes first.
        let announce = tokio::time::timeout(Duration::from_secs(1), observe.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(decode(&announce).unwrap().net, NetLayer::Arp(_)));

        let who_has = {
            use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
            use pnet::packet::ethernet::EtherTypes;
            let mut buf = vec![0u8; 28];
            {
                let mut arp = MutableArpPacket::new(&mut buf).unwrap();
                arp.set_hardware_type(ArpHardwareTypes::Ethernet);
                arp.set_protocol_type(EtherTypes::Ipv4);
                arp.set_hw_addr_len(6);
                arp.set_proto_addr_len(4);
                arp.set_operation(ArpOperations::Request);
                arp.set_sender_hw_addr(MacAddr::new(2, 0, 0, 0, 0, 9));
                arp.set_sender_proto_addr("10.0.0.9".parse().unwrap());
                arp.set_target_hw_addr(MacAddr::zero());
                arp.set_target_proto_addr("10.0.0.5".parse().unwrap());
            }
            frame::build_ethernet(
                MacAddr::broadcast(),
                MacAddr::new(2, 0, 0, 0, 0, 9),
                EtherTypes::Arp.0,
                &buf,
            )
        };
        inject.send(who_has.clone()).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), observe.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed = decode(&reply).unwrap();
        let NetLayer::Arp(arp) = parsed.net else { panic!("expected arp reply") };
        assert_eq!(arp.sender_mac, MacAddr::new(2, 0, 0, 0, 0, 1));
        assert_eq!(arp.sender_ip, "10.0.0.5".parse::<Ipv4Addr>().unwrap());

        sim.stop().await;

        // Restartability: a fresh link and the same controller still answer.
        let (source, sink, inject, mut observe) = ChannelLink::pair(Duration::from_millis(20));
        sim.start_with_link(Box::new(source), Arc::new(sink)).await.unwrap();
        let _announce = tokio::time::timeout(Duration::from_secs(1), observe.recv())
            .await
            .unwrap()
            .unwrap();
        inject.send(who_has).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), observe.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(decode(&reply).unwrap().net, NetLayer::Arp(_)));
        sim.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broadcast_discover_reaches_every_enabled_dhcp_handler() {
        let mut cfg = SimulatorConfig::new("test0");
        cfg.shutdown_grace = Duration::from_millis(500);
        for (i, subnet) in [(1u8, "10.0.10"), (2u8, "10.0.20")] {
            let mut dev = DeviceConfig::new(
                format!("srv{i}"),
                "server",
                MacAddress::new([2, 0, 0, 0, 0, i]),
            );
            dev.ips.push(format!("{subnet}.1").parse().unwrap());
            let mut pool = DhcpPoolV4::new(
                format!("{subnet}.0/24").parse().unwrap(),
                format!("{subnet}.100").parse().unwrap(),
                format!("{subnet}.200").parse().unwrap(),
            );
            pool.lease_time = 3600;
            dev.dhcp = DhcpV4Config { enabled: true, pools: vec![pool] };
            cfg.devices.push(dev);
        }
        let mut sim = Simulator::new(cfg).unwrap();
        let (source, sink, inject, mut observe) = ChannelLink::pair(Duration::from_millis(20));
        sim.start_with_link(Box::new(source), Arc::new(sink)).await.unwrap();

        // Swallow the two start-up announcements.
        for _ in 0..2 {
            let _ = tokio::time::timeout(Duration::from_secs(1), observe.recv()).await;
        }

        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        let discover = DhcpV4Packet {
            op: OP_REQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 7,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: String::new(),
            file: String::new(),
            options: vec![DhcpOption::MessageType(DhcpMessageType::Discover)],
        };
        // Limited broadcast, not addressed to any configured device IP.
        let raw = frame::build_ipv4_udp(
            MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01),
            MacAddr::broadcast(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            68,
            67,
            64,
            &discover.encode(),
        );
        inject.send(raw).await.unwrap();

        let mut offers = 0;
        for _ in 0..2 {
            if let Ok(Some(reply)) =
                tokio::time::timeout(Duration::from_secs(1), observe.recv()).await
            {
                let parsed = decode(&reply).unwrap();
                if let Some((67, 68, payload)) = parsed.udp() {
                    let pkt = DhcpV4Packet::decode(payload).unwrap();
                    assert_eq!(pkt.message_type(), Some(DhcpMessageType::Offer));
                    offers += 1;
                }
            }
        }
        assert_eq!(offers, 2, "every enabled DHCPv4 handler must see the DISCOVER");

        sim.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn down_transition_silences_a_device() {
        let mut sim = Simulator::new(base_config()).unwrap();
        let (source, sink, inject, mut observe) = ChannelLink::pair(Duration::from_millis(20));
        sim.start_with_link(Box::new(source), Arc::new(sink)).await.unwrap();
        let _announce = tokio::time::timeout(Duration::from_secs(1), observe.recv()).await;

        sim.set_device_state("r1", DeviceState::Down).await.unwrap();

        let ping = {
            use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
            use pnet::packet::icmp::{self, IcmpCode, IcmpPacket, IcmpTypes, MutableIcmpPacket};
            use pnet::packet::ip::IpNextHeaderProtocols;
            let mut icmp_buf = vec![0u8; 16];
            {
                let mut pkt = MutableEchoRequestPacket::new(&mut icmp_buf).unwrap();
                pkt.set_icmp_type(IcmpTypes::EchoRequest);
                pkt.set_icmp_code(IcmpCode(0));
                pkt.set_identifier(1);
                pkt.set_sequence_number(1);
                pkt.set_payload(&[0u8; 8]);
            }
            let checksum = icmp::checksum(&IcmpPacket::new(&icmp_buf).unwrap());
            {
                let mut pkt = MutableIcmpPacket::new(&mut icmp_buf).unwrap();
                pkt.set_checksum(checksum);
            }
            let ip = frame::build_ipv4(
                "10.0.0.9".parse().unwrap(),
                "10.0.0.5".parse().unwrap(),
                IpNextHeaderProtocols::Icmp.0,
                64,
                &icmp_buf,
            );
            frame::build_ethernet(
                MacAddr::new(2, 0, 0, 0, 0, 1),
                MacAddr::new(2, 0, 0, 0, 0, 9),
                pnet::packet::ethernet::EtherTypes::Ipv4.0,
                &ip,
            )
        };
        inject.send(ping.clone()).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), observe.recv()).await.is_err(),
            "down device must not answer"
        );

        sim.set_device_state("r1", DeviceState::Up).await.unwrap();
        inject.send(ping).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), observe.recv()).await;
        assert!(reply.is_ok(), "up device answers again");

        sim.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replay_streams_frames_to_the_sink() {
        use crate::netio::replay::VecSource;
        let mut sim = Simulator::new(base_config()).unwrap();
        let (source, sink, _inject, mut observe) = ChannelLink::pair(Duration::from_millis(20));
        sim.start_with_link(Box::new(source), Arc::new(sink)).await.unwrap();
        let _announce = tokio::time::timeout(Duration::from_secs(1), observe.recv()).await;

        sim.start_replay(Box::new(VecSource::new(vec![
            (Duration::ZERO, vec![0xde; 60]),
            (Duration::from_millis(5), vec![0xad; 60]),
        ])))
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), observe.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, vec![0xde; 60]);
        let second = tokio::time::timeout(Duration::from_secs(1), observe.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, vec![0xad; 60]);

        let report = sim.stop().await;
        assert!(report.completed);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let mut sim = Simulator::new(base_config()).unwrap();
        let (source, sink, _inject, _observe) = ChannelLink::pair(Duration::from_millis(20));
        sim.start_with_link(Box::new(source), Arc::new(sink)).await.unwrap();

        let (source, sink, _i, _o) = ChannelLink::pair(Duration::from_millis(20));
        let err = sim.start_with_link(Box::new(source), Arc::new(sink)).await;
        assert!(matches!(err, Err(CoreError::AlreadyRunning)));
        sim.stop().await;
    }
}
