//! Normalized configuration consumed by the simulator core.
//!
//! The YAML/CLI loaders live outside this crate; they hand the core an
//! already-parsed [`SimulatorConfig`]. The core still refuses to start on
//! out-of-range values, overlapping pools or unsafe walk-file paths, so every
//! numeric bound from the external contract is re-checked in [`SimulatorConfig::validate`].

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use itertools::Itertools;
use mac_address::MacAddress;
use thiserror::Error;

pub const DEFAULT_SNAPLEN: i32 = 65535;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_RATE_LIMIT_PPS: u32 = 1000;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_SECS: u32 = 86_400;
pub const DEFAULT_TRAP_POLL_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("duplicate device name {0:?}")]
    DuplicateName(String),

    #[error("duplicate MAC {0} (device {1:?})")]
    DuplicateMac(MacAddress, String),

    #[error("device {device:?}: {reason}")]
    Device { device: String, reason: String },

    #[error("device {device:?}: pool {pool} range is invalid: {reason}")]
    PoolRange {
        device: String,
        pool: String,
        reason: String,
    },

    #[error("device {device:?}: pools {a} and {b} overlap")]
    PoolOverlap { device: String, a: String, b: String },

    #[error("device {device:?}: STP timers violate {constraint}")]
    StpConstraint {
        device: String,
        constraint: &'static str,
    },

    #[error("device {device:?}: traps enabled but no receiver configured")]
    MissingTrapReceiver { device: String },

    #[error("walk file path {path:?} rejected: {reason}")]
    WalkPath { path: PathBuf, reason: String },
}

/// Top-level normalized configuration.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub interface: String,
    pub snaplen: i32,
    pub promiscuous: bool,
    pub read_timeout: Duration,
    pub rate_limit_pps: u32,
    pub shutdown_grace: Duration,
    /// Optional kernel-level BPF filter installed on the capture handle.
    pub capture_filter: Option<String>,
    /// Base directory that relative walk-file paths are resolved against.
    pub walk_base_dir: Option<PathBuf>,
    pub devices: Vec<DeviceConfig>,
}

impl SimulatorConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            snaplen: DEFAULT_SNAPLEN,
            promiscuous: true,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            rate_limit_pps: DEFAULT_RATE_LIMIT_PPS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            capture_filter: None,
            walk_base_dir: None,
            devices: Vec::new(),
        }
    }

    /// Re-checks every contract bound. The core refuses to start otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout > Duration::from_millis(100) {
            return Err(ConfigError::OutOfRange {
                field: "read_timeout_ms",
                value: self.read_timeout.as_millis() as i64,
                min: 1,
                max: 100,
            });
        }
        check_range("rate_limit_pps", self.rate_limit_pps as i64, 1, 1_000_000)?;

        let mut names: HashSet<&str> = HashSet::new();
        let mut macs: HashSet<[u8; 6]> = HashSet::new();
        for dev in &self.devices {
            if !names.insert(dev.name.as_str()) {
                return Err(ConfigError::DuplicateName(dev.name.clone()));
            }
            if !macs.insert(dev.mac.bytes()) {
                return Err(ConfigError::DuplicateMac(dev.mac, dev.name.clone()));
            }
            dev.validate(self.walk_base_dir.as_deref())?;
        }
        Ok(())
    }
}

/// One simulated device and its enabled protocol blocks.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: String,
    pub mac: MacAddress,
    pub ips: Vec<IpAddr>,
    /// Free-form recognized properties: sysDescr, sysContact, sysName,
    /// sysLocation, sysObjectID, platform, softwareVersion, ...
    pub properties: HashMap<String, String>,
    pub lldp: LldpConfig,
    pub cdp: CdpConfig,
    pub edp: EdpConfig,
    pub fdp: FdpConfig,
    pub stp: StpConfig,
    pub dhcp: DhcpV4Config,
    pub dhcpv6: DhcpV6Config,
    pub dns: DnsConfig,
    pub http: HttpConfig,
    pub ftp: FtpConfig,
    pub netbios: NetbiosConfig,
    pub icmp: IcmpConfig,
    pub icmpv6: Icmpv6Config,
    pub snmp: SnmpConfig,
    pub traffic: TrafficConfig,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, mac: MacAddress) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            mac,
            ips: Vec::new(),
            properties: HashMap::new(),
            lldp: LldpConfig::default(),
            cdp: CdpConfig::default(),
            edp: EdpConfig::default(),
            fdp: FdpConfig::default(),
            stp: StpConfig::default(),
            dhcp: DhcpV4Config::default(),
            dhcpv6: DhcpV6Config::default(),
            dns: DnsConfig::default(),
            http: HttpConfig::default(),
            ftp: FtpConfig::default(),
            netbios: NetbiosConfig::default(),
            icmp: IcmpConfig::default(),
            icmpv6: Icmpv6Config::default(),
            snmp: SnmpConfig::default(),
            traffic: TrafficConfig::default(),
        }
    }

    /// First configured IPv4 address, the default management address.
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.ips.iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    pub fn first_ipv6(&self) -> Option<Ipv6Addr> {
        self.ips.iter().find_map(|ip| match ip {
            IpAddr::V6(v6) => Some(*v6),
            IpAddr::V4(_) => None,
        })
    }

    fn validate(&self, walk_base: Option<&Path>) -> Result<(), ConfigError> {
        if self.lldp.enabled {
            check_range("lldp.advertise_interval", self.lldp.advertise_interval as i64, 1, 3600)?;
        }
        if self.cdp.enabled {
            check_range("cdp.advertise_interval", self.cdp.advertise_interval as i64, 5, 3600)?;
        }
        if self.edp.enabled {
            check_range("edp.advertise_interval", self.edp.advertise_interval as i64, 1, 3600)?;
        }
        if self.fdp.enabled {
            check_range("fdp.advertise_interval", self.fdp.advertise_interval as i64, 5, 3600)?;
        }
        if self.stp.enabled {
            self.stp.validate(&self.name)?;
        }
        if self.dhcp.enabled {
            self.dhcp.validate(&self.name)?;
        }
        if self.dhcpv6.enabled {
            self.dhcpv6.validate(&self.name)?;
        }
        if self.dns.enabled {
            for rec in &self.dns.forward_records {
                if rec.name.is_empty() {
                    return Err(ConfigError::Device {
                        device: self.name.clone(),
                        reason: "DNS record with empty name".into(),
                    });
                }
                check_range("dns.ttl", rec.ttl as i64, 0, i32::MAX as i64)?;
            }
        }
        if self.http.enabled {
            check_range("http.port", self.http.port as i64, 1, 65535)?;
            for ep in &self.http.endpoints {
                if !ep.path.starts_with('/') {
                    return Err(ConfigError::Device {
                        device: self.name.clone(),
                        reason: format!("HTTP endpoint path {:?} must start with '/'", ep.path),
                    });
                }
            }
        }
        if self.ftp.enabled {
            check_range("ftp.port", self.ftp.port as i64, 1, 65535)?;
        }
        if self.netbios.enabled {
            if self.netbios.name.len() > 15 {
                return Err(ConfigError::Device {
                    device: self.name.clone(),
                    reason: format!("NetBIOS name {:?} longer than 15", self.netbios.name),
                });
            }
            if self.netbios.workgroup.len() > 15 {
                return Err(ConfigError::Device {
                    device: self.name.clone(),
                    reason: format!("NetBIOS workgroup {:?} longer than 15", self.netbios.workgroup),
                });
            }
        }
        if self.icmp.enabled {
            check_range("icmp.ttl", self.icmp.ttl as i64, 1, 255)?;
        }
        if self.icmpv6.enabled {
            check_range("icmpv6.hop_limit", self.icmpv6.hop_limit as i64, 1, 255)?;
        }
        if self.snmp.enabled {
            self.snmp.validate(&self.name, walk_base)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LldpConfig {
    pub enabled: bool,
    pub system_name: Option<String>,
    pub system_description: Option<String>,
    pub chassis_id: Option<String>,
    pub port_description: Option<String>,
    pub advertise_interval: u32,
    pub management_address: Option<Ipv4Addr>,
}

impl Default for LldpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            system_name: None,
            system_description: None,
            chassis_id: None,
            port_description: None,
            advertise_interval: 30,
            management_address: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CdpConfig {
    pub enabled: bool,
    pub device_id: Option<String>,
    pub port_id: Option<String>,
    pub platform: Option<String>,
    pub software_version: Option<String>,
    pub advertise_interval: u32,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_id: None,
            port_id: None,
            platform: None,
            software_version: None,
            advertise_interval: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdpConfig {
    pub enabled: bool,
    pub advertise_interval: u32,
}

impl Default for EdpConfig {
    fn default() -> Self {
        Self { enabled: false, advertise_interval: 30 }
    }
}

#[derive(Debug, Clone)]
pub struct FdpConfig {
    pub enabled: bool,
    pub advertise_interval: u32,
}

impl Default for FdpConfig {
    fn default() -> Self {
        Self { enabled: false, advertise_interval: 60 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StpVersion {
    Stp,
    Rstp,
    Mstp,
}

#[derive(Debug, Clone)]
pub struct StpConfig {
    pub enabled: bool,
    pub bridge_priority: u16,
    pub hello_time: u8,
    pub max_age: u8,
    pub forward_delay: u8,
    pub version: StpVersion,
}

impl Default for StpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_priority: 32768,
            hello_time: 2,
            max_age: 20,
            forward_delay: 15,
            version: StpVersion::Rstp,
        }
    }
}

impl StpConfig {
    fn validate(&self, device: &str) -> Result<(), ConfigError> {
        check_range("stp.bridge_priority", self.bridge_priority as i64, 0, 61440)?;
        if self.bridge_priority % 4096 != 0 {
            return Err(ConfigError::StpConstraint {
                device: device.to_string(),
                constraint: "bridge_priority must be a multiple of 4096",
            });
        }
        check_range("stp.hello_time", self.hello_time as i64, 1, 10)?;
        check_range("stp.max_age", self.max_age as i64, 6, 40)?;
        check_range("stp.forward_delay", self.forward_delay as i64, 4, 30)?;
        if (self.max_age as u16) < 2 * (self.hello_time as u16 + 1) {
            return Err(ConfigError::StpConstraint {
                device: device.to_string(),
                constraint: "max_age >= 2 * (hello_time + 1)",
            });
        }
        if (self.forward_delay as u16) < self.max_age as u16 / 2 + 1 {
            return Err(ConfigError::StpConstraint {
                device: device.to_string(),
                constraint: "forward_delay >= max_age / 2 + 1",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DhcpPoolV4 {
    pub network: Ipv4Net,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_time: u32,
    pub domain_name: Option<String>,
}

impl DhcpPoolV4 {
    pub fn new(network: Ipv4Net, range_start: Ipv4Addr, range_end: Ipv4Addr) -> Self {
        Self {
            network,
            range_start,
            range_end,
            gateway: None,
            dns_servers: Vec::new(),
            lease_time: DEFAULT_LEASE_SECS,
            domain_name: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DhcpV4Config {
    pub enabled: bool,
    pub pools: Vec<DhcpPoolV4>,
}

impl DhcpV4Config {
    fn validate(&self, device: &str) -> Result<(), ConfigError> {
        for pool in &self.pools {
            let label = pool.network.to_string();
            if u32::from(pool.range_start) > u32::from(pool.range_end) {
                return Err(ConfigError::PoolRange {
                    device: device.to_string(),
                    pool: label,
                    reason: "range_start > range_end".into(),
                });
            }
            if !pool.network.contains(&pool.range_start) || !pool.network.contains(&pool.range_end) {
                return Err(ConfigError::PoolRange {
                    device: device.to_string(),
                    pool: label,
                    reason: "range not inside network".into(),
                });
            }
            check_range("dhcp.lease_time", pool.lease_time as i64, 60, 31_536_000)?;
        }
        for (a, b) in self.pools.iter().tuple_combinations() {
            let a_lo = u32::from(a.range_start);
            let a_hi = u32::from(a.range_end);
            let b_lo = u32::from(b.range_start);
            let b_hi = u32::from(b.range_end);
            if a_lo <= b_hi && b_lo <= a_hi {
                return Err(ConfigError::PoolOverlap {
                    device: device.to_string(),
                    a: a.network.to_string(),
                    b: b.network.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DhcpPoolV6 {
    pub network: Ipv6Net,
    pub range_start: Ipv6Addr,
    pub range_end: Ipv6Addr,
    pub dns_servers: Vec<Ipv6Addr>,
    pub lease_time: u32,
    pub domain_name: Option<String>,
}

impl DhcpPoolV6 {
    pub fn new(network: Ipv6Net, range_start: Ipv6Addr, range_end: Ipv6Addr) -> Self {
        Self {
            network,
            range_start,
            range_end,
            dns_servers: Vec::new(),
            lease_time: DEFAULT_LEASE_SECS,
            domain_name: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DhcpV6Config {
    pub enabled: bool,
    pub pools: Vec<DhcpPoolV6>,
}

impl DhcpV6Config {
    fn validate(&self, device: &str) -> Result<(), ConfigError> {
        for pool in &self.pools {
            let label = pool.network.to_string();
            if u128::from(pool.range_start) > u128::from(pool.range_end) {
                return Err(ConfigError::PoolRange {
                    device: device.to_string(),
                    pool: label,
                    reason: "range_start > range_end".into(),
                });
            }
            if !pool.network.contains(&pool.range_start) || !pool.network.contains(&pool.range_end) {
                return Err(ConfigError::PoolRange {
                    device: device.to_string(),
                    pool: label,
                    reason: "range not inside network".into(),
                });
            }
            check_range("dhcpv6.lease_time", pool.lease_time as i64, 60, 31_536_000)?;
        }
        for (a, b) in self.pools.iter().tuple_combinations() {
            let a_lo = u128::from(a.range_start);
            let a_hi = u128::from(a.range_end);
            let b_lo = u128::from(b.range_start);
            let b_hi = u128::from(b.range_end);
            if a_lo <= b_hi && b_lo <= a_hi {
                return Err(ConfigError::PoolOverlap {
                    device: device.to_string(),
                    a: a.network.to_string(),
                    b: b.network.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub ip: IpAddr,
    pub ttl: u32,
}

impl DnsRecord {
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self { name: name.into(), ip, ttl: 3600 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DnsConfig {
    pub enabled: bool,
    pub forward_records: Vec<DnsRecord>,
}

#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub port: u16,
    pub endpoints: Vec<HttpEndpoint>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { enabled: false, port: 80, endpoints: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct FtpUser {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub enabled: bool,
    pub port: u16,
    pub users: Vec<FtpUser>,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self { enabled: false, port: 21, users: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct NetbiosConfig {
    pub enabled: bool,
    pub name: String,
    pub workgroup: String,
}

impl Default for NetbiosConfig {
    fn default() -> Self {
        Self { enabled: false, name: String::new(), workgroup: "WORKGROUP".into() }
    }
}

#[derive(Debug, Clone)]
pub struct IcmpConfig {
    pub enabled: bool,
    pub ttl: u8,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self { enabled: false, ttl: 64 }
    }
}

#[derive(Debug, Clone)]
pub struct Icmpv6Config {
    pub enabled: bool,
    pub hop_limit: u8,
}

impl Default for Icmpv6Config {
    fn default() -> Self {
        Self { enabled: false, hop_limit: 255 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrapToggles {
    pub cold_start: bool,
    pub link_up: bool,
    pub link_down: bool,
    pub authentication_failure: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TrapThresholds {
    pub high_cpu: Option<u8>,
    pub high_memory: Option<u8>,
    pub high_disk: Option<u8>,
    pub interface_errors: Option<u64>,
}

impl TrapThresholds {
    fn any(&self) -> bool {
        self.high_cpu.is_some()
            || self.high_memory.is_some()
            || self.high_disk.is_some()
            || self.interface_errors.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct TrapConfig {
    pub enabled: bool,
    pub receivers: Vec<SocketAddr>,
    pub community: String,
    pub toggles: TrapToggles,
    pub thresholds: TrapThresholds,
    pub poll_interval: Duration,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            receivers: Vec::new(),
            community: "public".into(),
            toggles: TrapToggles::default(),
            thresholds: TrapThresholds::default(),
            poll_interval: Duration::from_secs(DEFAULT_TRAP_POLL_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnmpConfig {
    pub enabled: bool,
    pub community: String,
    pub walk_file: Option<PathBuf>,
    pub sysname: Option<String>,
    pub sysdescr: Option<String>,
    pub syscontact: Option<String>,
    pub syslocation: Option<String>,
    pub traps: TrapConfig,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            community: "public".into(),
            walk_file: None,
            sysname: None,
            sysdescr: None,
            syscontact: None,
            syslocation: None,
            traps: TrapConfig::default(),
        }
    }
}

impl SnmpConfig {
    fn validate(&self, device: &str, walk_base: Option<&Path>) -> Result<(), ConfigError> {
        if let Some(path) = &self.walk_file {
            validate_walk_path(path, walk_base)?;
        }
        let traps = &self.traps;
        if traps.enabled {
            let any_event = traps.toggles.cold_start
                || traps.toggles.link_up
                || traps.toggles.link_down
                || traps.toggles.authentication_failure;
            if (any_event || traps.thresholds.any()) && traps.receivers.is_empty() {
                return Err(ConfigError::MissingTrapReceiver {
                    device: device.to_string(),
                });
            }
            if let Some(v) = traps.thresholds.high_cpu {
                check_range("traps.thresholds.high_cpu", v as i64, 0, 100)?;
            }
            if let Some(v) = traps.thresholds.high_memory {
                check_range("traps.thresholds.high_memory", v as i64, 0, 100)?;
            }
            if let Some(v) = traps.thresholds.high_disk {
                check_range("traps.thresholds.high_disk", v as i64, 0, 100)?;
            }
        }
        Ok(())
    }
}

/// Per-device outgoing traffic generator settings.
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    pub enabled: bool,
    pub gratuitous_arp_interval: Option<Duration>,
    pub ping_targets: Vec<Ipv4Addr>,
    pub ping_interval: Duration,
    pub random_udp: bool,
    pub random_udp_interval: Duration,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gratuitous_arp_interval: Some(Duration::from_secs(120)),
            ping_targets: Vec::new(),
            ping_interval: Duration::from_secs(60),
            random_udp: false,
            random_udp_interval: Duration::from_secs(30),
        }
    }
}

/// Rejects traversal components and resolves relative paths against the base
/// directory. The returned path is guaranteed to name an existing regular file.
pub fn validate_walk_path(path: &Path, base: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ConfigError::WalkPath {
            path: path.to_path_buf(),
            reason: "path contains '..'".into(),
        });
    }
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match base {
            Some(base) => base.join(path),
            None => {
                return Err(ConfigError::WalkPath {
                    path: path.to_path_buf(),
                    reason: "relative path without a base directory".into(),
                })
            }
        }
    };
    match std::fs::metadata(&resolved) {
        Ok(meta) if meta.is_file() => Ok(resolved),
        Ok(_) => Err(ConfigError::WalkPath {
            path: resolved,
            reason: "not a regular file".into(),
        }),
        Err(e) => Err(ConfigError::WalkPath {
            path: resolved,
            reason: e.to_string(),
        }),
    }
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { field, value, min, max });
    }
    Ok(())
}
