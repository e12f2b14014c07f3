//! Per-device identity, lifecycle state and counters.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, RwLock};

use enum_iterator::Sequence;
use pnet::util::MacAddr;

use crate::config::DeviceConfig;
use crate::core::frame::wire_mac;
use crate::snmp::agent::SnmpAgent;

/// Lifecycle state of one simulated device. Only `Up` devices answer
/// requests or emit periodic frames.
#[derive(Copy, Debug, Sequence, PartialEq, Eq, Hash, Clone)]
pub enum DeviceState {
    Starting,
    Up,
    Down,
    Maintenance,
    Stopping,
}

/// Octet and frame counters, updated lock-free from the packet path.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub octets_in: AtomicU64,
    pub octets_out: AtomicU64,
    pub in_errors: AtomicU64,
    pub in_discards: AtomicU64,
    pub responses: AtomicU64,
}

/// Copy of the counters at one instant, for the control interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub octets_in: u64,
    pub octets_out: u64,
    pub in_errors: u64,
    pub in_discards: u64,
    pub responses: u64,
}

impl DeviceCounters {
    pub fn record_in(&self, octets: usize) {
        self.frames_in.fetch_add(1, Relaxed);
        self.octets_in.fetch_add(octets as u64, Relaxed);
    }

    pub fn record_out(&self, octets: usize) {
        self.frames_out.fetch_add(1, Relaxed);
        self.octets_out.fetch_add(octets as u64, Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_in: self.frames_in.load(Relaxed),
            frames_out: self.frames_out.load(Relaxed),
            octets_in: self.octets_in.load(Relaxed),
            octets_out: self.octets_out.load(Relaxed),
            in_errors: self.in_errors.load(Relaxed),
            in_discards: self.in_discards.load(Relaxed),
            responses: self.responses.load(Relaxed),
        }
    }
}

/// One simulated device. Created at table build, immutable except for its
/// lifecycle state and counters; owns its SNMP agent exclusively.
pub struct Device {
    config: DeviceConfig,
    mac: MacAddr,
    state: RwLock<DeviceState>,
    counters: Arc<DeviceCounters>,
    agent: Option<SnmpAgent>,
}

impl Device {
    /// The counters are shared with the SNMP agent's dynamic interface
    /// entries, which is why they arrive as an `Arc` rather than being owned.
    pub fn new(config: DeviceConfig, agent: Option<SnmpAgent>, counters: Arc<DeviceCounters>) -> Self {
        let mac = wire_mac(&config.mac);
        Self {
            config,
            mac,
            state: RwLock::new(DeviceState::Starting),
            counters,
            agent,
        }
    }

    /// Convenience constructor for callers without an agent.
    pub fn bare(config: DeviceConfig) -> Self {
        Self::new(config, None, Arc::new(DeviceCounters::default()))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> &str {
        &self.config.kind
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn ips(&self) -> &[IpAddr] {
        &self.config.ips
    }

    pub fn has_ip(&self, ip: &IpAddr) -> bool {
        self.config.ips.contains(ip)
    }

    /// Name of the simulated interface used for counters and error records.
    pub fn if_name(&self) -> &str {
        self.config
            .properties
            .get("interface")
            .map(String::as_str)
            .unwrap_or("eth0")
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.config.properties.get(key).map(String::as_str)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn counters(&self) -> &DeviceCounters {
        &self.counters
    }

    pub fn agent(&self) -> Option<&SnmpAgent> {
        self.agent.as_ref()
    }

    pub fn state(&self) -> DeviceState {
        *self.state.read().expect("device state lock poisoned")
    }

    pub fn is_up(&self) -> bool {
        self.state() == DeviceState::Up
    }

    /// Replaces the lifecycle state, returning the previous one. Trap
    /// emission on Up/Down transitions is the lifecycle controller's job.
    pub fn set_state(&self, new: DeviceState) -> DeviceState {
        let mut guard = self.state.write().expect("device state lock poisoned");
        std::mem::replace(&mut *guard, new)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.config.name)
            .field("mac", &self.mac)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use mac_address::MacAddress;

    fn device() -> Device {
        let cfg = DeviceConfig::new("sw1", "switch", MacAddress::new([2, 0, 0, 0, 0, 9]));
        Device::bare(cfg)
    }

    #[test]
    fn starts_in_starting_state() {
        let dev = device();
        assert_eq!(dev.state(), DeviceState::Starting);
        assert!(!dev.is_up());
    }

    #[test]
    fn set_state_returns_previous() {
        let dev = device();
        assert_eq!(dev.set_state(DeviceState::Up), DeviceState::Starting);
        assert_eq!(dev.set_state(DeviceState::Down), DeviceState::Up);
    }

    #[test]
    fn counters_snapshot_is_a_copy() {
        let dev = device();
        dev.counters().record_in(100);
        let snap = dev.counters().snapshot();
        dev.counters().record_in(50);
        assert_eq!(snap.frames_in, 1);
        assert_eq!(snap.octets_in, 100);
        assert_eq!(dev.counters().snapshot().frames_in, 2);
    }
}
