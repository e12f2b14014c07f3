//! Operator-driven error injection.
//!
//! Process-wide, thread-safe store of per-(device IP, interface, kind)
//! records. SNMP agents read it on every relevant GET, the threshold poller
//! reads it on every tick. Clearing disables a record but keeps it, so the
//! admin surface can show history for the lifetime of the process.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use enum_iterator::Sequence;

/// What is being injected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Sequence)]
pub enum ErrorKind {
    Fcs,
    Discards,
    InterfaceErrors,
    Utilization,
    Cpu,
    Memory,
    Disk,
}

impl ErrorKind {
    /// Percentage kinds surface the magnitude verbatim over SNMP; counter
    /// kinds scale the live counter instead.
    pub fn is_percentage(&self) -> bool {
        matches!(self, Self::Utilization | Self::Cpu | Self::Memory | Self::Disk)
    }
}

/// Simulated link parameters carried alongside the injection records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceProfile {
    pub speed_mbps: u32,
    pub full_duplex: bool,
}

impl Default for InterfaceProfile {
    fn default() -> Self {
        Self { speed_mbps: 1000, full_duplex: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub device_ip: IpAddr,
    pub interface: String,
    pub kind: ErrorKind,
    pub magnitude: u8,
    pub profile: InterfaceProfile,
    pub enabled: bool,
}

type Key = (IpAddr, String);

#[derive(Default)]
pub struct ErrorStateManager {
    records: RwLock<HashMap<Key, HashMap<ErrorKind, ErrorRecord>>>,
}

impl ErrorStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates a record; enabled iff the magnitude is non-zero.
    /// Magnitudes above 100 are clamped.
    pub fn set(&self, device_ip: IpAddr, interface: &str, kind: ErrorKind, magnitude: u8) {
        let magnitude = magnitude.min(100);
        let mut map = self.records.write().expect("error state lock poisoned");
        let slot = map
            .entry((device_ip, interface.to_string()))
            .or_default()
            .entry(kind)
            .or_insert_with(|| ErrorRecord {
                device_ip,
                interface: interface.to_string(),
                kind,
                magnitude: 0,
                profile: InterfaceProfile::default(),
                enabled: false,
            });
        slot.magnitude = magnitude;
        slot.enabled = magnitude > 0;
    }

    /// Attaches link parameters to every record of the interface, creating
    /// none.
    pub fn configure_interface(&self, device_ip: IpAddr, interface: &str, profile: InterfaceProfile) {
        let mut map = self.records.write().expect("error state lock poisoned");
        if let Some(kinds) = map.get_mut(&(device_ip, interface.to_string())) {
            for record in kinds.values_mut() {
                record.profile = profile.clone();
            }
        }
    }

    /// Snapshot of every record for the key; never an internal alias.
    pub fn get(&self, device_ip: IpAddr, interface: &str) -> Vec<ErrorRecord> {
        let map = self.records.read().expect("error state lock poisoned");
        map.get(&(device_ip, interface.to_string()))
            .map(|kinds| {
                let mut records: Vec<_> = kinds.values().cloned().collect();
                records.sort_by_key(|r| r.kind as u8);
                records
            })
            .unwrap_or_default()
    }

    /// Enabled magnitude for one kind, if any.
    pub fn magnitude(&self, device_ip: IpAddr, interface: &str, kind: ErrorKind) -> Option<u8> {
        let map = self.records.read().expect("error state lock poisoned");
        map.get(&(device_ip, interface.to_string()))
            .and_then(|kinds| kinds.get(&kind))
            .filter(|r| r.enabled)
            .map(|r| r.magnitude)
    }

    /// Disables everything on the key without removing history.
    pub fn clear(&self, device_ip: IpAddr, interface: &str) {
        let mut map = self.records.write().expect("error state lock poisoned");
        if let Some(kinds) = map.get_mut(&(device_ip, interface.to_string())) {
            for record in kinds.values_mut() {
                record.enabled = false;
                record.magnitude = 0;
            }
        }
    }

    pub fn clear_all(&self) {
        let mut map = self.records.write().expect("error state lock poisoned");
        for kinds in map.values_mut() {
            for record in kinds.values_mut() {
                record.enabled = false;
                record.magnitude = 0;
            }
        }
    }

    /// Snapshots of the enabled records only.
    pub fn list(&self) -> Vec<ErrorRecord> {
        let map = self.records.read().expect("error state lock poisoned");
        let mut out: Vec<_> = map
            .values()
            .flat_map(|kinds| kinds.values())
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.device_ip, &a.interface, a.kind as u8).cmp(&(b.device_ip, &b.interface, b.kind as u8))
        });
        out
    }
}

/// Observable contract for counter kinds: `base + base * magnitude / 100`.
pub fn calibrated_counter(base: u64, magnitude: u8) -> u64 {
    base + base * magnitude as u64 / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
    }

    #[test]
    fn set_creates_enabled_record() {
        let mgr = ErrorStateManager::new();
        mgr.set(ip(), "eth0", ErrorKind::Cpu, 90);
        assert_eq!(mgr.magnitude(ip(), "eth0", ErrorKind::Cpu), Some(90));
        let records = mgr.get(ip(), "eth0");
        assert_eq!(records.len(), 1);
        assert!(records[0].enabled);
    }

    #[test]
    fn set_is_idempotent() {
        let mgr = ErrorStateManager::new();
        mgr.set(ip(), "eth0", ErrorKind::Memory, 40);
        let once = (mgr.get(ip(), "eth0"), mgr.list());
        mgr.set(ip(), "eth0", ErrorKind::Memory, 40);
        assert_eq!(once, (mgr.get(ip(), "eth0"), mgr.list()));
    }

    #[test]
    fn get_returns_a_copy_not_an_alias() {
        let mgr = ErrorStateManager::new();
        mgr.set(ip(), "eth0", ErrorKind::Disk, 30);
        let mut snapshot = mgr.get(ip(), "eth0");
        snapshot[0].magnitude = 99;
        assert_eq!(mgr.magnitude(ip(), "eth0", ErrorKind::Disk), Some(30));
    }

    #[test]
    fn clear_disables_but_retains() {
        let mgr = ErrorStateManager::new();
        mgr.set(ip(), "eth0", ErrorKind::Fcs, 50);
        mgr.clear(ip(), "eth0");
        assert_eq!(mgr.magnitude(ip(), "eth0", ErrorKind::Fcs), None);
        let records = mgr.get(ip(), "eth0");
        assert_eq!(records.len(), 1);
        assert!(!records[0].enabled);
        assert_eq!(records[0].magnitude, 0);
    }

    #[test]
    fn clear_all_then_list_is_empty() {
        let mgr = ErrorStateManager::new();
        mgr.set(ip(), "eth0", ErrorKind::Cpu, 10);
        mgr.set(ip(), "eth1", ErrorKind::Discards, 20);
        mgr.clear_all();
        assert!(mgr.list().is_empty());
    }

    #[test]
    fn list_returns_enabled_only() {
        let mgr = ErrorStateManager::new();
        mgr.set(ip(), "eth0", ErrorKind::Cpu, 10);
        mgr.set(ip(), "eth0", ErrorKind::Disk, 0);
        let listed = mgr.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, ErrorKind::Cpu);
    }

    #[test]
    fn magnitude_is_clamped() {
        let mgr = ErrorStateManager::new();
        mgr.set(ip(), "eth0", ErrorKind::Utilization, 250);
        assert_eq!(mgr.magnitude(ip(), "eth0", ErrorKind::Utilization), Some(100));
    }

    #[test]
    fn counter_calibration_rule() {
        assert_eq!(calibrated_counter(1000, 0), 1000);
        assert_eq!(calibrated_counter(1000, 25), 1250);
        assert_eq!(calibrated_counter(1000, 100), 2000);
    }
}
