//! Process-wide device table: MAC and IP lookup plus the broadcast fan-out
//! policy. Built once at start, read-mostly afterwards.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use pnet::util::MacAddr;

use super::device::Device;

pub struct DeviceTable {
    by_mac: HashMap<[u8; 6], Arc<Device>>,
    by_ip: HashMap<IpAddr, Vec<Arc<Device>>>,
    all: Vec<Arc<Device>>,
}

impl DeviceTable {
    /// The MAC map is a bijection on the loaded devices; the config validator
    /// has already rejected duplicates, so insertion never collides here.
    pub fn new(devices: Vec<Arc<Device>>) -> Self {
        let mut by_mac = HashMap::with_capacity(devices.len());
        let mut by_ip: HashMap<IpAddr, Vec<Arc<Device>>> = HashMap::new();
        for dev in &devices {
            by_mac.insert(dev.mac().octets(), dev.clone());
            for ip in dev.ips() {
                by_ip.entry(*ip).or_default().push(dev.clone());
            }
        }
        Self { by_mac, by_ip, all: devices }
    }

    pub fn lookup_by_mac(&self, mac: MacAddr) -> Option<&Arc<Device>> {
        self.by_mac.get(&mac.octets())
    }

    /// One IP may resolve to several devices.
    pub fn lookup_by_ip(&self, ip: &IpAddr) -> &[Arc<Device>] {
        self.by_ip.get(ip).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Broadcast/multicast and link-local-unknown destinations resolve to all
    /// devices; the dispatcher narrows the set to devices whose handler for
    /// the decoded protocol is enabled.
    pub fn broadcast_targets(&self) -> &[Arc<Device>] {
        &self.all
    }

    pub fn all(&self) -> &[Arc<Device>] {
        &self.all
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Device>> {
        self.all.iter().find(|d| d.name() == name)
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use mac_address::MacAddress;
    use std::net::Ipv4Addr;

    fn table() -> DeviceTable {
        let mut a = DeviceConfig::new("a", "router", MacAddress::new([2, 0, 0, 0, 0, 1]));
        a.ips.push(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let mut b = DeviceConfig::new("b", "switch", MacAddress::new([2, 0, 0, 0, 0, 2]));
        b.ips.push(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        b.ips.push(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        DeviceTable::new(vec![
            Arc::new(Device::bare(a)),
            Arc::new(Device::bare(b)),
        ])
    }

    #[test]
    fn mac_lookup_is_exact() {
        let table = table();
        let dev = table.lookup_by_mac(MacAddr::new(2, 0, 0, 0, 0, 2)).unwrap();
        assert_eq!(dev.name(), "b");
        assert!(table.lookup_by_mac(MacAddr::new(2, 0, 0, 0, 0, 9)).is_none());
    }

    #[test]
    fn shared_ip_resolves_to_both_devices() {
        let table = table();
        let hits = table.lookup_by_ip(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(hits.len(), 2);
        let hits = table.lookup_by_ip(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name(), "b");
    }

    #[test]
    fn broadcast_targets_cover_all_devices() {
        let table = table();
        assert_eq!(table.broadcast_targets().len(), 2);
    }
}
