//! Discovery-protocol advertisers: LLDP, CDP, EDP and FDP frame builders
//! plus the per-device ticker task that emits them.
//!
//! Advertisers are transmit-only; inbound neighbor frames are never parsed.
//! Neighbor tables are exposed through walk-file MIB data instead.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use pnet::util::MacAddr;
use tokio::sync::watch;

use crate::config::DeviceConfig;
use crate::core::device::Device;
use crate::core::frame::{self, RawFrame, ETHERTYPE_LLDP};
use crate::netio::capture::FrameSink;
use crate::netio::ratelimit::RateLimiter;

const LLDP_MULTICAST: MacAddr = MacAddr(0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e);
const CDP_MULTICAST: MacAddr = MacAddr(0x01, 0x00, 0x0c, 0xcc, 0xcc, 0xcc);
const EDP_MULTICAST: MacAddr = MacAddr(0x00, 0xe0, 0x2b, 0x00, 0x00, 0x00);
const FDP_MULTICAST: MacAddr = MacAddr(0x01, 0xe0, 0x52, 0xcc, 0xcc, 0xcc);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryProtocol {
    Lldp,
    Cdp,
    Edp,
    Fdp,
}

impl DiscoveryProtocol {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Lldp => "lldp",
            Self::Cdp => "cdp",
            Self::Edp => "edp",
            Self::Fdp => "fdp",
        }
    }

    pub fn enabled(&self, cfg: &DeviceConfig) -> bool {
        match self {
            Self::Lldp => cfg.lldp.enabled,
            Self::Cdp => cfg.cdp.enabled,
            Self::Edp => cfg.edp.enabled,
            Self::Fdp => cfg.fdp.enabled,
        }
    }

    pub fn interval(&self, cfg: &DeviceConfig) -> Duration {
        let secs = match self {
            Self::Lldp => cfg.lldp.advertise_interval,
            Self::Cdp => cfg.cdp.advertise_interval,
            Self::Edp => cfg.edp.advertise_interval,
            Self::Fdp => cfg.fdp.advertise_interval,
        };
        Duration::from_secs(secs as u64)
    }

    pub fn build(&self, device: &Device) -> RawFrame {
        match self {
            Self::Lldp => build_lldp(device),
            Self::Cdp => build_cdp(device),
            Self::Edp => build_edp(device),
            Self::Fdp => build_fdp(device),
        }
    }
}

/// Ticker task: one per enabled protocol per device. Emits only while the
/// device is up; exits when the run's shutdown signal fires.
pub async fn advertise_loop(
    device: Arc<Device>,
    protocol: DiscoveryProtocol,
    sink: Arc<dyn FrameSink>,
    limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = protocol.interval(device.config());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !device.is_up() {
                    continue;
                }
                let frame = protocol.build(&device);
                if limiter.acquire().await {
                    let len = frame.len();
                    if sink.send_frame(frame).await.is_ok() {
                        device.counters().record_out(len);
                        trace!("{} advertisement sent for {}", protocol.label(), device.name());
                    }
                }
            }
        }
    }
    debug!("{} advertiser for {} exited", protocol.label(), device.name());
}

fn system_name(device: &Device) -> String {
    device
        .config()
        .lldp
        .system_name
        .clone()
        .or_else(|| device.property("sysName").map(str::to_string))
        .unwrap_or_else(|| device.name().to_string())
}

fn system_description(device: &Device) -> String {
    device
        .config()
        .lldp
        .system_description
        .clone()
        .or_else(|| device.property("sysDescr").map(str::to_string))
        .unwrap_or_else(|| format!("{} {}", device.kind(), device.name()))
}

fn platform(device: &Device) -> String {
    device
        .config()
        .cdp
        .platform
        .clone()
        .or_else(|| device.property("platform").map(str::to_string))
        .unwrap_or_else(|| device.kind().to_string())
}

fn software_version(device: &Device) -> String {
    device
        .config()
        .cdp
        .software_version
        .clone()
        .or_else(|| device.property("softwareVersion").map(str::to_string))
        .unwrap_or_else(|| "1.0".to_string())
}

pub fn build_lldp(device: &Device) -> RawFrame {
    let cfg = device.config();
    let mut body = Vec::with_capacity(128);

    // Chassis ID: configured string (locally assigned) or the MAC.
    match &cfg.lldp.chassis_id {
        Some(id) => {
            let mut value = vec![7u8];
            value.extend_from_slice(id.as_bytes());
            push_lldp_tlv(&mut body, 1, &value);
        }
        None => {
            let mut value = vec![4u8];
            value.extend_from_slice(&device.mac().octets());
            push_lldp_tlv(&mut body, 1, &value);
        }
    }

    // Port ID, locally assigned.
    let mut port = vec![7u8];
    port.extend_from_slice(device.if_name().as_bytes());
    push_lldp_tlv(&mut body, 2, &port);

    // TTL: four advertisement intervals, the conventional default.
    let ttl = (cfg.lldp.advertise_interval * 4).min(65535) as u16;
    push_lldp_tlv(&mut body, 3, &ttl.to_be_bytes());

    let port_descr = cfg
        .lldp
        .port_description
        .clone()
        .unwrap_or_else(|| device.if_name().to_string());
    push_lldp_tlv(&mut body, 4, port_descr.as_bytes());
    push_lldp_tlv(&mut body, 5, system_name(device).as_bytes());
    push_lldp_tlv(&mut body, 6, system_description(device).as_bytes());

    let caps = capabilities_bits(device.kind());
    let mut cap_value = Vec::with_capacity(4);
    cap_value.extend_from_slice(&caps.to_be_bytes());
    cap_value.extend_from_slice(&caps.to_be_bytes());
    push_lldp_tlv(&mut body, 7, &cap_value);

    let mgmt = cfg
        .lldp
        .management_address
        .or_else(|| cfg.first_ipv4());
    if let Some(ip) = mgmt {
        let mut value = vec![5u8, 1u8];
        value.extend_from_slice(&ip.octets());
        // Interface numbering: ifIndex 1, no OID.
        value.push(2);
        value.extend_from_slice(&1u32.to_be_bytes());
        value.push(0);
        push_lldp_tlv(&mut body, 8, &value);
    }

    push_lldp_tlv(&mut body, 0, &[]);
    frame::build_ethernet(LLDP_MULTICAST, device.mac(), ETHERTYPE_LLDP, &body)
}

fn push_lldp_tlv(out: &mut Vec<u8>, tlv_type: u8, value: &[u8]) {
    let header = ((tlv_type as u16) << 9) | (value.len() as u16 & 0x1ff);
    out.extend_from_slice(&header.to_be_bytes());
    out.extend_from_slice(value);
}

/// IEEE 802.1AB capability bits by device kind tag.
fn capabilities_bits(kind: &str) -> u16 {
    match kind {
        "router" => 0x0010,
        "switch" => 0x0004,
        "access_point" | "ap" => 0x0008,
        _ => 0x0080,
    }
}

pub fn build_cdp(device: &Device) -> RawFrame {
    let cfg = device.config();
    let device_id = cfg.cdp.device_id.clone().unwrap_or_else(|| device.name().to_string());
    let port_id = cfg.cdp.port_id.clone().unwrap_or_else(|| device.if_name().to_string());

    let mut cdp = vec![0x02, 0xb4, 0x00, 0x00]; // version 2, TTL 180, checksum
    push_wide_tlv(&mut cdp, 0x0001, device_id.as_bytes());
    if let Some(ip) = cfg.first_ipv4() {
        let mut value = 1u32.to_be_bytes().to_vec();
        value.extend_from_slice(&[0x01, 0x01, 0xcc]);
        value.extend_from_slice(&4u16.to_be_bytes());
        value.extend_from_slice(&ip.octets());
        push_wide_tlv(&mut cdp, 0x0002, &value);
    }
    push_wide_tlv(&mut cdp, 0x0003, port_id.as_bytes());
    push_wide_tlv(&mut cdp, 0x0004, &cdp_capabilities(device.kind()).to_be_bytes());
    push_wide_tlv(&mut cdp, 0x0005, software_version(device).as_bytes());
    push_wide_tlv(&mut cdp, 0x0006, platform(device).as_bytes());

    let checksum = pnet::util::checksum(&cdp, 1);
    cdp[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut payload = vec![0xaa, 0xaa, 0x03, 0x00, 0x00, 0x0c, 0x20, 0x00];
    payload.extend_from_slice(&cdp);
    // 802.3 frame: the type field carries the LLC payload length.
    frame::build_ethernet(CDP_MULTICAST, device.mac(), payload.len() as u16, &payload)
}

fn cdp_capabilities(kind: &str) -> u32 {
    match kind {
        "router" => 0x01,
        "switch" => 0x08,
        _ => 0x10,
    }
}

fn push_wide_tlv(out: &mut Vec<u8>, tlv_type: u16, value: &[u8]) {
    out.extend_from_slice(&tlv_type.to_be_bytes());
    out.extend_from_slice(&((value.len() + 4) as u16).to_be_bytes());
    out.extend_from_slice(value);
}

pub fn build_edp(device: &Device) -> RawFrame {
    let name = system_name(device);

    // Fixed header: version, reserved, length, checksum, sequence, id type,
    // then the machine MAC.
    let mut edp = vec![0x01, 0x00, 0, 0, 0, 0, 0, 0, 0x00, 0x00];
    edp.extend_from_slice(&device.mac().octets());

    // Display TLV.
    let mut display = Vec::new();
    display.push(0x99);
    display.push(0x01);
    display.extend_from_slice(&((name.len() + 4) as u16).to_be_bytes());
    display.extend_from_slice(name.as_bytes());
    edp.extend_from_slice(&display);
    // Null TLV terminates.
    edp.extend_from_slice(&[0x99, 0x00, 0x00, 0x04]);

    let len = edp.len() as u16;
    edp[2..4].copy_from_slice(&len.to_be_bytes());
    let checksum = pnet::util::checksum(&edp, 2);
    edp[4..6].copy_from_slice(&checksum.to_be_bytes());

    let mut payload = vec![0xaa, 0xaa, 0x03, 0x00, 0xe0, 0x2b, 0x00, 0xbb];
    payload.extend_from_slice(&edp);
    frame::build_ethernet(EDP_MULTICAST, device.mac(), payload.len() as u16, &payload)
}

pub fn build_fdp(device: &Device) -> RawFrame {
    let cfg = device.config();
    let device_id = cfg.cdp.device_id.clone().unwrap_or_else(|| device.name().to_string());

    let mut fdp = vec![0x01, 0x0a, 0x00, 0x00]; // version 1, TTL 10, checksum
    push_wide_tlv(&mut fdp, 0x0001, device_id.as_bytes());
    if let Some(ip) = cfg.first_ipv4() {
        let mut value = 1u32.to_be_bytes().to_vec();
        value.extend_from_slice(&[0x01, 0x01, 0xcc]);
        value.extend_from_slice(&4u16.to_be_bytes());
        value.extend_from_slice(&ip.octets());
        push_wide_tlv(&mut fdp, 0x0002, &value);
    }
    push_wide_tlv(&mut fdp, 0x0003, device.if_name().as_bytes());
    push_wide_tlv(&mut fdp, 0x0004, &cdp_capabilities(device.kind()).to_be_bytes());
    push_wide_tlv(&mut fdp, 0x0005, software_version(device).as_bytes());
    push_wide_tlv(&mut fdp, 0x0006, platform(device).as_bytes());

    let checksum = pnet::util::checksum(&fdp, 1);
    fdp[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut payload = vec![0xaa, 0xaa, 0x03, 0x00, 0xe0, 0x52, 0x20, 0x00];
    payload.extend_from_slice(&fdp);
    frame::build_ethernet(FDP_MULTICAST, device.mac(), payload.len() as u16, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use mac_address::MacAddress;

    fn device(kind: &str) -> Device {
        let mut cfg = DeviceConfig::new("sw1", kind, MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("10.0.0.5".parse().unwrap());
        cfg.lldp.enabled = true;
        cfg.cdp.enabled = true;
        Device::bare(cfg)
    }

    #[test]
    fn lldp_frame_has_multicast_dst_and_lldp_ethertype() {
        let dev = device("switch");
        let raw = build_lldp(&dev);
        assert_eq!(&raw[..6], &[0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e]);
        assert_eq!(&raw[12..14], &ETHERTYPE_LLDP.to_be_bytes());
        // First TLV is Chassis ID (type 1), MAC subtype.
        let header = u16::from_be_bytes([raw[14], raw[15]]);
        assert_eq!(header >> 9, 1);
        assert_eq!(raw[16], 4);
        assert_eq!(&raw[17..23], &[2, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn lldp_ttl_is_four_intervals() {
        let dev = device("router");
        let raw = build_lldp(&dev);
        // Walk TLVs to find type 3.
        let mut pos = 14;
        loop {
            let header = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
            let (t, len) = ((header >> 9) as u8, (header & 0x1ff) as usize);
            if t == 3 {
                let ttl = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]);
                assert_eq!(ttl, 120);
                break;
            }
            assert_ne!(t, 0, "TTL TLV missing");
            pos += 2 + len;
        }
    }

    #[test]
    fn cdp_frame_uses_snap_encapsulation() {
        let dev = device("router");
        let raw = build_cdp(&dev);
        assert_eq!(&raw[..6], &[0x01, 0x00, 0x0c, 0xcc, 0xcc, 0xcc]);
        // 802.3 length, then SNAP with Cisco OUI and CDP PID.
        let length = u16::from_be_bytes([raw[12], raw[13]]) as usize;
        assert_eq!(length, raw.len() - 14);
        assert_eq!(&raw[14..22], &[0xaa, 0xaa, 0x03, 0x00, 0x00, 0x0c, 0x20, 0x00]);
        // CDP version 2.
        assert_eq!(raw[22], 0x02);
    }

    #[test]
    fn cdp_checksum_verifies() {
        let dev = device("switch");
        let raw = build_cdp(&dev);
        let cdp = &raw[22..];
        // Recomputing over the checksummed bytes must give zero.
        assert_eq!(pnet::util::checksum(cdp, cdp.len()), 0);
    }

    #[test]
    fn edp_and_fdp_build_non_empty_snap_frames() {
        let dev = device("switch");
        let edp = build_edp(&dev);
        assert_eq!(&edp[..6], &[0x00, 0xe0, 0x2b, 0x00, 0x00, 0x00]);
        assert_eq!(&edp[17..20], &[0x00, 0xe0, 0x2b]);

        let fdp = build_fdp(&dev);
        assert_eq!(&fdp[..6], &[0x01, 0xe0, 0x52, 0xcc, 0xcc, 0xcc]);
        assert_eq!(&fdp[17..20], &[0x00, 0xe0, 0x52]);
    }
}
