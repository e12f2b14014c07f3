//! STP/RSTP BPDU emitter. The simulated bridge always claims to be root;
//! there is no topology computation, only periodic hello frames.

use std::sync::Arc;

use log::{debug, trace};
use pnet::util::MacAddr;
use tokio::sync::watch;

use crate::config::StpVersion;
use crate::core::device::Device;
use crate::core::frame::{self, RawFrame};
use crate::netio::capture::FrameSink;
use crate::netio::ratelimit::RateLimiter;

const STP_MULTICAST: MacAddr = MacAddr(0x01, 0x80, 0xc2, 0x00, 0x00, 0x00);
/// Designated port role, learning and forwarding set.
const RSTP_FLAGS: u8 = 0x3c;

pub fn build_bpdu(device: &Device) -> RawFrame {
    let cfg = &device.config().stp;
    let mut bridge_id = cfg.bridge_priority.to_be_bytes().to_vec();
    bridge_id.extend_from_slice(&device.mac().octets());

    let (version, bpdu_type, flags) = match cfg.version {
        StpVersion::Stp => (0u8, 0x00u8, 0u8),
        StpVersion::Rstp => (2, 0x02, RSTP_FLAGS),
        StpVersion::Mstp => (3, 0x02, RSTP_FLAGS),
    };

    let mut bpdu = Vec::with_capacity(40);
    bpdu.extend_from_slice(&[0x00, 0x00]); // protocol identifier
    bpdu.push(version);
    bpdu.push(bpdu_type);
    bpdu.push(flags);
    bpdu.extend_from_slice(&bridge_id); // root id: we are root
    bpdu.extend_from_slice(&0u32.to_be_bytes()); // root path cost
    bpdu.extend_from_slice(&bridge_id);
    bpdu.extend_from_slice(&0x8001u16.to_be_bytes()); // port id
    bpdu.extend_from_slice(&0u16.to_be_bytes()); // message age
    bpdu.extend_from_slice(&((cfg.max_age as u16) * 256).to_be_bytes());
    bpdu.extend_from_slice(&((cfg.hello_time as u16) * 256).to_be_bytes());
    bpdu.extend_from_slice(&((cfg.forward_delay as u16) * 256).to_be_bytes());
    if version >= 2 {
        bpdu.push(0); // version 1 length
    }

    let mut payload = vec![0x42, 0x42, 0x03];
    payload.extend_from_slice(&bpdu);
    frame::build_ethernet(STP_MULTICAST, device.mac(), payload.len() as u16, &payload)
}

/// Emits one BPDU every hello_time while the device is up.
pub async fn bpdu_loop(
    device: Arc<Device>,
    sink: Arc<dyn FrameSink>,
    limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let hello = std::time::Duration::from_secs(device.config().stp.hello_time as u64);
    let mut ticker = tokio::time::interval(hello);
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
                let frame = build_bpdu(&device);
                if limiter.acquire().await {
                    let len = frame.len();
                    if sink.send_frame(frame).await.is_ok() {
                        device.counters().record_out(len);
                        trace!("BPDU sent for {}", device.name());
                    }
                }
            }
        }
    }
    debug!("BPDU emitter for {} exited", device.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use mac_address::MacAddress;

    fn device(version: StpVersion) -> Device {
        let mut cfg = DeviceConfig::new("sw1", "switch", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.stp.enabled = true;
        cfg.stp.version = version;
        Device::bare(cfg)
    }

    #[test]
    fn config_bpdu_carries_timers_in_256ths() {
        let dev = device(StpVersion::Stp);
        let raw = build_bpdu(&dev);
        assert_eq!(&raw[..6], &[0x01, 0x80, 0xc2, 0x00, 0x00, 0x00]);
        assert_eq!(&raw[14..17], &[0x42, 0x42, 0x03]);
        let bpdu = &raw[17..];
        assert_eq!(bpdu[2], 0, "protocol version");
        assert_eq!(bpdu[3], 0, "bpdu type");
        // Root id priority 32768.
        assert_eq!(&bpdu[5..7], &0x8000u16.to_be_bytes());
        // max age 20s, hello 2s, forward delay 15s.
        assert_eq!(&bpdu[29..31], &(20u16 * 256).to_be_bytes());
        assert_eq!(&bpdu[31..33], &(2u16 * 256).to_be_bytes());
        assert_eq!(&bpdu[33..35], &(15u16 * 256).to_be_bytes());
    }

    #[test]
    fn rstp_bpdu_uses_version_two() {
        let dev = device(StpVersion::Rstp);
        let raw = build_bpdu(&dev);
        let bpdu = &raw[17..];
        assert_eq!(bpdu[2], 2);
        assert_eq!(bpdu[3], 0x02);
    }
}
