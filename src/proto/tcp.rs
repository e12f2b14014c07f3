//! Minimal TCP reply machinery shared by the HTTP and FTP responders.
//!
//! There is deliberately no connection table: every reply is derived from
//! the segment that prompted it (our next sequence number is whatever the
//! client last acknowledged). Enough for probing tools; no retransmission,
//! no windows, no reassembly.

use std::net::Ipv4Addr;

use pnet::packet::ethernet::EtherTypes;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags};
use pnet::util::MacAddr;
use rand::Rng;

use crate::core::device::Device;
use crate::core::frame::{self, Frame, NetLayer, RawFrame, Transport};

const WINDOW: u16 = 64_240;

/// Everything a stateless responder needs from one inbound segment.
#[derive(Debug, Clone)]
pub struct TcpContext {
    pub client_mac: MacAddr,
    pub client_ip: Ipv4Addr,
    /// Address the client was talking to; becomes our source.
    pub local_ip: Ipv4Addr,
    pub client_port: u16,
    pub local_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl TcpContext {
    pub fn from_frame(frame: &Frame, device: &Device) -> Option<Self> {
        let NetLayer::Ipv4(ref v4) = frame.net else {
            return None;
        };
        let Transport::Tcp { src_port, dst_port, seq, ack, flags, ref payload, .. } = v4.transport
        else {
            return None;
        };
        let local_ip = if device.has_ip(&std::net::IpAddr::V4(v4.dst)) {
            v4.dst
        } else {
            device.config().first_ipv4()?
        };
        Some(Self {
            client_mac: frame.src_mac,
            client_ip: v4.src,
            local_ip,
            client_port: src_port,
            local_port: dst_port,
            seq,
            ack,
            flags,
            payload: payload.clone(),
        })
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TcpFlags::SYN != 0 && self.flags & TcpFlags::ACK == 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TcpFlags::FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TcpFlags::RST != 0
    }

    /// ACK with no payload: the tail of the handshake.
    pub fn is_bare_ack(&self) -> bool {
        self.flags & TcpFlags::ACK != 0
            && self.flags & (TcpFlags::SYN | TcpFlags::FIN | TcpFlags::RST) == 0
            && self.payload.is_empty()
    }
}

/// What the application layer wants sent back for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpAction {
    /// Answer a SYN with SYN/ACK (fresh random ISN).
    SynAck,
    /// Payload back to the client, optionally closing our side.
    Data { bytes: Vec<u8>, fin: bool },
    /// Acknowledge the peer's FIN and close.
    FinAck,
    Ignore,
}

pub fn reply_segments(ctx: &TcpContext, device: &Device, action: TcpAction) -> Vec<RawFrame> {
    match action {
        TcpAction::SynAck => {
            let isn: u32 = rand::thread_rng().gen();
            vec![build_segment(
                ctx,
                device,
                isn,
                ctx.seq.wrapping_add(1),
                TcpFlags::SYN | TcpFlags::ACK,
                &[],
            )]
        }
        TcpAction::Data { bytes, fin } => {
            let mut flags = TcpFlags::PSH | TcpFlags::ACK;
            if fin {
                flags |= TcpFlags::FIN;
            }
            let ack = ctx.seq.wrapping_add(ctx.payload.len() as u32);
            vec![build_segment(ctx, device, ctx.ack, ack, flags, &bytes)]
        }
        TcpAction::FinAck => {
            vec![build_segment(
                ctx,
                device,
                ctx.ack,
                ctx.seq.wrapping_add(1),
                TcpFlags::FIN | TcpFlags::ACK,
                &[],
            )]
        }
        TcpAction::Ignore => Vec::new(),
    }
}

fn build_segment(
    ctx: &TcpContext,
    device: &Device,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> RawFrame {
    let tcp_len = 20 + payload.len();
    let mut segment = vec![0u8; tcp_len];
    {
        let mut tcp_pkt = MutableTcpPacket::new(&mut segment).expect("sized above");
        tcp_pkt.set_source(ctx.local_port);
        tcp_pkt.set_destination(ctx.client_port);
        tcp_pkt.set_sequence(seq);
        tcp_pkt.set_acknowledgement(ack);
        tcp_pkt.set_data_offset(5);
        tcp_pkt.set_flags(flags);
        tcp_pkt.set_window(WINDOW);
        tcp_pkt.set_payload(payload);
        let checksum = tcp::ipv4_checksum(&tcp_pkt.to_immutable(), &ctx.local_ip, &ctx.client_ip);
        tcp_pkt.set_checksum(checksum);
    }
    let ip = frame::build_ipv4(
        ctx.local_ip,
        ctx.client_ip,
        IpNextHeaderProtocols::Tcp.0,
        64,
        &segment,
    );
    frame::build_ethernet(ctx.client_mac, device.mac(), EtherTypes::Ipv4.0, &ip)
}

/// Client-side segment builder for tests.
#[cfg(test)]
pub fn client_segment(
    device: &Device,
    dst_ip: Ipv4Addr,
    port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> RawFrame {
    let src_ip: Ipv4Addr = "10.0.0.99".parse().unwrap();
    let tcp_len = 20 + payload.len();
    let mut segment = vec![0u8; tcp_len];
    {
        let mut tcp_pkt = MutableTcpPacket::new(&mut segment).unwrap();
        tcp_pkt.set_source(50000);
        tcp_pkt.set_destination(port);
        tcp_pkt.set_sequence(seq);
        tcp_pkt.set_acknowledgement(ack);
        tcp_pkt.set_data_offset(5);
        tcp_pkt.set_flags(flags);
        tcp_pkt.set_window(WINDOW);
        tcp_pkt.set_payload(payload);
        let checksum = tcp::ipv4_checksum(&tcp_pkt.to_immutable(), &src_ip, &dst_ip);
        tcp_pkt.set_checksum(checksum);
    }
    let ip = frame::build_ipv4(src_ip, dst_ip, IpNextHeaderProtocols::Tcp.0, 64, &segment);
    frame::build_ethernet(
        device.mac(),
        MacAddr::new(2, 0, 0, 0, 0, 0x63),
        EtherTypes::Ipv4.0,
        &ip,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::core::device::DeviceState;
    use crate::core::frame::decode;
    use mac_address::MacAddress;
    use std::sync::Arc;

    fn device() -> Arc<Device> {
        let mut cfg = DeviceConfig::new("d", "server", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("10.0.0.5".parse().unwrap());
        let dev = Arc::new(Device::bare(cfg));
        dev.set_state(DeviceState::Up);
        dev
    }

    #[test]
    fn syn_produces_synack_acking_isn_plus_one() {
        let device = device();
        let raw = client_segment(&device, "10.0.0.5".parse().unwrap(), 80, 1000, 0, TcpFlags::SYN, &[]);
        let parsed = decode(&raw).unwrap();
        let ctx = TcpContext::from_frame(&parsed, &device).unwrap();
        assert!(ctx.is_syn());

        let frames = reply_segments(&ctx, &device, TcpAction::SynAck);
        let reply = decode(&frames[0]).unwrap();
        let NetLayer::Ipv4(v4) = reply.net else { panic!("not ipv4") };
        let Transport::Tcp { ack, flags, .. } = v4.transport else { panic!("not tcp") };
        assert_eq!(ack, 1001);
        assert_eq!(flags & (TcpFlags::SYN | TcpFlags::ACK), TcpFlags::SYN | TcpFlags::ACK);
    }

    #[test]
    fn data_reply_uses_clients_ack_as_sequence() {
        let device = device();
        let raw = client_segment(
            &device,
            "10.0.0.5".parse().unwrap(),
            80,
            2000,
            555,
            TcpFlags::PSH | TcpFlags::ACK,
            b"GET / HTTP/1.0\r\n\r\n",
        );
        let parsed = decode(&raw).unwrap();
        let ctx = TcpContext::from_frame(&parsed, &device).unwrap();

        let frames = reply_segments(
            &ctx,
            &device,
            TcpAction::Data { bytes: b"hi".to_vec(), fin: true },
        );
        let reply = decode(&frames[0]).unwrap();
        let NetLayer::Ipv4(v4) = reply.net else { panic!("not ipv4") };
        let Transport::Tcp { seq, ack, flags, payload, .. } = v4.transport else {
            panic!("not tcp")
        };
        assert_eq!(seq, 555);
        assert_eq!(ack, 2000 + 18);
        assert_ne!(flags & TcpFlags::FIN, 0);
        assert_eq!(payload, b"hi");
    }
}
