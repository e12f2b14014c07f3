//! Minimal FTP control-channel responder: banner, USER/PASS, QUIT. No data
//! channel, no transfers; exactly what a service probe expects to see.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{Frame, RawFrame};
use crate::dispatch::{DispatchKey, ProtocolHandler};

use super::tcp::{reply_segments, TcpAction, TcpContext};

pub struct FtpHandler {
    ports: BTreeSet<u16>,
}

impl FtpHandler {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self { ports: ports.into_iter().collect() }
    }
}

#[async_trait]
impl ProtocolHandler for FtpHandler {
    fn name(&self) -> &'static str {
        "ftp"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        self.ports.iter().map(|p| DispatchKey::TcpPort(*p)).collect()
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().ftp.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let Some(ctx) = TcpContext::from_frame(frame, device) else {
            return Ok(Vec::new());
        };
        if ctx.local_port != device.config().ftp.port {
            return Ok(Vec::new());
        }
        let action = if ctx.is_rst() {
            TcpAction::Ignore
        } else if ctx.is_syn() {
            TcpAction::SynAck
        } else if ctx.is_fin() {
            TcpAction::FinAck
        } else if ctx.is_bare_ack() {
            // Handshake completed: greet the client.
            TcpAction::Data {
                bytes: format!("220 {} FTP server ready\r\n", device.name()).into_bytes(),
                fin: false,
            }
        } else if !ctx.payload.is_empty() {
            let (reply, close) = command_reply(device, &ctx.payload);
            TcpAction::Data { bytes: reply, fin: close }
        } else {
            TcpAction::Ignore
        };
        Ok(reply_segments(&ctx, device, action))
    }
}

fn command_reply(device: &Device, payload: &[u8]) -> (Vec<u8>, bool) {
    let line = String::from_utf8_lossy(payload);
    let line = line.trim_end();
    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or_default().to_ascii_uppercase();
    let arg = parts.next().unwrap_or_default();

    let (text, close) = match verb.as_str() {
        "USER" => ("331 Password required\r\n".to_string(), false),
        "PASS" => {
            let ok = device
                .config()
                .ftp
                .users
                .iter()
                .any(|u| u.password == arg);
            if ok {
                ("230 Login successful\r\n".to_string(), false)
            } else {
                ("530 Login incorrect\r\n".to_string(), false)
            }
        }
        "SYST" => ("215 UNIX Type: L8\r\n".to_string(), false),
        "QUIT" => ("221 Goodbye\r\n".to_string(), true),
        _ => ("502 Command not implemented\r\n".to_string(), false),
    };
    (text.into_bytes(), close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, FtpUser};
    use crate::core::device::DeviceState;
    use crate::core::frame::{decode, NetLayer, Transport};
    use crate::proto::tcp::client_segment;
    use mac_address::MacAddress;
    use pnet::packet::tcp::TcpFlags;

    fn device() -> Arc<Device> {
        let mut cfg = DeviceConfig::new("files", "server", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("10.0.0.5".parse().unwrap());
        cfg.ftp.enabled = true;
        cfg.ftp.users.push(FtpUser {
            username: "admin".into(),
            password: "hunter2".into(),
        });
        let dev = Arc::new(Device::bare(cfg));
        dev.set_state(DeviceState::Up);
        dev
    }

    async fn text_reply(device: &Arc<Device>, payload: &[u8]) -> String {
        let raw = client_segment(
            device,
            "10.0.0.5".parse().unwrap(),
            21,
            500,
            1,
            TcpFlags::PSH | TcpFlags::ACK,
            payload,
        );
        let parsed = decode(&raw).unwrap();
        let replies = FtpHandler::new([21]).handle(&parsed, device).await.unwrap();
        let reply = decode(&replies[0]).unwrap();
        let NetLayer::Ipv4(v4) = reply.net else { panic!("not ipv4") };
        let Transport::Tcp { payload, .. } = v4.transport else { panic!("not tcp") };
        String::from_utf8(payload).unwrap()
    }

    #[tokio::test]
    async fn handshake_ack_triggers_banner() {
        let device = device();
        let raw = client_segment(
            &device,
            "10.0.0.5".parse().unwrap(),
            21,
            501,
            1,
            TcpFlags::ACK,
            &[],
        );
        let parsed = decode(&raw).unwrap();
        let replies = FtpHandler::new([21]).handle(&parsed, &device).await.unwrap();
        let reply = decode(&replies[0]).unwrap();
        let NetLayer::Ipv4(v4) = reply.net else { panic!("not ipv4") };
        let Transport::Tcp { payload, .. } = v4.transport else { panic!("not tcp") };
        assert!(String::from_utf8(payload).unwrap().starts_with("220 "));
    }

    #[tokio::test]
    async fn user_then_pass_flow() {
        let device = device();
        assert!(text_reply(&device, b"USER admin\r\n").await.starts_with("331"));
        assert!(text_reply(&device, b"PASS hunter2\r\n").await.starts_with("230"));
        assert!(text_reply(&device, b"PASS wrong\r\n").await.starts_with("530"));
    }

    #[tokio::test]
    async fn unknown_command_is_502() {
        let device = device();
        assert!(text_reply(&device, b"MKD /tmp\r\n").await.starts_with("502"));
    }
}
