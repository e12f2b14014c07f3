//! Canned-endpoint HTTP responder, deep enough for banner grabs and path
//! probes: SYN/ACK the handshake, answer one GET per segment, close.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::trace;

use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{Frame, RawFrame};
use crate::dispatch::{DispatchKey, ProtocolHandler};

use super::tcp::{reply_segments, TcpAction, TcpContext};

pub struct HttpHandler {
    ports: BTreeSet<u16>,
}

impl HttpHandler {
    /// One handler serves every device; it subscribes to the union of the
    /// configured ports and re-checks the device's own port per frame.
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self { ports: ports.into_iter().collect() }
    }
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        self.ports.iter().map(|p| DispatchKey::TcpPort(*p)).collect()
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().http.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let Some(ctx) = TcpContext::from_frame(frame, device) else {
            return Ok(Vec::new());
        };
        if ctx.local_port != device.config().http.port {
            return Ok(Vec::new());
        }
        let action = if ctx.is_rst() {
            TcpAction::Ignore
        } else if ctx.is_syn() {
            TcpAction::SynAck
        } else if ctx.is_fin() {
            TcpAction::FinAck
        } else if !ctx.payload.is_empty() {
            TcpAction::Data {
                bytes: respond(device, &ctx.payload),
                fin: true,
            }
        } else {
            TcpAction::Ignore
        };
        Ok(reply_segments(&ctx, device, action))
    }
}

fn respond(device: &Device, request: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(request);
    let path = text
        .lines()
        .next()
        .and_then(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("GET"), Some(path)) | (Some("HEAD"), Some(path)) => Some(path.to_string()),
                _ => None,
            }
        });

    let Some(path) = path else {
        return http_response(400, "Bad Request", "");
    };
    trace!("HTTP GET {path} on {}", device.name());

    match device
        .config()
        .http
        .endpoints
        .iter()
        .find(|e| e.path == path)
    {
        Some(endpoint) => http_response(200, "OK", &endpoint.content),
        None => http_response(404, "Not Found", "404 not found\n"),
    }
}

fn http_response(code: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {reason}\r\nServer: httpd\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}
