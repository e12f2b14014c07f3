//! SNMP subsystem: OID/value model, BER codec, the per-device MIB store and
//! agent, walk-file ingest, trap emission, and the UDP handler that plugs the
//! agents into the dispatcher.

pub mod agent;
pub mod ber;
pub mod mib;
pub mod oid;
pub mod trap;
pub mod value;
pub mod walk;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::trace;

use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{Frame, RawFrame};
use crate::dispatch::{DispatchKey, ProtocolHandler};

use agent::AgentOutcome;
use mib::well_known;
use trap::TrapSender;

pub const SNMP_PORT: u16 = 161;

/// Dispatcher-facing handler: routes UDP/161 payloads into the device's
/// agent and wraps the response back into a frame. A failed community check
/// emits authenticationFailure when the device has that trap enabled.
pub struct SnmpHandler {
    trap_senders: HashMap<String, Arc<TrapSender>>,
}

impl SnmpHandler {
    pub fn new(trap_senders: HashMap<String, Arc<TrapSender>>) -> Self {
        Self { trap_senders }
    }
}

#[async_trait]
impl ProtocolHandler for SnmpHandler {
    fn name(&self) -> &'static str {
        "snmp"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        vec![DispatchKey::UdpPort(SNMP_PORT)]
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().snmp.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let Some(agent) = device.agent() else {
            return Ok(Vec::new());
        };
        let Some((src_port, _, payload)) = frame.udp() else {
            return Ok(Vec::new());
        };

        match agent.handle_message(payload) {
            AgentOutcome::Response(bytes) => Ok(crate::proto::udp_reply(
                frame, device, SNMP_PORT, src_port, &bytes,
            )
            .into_iter()
            .collect()),
            AgentOutcome::AuthenticationFailure => {
                trace!("device {}: SNMP community mismatch", device.name());
                if let Some(sender) = self.trap_senders.get(device.name()) {
                    if sender.toggles().authentication_failure {
                        sender
                            .send(agent.uptime_ticks(), well_known::trap_auth_failure(), Vec::new())
                            .await;
                    }
                }
                Ok(Vec::new())
            }
            AgentOutcome::Discard => Ok(Vec::new()),
        }
    }
}
