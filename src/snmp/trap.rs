//! Trap emission: v2c Trap PDUs over UDP plus the threshold poller.
//!
//! State-change traps (coldStart, linkUp/linkDown, authenticationFailure)
//! are fired by the lifecycle controller and the SNMP handler. Threshold
//! traps come from a per-device poller with edge-trigger hysteresis: a trap
//! fires on the below -> at-or-above transition and not again until the
//! value has dropped below the threshold.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::{TrapConfig, TrapThresholds, TrapToggles};
use crate::core::device::Device;
use crate::errorinj::{calibrated_counter, ErrorKind, ErrorStateManager};

use super::ber::{self, BoundValue, Pdu, PduKind, SnmpMessage};
use super::mib::well_known;
use super::oid::Oid;
use super::value::MibValue;

pub struct TrapSender {
    socket: UdpSocket,
    receivers: Vec<std::net::SocketAddr>,
    community: String,
    toggles: TrapToggles,
    send_errors: AtomicU64,
    sent: AtomicU64,
}

impl TrapSender {
    pub async fn bind(cfg: &TrapConfig) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            receivers: cfg.receivers.clone(),
            community: cfg.community.clone(),
            toggles: cfg.toggles.clone(),
            send_errors: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        })
    }

    pub fn toggles(&self) -> &TrapToggles {
        &self.toggles
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Relaxed)
    }

    /// Sends one trap to every receiver. Per-receiver failures are logged and
    /// counted; they never block the remaining receivers.
    pub async fn send(&self, uptime_ticks: u32, trap_oid: Oid, extra: Vec<(Oid, MibValue)>) {
        let mut bindings = vec![
            (
                well_known::sys_uptime(),
                BoundValue::Value(MibValue::TimeTicks(uptime_ticks)),
            ),
            (
                well_known::snmp_trap_oid(),
                BoundValue::Value(MibValue::Oid(trap_oid.clone())),
            ),
        ];
        for (oid, value) in extra {
            bindings.push((oid, BoundValue::Value(value)));
        }
        let message = SnmpMessage {
            version: 1,
            community: self.community.as_bytes().to_vec(),
            pdu: Pdu {
                kind: PduKind::TrapV2,
                request_id: rand::thread_rng().gen_range(0..i32::MAX),
                error_status: 0,
                error_index: 0,
                bindings,
            },
        };
        let datagram = ber::encode_message(&message);
        for receiver in &self.receivers {
            match self.socket.send_to(&datagram, receiver).await {
                Ok(_) => {
                    self.sent.fetch_add(1, Relaxed);
                    debug!("trap {trap_oid} sent to {receiver}");
                }
                Err(e) => {
                    self.send_errors.fetch_add(1, Relaxed);
                    warn!("trap send to {receiver} failed: {e}");
                }
            }
        }
    }
}

/// Which side of the threshold each monitored quantity was on last tick.
#[derive(Default)]
struct EdgeState {
    cpu: bool,
    memory: bool,
    disk: bool,
    interface_errors: bool,
}

/// Per-device threshold poller task body.
pub struct ThresholdPoller {
    device: Arc<Device>,
    errors: Arc<ErrorStateManager>,
    sender: Arc<TrapSender>,
    thresholds: TrapThresholds,
    poll_interval: Duration,
}

impl ThresholdPoller {
    pub fn new(
        device: Arc<Device>,
        errors: Arc<ErrorStateManager>,
        sender: Arc<TrapSender>,
        thresholds: TrapThresholds,
        poll_interval: Duration,
    ) -> Self {
        Self { device, errors, sender, thresholds, poll_interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut edges = EdgeState::default();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll(&mut edges).await;
                }
            }
        }
        debug!("threshold poller for {} exited", self.device.name());
    }

    async fn poll(&self, edges: &mut EdgeState) {
        let Some(device_ip) = self.device.ips().first().copied() else {
            return;
        };
        let if_name = self.device.if_name().to_string();
        let uptime = self
            .device
            .agent()
            .map(|a| a.uptime_ticks())
            .unwrap_or_default();

        if let Some(threshold) = self.thresholds.high_cpu {
            let value = self.percentage(device_ip, &if_name, ErrorKind::Cpu);
            if crossed(&mut edges.cpu, value, threshold as u64) {
                info!("device {}: CPU {value}% >= {threshold}%", self.device.name());
                self.sender
                    .send(
                        uptime,
                        well_known::trap_high_cpu(),
                        vec![(well_known::cpu_load(), MibValue::Integer32(value as i32))],
                    )
                    .await;
            }
        }
        if let Some(threshold) = self.thresholds.high_memory {
            let value = self.percentage(device_ip, &if_name, ErrorKind::Memory);
            if crossed(&mut edges.memory, value, threshold as u64) {
                info!("device {}: memory {value}% >= {threshold}%", self.device.name());
                self.sender
                    .send(
                        uptime,
                        well_known::trap_high_memory(),
                        vec![(well_known::memory_used(), MibValue::Gauge32(value as u32))],
                    )
                    .await;
            }
        }
        if let Some(threshold) = self.thresholds.high_disk {
            let value = self.percentage(device_ip, &if_name, ErrorKind::Disk);
            if crossed(&mut edges.disk, value, threshold as u64) {
                info!("device {}: disk {value}% >= {threshold}%", self.device.name());
                self.sender
                    .send(
                        uptime,
                        well_known::trap_high_disk(),
                        vec![(well_known::disk_used(), MibValue::Gauge32(value as u32))],
                    )
                    .await;
            }
        }
        if let Some(threshold) = self.thresholds.interface_errors {
            // Same calibration the agent exposes, so trap edges and walked
            // values can never disagree.
            let base = self
                .device
                .counters()
                .in_errors
                .load(Relaxed);
            let magnitude = self
                .errors
                .magnitude(device_ip, &if_name, ErrorKind::InterfaceErrors)
                .unwrap_or(0);
            let value = calibrated_counter(base, magnitude);
            if crossed(&mut edges.interface_errors, value, threshold) {
                info!(
                    "device {}: interface errors {value} >= {threshold}",
                    self.device.name()
                );
                self.sender
                    .send(
                        uptime,
                        well_known::trap_interface_errors(),
                        vec![(
                            well_known::if_column(well_known::IF_IN_ERRORS, 1),
                            MibValue::Counter32(value as u32),
                        )],
                    )
                    .await;
            }
        }
    }

    fn percentage(&self, device_ip: IpAddr, if_name: &str, kind: ErrorKind) -> u64 {
        self.errors
            .magnitude(device_ip, if_name, kind)
            .unwrap_or(0) as u64
    }
}

/// Edge trigger with hysteresis: fires only on the below -> at-or-above
/// transition; re-arms once the value drops below the threshold.
fn crossed(above: &mut bool, value: u64, threshold: u64) -> bool {
    if value >= threshold {
        if !*above {
            *above = true;
            return true;
        }
        false
    } else {
        *above = false;
        false
    }
}
