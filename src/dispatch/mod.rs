//! Frame dispatcher: decodes raw frames, resolves target devices through the
//! device table, and fans out to every handler registered for the decoded
//! layer tuple. Handler failures and panics are counted and contained here;
//! nothing a handler does can stop the dispatch loop.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::{debug, error, trace, warn};
use tokio::sync::watch;

use crate::core::device::Device;
use crate::core::errors::{CaptureError, HandlerError};
use crate::core::frame::{self, Frame, NetLayer, RawFrame, Transport};
use crate::core::table::DeviceTable;
use crate::netio::capture::{FrameSink, FrameSource};
use crate::netio::ratelimit::RateLimiter;

/// Layer tuple a handler subscribes to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DispatchKey {
    EtherType(u16),
    IpProto(u8),
    UdpPort(u16),
    TcpPort(u16),
}

/// A protocol handler: accepts a parsed frame and the selected device,
/// optionally produces response frames. Handlers must not block on I/O;
/// long-lived work belongs in the timer tasks each subsystem owns.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn keys(&self) -> Vec<DispatchKey>;

    /// Whether this device has the protocol enabled. Gates broadcast fan-out.
    fn enabled_for(&self, device: &Device) -> bool;

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    by_key: RwLock<HashMap<DispatchKey, Vec<Arc<dyn ProtocolHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn ProtocolHandler>) {
        let mut map = self.by_key.write().expect("registry lock poisoned");
        for key in handler.keys() {
            map.entry(key).or_default().push(handler.clone());
        }
        trace!("registered handler {}", handler.name());
    }

    pub fn deregister(&self, name: &str) {
        let mut map = self.by_key.write().expect("registry lock poisoned");
        for handlers in map.values_mut() {
            handlers.retain(|h| h.name() != name);
        }
    }

    fn handlers_for(&self, key: &DispatchKey) -> Vec<Arc<dyn ProtocolHandler>> {
        self.by_key
            .read()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub frames_in: AtomicU64,
    pub decode_errors: AtomicU64,
    pub handler_errors: AtomicU64,
    pub handler_panics: AtomicU64,
    pub responses_out: AtomicU64,
    pub rate_limit_drops: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub frames_in: u64,
    pub decode_errors: u64,
    pub handler_errors: u64,
    pub handler_panics: u64,
    pub responses_out: u64,
    pub rate_limit_drops: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            frames_in: self.frames_in.load(Relaxed),
            decode_errors: self.decode_errors.load(Relaxed),
            handler_errors: self.handler_errors.load(Relaxed),
            handler_panics: self.handler_panics.load(Relaxed),
            responses_out: self.responses_out.load(Relaxed),
            rate_limit_drops: self.rate_limit_drops.load(Relaxed),
        }
    }
}

pub struct Dispatcher {
    table: Arc<DeviceTable>,
    registry: Arc<HandlerRegistry>,
    sink: Arc<dyn FrameSink>,
    limiter: Arc<RateLimiter>,
    stats: Arc<DispatchStats>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        table: Arc<DeviceTable>,
        registry: Arc<HandlerRegistry>,
        sink: Arc<dyn FrameSink>,
        limiter: Arc<RateLimiter>,
        stats: Arc<DispatchStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { table, registry, sink, limiter, stats, shutdown }
    }

    /// Main capture-read loop: timed read, decode, fan out, repeat until the
    /// shutdown signal fires or the capture handle closes under us.
    pub async fn run(self, mut source: Box<dyn FrameSource>) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match source.next_frame().await {
                Ok(None) => continue,
                Ok(Some(raw)) => self.dispatch_frame(raw).await,
                Err(CaptureError::Closed) => {
                    debug!("frame source closed, dispatcher exiting");
                    break;
                }
                Err(e) => {
                    error!("unrecoverable capture failure: {e}");
                    break;
                }
            }
        }
        debug!("dispatcher loop exited");
    }

    async fn dispatch_frame(&self, raw: RawFrame) {
        self.stats.frames_in.fetch_add(1, Relaxed);
        let frame = match frame::decode(&raw) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                debug!("dropping malformed frame: {e}");
                self.stats.decode_errors.fetch_add(1, Relaxed);
                return;
            }
        };

        let targets = self.targets(&frame);
        if targets.is_empty() {
            return;
        }

        // Collect unique (handler, device) pairs across all matched keys.
        let mut seen: HashSet<(usize, usize)> = HashSet::new();
        let mut pairs: Vec<(Arc<dyn ProtocolHandler>, Arc<Device>)> = Vec::new();
        for key in frame_keys(&frame) {
            for handler in self.registry.handlers_for(&key) {
                for device in &targets {
                    if !device.is_up() || !handler.enabled_for(device) {
                        continue;
                    }
                    let id = (
                        Arc::as_ptr(&handler) as *const () as usize,
                        Arc::as_ptr(device) as *const () as usize,
                    );
                    if seen.insert(id) {
                        pairs.push((handler.clone(), device.clone()));
                    }
                }
            }
        }
        if pairs.is_empty() {
            return;
        }

        let mut counted: HashSet<usize> = HashSet::new();
        for (_, device) in &pairs {
            if counted.insert(Arc::as_ptr(device) as *const () as usize) {
                device.counters().record_in(raw.len());
            }
        }

        let mut joins = Vec::with_capacity(pairs.len());
        for (handler, device) in pairs {
            let frame = frame.clone();
            let sink = self.sink.clone();
            let limiter = self.limiter.clone();
            let stats = self.stats.clone();
            joins.push(tokio::spawn(async move {
                match handler.handle(&frame, &device).await {
                    Ok(responses) => {
                        for resp in responses {
                            if !limiter.acquire().await {
                                stats.rate_limit_drops.fetch_add(1, Relaxed);
                                continue;
                            }
                            let len = resp.len();
                            if sink.send_frame(resp).await.is_ok() {
                                device.counters().record_out(len);
                                device.counters().responses.fetch_add(1, Relaxed);
                                stats.responses_out.fetch_add(1, Relaxed);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            "handler {} failed for device {}: {e}",
                            handler.name(),
                            device.name()
                        );
                        stats.handler_errors.fetch_add(1, Relaxed);
                    }
                }
            }));
        }
        for join in joins {
            if let Err(e) = join.await {
                if e.is_panic() {
                    error!("handler panicked; frame dropped");
                    self.stats.handler_panics.fetch_add(1, Relaxed);
                }
            }
        }
    }

    /// Target resolution policy: broadcast/multicast destinations (including
    /// IPv4 limited broadcast regardless of the Ethernet address) reach every
    /// device; unicast resolves by MAC first, then by destination IP.
    fn targets(&self, frame: &Frame) -> Vec<Arc<Device>> {
        if frame.is_broadcast_or_multicast() || is_ip_broadcast(frame) {
            return self.table.broadcast_targets().to_vec();
        }
        if let Some(dev) = self.table.lookup_by_mac(frame.dst_mac) {
            return vec![dev.clone()];
        }
        match &frame.net {
            NetLayer::Ipv4(v4) => self.table.lookup_by_ip(&IpAddr::V4(v4.dst)).to_vec(),
            NetLayer::Ipv6(v6) => self.table.lookup_by_ip(&IpAddr::V6(v6.dst)).to_vec(),
            _ => Vec::new(),
        }
    }
}

fn is_ip_broadcast(frame: &Frame) -> bool {
    match &frame.net {
        NetLayer::Ipv4(v4) => v4.dst == Ipv4Addr::BROADCAST,
        NetLayer::Ipv6(v6) => v6.dst.octets()[0] == 0xff,
        _ => false,
    }
}

fn frame_keys(frame: &Frame) -> Vec<DispatchKey> {
    let mut keys = vec![DispatchKey::EtherType(frame.ethertype)];
    let transport = match &frame.net {
        NetLayer::Ipv4(v4) => {
            keys.push(DispatchKey::IpProto(v4.protocol));
            Some(&v4.transport)
        }
        NetLayer::Ipv6(v6) => {
            keys.push(DispatchKey::IpProto(v6.next_header));
            Some(&v6.transport)
        }
        _ => None,
    };
    match transport {
        Some(Transport::Udp { dst_port, .. }) => keys.push(DispatchKey::UdpPort(*dst_port)),
        Some(Transport::Tcp { dst_port, .. }) => keys.push(DispatchKey::TcpPort(*dst_port)),
        _ => {}
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::core::device::DeviceState;
    use crate::netio::capture::ChannelLink;
    use mac_address::MacAddress;
    use pnet::util::MacAddr;
    use std::time::Duration;

    struct EchoUdpHandler;

    #[async_trait]
    impl ProtocolHandler for EchoUdpHandler {
        fn name(&self) -> &'static str {
            "echo-udp"
        }

        fn keys(&self) -> Vec<DispatchKey> {
            vec![DispatchKey::UdpPort(7)]
        }

        fn enabled_for(&self, _device: &Device) -> bool {
            true
        }

        async fn handle(
            &self,
            _frame: &Frame,
            _device: &Arc<Device>,
        ) -> Result<Vec<RawFrame>, HandlerError> {
            Ok(vec![vec![0xAB; 20]])
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl ProtocolHandler for PanicHandler {
        fn name(&self) -> &'static str {
            "panic"
        }

        fn keys(&self) -> Vec<DispatchKey> {
            vec![DispatchKey::UdpPort(9)]
        }

        fn enabled_for(&self, _device: &Device) -> bool {
            true
        }

        async fn handle(
            &self,
            _frame: &Frame,
            _device: &Arc<Device>,
        ) -> Result<Vec<RawFrame>, HandlerError> {
            panic!("boom");
        }
    }

    fn test_device() -> Arc<Device> {
        let mut cfg = DeviceConfig::new("d1", "server", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("10.0.0.5".parse().unwrap());
        let dev = Arc::new(Device::bare(cfg));
        dev.set_state(DeviceState::Up);
        dev
    }

    #[tokio::test]
    async fn udp_frame_reaches_handler_and_reply_is_sent() {
        let device = test_device();
        let (source, sink, inject, mut observe) = ChannelLink::pair(Duration::from_millis(20));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(EchoUdpHandler));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limiter = RateLimiter::new(1000, shutdown_rx.clone());
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(
            Arc::new(DeviceTable::new(vec![device.clone()])),
            registry,
            Arc::new(sink),
            limiter,
            stats.clone(),
            shutdown_rx,
        );
        let task = tokio::spawn(dispatcher.run(Box::new(source)));

        let raw = frame::build_ipv4_udp(
            MacAddr::new(2, 0, 0, 0, 0, 99),
            MacAddr::new(2, 0, 0, 0, 0, 1),
            "10.0.0.9".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            1234,
            7,
            64,
            b"ping",
        );
        inject.send(raw).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), observe.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, vec![0xAB; 20]);
        // The counter updates land just after the send; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.snapshot().responses_out, 1);
        assert_eq!(device.counters().snapshot().frames_in, 1);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    #[tokio::test]
    async fn malformed_frame_increments_decode_errors() {
        let device = test_device();
        let (source, sink, inject, _observe) = ChannelLink::pair(Duration::from_millis(20));
        let registry = Arc::new(HandlerRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limiter = RateLimiter::new(1000, shutdown_rx.clone());
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(
            Arc::new(DeviceTable::new(vec![device])),
            registry,
            Arc::new(sink),
            limiter,
            stats.clone(),
            shutdown_rx,
        );
        let task = tokio::spawn(dispatcher.run(Box::new(source)));

        inject.send(vec![1, 2, 3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.snapshot().decode_errors, 1);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    #[tokio::test]
    async fn handler_panic_is_contained_and_counted() {
        let device = test_device();
        let (source, sink, inject, _observe) = ChannelLink::pair(Duration::from_millis(20));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(PanicHandler));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limiter = RateLimiter::new(1000, shutdown_rx.clone());
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(
            Arc::new(DeviceTable::new(vec![device])),
            registry,
            Arc::new(sink),
            limiter,
            stats.clone(),
            shutdown_rx,
        );
        let task = tokio::spawn(dispatcher.run(Box::new(source)));

        let raw = frame::build_ipv4_udp(
            MacAddr::new(2, 0, 0, 0, 0, 99),
            MacAddr::new(2, 0, 0, 0, 0, 1),
            "10.0.0.9".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            1234,
            9,
            64,
            b"die",
        );
        inject.send(raw).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stats.snapshot().handler_panics, 1);

        // The dispatcher survives: a second frame still counts.
        inject.send(vec![1, 2, 3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.snapshot().decode_errors, 1);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    #[tokio::test]
    async fn down_devices_do_not_receive_frames() {
        let device = test_device();
        device.set_state(DeviceState::Down);
        let (source, sink, inject, mut observe) = ChannelLink::pair(Duration::from_millis(20));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(EchoUdpHandler));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limiter = RateLimiter::new(1000, shutdown_rx.clone());
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(
            Arc::new(DeviceTable::new(vec![device])),
            registry,
            Arc::new(sink),
            limiter,
            stats.clone(),
            shutdown_rx,
        );
        let task = tokio::spawn(dispatcher.run(Box::new(source)));

        let raw = frame::build_ipv4_udp(
            MacAddr::new(2, 0, 0, 0, 0, 99),
            MacAddr::new(2, 0, 0, 0, 0, 1),
            "10.0.0.9".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            1234,
            7,
            64,
            b"ping",
        );
        inject.send(raw).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(150), observe.recv())
            .await
            .is_err());

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}
