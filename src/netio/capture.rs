//! Capture engine: a single pcap handle per interface, owned by a dedicated
//! thread. The thread alternates timed reads with draining an outbound frame
//! queue, so one handle serves both directions and the read timeout bounds
//! shutdown latency on a silent network.
//!
//! The rest of the core never touches pcap directly; it consumes the
//! [`FrameSource`] / [`FrameSink`] seams, which tests back with plain
//! channels via [`ChannelLink`].

use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, trace, warn};
use tokio::sync::mpsc;

use crate::core::errors::CaptureError;
use crate::core::frame::RawFrame;

const INBOUND_QUEUE: usize = 1024;
const OUTBOUND_QUEUE: usize = 512;

/// Source half of the packet plane. `Ok(None)` is the "no packet this
/// interval" sentinel that lets the dispatcher re-check cancellation.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError>;
}

/// Sink half of the packet plane. Writers go through the rate limiter before
/// calling this.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: RawFrame) -> Result<(), CaptureError>;
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub interface: String,
    pub snaplen: i32,
    pub promiscuous: bool,
    pub read_timeout: Duration,
}

/// An opened but not yet running capture handle. `set_filter` may be called
/// before `start` hands the handle to the capture thread.
pub struct OpenCapture {
    cap: pcap::Capture<pcap::Active>,
    opts: CaptureOptions,
}

impl OpenCapture {
    /// Acquires an exclusive pcap handle on the interface.
    pub fn open(opts: &CaptureOptions) -> Result<Self, CaptureError> {
        let inactive = pcap::Capture::from_device(opts.interface.as_str())
            .map_err(|e| map_open_error(&opts.interface, e))?;
        let cap = inactive
            .snaplen(opts.snaplen)
            .promisc(opts.promiscuous)
            .timeout(opts.read_timeout.as_millis() as i32)
            .open()
            .map_err(|e| map_open_error(&opts.interface, e))?;
        Ok(Self { cap, opts: opts.clone() })
    }

    /// Installs a kernel-level BPF filter.
    pub fn set_filter(&mut self, bpf: &str) -> Result<(), CaptureError> {
        self.cap.filter(bpf, true).map_err(|e| CaptureError::BadFilter {
            filter: bpf.to_string(),
            reason: e.to_string(),
        })
    }

    /// Spawns the capture thread and returns the running engine plus its
    /// async seams.
    pub fn start(self) -> (CaptureEngine, PcapSource, PcapSink) {
        let (in_tx, in_rx) = mpsc::channel::<RawFrame>(INBOUND_QUEUE);
        let (out_tx, mut out_rx) = mpsc::channel::<RawFrame>(OUTBOUND_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let mut cap = self.cap;
        let iface = self.opts.interface.clone();
        let thread = std::thread::Builder::new()
            .name(format!("capture-{iface}"))
            .spawn(move || {
                loop {
                    if thread_stop.load(SeqCst) {
                        break;
                    }
                    match cap.next_packet() {
                        Ok(pkt) => {
                            let frame = pkt.data.to_vec();
                            if in_tx.blocking_send(frame).is_err() {
                                break;
                            }
                        }
                        Err(pcap::Error::TimeoutExpired) => {
                            // No packet this interval; fall through to the
                            // outbound drain and the stop check.
                        }
                        Err(e) => {
                            error!("capture read on {iface} failed: {e}");
                            break;
                        }
                    }
                    while let Ok(frame) = out_rx.try_recv() {
                        if let Err(e) = cap.sendpacket(frame) {
                            warn!("capture write on {iface} failed: {e}");
                        }
                    }
                }
                debug!("capture thread for {iface} exited");
            })
            .expect("spawn capture thread");

        let engine = CaptureEngine { stop, thread: Some(thread) };
        let source = PcapSource {
            rx: in_rx,
            read_timeout: self.opts.read_timeout,
        };
        let sink = PcapSink { tx: out_tx };
        (engine, source, sink)
    }
}

/// Handle on the running capture thread. `close` is the first step of every
/// shutdown: it unblocks any in-flight read within one read timeout.
pub struct CaptureEngine {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureEngine {
    pub fn close(&mut self) {
        self.stop.store(true, SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct PcapSource {
    rx: mpsc::Receiver<RawFrame>,
    read_timeout: Duration,
}

#[async_trait]
impl FrameSource for PcapSource {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        match tokio::time::timeout(self.read_timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(CaptureError::Closed),
        }
    }
}

#[derive(Clone)]
pub struct PcapSink {
    tx: mpsc::Sender<RawFrame>,
}

#[async_trait]
impl FrameSink for PcapSink {
    async fn send_frame(&self, frame: RawFrame) -> Result<(), CaptureError> {
        trace!("queueing {} byte frame for injection", frame.len());
        self.tx.send(frame).await.map_err(|_| CaptureError::Closed)
    }
}

fn map_open_error(interface: &str, e: pcap::Error) -> CaptureError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("permission") || lower.contains("not permitted") {
        CaptureError::PermissionDenied(interface.to_string())
    } else if lower.contains("no such device") || lower.contains("doesn't exist") {
        CaptureError::InterfaceUnavailable(interface.to_string())
    } else {
        CaptureError::Backend(msg)
    }
}

/// Channel-backed source/sink pair: the capture seam used by tests and by
/// embedders that feed frames from somewhere other than a live interface.
pub struct ChannelLink;

impl ChannelLink {
    /// Returns `(source, sink, inject, observe)`: frames pushed into `inject`
    /// appear on the source; frames the core sends show up on `observe`.
    pub fn pair(
        read_timeout: Duration,
    ) -> (
        ChannelSource,
        ChannelSink,
        mpsc::Sender<RawFrame>,
        mpsc::Receiver<RawFrame>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            ChannelSource { rx: in_rx, read_timeout },
            ChannelSink { tx: out_tx },
            in_tx,
            out_rx,
        )
    }
}

pub struct ChannelSource {
    rx: mpsc::Receiver<RawFrame>,
    read_timeout: Duration,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        match tokio::time::timeout(self.read_timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(CaptureError::Closed),
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RawFrame>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&self, frame: RawFrame) -> Result<(), CaptureError> {
        self.tx.send(frame).await.map_err(|_| CaptureError::Closed)
    }
}
