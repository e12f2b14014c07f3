//! PCAP replay: streams frames from a capture file back onto the wire,
//! paced by the recorded inter-frame gaps.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use pcap_file::pcap::PcapReader;

use crate::core::errors::CaptureError;
use crate::core::frame::RawFrame;

/// Longest gap honored between two replayed frames. Capture files with hours
/// of silence should not stall the replay task for hours.
const MAX_GAP: Duration = Duration::from_secs(1);

/// Anything that can hand the replay task a sequence of timed frames.
pub trait ReplaySource: Send {
    /// Next frame plus the delay to wait before sending it.
    fn next_frame(&mut self) -> Option<(Duration, RawFrame)>;
}

pub struct PcapFileSource {
    reader: PcapReader<BufReader<File>>,
    last_ts: Option<Duration>,
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path)?;
        let reader = PcapReader::new(BufReader::new(file))
            .map_err(|e| CaptureError::Backend(e.to_string()))?;
        Ok(Self { reader, last_ts: None })
    }
}

impl ReplaySource for PcapFileSource {
    fn next_frame(&mut self) -> Option<(Duration, RawFrame)> {
        match self.reader.next_packet() {
            Some(Ok(pkt)) => {
                let gap = match self.last_ts {
                    Some(prev) => pkt.timestamp.saturating_sub(prev).min(MAX_GAP),
                    None => Duration::ZERO,
                };
                self.last_ts = Some(pkt.timestamp);
                Some((gap, pkt.data.into_owned()))
            }
            // A corrupt record ends the replay rather than skipping forward.
            Some(Err(e)) => {
                log::warn!("replay source read error: {e}");
                None
            }
            None => None,
        }
    }
}

/// In-memory source for tests and for replaying synthesized bursts.
pub struct VecSource {
    frames: std::vec::IntoIter<(Duration, RawFrame)>,
}

impl VecSource {
    pub fn new(frames: Vec<(Duration, RawFrame)>) -> Self {
        Self { frames: frames.into_iter() }
    }
}

impl ReplaySource for VecSource {
    fn next_frame(&mut self) -> Option<(Duration, RawFrame)> {
        self.frames.next()
    }
}
