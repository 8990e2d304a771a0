//! Packet types passed between streams, the synchronizer and consumers.
//!
//! - `Frame`: raw pixel buffer with its dimensions.
//! - `FramePacket`: one camera's captured frame plus capture metadata.
//! - `SyncPacket`: one synchronization cycle, one entry per configured port.
//!
//! Packets are immutable once built. Producers wrap them in `Arc` so a single
//! instance is shared read-only by every subscriber.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identity of one physical camera / stream.
pub type Port = u32;

/// Width and height of a frame, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<(u32, u32)> for FrameSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Raw image buffer as delivered by a capture backend.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }
}

// Pixel data is elided.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A single frame captured by one stream.
#[derive(Debug)]
pub struct FramePacket {
    pub port: Port,
    /// Per-stream loop counter. Gaps mean the read at that iteration failed.
    pub frame_index: u64,
    /// Wall-clock seconds since the Unix epoch, midpoint of grab and retrieve.
    pub frame_time: f64,
    pub frame: Frame,
    /// Smoothed achieved capture rate at the time of this frame.
    pub fps: f64,
}

/// The merged result of one synchronization cycle.
#[derive(Debug)]
pub struct SyncPacket {
    pub sync_index: u64,
    /// Every configured port maps to its packet, or `None` when it dropped.
    pub frame_packets: BTreeMap<Port, Option<Arc<FramePacket>>>,
}

impl SyncPacket {
    /// Per-port dropped flags for this cycle.
    pub fn dropped(&self) -> BTreeMap<Port, bool> {
        self.frame_packets
            .iter()
            .map(|(port, packet)| (*port, packet.is_none()))
            .collect()
    }

    /// Returns `None` for a port that is not part of this synchronizer.
    pub fn is_dropped(&self, port: Port) -> Option<bool> {
        self.frame_packets.get(&port).map(|packet| packet.is_none())
    }

    pub fn frame_packet_count(&self) -> usize {
        self.frame_packets
            .values()
            .filter(|packet| packet.is_some())
            .count()
    }

    pub fn get(&self, port: Port) -> Option<&Arc<FramePacket>> {
        self.frame_packets.get(&port).and_then(|packet| packet.as_ref())
    }
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
