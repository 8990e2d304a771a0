//! Synthetic camera for `stub://` devices.
//!
//! Frames are generated in memory. The first eight bytes of every frame carry
//! the read sequence number (little endian), so consumers can tell exactly
//! which device read produced a packet.
//!
//! Device paths accept options after `?`:
//! - `fail_every=N`: every Nth read fails
//! - `offline`: every read fails (the probe rejects the camera)
//! - `latency_ms=N`: each grab blocks for N milliseconds

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{CameraConfig, CaptureDevice, Rotation};
use crate::error::DeviceError;
use crate::packet::{Frame, FrameSize, Port};

const SEQUENCE_BYTES: usize = 8;

/// Shared counters for observing a synthetic camera after it has been moved
/// into a stream.
#[derive(Clone, Debug, Default)]
pub struct SyntheticProbe {
    reads: Arc<AtomicU64>,
    connects: Arc<AtomicU64>,
    disconnects: Arc<AtomicU64>,
}

impl SyntheticProbe {
    /// Grab attempts made while connected, failed ones included.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

pub struct SyntheticCamera {
    port: Port,
    name: String,
    size: FrameSize,
    exposure: i32,
    rotation: Rotation,
    connected: bool,
    offline: bool,
    fail_every: Option<u64>,
    latency: Duration,
    read_count: u64,
    latched: Option<Frame>,
    probe: SyntheticProbe,
}

impl SyntheticCamera {
    pub fn new(port: Port, size: FrameSize) -> Self {
        Self {
            port,
            name: format!("stub://cam{}", port),
            size,
            exposure: 0,
            rotation: Rotation::default(),
            connected: true,
            offline: false,
            fail_every: None,
            latency: Duration::ZERO,
            read_count: 0,
            latched: None,
            probe: SyntheticProbe::default(),
        }
    }

    /// Build from a `stub://name?options` device path.
    pub fn from_config(config: &CameraConfig) -> Result<Self, DeviceError> {
        let rest = config.device.strip_prefix("stub://").unwrap_or(&config.device);
        let (name, options) = rest.split_once('?').unwrap_or((rest, ""));
        let mut camera = Self::new(config.port, config.size);
        camera.name = format!("stub://{}", name);
        for option in options.split('&').filter(|option| !option.is_empty()) {
            let (key, value) = option.split_once('=').unwrap_or((option, ""));
            match key {
                "offline" => camera.offline = true,
                "fail_every" => {
                    let every = parse_option(config.port, key, value)?;
                    camera = camera.with_failure_every(every);
                }
                "latency_ms" => {
                    let millis = parse_option(config.port, key, value)?;
                    camera = camera.with_latency(Duration::from_millis(millis));
                }
                other => {
                    return Err(DeviceError::Rejected {
                        port: config.port,
                        reason: format!("unknown stub option '{}'", other),
                    })
                }
            }
        }
        Ok(camera)
    }

    /// Make every `every`th read fail. Zero disables failures.
    pub fn with_failure_every(mut self, every: u64) -> Self {
        self.fail_every = (every > 0).then_some(every);
        self
    }

    /// Make every read fail.
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Block each grab for `latency`, like a device waiting for exposure.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn probe(&self) -> SyntheticProbe {
        self.probe.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read sequence number stamped into a synthetic frame.
    pub fn sequence_of(frame: &Frame) -> Option<u64> {
        let bytes = frame.data.get(..SEQUENCE_BYTES)?;
        let mut raw = [0u8; SEQUENCE_BYTES];
        raw.copy_from_slice(bytes);
        Some(u64::from_le_bytes(raw))
    }

    fn render(&self) -> Frame {
        let pixel_count = (self.size.width as usize) * (self.size.height as usize) * 3;
        let mut data = vec![0u8; pixel_count.max(SEQUENCE_BYTES)];
        let shade = (self.read_count % 256) as u8;
        for (i, pixel) in data.iter_mut().enumerate().skip(SEQUENCE_BYTES) {
            *pixel = shade.wrapping_add((i % 251) as u8);
        }
        data[..SEQUENCE_BYTES].copy_from_slice(&self.read_count.to_le_bytes());
        Frame::new(self.size.width, self.size.height, data)
    }
}

fn parse_option(port: Port, key: &str, value: &str) -> Result<u64, DeviceError> {
    value.parse().map_err(|_| DeviceError::Rejected {
        port,
        reason: format!("stub option '{}' needs an integer, got '{}'", key, value),
    })
}

impl CaptureDevice for SyntheticCamera {
    fn port(&self) -> Port {
        self.port
    }

    fn size(&self) -> FrameSize {
        self.size
    }

    fn set_size(&mut self, size: FrameSize) -> Result<(), DeviceError> {
        if size.width == 0 || size.height == 0 {
            return Err(DeviceError::Rejected {
                port: self.port,
                reason: format!("invalid resolution {}", size),
            });
        }
        self.size = size;
        Ok(())
    }

    fn exposure(&self) -> i32 {
        self.exposure
    }

    fn set_exposure(&mut self, value: i32) -> Result<(), DeviceError> {
        self.exposure = value;
        Ok(())
    }

    fn rotation(&self) -> Rotation {
        self.rotation
    }

    fn set_rotation(&mut self, rotation: Rotation) {
        self.rotation = rotation;
    }

    fn grab(&mut self) -> bool {
        self.latched = None;
        if !self.connected {
            return false;
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        self.read_count += 1;
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        if self.offline {
            return false;
        }
        if let Some(every) = self.fail_every {
            if self.read_count % every == 0 {
                return false;
            }
        }
        self.latched = Some(self.render());
        true
    }

    fn retrieve(&mut self) -> Option<Frame> {
        self.latched.take()
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        self.connected = true;
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        log::info!("camera {}: connected to {} (synthetic)", self.port, self.name);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.latched = None;
        self.probe.disconnects.fetch_add(1, Ordering::SeqCst);
        log::info!("camera {}: disconnected from {}", self.port, self.name);
    }
}
