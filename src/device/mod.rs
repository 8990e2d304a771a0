//! Camera devices.
//!
//! A `Stream` only talks to the `CaptureDevice` capability set defined here.
//! `Camera` is the concrete handle used by the daemon; its backend is resolved
//! once, at open time, from the configured backend name and device path:
//! - `stub://` paths: synthetic frames (tests, demos)
//! - anything else: V4L2 (feature: ingest-v4l2)
//!
//! Enumeration and resolution probing live outside this crate.

pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::fmt;
use std::str::FromStr;

use crate::error::DeviceError;
use crate::packet::{Frame, FrameSize, Port};

pub use synthetic::{SyntheticCamera, SyntheticProbe};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Camera;

/// The capabilities a stream needs from a camera.
pub trait CaptureDevice: Send + 'static {
    /// Stable identity of this camera.
    fn port(&self) -> Port;

    /// Live resolution as reported by the device.
    fn size(&self) -> FrameSize;

    /// Request a new resolution. Backends may require a reconnect first.
    fn set_size(&mut self, size: FrameSize) -> Result<(), DeviceError>;

    fn exposure(&self) -> i32;

    fn set_exposure(&mut self, value: i32) -> Result<(), DeviceError>;

    /// Display orientation. Does not alter captured pixels.
    fn rotation(&self) -> Rotation;

    fn set_rotation(&mut self, rotation: Rotation);

    /// Latch the next frame. Returns false on a failed read.
    fn grab(&mut self) -> bool;

    /// Decode the latched frame, if the preceding grab succeeded.
    fn retrieve(&mut self) -> Option<Frame>;

    fn connect(&mut self) -> Result<(), DeviceError>;

    fn disconnect(&mut self);
}

/// Display rotation in quarter turns; positive is clockwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rotation(i8);

impl Rotation {
    pub fn from_quarter_turns(count: i8) -> Self {
        Self(count % 4)
    }

    pub fn quarter_turns(self) -> i8 {
        self.0
    }

    pub fn rotate_cw(self) -> Self {
        if self.0 == 3 {
            Self(0)
        } else {
            Self(self.0 + 1)
        }
    }

    pub fn rotate_ccw(self) -> Self {
        if self.0 == -3 {
            Self(0)
        } else {
            Self(self.0 - 1)
        }
    }
}

/// Capture API selection, resolved at open time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Auto,
    Synthetic,
    V4l2,
}

impl Backend {
    /// Pick a concrete backend for `device`.
    pub fn resolve(self, device: &str) -> Backend {
        match self {
            Backend::Auto if device.starts_with("stub://") => Backend::Synthetic,
            Backend::Auto => Backend::V4l2,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Auto => "auto",
            Backend::Synthetic => "synthetic",
            Backend::V4l2 => "v4l2",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" | "any" | "cap_any" => Ok(Backend::Auto),
            "synthetic" | "stub" => Ok(Backend::Synthetic),
            "v4l2" | "v4l" | "cap_v4l2" | "cap_v4l" => Ok(Backend::V4l2),
            other => Err(format!("unknown camera backend '{}'", other)),
        }
    }
}

/// Everything needed to open one camera.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub port: Port,
    /// Device path, e.g. "/dev/video0" or "stub://left".
    pub device: String,
    pub size: FrameSize,
    pub exposure: Option<i32>,
    pub rotation: Rotation,
    pub backend: Backend,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            port: 0,
            device: "stub://cam0".to_string(),
            size: FrameSize::new(640, 480),
            exposure: None,
            rotation: Rotation::default(),
            backend: Backend::Auto,
        }
    }
}

/// A camera handle with its backend chosen at open time.
pub struct Camera {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(V4l2Camera),
}

impl Camera {
    /// Open and connect the configured device.
    pub fn open(config: CameraConfig) -> Result<Self, DeviceError> {
        let resolved = config.backend.resolve(&config.device);
        log::info!(
            "camera {}: opening {} with backend {}",
            config.port,
            config.device,
            resolved
        );
        let mut camera = match resolved {
            Backend::Synthetic => Self::from(SyntheticCamera::from_config(&config)?),
            Backend::V4l2 | Backend::Auto => Self::open_v4l2(&config)?,
        };
        camera.connect()?;
        camera.set_size(config.size)?;
        if let Some(exposure) = config.exposure {
            camera.set_exposure(exposure)?;
        }
        camera.set_rotation(config.rotation);
        Ok(camera)
    }

    #[cfg(feature = "ingest-v4l2")]
    fn open_v4l2(config: &CameraConfig) -> Result<Self, DeviceError> {
        Ok(Self {
            backend: CameraBackend::V4l2(V4l2Camera::new(config.port, &config.device)),
        })
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    fn open_v4l2(config: &CameraConfig) -> Result<Self, DeviceError> {
        Err(DeviceError::Unavailable {
            port: config.port,
            reason: format!("{} needs the ingest-v4l2 feature", config.device),
        })
    }

    pub fn backend(&self) -> Backend {
        match &self.backend {
            CameraBackend::Synthetic(_) => Backend::Synthetic,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(_) => Backend::V4l2,
        }
    }
}

impl From<SyntheticCamera> for Camera {
    fn from(camera: SyntheticCamera) -> Self {
        Self {
            backend: CameraBackend::Synthetic(camera),
        }
    }
}

impl CaptureDevice for Camera {
    fn port(&self) -> Port {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.port(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.port(),
        }
    }

    fn size(&self) -> FrameSize {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.size(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.size(),
        }
    }

    fn set_size(&mut self, size: FrameSize) -> Result<(), DeviceError> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.set_size(size),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.set_size(size),
        }
    }

    fn exposure(&self) -> i32 {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.exposure(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.exposure(),
        }
    }

    fn set_exposure(&mut self, value: i32) -> Result<(), DeviceError> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.set_exposure(value),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.set_exposure(value),
        }
    }

    fn rotation(&self) -> Rotation {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.rotation(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.rotation(),
        }
    }

    fn set_rotation(&mut self, rotation: Rotation) {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.set_rotation(rotation),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.set_rotation(rotation),
        }
    }

    fn grab(&mut self) -> bool {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.grab(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.grab(),
        }
    }

    fn retrieve(&mut self) -> Option<Frame> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.retrieve(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.retrieve(),
        }
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.connect(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.connect(),
        }
    }

    fn disconnect(&mut self) {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.disconnect(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(camera) => camera.disconnect(),
        }
    }
}
