//! V4L2 camera backend.
//!
//! Frames are requested as packed RGB24 (`RGB3`). If the driver refuses the
//! format, whatever it negotiated is passed through unchanged.

use std::io;

use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;

use super::{CaptureDevice, Rotation};
use crate::error::DeviceError;
use crate::packet::{Frame, FrameSize, Port};

const BUFFER_COUNT: u32 = 4;
/// V4L2_CID_EXPOSURE_ABSOLUTE
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

pub struct V4l2Camera {
    port: Port,
    path: String,
    device: Option<v4l::Device>,
    stream: Option<MmapStream<'static>>,
    requested: FrameSize,
    exposure: i32,
    rotation: Rotation,
    latched: Option<Vec<u8>>,
}

impl V4l2Camera {
    pub fn new(port: Port, path: &str) -> Self {
        Self {
            port,
            path: path.to_string(),
            device: None,
            stream: None,
            requested: FrameSize::new(640, 480),
            exposure: 0,
            rotation: Rotation::default(),
            latched: None,
        }
    }

    fn device(&self) -> Result<&v4l::Device, DeviceError> {
        self.device.as_ref().ok_or_else(|| DeviceError::Unavailable {
            port: self.port,
            reason: format!("{} is not connected", self.path),
        })
    }

    fn ensure_stream(&mut self) -> io::Result<&mut MmapStream<'static>> {
        if self.stream.is_none() {
            let device = self
                .device
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;
            let stream = MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)?;
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no stream"))
    }
}

impl CaptureDevice for V4l2Camera {
    fn port(&self) -> Port {
        self.port
    }

    fn size(&self) -> FrameSize {
        self.device
            .as_ref()
            .and_then(|device| device.format().ok())
            .map(|format| FrameSize::new(format.width, format.height))
            .unwrap_or(self.requested)
    }

    fn set_size(&mut self, size: FrameSize) -> Result<(), DeviceError> {
        // Buffers are sized for the old format; the driver refuses changes while
        // they are mapped.
        self.stream = None;
        self.requested = size;
        let port = self.port;
        let device = self.device()?;
        let mut format = device.format()?;
        format.width = size.width;
        format.height = size.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");
        match device.set_format(&format) {
            Ok(applied) if applied.width != size.width || applied.height != size.height => {
                log::warn!(
                    "camera {}: requested {} but driver chose {}x{}",
                    port,
                    size,
                    applied.width,
                    applied.height
                );
            }
            Ok(_) => {}
            Err(err) => {
                return Err(DeviceError::Rejected {
                    port,
                    reason: format!("set format {}: {}", size, err),
                })
            }
        }
        Ok(())
    }

    fn exposure(&self) -> i32 {
        // The driver does not reliably read back exposure, so the last value
        // written is reported.
        self.exposure
    }

    fn set_exposure(&mut self, value: i32) -> Result<(), DeviceError> {
        let device = self.device()?;
        device.set_control(v4l::control::Control {
            id: CID_EXPOSURE_ABSOLUTE,
            value: v4l::control::Value::Integer(i64::from(value)),
        })?;
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
        let port = self.port;
        let result = self
            .ensure_stream()
            .and_then(|stream| CaptureStream::next(stream).map(|(buf, _meta)| buf.to_vec()));
        match result {
            Ok(buf) => {
                self.latched = Some(buf);
                true
            }
            Err(err) => {
                log::debug!("camera {}: grab failed: {}", port, err);
                false
            }
        }
    }

    fn retrieve(&mut self) -> Option<Frame> {
        let data = self.latched.take()?;
        let size = self.size();
        Some(Frame::new(size.width, size.height, data))
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        let device = v4l::Device::with_path(&self.path).map_err(|err| DeviceError::Unavailable {
            port: self.port,
            reason: format!("open {}: {}", self.path, err),
        })?;
        self.device = Some(device);
        log::info!("camera {}: connected to {}", self.port, self.path);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.latched = None;
        self.stream = None;
        self.device = None;
        log::info!("camera {}: disconnected from {}", self.port, self.path);
    }
}
