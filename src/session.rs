//! Capture session: the set of streams plus the synchronizer that merges them.
//!
//! A session is either in multi-camera mode (the synchronizer pulls from every
//! stream) or single-camera mode (the synchronizer is paused and one stream
//! feeds a single-slot preview queue).

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::device::CaptureDevice;
use crate::error::{SessionError, SyncError};
use crate::packet::{FramePacket, FrameSize, Port};
use crate::queue::Sink;
use crate::stream::{FramePacketSink, FrameSource, Stream};
use crate::sync::{Synchronizer, SynchronizerConfig};

pub const DEFAULT_FPS_TARGET: u32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub fps_target: u32,
    pub sync: SynchronizerConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            fps_target: DEFAULT_FPS_TARGET,
            sync: SynchronizerConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    MultiCamera,
    SingleCamera(Port),
}

pub struct Session<D: CaptureDevice> {
    // Declared before `streams` so it releases its subscriptions first on drop.
    synchronizer: Synchronizer,
    streams: BTreeMap<Port, Stream<D>>,
    mode: SessionMode,
    preview: Option<(Port, FramePacketSink)>,
    fps_target: u32,
}

impl<D: CaptureDevice> Session<D> {
    /// Start one stream per device and a synchronizer over all of them.
    pub fn new(devices: Vec<D>, settings: SessionSettings) -> Result<Self, SessionError> {
        if devices.is_empty() {
            return Err(SessionError::NoCameras);
        }
        let mut streams = BTreeMap::new();
        for device in devices {
            let port = device.port();
            if streams.contains_key(&port) {
                return Err(SyncError::DuplicatePort(port).into());
            }
            streams.insert(port, Stream::new(device, settings.fps_target)?);
        }
        let sources: Vec<Box<dyn FrameSource>> = streams
            .values()
            .map(|stream| Box::new(stream.handle()) as Box<dyn FrameSource>)
            .collect();
        let synchronizer = Synchronizer::new(sources, settings.sync)?;
        log::info!(
            "session: {} stream(s) at {} fps, multi-camera mode",
            streams.len(),
            settings.fps_target
        );

        Ok(Self {
            synchronizer,
            streams,
            mode: SessionMode::MultiCamera,
            preview: None,
            fps_target: settings.fps_target,
        })
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn ports(&self) -> Vec<Port> {
        self.streams.keys().copied().collect()
    }

    pub fn stream(&self, port: Port) -> Option<&Stream<D>> {
        self.streams.get(&port)
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    pub fn fps_target(&self) -> u32 {
        self.fps_target
    }

    /// Resume synchronized capture across every stream.
    pub fn set_multi_camera(&mut self) {
        self.release_preview();
        if !self.synchronizer.is_subscribed_to_streams() {
            self.synchronizer.subscribe_to_streams();
        }
        self.mode = SessionMode::MultiCamera;
        log::info!("session: multi-camera mode");
    }

    /// Pause the synchronizer and preview a single camera.
    ///
    /// The returned receiver only ever holds the freshest packet.
    pub fn set_single_camera(
        &mut self,
        port: Port,
    ) -> Result<Receiver<Arc<FramePacket>>, SessionError> {
        if !self.streams.contains_key(&port) {
            return Err(SessionError::UnknownPort(port));
        }
        self.release_preview();
        if self.synchronizer.is_subscribed_to_streams() {
            self.synchronizer.unsubscribe_from_streams();
        }

        let (sink, rx) = Sink::latest();
        if let Some(stream) = self.streams.get(&port) {
            stream.subscribe(sink.clone());
        }
        self.preview = Some((port, sink));
        self.mode = SessionMode::SingleCamera(port);
        log::info!("session: single-camera mode on port {}", port);
        Ok(rx)
    }

    /// Apply a new rate target to every stream.
    pub fn set_fps(&mut self, fps_target: u32) -> Result<(), SessionError> {
        for stream in self.streams.values_mut() {
            stream.set_fps_target(fps_target)?;
        }
        self.fps_target = fps_target;
        Ok(())
    }

    pub fn change_resolution(&mut self, port: Port, size: FrameSize) -> Result<(), SessionError> {
        let stream = self
            .streams
            .get_mut(&port)
            .ok_or(SessionError::UnknownPort(port))?;
        stream.change_resolution(size)?;
        Ok(())
    }

    /// Stop the synchronizer, then every stream, and return the devices.
    pub fn shutdown(mut self) -> Result<BTreeMap<Port, D>, SessionError> {
        self.release_preview();
        self.synchronizer.stop();
        let mut devices = BTreeMap::new();
        for (port, stream) in std::mem::take(&mut self.streams) {
            devices.insert(port, stream.stop()?);
        }
        log::info!("session: shut down {} stream(s)", devices.len());
        Ok(devices)
    }

    fn release_preview(&mut self) {
        if let Some((port, sink)) = self.preview.take() {
            if let Some(stream) = self.streams.get(&port) {
                stream.unsubscribe(&sink);
            }
        }
    }
}
