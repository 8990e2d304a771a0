//! Per-camera capture engine.
//!
//! A `Stream` owns one worker thread that owns the camera. Callers never touch
//! the device or the subscriber list directly: every request (subscribe, rate
//! change, device query, stop) is a command on the worker's control queue.
//!
//! The worker:
//! - sleeps until the next pacing milestone, then grabs and retrieves a frame
//! - wraps each successful read in a `FramePacket` and fans it out
//! - advances `frame_index` once per read, successful or not
//! - suspends reads entirely while nobody is subscribed
//!
//! Stopping is a handshake: the worker returns its state (device included)
//! through its join handle, and nothing touches the device until that join
//! completes. `change_resolution` relies on this to guarantee that two workers
//! never hold the same device.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::device::{CaptureDevice, Rotation};
use crate::error::{DeviceError, StreamError};
use crate::packet::{wall_clock_secs, FramePacket, FrameSize, Port};
use crate::pacing::Pacer;
use crate::queue::{Registration, Sink, Subscribers};
use crate::smoothing::RateEstimator;

/// How long an idle worker waits on its control queue before checking again.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Reads attempted when a stream is created; the last one must succeed.
pub const PROBE_READS: u32 = 10;

pub type FramePacketSink = Sink<Arc<FramePacket>>;

type DeviceJob<D> = Box<dyn FnOnce(&mut D) + Send>;

enum Command<D> {
    Subscribe(FramePacketSink),
    Unsubscribe(FramePacketSink),
    FpsTarget(u32),
    WithDevice(DeviceJob<D>),
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Anything that delivers `FramePacket`s to registered sinks.
pub trait FrameSource: Send {
    fn port(&self) -> Port;

    fn subscribe(&self, sink: FramePacketSink);

    fn unsubscribe(&self, sink: &FramePacketSink);
}

/// Cloneable subscription handle for a `Stream`.
///
/// Stays valid across worker restarts.
pub struct StreamHandle<D> {
    port: Port,
    control: Sender<Command<D>>,
}

impl<D> Clone for StreamHandle<D> {
    fn clone(&self) -> Self {
        Self {
            port: self.port,
            control: self.control.clone(),
        }
    }
}

impl<D: CaptureDevice> StreamHandle<D> {
    fn send(&self, command: Command<D>) -> Result<(), StreamError> {
        self.control
            .send(command)
            .map_err(|_| StreamError::WorkerGone { port: self.port })
    }
}

impl<D: CaptureDevice> FrameSource for StreamHandle<D> {
    fn port(&self) -> Port {
        self.port
    }

    fn subscribe(&self, sink: FramePacketSink) {
        if let Err(err) = self.send(Command::Subscribe(sink)) {
            log::warn!("stream {}: subscribe ignored: {}", self.port, err);
        }
    }

    fn unsubscribe(&self, sink: &FramePacketSink) {
        if let Err(err) = self.send(Command::Unsubscribe(sink.clone())) {
            log::warn!("stream {}: unsubscribe ignored: {}", self.port, err);
        }
    }
}

/// State owned by the capture thread. Handed back on stop and reused on restart.
struct Worker<D> {
    port: Port,
    device: D,
    control: Receiver<Command<D>>,
    subscribers: Subscribers<Arc<FramePacket>>,
    pacer: Pacer,
    rate: RateEstimator,
    frame_index: u64,
}

impl<D: CaptureDevice> Worker<D> {
    fn run(mut self) -> Self {
        log::info!(
            "stream {}: camera rolling at {} fps target",
            self.port,
            self.pacer.fps_target()
        );
        self.rate.start(Instant::now());
        let mut idle = false;

        loop {
            if self.drain_commands() == Flow::Stop {
                break;
            }

            if self.subscribers.is_empty() {
                if !idle {
                    log::info!("stream {}: no subscribers, capture suspended", self.port);
                    idle = true;
                }
                if self.idle_wait() == Flow::Stop {
                    break;
                }
                continue;
            }
            if idle {
                log::info!("stream {}: capture resumed", self.port);
                idle = false;
                self.rate.start(Instant::now());
            }

            if self.wait_for_milestone() == Flow::Stop {
                break;
            }
            // The last subscriber may have left while we slept.
            if self.subscribers.is_empty() {
                continue;
            }
            self.capture_once();
        }

        log::info!(
            "stream {}: worker stopped after frame_index {}",
            self.port,
            self.frame_index
        );
        self
    }

    fn drain_commands(&mut self) -> Flow {
        while let Ok(command) = self.control.try_recv() {
            if self.apply(command) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn idle_wait(&mut self) -> Flow {
        match self.control.recv_timeout(IDLE_POLL_INTERVAL) {
            Ok(command) => self.apply(command),
            Err(RecvTimeoutError::Timeout) => Flow::Continue,
            Err(RecvTimeoutError::Disconnected) => Flow::Stop,
        }
    }

    /// Sleep until the next milestone, serving commands in the meantime.
    fn wait_for_milestone(&mut self) -> Flow {
        let deadline = Instant::now() + self.pacer.wait_from(wall_clock_secs());
        loop {
            match self.control.recv_deadline(deadline) {
                Ok(command) => {
                    if self.apply(command) == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Flow::Continue,
                Err(RecvTimeoutError::Disconnected) => return Flow::Stop,
            }
        }
    }

    fn capture_once(&mut self) {
        let read_start = wall_clock_secs();
        let frame = if self.device.grab() {
            self.device.retrieve()
        } else {
            None
        };
        let read_stop = wall_clock_secs();

        if let Some(frame) = frame {
            let fps = self.rate.tick(Instant::now());
            let packet = Arc::new(FramePacket {
                port: self.port,
                frame_index: self.frame_index,
                frame_time: (read_start + read_stop) / 2.0,
                frame,
                fps,
            });
            let pruned = self.subscribers.broadcast(&packet);
            if pruned > 0 {
                log::warn!(
                    "stream {}: removed {} subscriber(s) with closed queues, {} remain",
                    self.port,
                    pruned,
                    self.subscribers.len()
                );
            }
        }
        self.frame_index += 1;
    }

    fn apply(&mut self, command: Command<D>) -> Flow {
        match command {
            Command::Subscribe(sink) => match self.subscribers.add(sink) {
                Registration::Added => log::info!(
                    "stream {}: subscriber added, now {}",
                    self.port,
                    self.subscribers.len()
                ),
                _ => log::warn!("stream {}: attempted to subscribe twice", self.port),
            },
            Command::Unsubscribe(sink) => match self.subscribers.remove(&sink) {
                Registration::Removed => log::info!(
                    "stream {}: subscriber removed, {} remain",
                    self.port,
                    self.subscribers.len()
                ),
                _ => log::warn!(
                    "stream {}: attempted to unsubscribe a queue that was not subscribed",
                    self.port
                ),
            },
            Command::FpsTarget(fps_target) => {
                log::info!("stream {}: fps target set to {}", self.port, fps_target);
                self.pacer = Pacer::new(fps_target);
            }
            Command::WithDevice(job) => job(&mut self.device),
            Command::Stop => return Flow::Stop,
        }
        Flow::Continue
    }
}

pub struct Stream<D: CaptureDevice> {
    port: Port,
    fps_target: u32,
    control: Sender<Command<D>>,
    worker: Option<JoinHandle<Worker<D>>>,
}

impl<D: CaptureDevice> Stream<D> {
    /// Probe the device and start capturing at `fps_target`.
    ///
    /// Fails with `DeviceUnavailable` when the probe's final read fails; the
    /// probe is not retried.
    pub fn new(mut device: D, fps_target: u32) -> Result<Self, StreamError> {
        let port = device.port();
        if fps_target == 0 {
            return Err(StreamError::InvalidFpsTarget { port });
        }

        log::info!("stream {}: probing camera", port);
        let mut good_read = false;
        for _ in 0..PROBE_READS {
            good_read = device.grab() && device.retrieve().is_some();
        }
        if !good_read {
            log::warn!("stream {}: camera appears to be busy", port);
            return Err(StreamError::DeviceUnavailable { port });
        }

        let (control, control_rx) = crossbeam_channel::unbounded();
        let worker = Worker {
            port,
            device,
            control: control_rx,
            subscribers: Subscribers::new(),
            pacer: Pacer::new(fps_target),
            rate: RateEstimator::new(),
            frame_index: 0,
        };
        let handle = spawn_worker(worker)?;

        Ok(Self {
            port,
            fps_target,
            control,
            worker: Some(handle),
        })
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn fps_target(&self) -> u32 {
        self.fps_target
    }

    pub fn handle(&self) -> StreamHandle<D> {
        StreamHandle {
            port: self.port,
            control: self.control.clone(),
        }
    }

    /// Register a sink. Subscribing the same queue twice is a logged no-op.
    pub fn subscribe(&self, sink: FramePacketSink) {
        self.handle().subscribe(sink);
    }

    /// Deregister a sink. Unknown sinks are a logged no-op.
    pub fn unsubscribe(&self, sink: &FramePacketSink) {
        self.handle().unsubscribe(sink);
    }

    /// Change the pacing schedule; applies from the next read.
    pub fn set_fps_target(&mut self, fps_target: u32) -> Result<(), StreamError> {
        if fps_target == 0 {
            return Err(StreamError::InvalidFpsTarget { port: self.port });
        }
        self.handle().send(Command::FpsTarget(fps_target))?;
        self.fps_target = fps_target;
        Ok(())
    }

    /// Run `job` on the capture thread, between reads, and return its result.
    pub fn with_device<R, F>(&self, job: F) -> Result<R, StreamError>
    where
        F: FnOnce(&mut D) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.handle().send(Command::WithDevice(Box::new(move |device| {
            let _ = reply_tx.send(job(device));
        })))?;
        reply_rx
            .recv()
            .map_err(|_| StreamError::WorkerGone { port: self.port })
    }

    /// Live resolution, read from the device rather than cached.
    pub fn size(&self) -> Result<FrameSize, StreamError> {
        self.with_device(|device| device.size())
    }

    pub fn set_exposure(&self, value: i32) -> Result<(), StreamError> {
        self.with_device(move |device| device.set_exposure(value))?
            .map_err(StreamError::from)
    }

    pub fn rotation(&self) -> Result<Rotation, StreamError> {
        self.with_device(|device| device.rotation())
    }

    pub fn set_rotation(&self, rotation: Rotation) -> Result<(), StreamError> {
        self.with_device(move |device| device.set_rotation(rotation))
    }

    /// Stop the worker, reconnect the camera at `size`, and restart.
    ///
    /// Blocks until the old worker has exited. If reconnecting fails the
    /// worker is still restarted (its reads fail until a later change
    /// succeeds) and the error is returned.
    pub fn change_resolution(&mut self, size: FrameSize) -> Result<(), StreamError> {
        log::info!("stream {}: about to stop camera", self.port);
        let mut worker = self.halt()?;
        log::info!("stream {}: stop confirmed", self.port);

        worker.rate = RateEstimator::new();
        let reconnected = reconnect(&mut worker.device, size);

        log::info!(
            "stream {}: restarting worker at resolution {}",
            self.port,
            size
        );
        self.worker = Some(spawn_worker(worker)?);
        reconnected.map_err(StreamError::from)
    }

    /// Stop capturing and hand the disconnected device back.
    pub fn stop(mut self) -> Result<D, StreamError> {
        let mut worker = self.halt()?;
        worker.device.disconnect();
        Ok(worker.device)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn halt(&mut self) -> Result<Worker<D>, StreamError> {
        let port = self.port;
        let handle = self.worker.take().ok_or(StreamError::WorkerGone { port })?;
        // A send failure means the worker already exited; join still applies.
        let _ = self.control.send(Command::Stop);
        handle.join().map_err(|_| {
            log::error!("stream {}: capture worker panicked", port);
            StreamError::WorkerGone { port }
        })
    }
}

impl<D: CaptureDevice> Drop for Stream<D> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Ok(mut worker) = self.halt() {
                worker.device.disconnect();
            }
        }
    }
}

fn reconnect<D: CaptureDevice>(device: &mut D, size: FrameSize) -> Result<(), DeviceError> {
    let port = device.port();
    log::info!("stream {}: disconnecting camera", port);
    device.disconnect();
    log::info!("stream {}: reconnecting camera", port);
    device.connect()?;
    device.set_size(size)
}

fn spawn_worker<D: CaptureDevice>(worker: Worker<D>) -> Result<JoinHandle<Worker<D>>, StreamError> {
    let port = worker.port;
    thread::Builder::new()
        .name(format!("stream-{}", port))
        .spawn(move || worker.run())
        .map_err(|err| StreamError::Device(DeviceError::Io(err)))
}
