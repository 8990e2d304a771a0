//! Multi-camera paced capture and cross-camera synchronization.
//!
//! # Architecture
//!
//! Each camera runs in its own `Stream`: a worker thread that reads the device
//! on a fixed per-second milestone schedule and fans every captured frame out
//! to subscriber queues as an immutable `FramePacket`. The `Synchronizer`
//! subscribes to every stream, groups one packet per camera into a
//! `SyncPacket` per cycle, and reports how often each camera missed a cycle.
//!
//! ```text
//! device -> Stream -> FramePacket -> intake queue -> Synchronizer -> SyncPacket -> subscribers
//! ```
//!
//! All coordination is queue handoff: subscriptions, rate changes and stop
//! requests are commands on a worker's control queue, so every subscriber
//! registry is owned by exactly one thread.
//!
//! # Module Structure
//!
//! - `packet`: `FramePacket`, `SyncPacket`, `Frame`, `FrameSize`
//! - `device`: the `CaptureDevice` capability set and camera backends
//! - `stream`: paced per-camera capture
//! - `sync`: cycle aggregation and drop metrics
//! - `session`: multi-camera / single-camera orchestration
//! - `config`: daemon configuration (file + environment)

pub mod config;
pub mod device;
pub mod error;
pub mod pacing;
pub mod packet;
pub mod queue;
pub mod session;
pub mod smoothing;
pub mod stream;
pub mod sync;

pub use device::{Backend, Camera, CameraConfig, CaptureDevice, Rotation, SyntheticCamera};
pub use error::{DeviceError, SessionError, StreamError, SyncError};
pub use packet::{Frame, FramePacket, FrameSize, Port, SyncPacket};
pub use queue::Sink;
pub use session::{Session, SessionMode, SessionSettings};
pub use stream::{FrameSource, Stream, StreamHandle};
pub use sync::{Synchronizer, SynchronizerConfig};
