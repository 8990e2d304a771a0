use thiserror::Error;

use crate::packet::Port;

/// Errors raised at the device capability boundary.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("camera at port {port} is unavailable: {reason}")]
    Unavailable { port: Port, reason: String },

    #[error("camera at port {port} rejected setting: {reason}")]
    Rejected { port: Port, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a `Stream`.
///
/// Transient read failures never appear here; they are absorbed by the worker
/// and only show up as gaps in `frame_index` and a lower `fps`.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("camera at port {port} failed its connectivity probe (likely in use)")]
    DeviceUnavailable { port: Port },

    #[error("fps target must be at least 1 (port {port})")]
    InvalidFpsTarget { port: Port },

    #[error("capture worker for port {port} is gone")]
    WorkerGone { port: Port },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors raised while building a `Synchronizer`.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("port {0} is configured more than once")]
    DuplicatePort(Port),

    #[error("failed to start aggregator: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors surfaced by a `Session`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no stream configured at port {0}")]
    UnknownPort(Port),

    #[error("session requires at least one camera")]
    NoCameras,

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}
