use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::device::{Backend, CameraConfig, Rotation};
use crate::packet::{FrameSize, Port};
use crate::session::SessionSettings;
use crate::sync::SynchronizerConfig;

const DEFAULT_FPS: u32 = 6;
const DEFAULT_SYNC_TIMEOUT_MS: u64 = 250;
const DEFAULT_DEVICE: &str = "stub://cam0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const CAMERA_KEY_PREFIX: &str = "cam_";

#[derive(Debug, Deserialize, Default)]
struct MulticamConfigFile {
    fps: Option<u32>,
    sync_timeout_ms: Option<u64>,
    /// Flat per-camera records keyed `cam_<port>`.
    #[serde(flatten)]
    cameras: BTreeMap<String, CameraConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    size: Option<[u32; 2]>,
    exposure: Option<i32>,
    rotation_count: Option<i8>,
    ignore: Option<bool>,
    backend: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MulticamConfig {
    pub fps: u32,
    pub sync_timeout: Duration,
    pub cameras: Vec<CameraSettings>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub camera: CameraConfig,
    /// Ignored cameras stay in the file but are never opened.
    pub ignore: bool,
}

impl MulticamConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MULTICAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: MulticamConfigFile =
            toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let mut cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MulticamConfigFile) -> Result<Self> {
        let mut cameras = Vec::with_capacity(file.cameras.len());
        for (key, camera) in file.cameras {
            cameras.push(camera_settings(&key, camera)?);
        }
        if cameras.is_empty() {
            cameras.push(CameraSettings {
                camera: CameraConfig {
                    port: 0,
                    device: DEFAULT_DEVICE.to_string(),
                    size: FrameSize::new(DEFAULT_WIDTH, DEFAULT_HEIGHT),
                    ..CameraConfig::default()
                },
                ignore: false,
            });
        }
        cameras.sort_by_key(|settings| settings.camera.port);

        Ok(Self {
            fps: file.fps.unwrap_or(DEFAULT_FPS),
            sync_timeout: Duration::from_millis(
                file.sync_timeout_ms.unwrap_or(DEFAULT_SYNC_TIMEOUT_MS),
            ),
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(fps) = std::env::var("MULTICAM_FPS") {
            if !fps.trim().is_empty() {
                self.fps = fps
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("MULTICAM_FPS must be an integer frame rate"))?;
            }
        }
        if let Ok(timeout) = std::env::var("MULTICAM_SYNC_TIMEOUT_MS") {
            if !timeout.trim().is_empty() {
                let millis: u64 = timeout.trim().parse().map_err(|_| {
                    anyhow!("MULTICAM_SYNC_TIMEOUT_MS must be an integer number of milliseconds")
                })?;
                self.sync_timeout = Duration::from_millis(millis);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(anyhow!("fps must be at least 1"));
        }
        if self.sync_timeout.is_zero() {
            return Err(anyhow!("sync timeout must be greater than zero"));
        }
        if self.active_cameras().next().is_none() {
            return Err(anyhow!("at least one camera must not be ignored"));
        }
        Ok(())
    }

    /// Cameras to open, in port order.
    pub fn active_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras
            .iter()
            .filter(|settings| !settings.ignore)
            .map(|settings| &settings.camera)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            fps_target: self.fps,
            sync: SynchronizerConfig {
                cycle_timeout: self.sync_timeout,
            },
        }
    }
}

fn camera_settings(key: &str, file: CameraConfigFile) -> Result<CameraSettings> {
    let port: Port = key
        .strip_prefix(CAMERA_KEY_PREFIX)
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| anyhow!("unexpected config key '{}': expected cam_<port>", key))?;
    let backend = match file.backend.as_deref() {
        Some(name) => name
            .parse::<Backend>()
            .map_err(|e| anyhow!("{}: {}", key, e))?,
        None => Backend::Auto,
    };
    let [width, height] = file.size.unwrap_or([DEFAULT_WIDTH, DEFAULT_HEIGHT]);
    if width == 0 || height == 0 {
        return Err(anyhow!("{}: size must be non-zero, got {}x{}", key, width, height));
    }
    let rotation_count = file.rotation_count.unwrap_or(0);
    if !(-3..=3).contains(&rotation_count) {
        return Err(anyhow!(
            "{}: rotation_count must be within -3..=3, got {}",
            key,
            rotation_count
        ));
    }
    Ok(CameraSettings {
        camera: CameraConfig {
            port,
            device: file
                .device
                .unwrap_or_else(|| format!("stub://cam{}", port)),
            size: FrameSize::new(width, height),
            exposure: file.exposure,
            rotation: Rotation::from_quarter_turns(rotation_count),
            backend,
        },
        ignore: file.ignore.unwrap_or(false),
    })
}

fn read_config_file(path: &Path) -> Result<MulticamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
