//! multicamd - multi-camera synchronized capture daemon
//!
//! Opens every configured camera, runs one paced stream per camera and a
//! synchronizer across them, and logs per-cycle summaries plus periodic
//! drop-rate health lines until Ctrl-C or the requested run time elapses.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{select, tick};
use std::time::{Duration, Instant};

use multicam_sync::config::MulticamConfig;
use multicam_sync::{Camera, Session, Sink};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "MULTICAM_CONFIG")]
    config: Option<String>,
    /// Override the configured capture rate.
    #[arg(long)]
    fps: Option<u32>,
    /// Stop after this many seconds; 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    seconds: u64,
    /// Seconds between drop-rate health lines.
    #[arg(long, default_value_t = 5)]
    health_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("MULTICAM_CONFIG", path);
    }
    let mut cfg = MulticamConfig::load().context("loading configuration")?;
    if let Some(fps) = args.fps {
        if fps == 0 {
            return Err(anyhow!("fps must be >= 1"));
        }
        cfg.fps = fps;
    }
    if args.health_interval == 0 {
        return Err(anyhow!("health interval must be >= 1 second"));
    }

    let mut cameras = Vec::new();
    for camera in cfg.active_cameras() {
        let opened = Camera::open(camera.clone())
            .with_context(|| format!("opening camera {} ({})", camera.port, camera.device))?;
        cameras.push(opened);
    }

    let session = Session::new(cameras, cfg.session_settings())?;
    log::info!(
        "multicamd: capturing ports {:?} at {} fps",
        session.ports(),
        session.fps_target()
    );

    let (sink, packets) = Sink::unbounded();
    session.synchronizer().subscribe_to_sync_packets(sink.clone());

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("error setting Ctrl-C handler")?;

    let health = tick(Duration::from_secs(args.health_interval));
    let run_until = (args.seconds > 0).then(|| Instant::now() + Duration::from_secs(args.seconds));
    let mut cycles = 0u64;
    let mut dropped_frames = 0u64;

    loop {
        if run_until.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("multicamd: run time elapsed");
            break;
        }
        select! {
            recv(packets) -> packet => {
                let Ok(packet) = packet else { break };
                cycles += 1;
                let present = packet.frame_packet_count();
                dropped_frames += (packet.frame_packets.len() - present) as u64;
                log::debug!(
                    "sync {}: {}/{} frame(s)",
                    packet.sync_index,
                    present,
                    packet.frame_packets.len()
                );
            }
            recv(health) -> _ => {
                let dropped = session.synchronizer().dropped_fps();
                let summary: Vec<String> = dropped
                    .iter()
                    .map(|(port, rate)| format!("{}={:.2}", port, rate))
                    .collect();
                log::info!(
                    "multicamd: {} cycle(s), {} missing frame(s), drop rate [{}]",
                    cycles,
                    dropped_frames,
                    summary.join(", ")
                );
            }
            recv(stop_rx) -> _ => {
                log::info!("shutdown signal received, stopping capture...");
                break;
            }
            default(Duration::from_millis(250)) => {}
        }
    }

    session.synchronizer().unsubscribe(&sink);
    session.shutdown()?;
    log::info!("multicamd: {} cycle(s) captured", cycles);
    Ok(())
}
