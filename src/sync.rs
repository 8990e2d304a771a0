//! Cross-camera synchronizer.
//!
//! The aggregator thread pulls one packet per port per cycle from dedicated
//! intake queues and emits one `SyncPacket` covering every configured port.
//! A cycle begins when any intake has a packet waiting and opens a single
//! deadline (`now + cycle_timeout`); ports are awaited in order against it, so
//! a slow camera costs at most one timeout per cycle. A port that delivered
//! nothing by the deadline is recorded as absent. A port with a backlog
//! contributes only its newest packet.
//!
//! Once the first cycle has run, a full `cycle_timeout` without any arrival
//! emits an all-absent cycle, so `dropped_fps` keeps moving toward 1.0 while
//! every camera is stalled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};

use crate::error::SyncError;
use crate::packet::{wall_clock_secs, FramePacket, Port, SyncPacket};
use crate::queue::{Registration, Sink, Subscribers};
use crate::smoothing::DropTracker;
use crate::stream::{FramePacketSink, FrameSource};

pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_millis(250);

pub type SyncPacketSink = Sink<Arc<SyncPacket>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SynchronizerConfig {
    /// Upper bound on how long one cycle waits for stragglers.
    pub cycle_timeout: Duration,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
        }
    }
}

enum Command {
    Subscribe(SyncPacketSink),
    Unsubscribe(SyncPacketSink),
    /// Resume cycles; acknowledged once stale intake has been discarded.
    Resume(Sender<()>),
    Pause,
    Stop,
}

/// Metrics the aggregator publishes for lock-free readers.
struct Published {
    current: ArcSwapOption<SyncPacket>,
    dropped: ArcSwap<BTreeMap<Port, f64>>,
}

/// Caller-side half of one port's intake: the source and the sink it feeds.
struct Feed {
    source: Box<dyn FrameSource>,
    sink: FramePacketSink,
}

struct Intake {
    port: Port,
    rx: Receiver<Arc<FramePacket>>,
}

struct Aggregator {
    intakes: Vec<Intake>,
    control: Receiver<Command>,
    subscribers: Subscribers<Arc<SyncPacket>>,
    drops: DropTracker,
    published: Arc<Published>,
    cycle_timeout: Duration,
    sync_index: u64,
    pulling: bool,
    last_cycle_end: Option<Instant>,
    /// Packets captured before this wall-clock time are stale.
    fresh_after: f64,
    discarded: u64,
}

impl Aggregator {
    fn run(mut self) {
        log::info!(
            "synchronizer: aggregating {} port(s), cycle timeout {:?}",
            self.intakes.len(),
            self.cycle_timeout
        );
        while self.drain_commands() {
            if !self.pulling {
                let Ok(command) = self.control.recv() else {
                    break;
                };
                if !self.apply(command) {
                    break;
                }
                continue;
            }
            if self.intakes.iter().any(|intake| !intake.rx.is_empty()) {
                self.cycle(Instant::now() + self.cycle_timeout);
            } else if self.wait_for_activity() {
                log::debug!(
                    "synchronizer: no packets for {:?}, every port absent",
                    self.cycle_timeout
                );
                self.cycle(Instant::now());
            }
        }
        log::info!(
            "synchronizer: stopped after {} cycle(s), {} packet(s) discarded",
            self.sync_index,
            self.discarded
        );
    }

    /// Returns false on stop or when every caller handle is gone.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.control.try_recv() {
                Ok(command) => {
                    if !self.apply(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Block until a packet or a command is waiting. Commands are always
    /// drained before the next cycle starts. Returns true when a whole cycle
    /// timeout has passed since the last cycle with nothing arriving.
    fn wait_for_activity(&self) -> bool {
        let mut select = Select::new();
        select.recv(&self.control);
        for intake in &self.intakes {
            select.recv(&intake.rx);
        }
        match self.last_cycle_end {
            Some(end) => select.ready_deadline(end + self.cycle_timeout).is_err(),
            None => {
                let _ = select.ready();
                false
            }
        }
    }

    /// Returns false on stop.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe(sink) => match self.subscribers.add(sink) {
                Registration::Added => log::info!(
                    "synchronizer: subscriber added, now {}",
                    self.subscribers.len()
                ),
                _ => log::warn!("synchronizer: attempted to subscribe twice"),
            },
            Command::Unsubscribe(sink) => match self.subscribers.remove(&sink) {
                Registration::Removed => log::info!(
                    "synchronizer: subscriber removed, {} remain",
                    self.subscribers.len()
                ),
                _ => log::warn!(
                    "synchronizer: attempted to unsubscribe a queue that was not subscribed"
                ),
            },
            Command::Resume(ack) => {
                let stale: usize = self
                    .intakes
                    .iter()
                    .map(|intake| intake.rx.try_iter().count())
                    .sum();
                if stale > 0 {
                    log::debug!("synchronizer: discarded {} stale packet(s)", stale);
                }
                self.discarded += stale as u64;
                // A stream may still push a frame it captured before resuming.
                self.fresh_after = wall_clock_secs();
                self.last_cycle_end = (self.sync_index > 0).then(Instant::now);
                self.pulling = true;
                let _ = ack.send(());
            }
            Command::Pause => self.pulling = false,
            Command::Stop => return false,
        }
        true
    }

    fn cycle(&mut self, deadline: Instant) {
        let mut frame_packets = BTreeMap::new();
        for intake in &self.intakes {
            let (packet, discarded) = newest_before(&intake.rx, deadline, self.fresh_after);
            if discarded > 0 {
                log::debug!(
                    "synchronizer: port {} skipped {} older packet(s)",
                    intake.port,
                    discarded
                );
                self.discarded += discarded as u64;
            }
            self.drops.record(intake.port, packet.is_none());
            frame_packets.insert(intake.port, packet);
        }

        let packet = Arc::new(SyncPacket {
            sync_index: self.sync_index,
            frame_packets,
        });
        self.sync_index += 1;
        log::debug!(
            "synchronizer: cycle {} with {}/{} frame(s)",
            packet.sync_index,
            packet.frame_packet_count(),
            self.intakes.len()
        );

        self.published.current.store(Some(Arc::clone(&packet)));
        self.published
            .dropped
            .store(Arc::new(self.drops.rates().clone()));

        let pruned = self.subscribers.broadcast(&packet);
        if pruned > 0 {
            log::warn!(
                "synchronizer: removed {} subscriber(s) with closed queues",
                pruned
            );
        }
        self.last_cycle_end = Some(Instant::now());
    }
}

/// Wait until `deadline` for a packet captured at or after `fresh_after`, then
/// skip ahead to the newest queued one. Also returns how many packets were
/// passed over, stale or superseded.
fn newest_before(
    rx: &Receiver<Arc<FramePacket>>,
    deadline: Instant,
    fresh_after: f64,
) -> (Option<Arc<FramePacket>>, usize) {
    let mut discarded = 0;
    let mut newest = loop {
        match rx.recv_deadline(deadline) {
            Ok(packet) if packet.frame_time >= fresh_after => break packet,
            Ok(_) => discarded += 1,
            Err(_) => return (None, discarded),
        }
    };
    for packet in rx.try_iter() {
        discarded += 1;
        if packet.frame_time >= fresh_after {
            newest = packet;
        }
    }
    (Some(newest), discarded)
}

pub struct Synchronizer {
    ports: Vec<Port>,
    feeds: Vec<Feed>,
    control: Sender<Command>,
    published: Arc<Published>,
    worker: Option<JoinHandle<()>>,
    subscribed_to_streams: bool,
}

impl Synchronizer {
    /// Build the intake queues, start the aggregator and subscribe to every
    /// source.
    pub fn new(
        sources: Vec<Box<dyn FrameSource>>,
        config: SynchronizerConfig,
    ) -> Result<Self, SyncError> {
        let mut seen = BTreeSet::new();
        let mut ports = Vec::with_capacity(sources.len());
        let mut feeds = Vec::with_capacity(sources.len());
        let mut intakes = Vec::with_capacity(sources.len());
        for source in sources {
            let port = source.port();
            if !seen.insert(port) {
                return Err(SyncError::DuplicatePort(port));
            }
            let (sink, rx) = Sink::unbounded();
            ports.push(port);
            feeds.push(Feed { source, sink });
            intakes.push(Intake { port, rx });
        }

        let published = Arc::new(Published {
            current: ArcSwapOption::empty(),
            dropped: ArcSwap::from_pointee(ports.iter().map(|port| (*port, 0.0)).collect()),
        });
        let (control, control_rx) = crossbeam_channel::unbounded();
        let aggregator = Aggregator {
            intakes,
            control: control_rx,
            subscribers: Subscribers::new(),
            drops: DropTracker::new(ports.iter().copied()),
            published: Arc::clone(&published),
            cycle_timeout: config.cycle_timeout,
            sync_index: 0,
            pulling: false,
            last_cycle_end: None,
            fresh_after: f64::NEG_INFINITY,
            discarded: 0,
        };
        let worker = thread::Builder::new()
            .name("synchronizer".to_string())
            .spawn(move || aggregator.run())?;

        let mut synchronizer = Self {
            ports,
            feeds,
            control,
            published,
            worker: Some(worker),
            subscribed_to_streams: false,
        };
        synchronizer.subscribe_to_streams();
        Ok(synchronizer)
    }

    /// Configured ports, in construction order.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Start pulling from the streams. Packets queued while paused are
    /// discarded before the first new cycle.
    pub fn subscribe_to_streams(&mut self) {
        if self.subscribed_to_streams {
            log::warn!("synchronizer: already subscribed to streams");
            return;
        }
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.control.send(Command::Resume(ack_tx)).is_err() || ack_rx.recv().is_err() {
            log::warn!("synchronizer: aggregator is gone, not subscribing");
            return;
        }
        for feed in &self.feeds {
            feed.source.subscribe(feed.sink.clone());
        }
        self.subscribed_to_streams = true;
        log::info!("synchronizer: subscribed to {} stream(s)", self.feeds.len());
    }

    /// Stop pulling from the streams; no cycles run until resubscribed.
    pub fn unsubscribe_from_streams(&mut self) {
        if !self.subscribed_to_streams {
            log::warn!("synchronizer: not subscribed to streams");
            return;
        }
        let _ = self.control.send(Command::Pause);
        self.release_streams();
        log::info!("synchronizer: unsubscribed from streams");
    }

    pub fn is_subscribed_to_streams(&self) -> bool {
        self.subscribed_to_streams
    }

    pub fn subscribe_to_sync_packets(&self, sink: SyncPacketSink) {
        if self.control.send(Command::Subscribe(sink)).is_err() {
            log::warn!("synchronizer: aggregator is gone, subscribe ignored");
        }
    }

    pub fn unsubscribe(&self, sink: &SyncPacketSink) {
        if self.control.send(Command::Unsubscribe(sink.clone())).is_err() {
            log::warn!("synchronizer: aggregator is gone, unsubscribe ignored");
        }
    }

    /// Most recently completed packet, if any cycle has run.
    pub fn current_sync_packet(&self) -> Option<Arc<SyncPacket>> {
        self.published.current.load_full()
    }

    /// Smoothed fraction of recent cycles in which each port was absent.
    pub fn dropped_fps(&self) -> Arc<BTreeMap<Port, f64>> {
        self.published.dropped.load_full()
    }

    /// Halt after the in-flight cycle and release every stream subscription.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if self.subscribed_to_streams {
            self.release_streams();
        }
        let _ = self.control.send(Command::Stop);
        if worker.join().is_err() {
            log::error!("synchronizer: aggregator panicked");
        }
    }

    fn release_streams(&mut self) {
        for feed in &self.feeds {
            feed.source.unsubscribe(&feed.sink);
        }
        self.subscribed_to_streams = false;
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}
