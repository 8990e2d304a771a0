use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;

use multicam_sync::packet::wall_clock_secs;
use multicam_sync::stream::FramePacketSink;
use multicam_sync::{
    Frame, FramePacket, FrameSize, FrameSource, Port, Sink, Stream, SyncPacket, Synchronizer,
    SynchronizerConfig, SyntheticCamera,
};

const CYCLE_TIMEOUT: Duration = Duration::from_millis(150);
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A source the test pushes packets through by hand.
#[derive(Clone)]
struct ScriptedSource {
    port: Port,
    sinks: Arc<Mutex<Vec<FramePacketSink>>>,
}

impl ScriptedSource {
    fn new(port: Port) -> Self {
        Self {
            port,
            sinks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, frame_index: u64) {
        self.push_captured_at(frame_index, wall_clock_secs());
    }

    fn push_captured_at(&self, frame_index: u64, frame_time: f64) {
        let packet = Arc::new(FramePacket {
            port: self.port,
            frame_index,
            frame_time,
            frame: Frame::new(2, 2, vec![0; 12]),
            fps: 0.0,
        });
        for sink in self.sinks.lock().unwrap().iter() {
            sink.push(Arc::clone(&packet));
        }
    }

    fn subscriber_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

impl FrameSource for ScriptedSource {
    fn port(&self) -> Port {
        self.port
    }

    fn subscribe(&self, sink: FramePacketSink) {
        let mut sinks = self.sinks.lock().unwrap();
        if !sinks.iter().any(|existing| existing.same_queue(&sink)) {
            sinks.push(sink);
        }
    }

    fn unsubscribe(&self, sink: &FramePacketSink) {
        self.sinks
            .lock()
            .unwrap()
            .retain(|existing| !existing.same_queue(sink));
    }
}

fn synchronizer(sources: &[ScriptedSource]) -> Synchronizer {
    synchronizer_with_timeout(sources, CYCLE_TIMEOUT)
}

fn synchronizer_with_timeout(sources: &[ScriptedSource], cycle_timeout: Duration) -> Synchronizer {
    let boxed = sources
        .iter()
        .map(|source| Box::new(source.clone()) as Box<dyn FrameSource>)
        .collect();
    Synchronizer::new(
        boxed,
        SynchronizerConfig { cycle_timeout },
    )
    .expect("synchronizer starts")
}

fn subscribed(sync: &Synchronizer) -> Receiver<Arc<SyncPacket>> {
    let (sink, rx) = Sink::unbounded();
    sync.subscribe_to_sync_packets(sink);
    rx
}

fn next(rx: &Receiver<Arc<SyncPacket>>) -> Arc<SyncPacket> {
    rx.recv_timeout(RECV_TIMEOUT).expect("sync packet before timeout")
}

#[test]
fn alternating_port_is_absent_on_every_second_cycle() {
    let a = ScriptedSource::new(0);
    let b = ScriptedSource::new(1);
    let sync = synchronizer(&[a.clone(), b.clone()]);
    let rx = subscribed(&sync);

    // B reports on the first and third cycles only.
    let mut packets = Vec::new();
    for cycle in 0..4u64 {
        a.push(cycle);
        if cycle % 2 == 0 {
            b.push(cycle);
        }
        packets.push(next(&rx));
    }

    for (cycle, packet) in packets.iter().enumerate() {
        assert_eq!(packet.sync_index, cycle as u64);
        assert_eq!(packet.frame_packets.len(), 2);
        assert_eq!(packet.is_dropped(0), Some(false));
        assert_eq!(packet.is_dropped(1), Some(cycle % 2 == 1));
    }
    assert_eq!(packets[0].frame_packet_count(), 2);
    assert_eq!(packets[1].frame_packet_count(), 1);
    assert!(packets[1].get(0).is_some());
    assert!(packets[1].get(1).is_none());

    // 0 -> 0 -> 0.5 -> 0.25 -> 0.625
    let dropped = sync.dropped_fps();
    assert_eq!(dropped[&0], 0.0);
    assert!((dropped[&1] - 0.625).abs() < 1e-9, "B drop {}", dropped[&1]);
    assert!((dropped[&1] - 0.5).abs() <= 0.125);

    let current = sync.current_sync_packet().expect("current packet");
    assert_eq!(current.sync_index, 3);
}

#[test]
fn every_cycle_covers_every_port_without_index_gaps() {
    let sources: Vec<ScriptedSource> = (0..3).map(ScriptedSource::new).collect();
    let sync = synchronizer(&sources);
    let rx = subscribed(&sync);
    assert_eq!(sync.ports(), &[0, 1, 2]);

    for cycle in 0..8u64 {
        for (i, source) in sources.iter().enumerate() {
            if (cycle + i as u64) % 3 != 0 {
                source.push(cycle);
            }
        }
        let packet = next(&rx);
        assert_eq!(packet.sync_index, cycle);
        let ports: Vec<Port> = packet.frame_packets.keys().copied().collect();
        assert_eq!(ports, vec![0, 1, 2]);
        for (port, frame_packet) in &packet.frame_packets {
            if let Some(frame_packet) = frame_packet {
                assert_eq!(frame_packet.port, *port);
                assert_eq!(frame_packet.frame_index, cycle);
            }
        }
    }
    for rate in sync.dropped_fps().values() {
        assert!((0.0..=1.0).contains(rate));
    }
}

#[test]
fn no_cycles_run_before_the_first_packet() {
    let a = ScriptedSource::new(0);
    let sync = synchronizer(&[a.clone()]);
    let rx = subscribed(&sync);

    assert!(rx.recv_timeout(CYCLE_TIMEOUT * 3).is_err());
    assert!(sync.current_sync_packet().is_none());
    assert_eq!(sync.dropped_fps()[&0], 0.0);
}

#[test]
fn stalled_ports_keep_cycling_and_report_drops() {
    let a = ScriptedSource::new(0);
    let b = ScriptedSource::new(1);
    let sync = synchronizer_with_timeout(&[a.clone(), b.clone()], Duration::from_millis(50));
    let rx = subscribed(&sync);

    for cycle in 0..3u64 {
        a.push(cycle);
        b.push(cycle);
        next(&rx);
    }
    let before_stall = sync.current_sync_packet().expect("cycles ran").sync_index;

    // Every port goes silent.
    std::thread::sleep(Duration::from_secs(1));

    let dropped = sync.dropped_fps();
    assert!(dropped[&0] > 0.9, "port 0 drop {}", dropped[&0]);
    assert!(dropped[&1] > 0.9, "port 1 drop {}", dropped[&1]);
    let current = sync.current_sync_packet().expect("current packet");
    assert!(
        current.sync_index >= before_stall + 5,
        "only reached cycle {}",
        current.sync_index
    );
    assert_eq!(current.frame_packet_count(), 0);
    assert_eq!(current.frame_packets.len(), 2);

    let packets: Vec<Arc<SyncPacket>> = rx.try_iter().collect();
    for pair in packets.windows(2) {
        assert_eq!(pair[1].sync_index, pair[0].sync_index + 1);
    }
    assert!(packets
        .iter()
        .filter(|packet| packet.sync_index > before_stall)
        .all(|packet| packet.frame_packet_count() == 0));

    // Recovery: the next arrival is present in its cycle.
    a.push(3);
    let recovered = loop {
        let packet = next(&rx);
        if packet.frame_packet_count() > 0 {
            break packet;
        }
    };
    assert_eq!(recovered.get(0).map(|p| p.frame_index), Some(3));
}

#[test]
fn paused_synchronizer_discards_stale_intake() {
    let a = ScriptedSource::new(0);
    let b = ScriptedSource::new(1);
    let mut sync = synchronizer_with_timeout(&[a.clone(), b.clone()], Duration::from_secs(1));
    let rx = subscribed(&sync);

    a.push(0);
    b.push(0);
    assert_eq!(next(&rx).sync_index, 0);

    sync.unsubscribe_from_streams();
    assert!(!sync.is_subscribed_to_streams());
    assert_eq!(a.subscriber_count(), 0);
    assert_eq!(b.subscriber_count(), 0);
    a.push(1);
    assert!(rx.recv_timeout(CYCLE_TIMEOUT * 2).is_err());

    let paused_at = wall_clock_secs();
    sync.subscribe_to_streams();
    assert_eq!(a.subscriber_count(), 1);
    // Captured while paused but delivered late.
    a.push_captured_at(1, paused_at);
    a.push(2);
    b.push(2);
    let resumed = next(&rx);
    assert_eq!(resumed.sync_index, 1);
    assert_eq!(resumed.get(0).map(|p| p.frame_index), Some(2));
    assert_eq!(resumed.get(1).map(|p| p.frame_index), Some(2));
}

#[test]
fn unsubscribed_consumer_stops_receiving() {
    let a = ScriptedSource::new(0);
    let sync = synchronizer(&[a.clone()]);
    let (sink, rx) = Sink::unbounded();
    sync.subscribe_to_sync_packets(sink.clone());
    sync.subscribe_to_sync_packets(sink.clone());

    a.push(0);
    assert_eq!(next(&rx).sync_index, 0);
    assert!(rx.try_recv().is_err(), "duplicate subscription delivered twice");

    sync.unsubscribe(&sink);
    a.push(1);
    assert!(rx.recv_timeout(CYCLE_TIMEOUT * 2).is_err());
    let current = sync.current_sync_packet().expect("cycle still ran");
    assert!(current.sync_index >= 1);
}

#[test]
fn stop_releases_stream_subscriptions() {
    let a = ScriptedSource::new(0);
    let b = ScriptedSource::new(1);
    let mut sync = synchronizer(&[a.clone(), b.clone()]);
    assert_eq!(a.subscriber_count(), 1);

    sync.stop();
    assert_eq!(a.subscriber_count(), 0);
    assert_eq!(b.subscriber_count(), 0);
}

#[test]
fn duplicate_ports_are_rejected() {
    let sources: Vec<Box<dyn FrameSource>> = vec![
        Box::new(ScriptedSource::new(3)),
        Box::new(ScriptedSource::new(3)),
    ];
    assert!(Synchronizer::new(sources, SynchronizerConfig::default()).is_err());
}

#[test]
fn synchronizes_live_streams() {
    let streams: Vec<Stream<SyntheticCamera>> = (0..2)
        .map(|port| {
            Stream::new(SyntheticCamera::new(port, FrameSize::new(8, 6)), 20).expect("stream")
        })
        .collect();
    let sources = streams
        .iter()
        .map(|stream| Box::new(stream.handle()) as Box<dyn FrameSource>)
        .collect();
    let sync = Synchronizer::new(sources, SynchronizerConfig::default()).expect("synchronizer");
    let rx = subscribed(&sync);

    let packets: Vec<Arc<SyncPacket>> = (0..10).map(|_| next(&rx)).collect();
    for pair in packets.windows(2) {
        assert_eq!(pair[1].sync_index, pair[0].sync_index + 1);
    }
    let complete = packets
        .iter()
        .filter(|packet| packet.frame_packet_count() == 2)
        .count();
    assert!(complete >= 5, "only {} complete cycles", complete);
}
