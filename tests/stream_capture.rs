use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use multicam_sync::stream::{IDLE_POLL_INTERVAL, PROBE_READS};
use multicam_sync::{
    CaptureDevice, FramePacket, FrameSize, FrameSource, Sink, Stream, StreamError,
    SyntheticCamera,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn collect(rx: &Receiver<Arc<FramePacket>>, count: usize) -> Vec<Arc<FramePacket>> {
    (0..count)
        .map(|_| rx.recv_timeout(RECV_TIMEOUT).expect("packet before timeout"))
        .collect()
}

fn sequence(packet: &FramePacket) -> u64 {
    SyntheticCamera::sequence_of(&packet.frame).expect("sequence stamp")
}

#[test]
fn frame_index_counts_failed_reads() {
    let camera = SyntheticCamera::new(0, FrameSize::new(8, 6)).with_failure_every(3);
    let stream = Stream::new(camera, 30).expect("stream starts");
    let (sink, rx) = Sink::unbounded();
    stream.subscribe(sink);

    let packets = collect(&rx, 10);

    // Read N (1-based) is the (N - PROBE_READS - 1)th worker iteration.
    for packet in &packets {
        let seq = sequence(packet);
        assert_ne!(seq % 3, 0, "failed reads must not produce packets");
        assert_eq!(packet.frame_index, seq - u64::from(PROBE_READS) - 1);
        assert_eq!(packet.port, 0);
    }
    let gaps = packets
        .windows(2)
        .filter(|pair| pair[1].frame_index - pair[0].frame_index > 1)
        .count();
    assert!(gaps >= 2, "expected gaps from failed reads");
    for pair in packets.windows(2) {
        assert!(pair[1].frame_index > pair[0].frame_index);
        assert!(pair[1].frame_time >= pair[0].frame_time);
    }
}

#[test]
fn pacing_converges_to_target_rate() {
    let camera = SyntheticCamera::new(1, FrameSize::new(8, 6));
    let stream = Stream::new(camera, 20).expect("stream starts");
    let (sink, rx) = Sink::unbounded();
    stream.subscribe(sink);

    let started = Instant::now();
    let packets = collect(&rx, 30);
    let elapsed = started.elapsed().as_secs_f64();

    // 30 reads at 20 fps take ~1.5 s.
    assert!(elapsed > 1.2, "captured too fast: {:.3}s", elapsed);
    assert!(elapsed < 3.0, "captured too slow: {:.3}s", elapsed);
    let fps = packets.last().map(|packet| packet.fps).unwrap_or_default();
    assert!(fps > 12.0 && fps < 30.0, "smoothed fps {:.2}", fps);
}

#[test]
fn duplicate_subscription_delivers_once() {
    let camera = SyntheticCamera::new(2, FrameSize::new(8, 6));
    let stream = Stream::new(camera, 30).expect("stream starts");
    let (sink, rx) = Sink::unbounded();
    stream.subscribe(sink.clone());
    stream.subscribe(sink.clone());
    stream.handle().subscribe(sink);

    let packets = collect(&rx, 8);
    for pair in packets.windows(2) {
        assert!(pair[1].frame_index > pair[0].frame_index, "duplicate delivery");
    }
}

#[test]
fn idle_stream_does_not_read() {
    let camera = SyntheticCamera::new(3, FrameSize::new(8, 6));
    let probe = camera.probe();
    let stream = Stream::new(camera, 6).expect("stream starts");

    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(probe.reads(), u64::from(PROBE_READS));

    // One idle poll plus one pacing period at 6 fps.
    let resume_bound = IDLE_POLL_INTERVAL + Duration::from_secs_f64(1.0 / 6.0);
    let (sink, rx) = Sink::unbounded();
    let subscribed_at = Instant::now();
    stream.subscribe(sink.clone());
    let first = rx
        .recv_timeout(resume_bound)
        .expect("capture resumes within one idle poll");
    assert!(subscribed_at.elapsed() <= resume_bound);
    assert_eq!(first.frame_index, 0);

    stream.unsubscribe(&sink);
    std::thread::sleep(Duration::from_millis(300));
    let settled = probe.reads();
    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(probe.reads(), settled, "reads continued without subscribers");
}

#[test]
fn unsubscribe_of_unknown_sink_is_harmless() {
    let camera = SyntheticCamera::new(4, FrameSize::new(8, 6));
    let stream = Stream::new(camera, 30).expect("stream starts");
    let (sink, rx) = Sink::unbounded();
    let (stranger, _stranger_rx) = Sink::unbounded();
    stream.subscribe(sink);
    stream.unsubscribe(&stranger);

    assert_eq!(collect(&rx, 3).len(), 3);
}

#[test]
fn change_resolution_restarts_with_new_size() {
    let camera = SyntheticCamera::new(5, FrameSize::new(16, 12));
    let probe = camera.probe();
    let mut stream = Stream::new(camera, 30).expect("stream starts");
    let (sink, rx) = Sink::unbounded();
    stream.subscribe(sink);

    let before = collect(&rx, 3);
    assert!(before.iter().all(|p| p.frame.size() == FrameSize::new(16, 12)));

    stream
        .change_resolution(FrameSize::new(8, 6))
        .expect("resolution change");
    assert_eq!(stream.size().expect("size query"), FrameSize::new(8, 6));
    assert_eq!(probe.disconnects(), 1);
    assert_eq!(probe.connects(), 1);

    let mut packets = before;
    packets.extend(rx.try_iter());
    packets.extend(collect(&rx, 3));

    let first_new = packets
        .iter()
        .position(|p| p.frame.size() == FrameSize::new(8, 6))
        .expect("packet at new resolution");
    assert!(packets[first_new..]
        .iter()
        .all(|p| p.frame.size() == FrameSize::new(8, 6)));
    for pair in packets.windows(2) {
        assert!(
            pair[1].frame_index > pair[0].frame_index,
            "frame_index reused across restart"
        );
    }
}

#[test]
fn rate_target_can_change_while_running() {
    let camera = SyntheticCamera::new(6, FrameSize::new(8, 6));
    let mut stream = Stream::new(camera, 5).expect("stream starts");
    assert_eq!(stream.fps_target(), 5);

    assert!(matches!(
        stream.set_fps_target(0),
        Err(StreamError::InvalidFpsTarget { port: 6 })
    ));
    stream.set_fps_target(25).expect("new target");
    assert_eq!(stream.fps_target(), 25);

    let (sink, rx) = Sink::unbounded();
    stream.subscribe(sink);
    let started = Instant::now();
    collect(&rx, 10);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[test]
fn device_settings_apply_on_worker() {
    let camera = SyntheticCamera::new(7, FrameSize::new(8, 6));
    let stream = Stream::new(camera, 10).expect("stream starts");

    stream.set_exposure(-5).expect("exposure");
    assert_eq!(stream.with_device(|d| d.exposure()).expect("query"), -5);

    let rotation = stream.rotation().expect("rotation").rotate_cw();
    stream.set_rotation(rotation).expect("rotate");
    assert_eq!(stream.rotation().expect("rotation").quarter_turns(), 1);
}

#[test]
fn busy_camera_fails_probe() {
    let camera = SyntheticCamera::new(8, FrameSize::new(8, 6)).offline();
    let result = Stream::new(camera, 6);
    assert!(matches!(
        result,
        Err(StreamError::DeviceUnavailable { port: 8 })
    ));
}

#[test]
fn zero_rate_is_rejected_at_construction() {
    let camera = SyntheticCamera::new(9, FrameSize::new(8, 6));
    assert!(matches!(
        Stream::new(camera, 0),
        Err(StreamError::InvalidFpsTarget { port: 9 })
    ));
}

#[test]
fn stop_returns_disconnected_device() {
    let camera = SyntheticCamera::new(10, FrameSize::new(8, 6));
    let probe = camera.probe();
    let stream = Stream::new(camera, 10).expect("stream starts");
    assert!(stream.is_running());

    let mut camera = stream.stop().expect("clean stop");
    assert_eq!(probe.disconnects(), 1);
    assert!(!camera.grab());
    assert_eq!(camera.port(), 10);
}
