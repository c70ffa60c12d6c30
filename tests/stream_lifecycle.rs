mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{camera_descriptor, payload, MockDevice, STREAMING_INTERFACE};
use uvc_host::usb::TransferStatus;
use uvc_host::{
    Encoding, Error, FrameCallback, Settings, Stream, StreamConfig, StreamEvent, StreamState,
    UvcHost, VideoFormat,
};

type Delivered = Arc<Mutex<Vec<Vec<u8>>>>;

fn recording_callback() -> (FrameCallback, Delivered) {
    let delivered: Delivered = Arc::default();
    let sink = Arc::clone(&delivered);
    let cb: FrameCallback = Box::new(move |frame| {
        sink.lock().unwrap().push(frame.data().to_vec());
        Some(frame)
    });
    (cb, delivered)
}

type Events = Arc<Mutex<Vec<&'static str>>>;

/// Open with an event callback that records overflow, underflow and
/// transfer error events by name.
fn open_with_events(cb: FrameCallback) -> (UvcHost, Arc<MockDevice>, Stream, Events) {
    let host = UvcHost::new();
    let device = MockDevice::new(3, false);
    host.device_connected(device.clone());
    let events: Events = Arc::default();
    let seen = Arc::clone(&events);
    let config = StreamConfig::new(Settings::default(), cb).with_event_callback(move |event| {
        let name = match event {
            StreamEvent::FrameOverflow => "overflow",
            StreamEvent::FrameUnderflow => "underflow",
            StreamEvent::TransferError(_) => "transfer error",
            StreamEvent::DeviceDisconnected(_) => "disconnected",
        };
        seen.lock().unwrap().push(name);
    });
    let stream = host.open(config, Duration::ZERO).unwrap();
    (host, device, stream, events)
}

fn open(bulk: bool) -> (UvcHost, Arc<MockDevice>, Stream, Delivered) {
    let host = UvcHost::new();
    let device = MockDevice::new(3, bulk);
    if bulk {
        // Room for several full bulk transfers per frame
        device.set_max_frame_size(64 * 1024);
    }
    host.device_connected(device.clone());
    let (cb, delivered) = recording_callback();
    let stream = host
        .open(StreamConfig::new(Settings::default(), cb), Duration::from_millis(100))
        .unwrap();
    (host, device, stream, delivered)
}

#[test]
fn isochronous_stream_runs_through_lifecycle() {
    let (_host, device, stream, delivered) = open(false);
    assert_eq!(stream.state(), StreamState::Opened);
    assert!(!stream.is_bulk());
    assert!(device.is_claimed());
    assert_eq!(stream.format(), VideoFormat::new(640, 480, 30.0, Encoding::Mjpeg));
    assert_eq!(stream.max_frame_size(), 4096);
    assert_eq!(device.commits().len(), 1);

    stream.start().unwrap();
    assert_eq!(stream.state(), StreamState::Streaming);
    // 1024-byte payloads need the 3 x 1024 alternate setting
    assert_eq!(device.alt_setting(), 2);
    assert_eq!(device.pending(), 3);

    assert!(device.complete_isoc(&[payload(false, false, b"abc"), payload(false, false, b"def")]));
    assert!(device.complete_isoc(&[payload(true, true, b"xyz")]));
    // Transfers are resubmitted as they complete
    assert_eq!(device.pending(), 3);

    stream.stop().unwrap();
    assert_eq!(stream.state(), StreamState::Opened);
    assert_eq!(device.alt_setting(), 0);
    assert_eq!(device.pending(), 0);

    assert_eq!(
        *delivered.lock().unwrap(),
        vec![b"abcdef".to_vec(), b"xyz".to_vec()]
    );
    let stats = stream.stats();
    assert_eq!(stats.frames_delivered, 2);
    assert_eq!(stats.frames_dropped, 0);
    assert_eq!(stream.frames_available(), 3);

    stream.close().unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    assert!(!device.is_claimed());
}

#[test]
fn bulk_stream_resynchronizes_after_stray_data() {
    let (_host, device, stream, delivered) = open(true);
    assert!(stream.is_bulk());
    stream.start().unwrap();
    let full = device.transfer_size();
    assert!(full > 0 && full % 512 == 0);

    // SOF, DATA, DATA, short EOF
    let mut sof = payload(false, false, &[]);
    sof.resize(full, 1);
    assert!(device.complete_bulk(&sof));
    assert!(device.complete_bulk(&vec![2; full]));
    assert!(device.complete_bulk(&vec![3; full]));
    assert!(device.complete_bulk(&[4; 10]));
    assert_eq!(delivered.lock().unwrap().len(), 1);
    assert_eq!(delivered.lock().unwrap()[0].len(), 3 * full - 2 + 10);

    // Stray data without a header is dropped and starts nothing
    assert!(device.complete_bulk(&[0; 10]));
    assert_eq!(delivered.lock().unwrap().len(), 1);

    assert!(device.complete_bulk(&payload(true, false, b"next")));
    assert_eq!(delivered.lock().unwrap().len(), 2);
    assert_eq!(delivered.lock().unwrap()[1], b"next");

    stream.stop().unwrap();
    assert_eq!(device.pending(), 0);
    stream.close().unwrap();
}

#[test]
fn calls_in_wrong_state_are_rejected() {
    let (_host, _device, stream, _) = open(false);
    assert!(matches!(stream.stop(), Err(Error::InvalidState(_))));

    stream.start().unwrap();
    assert!(matches!(stream.start(), Err(Error::InvalidState(_))));
    assert!(matches!(stream.close(), Err(Error::InvalidState(_))));
    assert!(matches!(
        stream.format_commit(&VideoFormat::new(1280, 720, 30.0, Encoding::Mjpeg)),
        Err(Error::InvalidState(_))
    ));
    stream.stop().unwrap();

    stream.close().unwrap();
    assert!(matches!(stream.start(), Err(Error::InvalidState(_))));
    assert!(matches!(stream.close(), Err(Error::InvalidState(_))));
}

#[test]
fn format_commit_switches_resolution() {
    let (_host, device, stream, _) = open(false);
    stream
        .format_commit(&VideoFormat::new(1280, 720, 30.0, Encoding::Mjpeg))
        .unwrap();
    assert_eq!(stream.format(), VideoFormat::new(1280, 720, 30.0, Encoding::Mjpeg));
    assert_eq!(stream.streaming_control().frame_index, 2);
    assert_eq!(device.commits().len(), 2);
    stream.close().unwrap();
}

#[test]
fn format_commit_rejects_unadvertised_rate() {
    let (_host, device, stream, _) = open(false);
    let before = stream.format();
    assert!(matches!(
        stream.format_commit(&VideoFormat::new(1280, 720, 15.0, Encoding::Mjpeg)),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        stream.format_commit(&VideoFormat::new(640, 480, 24.0, Encoding::Mjpeg)),
        Err(Error::NotFound(_))
    ));
    assert_eq!(stream.format(), before);
    assert_eq!(device.commits().len(), 1);
    stream.close().unwrap();
}

#[test]
fn format_commit_rejects_frames_bigger_than_buffers() {
    let (_host, device, stream, _) = open(false);
    device.set_max_frame_size(8192);
    assert!(matches!(
        stream.format_commit(&VideoFormat::new(1280, 720, 30.0, Encoding::Mjpeg)),
        Err(Error::InvalidSize {
            expected: 4096,
            actual: 8192
        })
    ));
    assert_eq!(stream.format().width, 640);
    stream.close().unwrap();
}

#[test]
fn format_commit_requires_returned_frames() {
    let host = UvcHost::new();
    let device = MockDevice::new(3, false);
    host.device_connected(device.clone());
    let kept = Arc::new(Mutex::new(Vec::new()));
    let keep = Arc::clone(&kept);
    let cb: FrameCallback = Box::new(move |frame| {
        keep.lock().unwrap().push(frame);
        None
    });
    let stream = host
        .open(StreamConfig::new(Settings::default(), cb), Duration::ZERO)
        .unwrap();

    stream.start().unwrap();
    assert!(device.complete_isoc(&[payload(false, true, b"held")]));
    stream.stop().unwrap();
    assert_eq!(kept.lock().unwrap().len(), 1);

    let wanted = VideoFormat::new(1280, 720, 30.0, Encoding::Mjpeg);
    assert!(matches!(stream.format_commit(&wanted), Err(Error::InvalidState(_))));

    let frame = kept.lock().unwrap().pop().unwrap();
    assert_eq!(frame.data(), b"held");
    stream.frame_return(frame).unwrap();
    stream.format_commit(&wanted).unwrap();
    stream.close().unwrap();
}

#[test]
fn probe_does_not_commit() {
    let (_host, device, stream, _) = open(false);
    let ctrl = stream
        .probe(&VideoFormat::new(640, 480, 15.0, Encoding::Mjpeg))
        .unwrap();
    assert_eq!(ctrl.frame_interval, 666_666);
    assert_eq!(ctrl.max_video_frame_size, 4096);
    assert_eq!(device.commits().len(), 1);
    assert_eq!(stream.format().fps, 30.0);
    stream.close().unwrap();
}

#[test]
fn transfer_errors_are_reported_and_streaming_continues() {
    let host = UvcHost::new();
    let device = MockDevice::new(3, false);
    host.device_connected(device.clone());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&errors);
    let (cb, _) = recording_callback();
    let config = StreamConfig::new(Settings::default(), cb).with_event_callback(move |event| {
        if let StreamEvent::TransferError(code) = event {
            seen.lock().unwrap().push(code);
        }
    });
    let stream = host.open(config, Duration::ZERO).unwrap();

    stream.start().unwrap();
    assert!(device.fail_next(TransferStatus::Stall));
    assert_eq!(*errors.lock().unwrap(), vec![2]);
    assert_eq!(stream.stats().transfer_errors, 1);
    assert_eq!(device.pending(), 3);
    assert_eq!(stream.state(), StreamState::Streaming);

    stream.stop().unwrap();
    stream.close().unwrap();
}

#[test]
fn start_failure_rolls_back() {
    let (_host, device, stream, _) = open(false);
    device.fail_submit(true);
    assert!(matches!(stream.start(), Err(Error::Transport(_))));
    assert_eq!(stream.state(), StreamState::Opened);
    assert_eq!(device.pending(), 0);

    device.fail_submit(false);
    stream.start().unwrap();
    assert_eq!(device.pending(), 3);
    stream.stop().unwrap();
    stream.close().unwrap();
}

#[test]
fn disconnect_forces_device_gone() {
    let host = UvcHost::new();
    let device = MockDevice::new(7, false);
    host.device_connected(device.clone());
    let gone = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&gone);
    let (cb, _) = recording_callback();
    let config = StreamConfig::new(Settings::default(), cb).with_event_callback(move |event| {
        if let StreamEvent::DeviceDisconnected(stream) = event {
            *seen.lock().unwrap() = Some(stream);
        }
    });
    let stream = host.open(config, Duration::ZERO).unwrap();
    stream.start().unwrap();

    device.unplug();
    host.device_gone(7);
    assert_eq!(stream.state(), StreamState::DeviceGone);
    assert!(host.devices().is_empty());

    let handle = gone.lock().unwrap().take().unwrap();
    assert_eq!(handle.device_address(), 7);
    assert!(matches!(stream.start(), Err(Error::InvalidState(_))));
    handle.close().unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    // Device side is gone, so the interface is never released
    assert!(device.is_claimed());
}

#[test]
fn open_times_out_without_device() {
    let host = UvcHost::new();
    let (cb, _) = recording_callback();
    let started = Instant::now();
    let err = host
        .open(StreamConfig::new(Settings::default(), cb), Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn open_waits_for_device_to_appear() {
    let host = UvcHost::new();
    let late = host.clone();
    let plug = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        late.device_connected(MockDevice::new(4, false));
    });
    let (cb, _) = recording_callback();
    let stream = host
        .open(StreamConfig::new(Settings::default(), cb), Duration::from_secs(5))
        .unwrap();
    plug.join().unwrap();
    assert_eq!(stream.device_address(), 4);
    assert_eq!(stream.interface(), STREAMING_INTERFACE);
    stream.close().unwrap();
}

#[test]
fn open_honors_selector_and_skips_busy_interfaces() {
    let host = UvcHost::new();
    host.device_connected(MockDevice::new(3, false));

    let mut settings = Settings::default();
    settings.device.vendor_id = Some(0x1234);
    let (cb, _) = recording_callback();
    assert!(matches!(
        host.open(StreamConfig::new(settings, cb), Duration::ZERO),
        Err(Error::NotFound(_))
    ));

    let (cb, _) = recording_callback();
    let first = host
        .open(StreamConfig::new(Settings::default(), cb), Duration::ZERO)
        .unwrap();
    let (cb, _) = recording_callback();
    assert!(matches!(
        host.open(StreamConfig::new(Settings::default(), cb), Duration::ZERO),
        Err(Error::NotFound(_))
    ));

    first.close().unwrap();
    let (cb, _) = recording_callback();
    let second = host
        .open(StreamConfig::new(Settings::default(), cb), Duration::ZERO)
        .unwrap();
    second.close().unwrap();
}

#[test]
fn open_rejects_bad_arguments() {
    let host = UvcHost::new();
    host.device_connected(MockDevice::new(3, false));

    let mut settings = Settings::default();
    settings.advanced.number_of_frame_buffers = 0;
    let (cb, _) = recording_callback();
    assert!(matches!(
        host.open(StreamConfig::new(settings, cb), Duration::ZERO),
        Err(Error::InvalidArg(_))
    ));

    let mut settings = Settings::default();
    settings.format = VideoFormat::new(320, 240, 30.0, Encoding::Mjpeg);
    let (cb, _) = recording_callback();
    assert!(matches!(
        host.open(StreamConfig::new(settings, cb), Duration::ZERO),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn wildcard_request_takes_first_advertised_format() {
    let host = UvcHost::new();
    host.device_connected(MockDevice::new(3, false));
    let mut settings = Settings::default();
    settings.format = VideoFormat::default();
    let (cb, _) = recording_callback();
    let stream = host
        .open(StreamConfig::new(settings, cb), Duration::ZERO)
        .unwrap();
    assert_eq!(stream.format(), VideoFormat::new(640, 480, 30.0, Encoding::Mjpeg));
    assert_eq!(stream.formats().len(), 3);
    stream.close().unwrap();
}

#[test]
fn oversized_frame_raises_overflow_and_stream_recovers() {
    let (cb, delivered) = recording_callback();
    let (_host, device, stream, events) = open_with_events(cb);
    stream.start().unwrap();

    // Two 3000-byte payloads do not fit a 4096-byte frame buffer
    let big = vec![9u8; 3000];
    assert!(device.complete_isoc(&[payload(false, false, &big), payload(false, true, &big)]));
    assert!(device.complete_isoc(&[payload(true, true, b"ok")]));

    assert_eq!(*events.lock().unwrap(), vec!["overflow"]);
    assert_eq!(*delivered.lock().unwrap(), vec![b"ok".to_vec()]);
    let stats = stream.stats();
    assert_eq!(stats.overflows, 1);
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.frames_delivered, 1);

    stream.stop().unwrap();
    assert_eq!(stream.frames_available(), 3);
    stream.close().unwrap();
}

#[test]
fn exhausted_pool_raises_underflow_until_a_frame_comes_back() {
    let kept = Arc::new(Mutex::new(Vec::new()));
    let keep = Arc::clone(&kept);
    let cb: FrameCallback = Box::new(move |frame| {
        keep.lock().unwrap().push(frame);
        None
    });
    let (_host, device, stream, events) = open_with_events(cb);
    stream.start().unwrap();

    assert!(device.complete_isoc(&[payload(false, true, b"a")]));
    assert!(device.complete_isoc(&[payload(true, true, b"b")]));
    assert!(device.complete_isoc(&[payload(false, true, b"c")]));
    assert_eq!(stream.frames_available(), 0);

    assert!(device.complete_isoc(&[payload(true, true, b"d")]));
    assert_eq!(*events.lock().unwrap(), vec!["underflow"]);
    assert_eq!(stream.stats().underflows, 1);
    assert_eq!(kept.lock().unwrap().len(), 3);

    let frame = kept.lock().unwrap().remove(0);
    stream.frame_return(frame).unwrap();
    assert!(device.complete_isoc(&[payload(false, true, b"e")]));

    let data: Vec<Vec<u8>> = kept.lock().unwrap().iter().map(|f| f.data().to_vec()).collect();
    assert_eq!(data, vec![b"b".to_vec(), b"c".to_vec(), b"e".to_vec()]);
    assert_eq!(*events.lock().unwrap(), vec!["underflow"]);

    stream.stop().unwrap();
    for frame in kept.lock().unwrap().drain(..) {
        stream.frame_return(frame).unwrap();
    }
    stream.close().unwrap();
}

#[test]
fn bad_isochronous_packet_drops_its_frame() {
    let (cb, delivered) = recording_callback();
    let (_host, device, stream, events) = open_with_events(cb);
    stream.start().unwrap();

    assert!(device.complete_isoc_with(&[
        (payload(false, false, b"abc"), TransferStatus::Completed),
        (payload(false, false, b"def"), TransferStatus::Error(-71)),
        (payload(false, true, b"ghi"), TransferStatus::Completed),
    ]));
    assert!(device.complete_isoc(&[payload(true, true, b"jkl")]));

    assert_eq!(*delivered.lock().unwrap(), vec![b"jkl".to_vec()]);
    let stats = stream.stats();
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.frames_delivered, 1);
    // A bad packet is not a failed transfer
    assert_eq!(stats.transfer_errors, 0);
    assert!(events.lock().unwrap().is_empty());

    stream.stop().unwrap();
    stream.close().unwrap();
}

#[test]
fn disconnect_while_starting_wins_over_start() {
    let (host, device, stream, _) = open(false);
    let unplugged = Arc::clone(&device);
    let racing = host.clone();
    device.on_set_interface(move || {
        unplugged.unplug();
        racing.device_gone(3);
    });

    assert!(matches!(stream.start(), Err(Error::InvalidState(_))));
    assert_eq!(stream.state(), StreamState::DeviceGone);
    assert_eq!(device.pending(), 0);
    assert!(matches!(stream.stop(), Err(Error::InvalidState(_))));

    stream.close().unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    assert!(device.is_claimed());
}

#[test]
fn concurrent_open_cannot_take_a_reserved_interface() {
    let host = UvcHost::new();
    let device = MockDevice::new(3, false);
    host.device_connected(device.clone());

    // A second open runs while the first one is claiming the interface
    let nested = Arc::new(Mutex::new(None));
    let result = Arc::clone(&nested);
    let racing = host.clone();
    device.on_claim(move || {
        let (cb, _) = recording_callback();
        let second = racing.open(StreamConfig::new(Settings::default(), cb), Duration::ZERO);
        *result.lock().unwrap() = Some(second.map(|s| s.device_address()));
    });

    let (cb, _) = recording_callback();
    let first = host
        .open(StreamConfig::new(Settings::default(), cb), Duration::ZERO)
        .unwrap();
    assert!(matches!(
        nested.lock().unwrap().take(),
        Some(Err(Error::NotFound(_)))
    ));
    assert!(device.is_claimed());
    first.close().unwrap();

    // The reservation is gone once the first open finished
    let (cb, _) = recording_callback();
    let again = host
        .open(StreamConfig::new(Settings::default(), cb), Duration::ZERO)
        .unwrap();
    again.close().unwrap();
}

#[test]
fn open_skips_isochronous_endpoints_without_bandwidth() {
    let mut descriptor = camera_descriptor(false);
    let len = descriptor.len();
    // wMaxPacketSize of both alternate settings' endpoints
    for i in [len - 19, len - 18, len - 3, len - 2] {
        descriptor[i] = 0;
    }
    let host = UvcHost::new();
    let device = MockDevice::with_descriptor(3, descriptor);
    host.device_connected(device.clone());

    let (cb, _) = recording_callback();
    assert!(matches!(
        host.open(StreamConfig::new(Settings::default(), cb), Duration::ZERO),
        Err(Error::NotFound(_))
    ));
    assert!(!device.is_claimed());
}
