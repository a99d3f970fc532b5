use std::io::{Read, Write};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cmux_frame::{Frame, FrameKind, FrameReader, FrameWriter, Role, WriteProgress};
use cmux_mux::{Mux, MuxChannel, MuxConfig, MuxError, MuxEvents, NoEvents};
use cmux_transport::SerialStream;

const DEADLINE: Duration = Duration::from_secs(5);

fn fast_config() -> MuxConfig {
    MuxConfig {
        t1: Duration::from_millis(40),
        ..MuxConfig::default()
    }
}

/// A hand-driven far end speaking raw frames.
struct RawPeer {
    stream: SerialStream,
    reader: FrameReader,
    writer: FrameWriter,
}

impl RawPeer {
    fn new(stream: SerialStream) -> Self {
        Self {
            stream,
            reader: FrameReader::new(),
            writer: FrameWriter::new(),
        }
    }

    fn expect_frame(&mut self) -> Frame {
        let deadline = Instant::now() + DEADLINE;
        loop {
            if let Some(frame) = self
                .reader
                .read_frame(&mut self.stream)
                .expect("raw peer read should succeed")
            {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame within deadline");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn answer(&mut self, dlci: u8, kind: FrameKind) {
        self.writer
            .load_response(dlci, kind, Role::Responder)
            .expect("answer should encode");
        let progress = self
            .writer
            .flush(&mut self.stream)
            .expect("answer should be written");
        assert_eq!(progress, WriteProgress::Complete);
    }

    fn request(&mut self, dlci: u8) {
        self.writer
            .load_request(dlci, FrameKind::Sabm, Role::Responder)
            .expect("request should encode");
        let progress = self
            .writer
            .flush(&mut self.stream)
            .expect("request should be written");
        assert_eq!(progress, WriteProgress::Complete);
    }

    fn accept(&mut self, dlci: u8) {
        let frame = self.expect_frame();
        assert_eq!(frame.kind, FrameKind::Sabm);
        assert_eq!(frame.dlci(), dlci);
        self.answer(dlci, FrameKind::Ua);
    }
}

#[derive(Clone, Default)]
struct Recorder {
    control: Arc<Mutex<u32>>,
    channels: Arc<Mutex<Option<Sender<MuxChannel>>>>,
}

impl MuxEvents for Recorder {
    fn on_control_channel_open(&self) {
        if let Ok(mut count) = self.control.lock() {
            *count += 1;
        }
    }

    fn on_channel_open(&self, channel: MuxChannel, _dlci: u8) {
        if let Ok(guard) = self.channels.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(channel);
            }
        }
    }
}

#[test]
fn two_engines_open_channels_and_exchange_data() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let (opened_tx, opened_rx) = mpsc::channel();
    let recorder = Recorder {
        channels: Arc::new(Mutex::new(Some(opened_tx))),
        ..Recorder::default()
    };

    let initiator = Mux::start(left, fast_config(), NoEvents).expect("initiator should start");
    let responder =
        Mux::start(right, fast_config(), recorder.clone()).expect("responder should start");

    initiator
        .open_control_channel()
        .expect("control channel should open");
    assert_eq!(initiator.role().unwrap(), Some(Role::Initiator));

    let mut local = initiator.open_channel(1).expect("channel 1 should open");
    let mut remote = opened_rx
        .recv_timeout(DEADLINE)
        .expect("responder should report channel 1");
    assert_eq!(remote.dlci(), 1);
    assert_eq!(*recorder.control.lock().unwrap(), 1);
    assert_eq!(responder.role().unwrap(), Some(Role::Responder));
    assert_eq!(responder.channels().unwrap(), vec![1]);

    local.write_all(b"AT+CGMI\r").expect("write should succeed");
    let mut buf = [0u8; 8];
    remote.read_exact(&mut buf).expect("read should succeed");
    assert_eq!(&buf, b"AT+CGMI\r");

    remote.write_all(b"OK\r\n").expect("reply should succeed");
    let mut reply = [0u8; 4];
    local.read_exact(&mut reply).expect("reply read should succeed");
    assert_eq!(&reply, b"OK\r\n");

    // Large writes are split into maximum-size frames.
    let payload = vec![0x5A; 1000];
    let writer = thread::spawn(move || {
        local.write_all(&payload).expect("bulk write should succeed");
    });
    let mut received = vec![0u8; 1000];
    remote
        .read_exact(&mut received)
        .expect("bulk read should succeed");
    assert!(received.iter().all(|&b| b == 0x5A));
    writer.join().expect("writer thread should finish");

    initiator.shutdown().expect("shutdown should succeed");
    responder.shutdown().expect("shutdown should succeed");
}

#[test]
fn control_channel_answer_needs_no_retransmission() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let mux = Mux::start(left, fast_config(), NoEvents).expect("mux should start");
    let mut peer = RawPeer::new(right);

    let opener = thread::spawn(move || {
        let result = mux.open_control_channel();
        (mux, result)
    });

    let sabm = peer.expect_frame();
    assert_eq!(sabm.kind, FrameKind::Sabm);
    assert_eq!(sabm.address.octet(), 0x03);
    assert!(sabm.poll_final);
    peer.answer(0, FrameKind::Ua);

    let (mux, result) = opener.join().expect("opener should finish");
    result.expect("control channel should open");
    assert!(mux.is_control_open().unwrap());

    thread::sleep(fast_config().t1 * 3);
    let mut buf = [0u8; 16];
    assert!(
        peer.stream.read(&mut buf).is_err(),
        "no further frames expected"
    );
}

#[test]
fn silent_peer_gets_budget_plus_one_sabms_then_timeout() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let mux = Mux::start(left, fast_config(), NoEvents).expect("mux should start");
    let mut peer = RawPeer::new(right);

    let started = Instant::now();
    let err = mux
        .open_control_channel()
        .expect_err("silent peer should time out");
    assert!(matches!(
        err,
        MuxError::Timeout {
            dlci: 0,
            attempts: 4
        }
    ));
    assert!(started.elapsed() >= fast_config().t1 * 4);

    for _ in 0..4 {
        let frame = peer.expect_frame();
        assert_eq!(frame.kind, FrameKind::Sabm);
        assert_eq!(frame.dlci(), 0);
    }
    assert!(peer.reader.read_frame(&mut peer.stream).unwrap().is_none());

    // The engine is reusable after a timeout.
    let opener = thread::spawn(move || {
        let result = mux.open_control_channel();
        (mux, result)
    });
    peer.accept(0);
    let (_mux, result) = opener.join().expect("opener should finish");
    result.expect("second attempt should succeed");
}

#[test]
fn rejected_and_exhausted_channels() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let mux = Arc::new(Mux::start(left, fast_config(), NoEvents).expect("mux should start"));
    let mut peer = RawPeer::new(right);

    let opener = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || mux.open_control_channel())
    };
    peer.accept(0);
    opener.join().unwrap().expect("control channel should open");

    let opener = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || mux.open_channel(9).map(|_| ()))
    };
    let frame = peer.expect_frame();
    assert_eq!(frame.dlci(), 9);
    peer.answer(9, FrameKind::Dm);
    assert!(matches!(
        opener.join().unwrap(),
        Err(MuxError::Rejected(9))
    ));

    for dlci in 1..=4 {
        let opener = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.open_channel(dlci).map(|_| ()))
        };
        peer.accept(dlci);
        opener.join().unwrap().expect("channel should open");
    }

    assert!(matches!(
        mux.open_channel(5),
        Err(MuxError::ResourceExhausted)
    ));
    assert_eq!(mux.channels().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn blocked_writer_is_notified_after_establishment() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let mux = Arc::new(Mux::start(left, fast_config(), NoEvents).expect("mux should start"));
    let mut peer = RawPeer::new(right);

    let opener = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || {
            mux.open_control_channel()?;
            mux.open_channel(1).map(|_| ())
        })
    };
    peer.accept(0);
    peer.accept(1);
    opener.join().unwrap().expect("channel 1 should open");

    let channel = mux.channel(1).expect("channel 1 should have a handle");
    let (notified_tx, notified_rx) = mpsc::channel();
    channel
        .register_notification(move || {
            let _ = notified_tx.send(());
        })
        .expect("registration should succeed");

    let opener = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || mux.open_channel(2).map(|_| ()))
    };
    let frame = peer.expect_frame();
    assert_eq!(frame.dlci(), 2);

    // The SABM for DLCI 2 is outstanding: writes must wait their turn.
    assert!(matches!(channel.write(b"x"), Err(MuxError::WouldBlock)));
    assert!(!channel.poll().unwrap().writable);

    peer.answer(2, FrameKind::Ua);
    opener.join().unwrap().expect("channel 2 should open");
    notified_rx
        .recv_timeout(DEADLINE)
        .expect("channel 1 should be notified");

    assert_eq!(channel.write(b"x").unwrap(), 1);
    let frame = peer.expect_frame();
    assert_eq!(frame.kind, FrameKind::Uih);
    assert_eq!(frame.payload.as_ref(), b"x");
}

#[test]
fn open_errors_do_not_block() {
    let (left, _right) = SerialStream::pair().expect("pair should open");
    let mux = Mux::start(left, fast_config(), NoEvents).expect("mux should start");

    assert!(matches!(mux.open_channel(1), Err(MuxError::NotOpen)));
    assert!(matches!(mux.open_channel(0), Err(MuxError::InvalidChannel(0))));
    assert!(matches!(
        mux.channel(1),
        Err(MuxError::ChannelNotOpen(1))
    ));
}

#[test]
fn shutdown_releases_blocked_opener() {
    let (left, _right) = SerialStream::pair().expect("pair should open");
    let config = MuxConfig {
        t1: Duration::from_secs(30),
        ..MuxConfig::default()
    };
    let mux = Arc::new(Mux::start(left, config, NoEvents).expect("mux should start"));

    let opener = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || mux.open_control_channel())
    };
    thread::sleep(Duration::from_millis(50));
    mux.shutdown().expect("shutdown should succeed");

    assert!(matches!(
        opener.join().unwrap(),
        Err(MuxError::Terminated(_))
    ));
    assert!(mux.terminated().unwrap().is_some());
    assert!(matches!(
        mux.open_control_channel(),
        Err(MuxError::Terminated(_))
    ));
}

#[test]
fn peer_hangup_terminates_session() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let mux = Mux::start(left, fast_config(), NoEvents).expect("mux should start");
    let mut peer = RawPeer::new(right);

    let opener = thread::spawn(move || {
        let result = mux.open_control_channel();
        (mux, result)
    });
    peer.accept(0);
    let (mux, result) = opener.join().unwrap();
    result.expect("control channel should open");

    drop(peer);
    let deadline = Instant::now() + DEADLINE;
    while mux.terminated().unwrap().is_none() {
        assert!(Instant::now() < deadline, "hangup not detected");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(
        mux.open_channel(1),
        Err(MuxError::Terminated(_))
    ));
}

#[test]
fn simultaneous_open_of_same_channel_settles_without_timeout() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let left = Arc::new(Mux::start(left, fast_config(), NoEvents).expect("left should start"));
    let right = Arc::new(Mux::start(right, fast_config(), NoEvents).expect("right should start"));
    left
        .open_control_channel()
        .expect("control channel should open");

    let barrier = Arc::new(Barrier::new(2));
    let openers = [&left, &right].map(|mux| {
        let mux = Arc::clone(mux);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            mux.open_channel(1).map(|_| ())
        })
    });

    for opener in openers {
        match opener.join().expect("opener should finish") {
            Ok(()) | Err(MuxError::AlreadySatisfied(1)) | Err(MuxError::ChannelInUse(1)) => {}
            Err(err) => panic!("unexpected outcome: {err}"),
        }
    }

    let deadline = Instant::now() + DEADLINE;
    while left.channels().unwrap() != vec![1] || right.channels().unwrap() != vec![1] {
        assert!(Instant::now() < deadline, "channel 1 not open on both ends");
        thread::sleep(Duration::from_millis(5));
    }
    let mut local = left.channel(1).expect("left end should have a handle");
    let mut remote = right.channel(1).expect("right end should have a handle");
    local.write_all(b"ping").expect("write should succeed");
    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).expect("data should cross");
    assert_eq!(&buf, b"ping");
}

#[test]
fn notification_callback_can_write() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let mux = Arc::new(Mux::start(left, fast_config(), NoEvents).expect("mux should start"));
    let mut peer = RawPeer::new(right);

    let opener = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || {
            mux.open_control_channel()?;
            mux.open_channel(1).map(|_| ())
        })
    };
    peer.accept(0);
    peer.accept(1);
    opener.join().unwrap().expect("channel 1 should open");

    let channel = mux.channel(1).expect("channel 1 should have a handle");
    let (written_tx, written_rx) = mpsc::channel();
    let inner = channel.clone();
    channel
        .register_notification(move || {
            let _ = written_tx.send(inner.write(b"N").map_err(|err| err.to_string()));
        })
        .expect("registration should succeed");

    let opener = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || mux.open_channel(2).map(|_| ()))
    };
    assert_eq!(peer.expect_frame().dlci(), 2);
    assert!(matches!(channel.write(b"x"), Err(MuxError::WouldBlock)));

    peer.answer(2, FrameKind::Ua);
    opener.join().unwrap().expect("channel 2 should open");

    let written = written_rx
        .recv_timeout(DEADLINE)
        .expect("channel 1 should be notified");
    assert_eq!(written, Ok(1));
    let frame = peer.expect_frame();
    assert_eq!(frame.kind, FrameKind::Uih);
    assert_eq!(frame.dlci(), 1);
    assert_eq!(frame.payload.as_ref(), b"N");
}

struct PanicOnChannel;

impl MuxEvents for PanicOnChannel {
    fn on_channel_open(&self, _channel: MuxChannel, dlci: u8) {
        panic!("callback rejected channel {dlci}");
    }
}

#[test]
fn panicking_callback_ends_session_and_releases_readers() {
    let (left, right) = SerialStream::pair().expect("pair should open");
    let mux = Arc::new(Mux::start(left, fast_config(), PanicOnChannel).expect("mux should start"));
    let mut peer = RawPeer::new(right);

    let opener = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || {
            mux.open_control_channel()?;
            mux.open_channel(1).map(|_| ())
        })
    };
    peer.accept(0);
    peer.accept(1);
    opener.join().unwrap().expect("channel 1 should open");

    let channel = mux.channel(1).expect("channel 1 should have a handle");
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 8];
        let _ = done_tx.send(channel.read_timeout(&mut buf, None));
    });
    thread::sleep(Duration::from_millis(20));

    // A peer-initiated open runs the panicking callback.
    peer.request(2);
    let result = done_rx
        .recv_timeout(DEADLINE)
        .expect("blocked reader should be released");
    assert!(matches!(result, Err(MuxError::Terminated(_))));
    assert!(mux.terminated().unwrap().is_some());
    assert!(matches!(mux.open_channel(3), Err(MuxError::Terminated(_))));
}
