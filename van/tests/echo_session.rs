//! End-to-end echo sessions over shared memory.
//!
//! A client session runs the echo loop on the test thread while a host
//! (either the generator thread or a hand-driven [`Host`]) feeds the device.
//!
//! ```bash
//! RUST_LOG=van=trace cargo test --test echo_session -- --nocapture
//! ```

use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serial_test::serial;
use van::{
    EchoError, EchoLoop, Generator, GeneratorConfig, Host, OpenFlags, ReadMode, Session,
    SessionState, Timeout, VanConfig, VanError,
};

static INIT_TRACING: Once = Once::new();
static NEXT_NAMESPACE: AtomicUsize = AtomicUsize::new(0);

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        van::init_tracing();
    });
}

/// A namespace no other test (or test process) uses.
fn config() -> VanConfig {
    init_test_tracing();
    VanConfig {
        namespace: format!(
            "it{}x{}",
            std::process::id(),
            NEXT_NAMESPACE.fetch_add(1, Ordering::Relaxed)
        ),
        ..VanConfig::default()
    }
}

fn attach(session: &Session, device: &str) -> Host {
    Host::attach(session.config(), device, Duration::from_secs(2)).expect("host attach")
}

fn echo_against_generator(mode: ReadMode, sync: bool) {
    let config = config();
    let generator = Generator::spawn(
        config.clone(),
        GeneratorConfig {
            cycles: 500,
            sync,
            ..GeneratorConfig::default()
        },
    )
    .expect("spawn generator");

    let session = Session::new(config);
    session.init().expect("init");
    session.set_trace(2);
    let id = session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");

    let report = EchoLoop::new(session.transport(), id)
        .with_mode(mode)
        .run()
        .expect("echo run");
    let generated = generator.join().expect("generator run");

    assert_eq!(report.echoed, 500);
    assert_eq!(generated.sent, 501);
    assert_eq!(generated.echoed, 500);

    session.registry().close(id).expect("close");
    session.exit();
}

#[test]
fn queued_echo_session() {
    echo_against_generator(ReadMode::Queued, false);
}

#[test]
fn single_shot_echo_session() {
    echo_against_generator(ReadMode::SingleShot, true);
}

#[test]
fn drain_session_without_echo() {
    let config = config();
    let generator = Generator::spawn(
        config.clone(),
        GeneratorConfig {
            cycles: 100,
            sync: true,
            verify_echo: false,
            ..GeneratorConfig::default()
        },
    )
    .expect("spawn generator");

    let session = Session::new(config);
    session.init().expect("init");
    let id = session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");

    let report = EchoLoop::new(session.transport(), id)
        .with_mode(ReadMode::SingleShot)
        .with_echo(false)
        .run()
        .expect("drain run");
    let generated = generator.join().expect("generator run");

    assert_eq!(report.echoed, 100);
    assert_eq!(generated.echoed, 0);
}

#[test]
fn gap_in_sequence_aborts_before_echo() {
    let session = Session::new(config());
    session.init().expect("init");
    let id = session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");
    let mut host = attach(&session, "/python");

    for msg in ["0", "2", "That's it."] {
        host.send(msg.as_bytes()).expect("send");
    }

    let err = EchoLoop::new(session.transport(), id).run().unwrap_err();
    match err {
        EchoError::ProtocolViolation { expected, received } => {
            assert_eq!(expected, 1);
            assert_eq!(received, "2");
        }
        other => panic!("expected protocol violation, got {other}"),
    }

    let mut buf = [0u8; 16];
    let n = host
        .recv_blocking(&mut buf, Timeout::Duration(Duration::from_secs(1)))
        .expect("echo of 0");
    assert_eq!(&buf[..n], b"0");
    assert_eq!(host.recv(&mut buf), None, "2 must never be echoed");
}

#[test]
fn write_abc_reaches_host() {
    let session = Session::new(config());
    session.init().expect("init");
    let id = session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");
    let mut host = attach(&session, "/python");

    session.transport().write(id, b"abc").expect("write");

    let mut buf = [0u8; 512];
    let n = host
        .recv_blocking(&mut buf, Timeout::Infinite)
        .expect("recv");
    assert_eq!(n, 3);
    assert_eq!(&buf[..3], b"abc");
}

#[test]
fn written_bytes_round_trip_unchanged() {
    let session = Session::new(config());
    session.init().expect("init");
    let id = session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");
    let mut host = attach(&session, "/python");
    let transport = session.transport();

    let messages: Vec<Vec<u8>> = (0..20u8)
        .map(|i| (0..=i).map(|b| b.wrapping_mul(37)).collect())
        .collect();
    for msg in &messages {
        transport.write(id, msg).expect("write");
    }

    let mut buf = [0u8; van::MAX_MESSAGE_SIZE];
    for msg in &messages {
        let n = host.recv(&mut buf).expect("queued message");
        assert_eq!(&buf[..n], &msg[..]);
    }
}

#[test]
fn short_buffer_read_stops_at_capacity() {
    let session = Session::new(config());
    session.init().expect("init");
    let id = session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");
    let mut host = attach(&session, "/python");
    host.send(b"0123456789").expect("send");

    let mut buf = [0xEEu8; 10];
    let n = session.transport().read(id, &mut buf[..4]).expect("read");
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], b"0123");
    assert!(buf[4..].iter().all(|&b| b == 0xEE));
}

#[test]
fn transport_requires_initialized_session() {
    let session = Session::new(config());
    let transport = session.transport();
    let mut buf = [0u8; 8];

    let err = transport.read(van::DeviceId::new(1), &mut buf).unwrap_err();
    assert!(matches!(
        err,
        VanError::NotReady {
            state: SessionState::Uninitialized
        }
    ));

    session.init().expect("init");
    let id = session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");
    session.exit();

    for result in [
        transport.read(id, &mut buf).map(drop),
        transport.sync_read(id, &mut buf).map(drop),
        transport.write(id, b"x"),
        session.registry().close(id),
    ] {
        assert!(matches!(
            result,
            Err(VanError::NotReady {
                state: SessionState::ShutDown
            })
        ));
    }
}

#[test]
fn closed_and_unknown_ids_are_invalid() {
    let session = Session::new(config());
    session.init().expect("init");
    let registry = session.registry();
    let transport = session.transport();
    let id = registry.open("/python", OpenFlags::NONE).expect("open");
    registry.close(id).expect("close");

    let mut buf = [0u8; 8];
    assert!(matches!(transport.read(id, &mut buf), Err(VanError::InvalidHandle(_))));
    assert!(matches!(transport.sync_read(id, &mut buf), Err(VanError::InvalidHandle(_))));
    assert!(matches!(
        transport.read(van::DeviceId::new(77), &mut buf),
        Err(VanError::InvalidHandle(_))
    ));
}

#[test]
fn exit_releases_devices_for_hosts() {
    let session = Session::new(config());
    session.init().expect("init");
    session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");
    let host = attach(&session, "/python");
    assert!(host.is_client_open());

    session.exit();
    assert!(!host.is_client_open());
    assert!(matches!(
        Host::attach(session.config(), "/python", Duration::from_millis(10)),
        Err(VanError::NotReady { .. })
    ));
}

#[test]
fn wait_for_host_flag_returns_once_attached() {
    let config = VanConfig {
        attach_timeout: Duration::from_secs(2),
        ..config()
    };
    let session = Session::new(config.clone());
    session.init().expect("init");

    let host = std::thread::spawn(move || {
        van::host::attach_when_ready(&config, "/python", Duration::from_secs(2))
    });

    let id = session
        .registry()
        .open("/python", OpenFlags::WAIT_FOR_HOST)
        .expect("open with host");
    assert!(session.registry().is_open(id));
    let host = host.join().unwrap().expect("host attach");
    assert!(host.is_client_open());
}

/// Uses the default `van` namespace, like the stock binaries.
#[test]
#[serial]
fn default_namespace_session() {
    init_test_tracing();
    let session = Session::new(VanConfig::default());
    session.init().expect("init");
    assert_eq!(session.config().namespace, "van");

    let id = session
        .registry()
        .open("/python", OpenFlags::NONE)
        .expect("open");
    let mut host = attach(&session, "/python");
    host.send(b"That's it.").expect("send");

    let report = EchoLoop::new(session.transport(), id).run().expect("run");
    assert_eq!(report.echoed, 0);
    session.exit();
}
