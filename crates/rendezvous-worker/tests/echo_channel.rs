//! End-to-end: launch the echo worker, clone into it, tear it down.
//!
//! Every read is guarded by a poll deadline so a broken worker fails the
//! test instead of hanging it.

use std::time::Duration;

use rendezvous::protocol::HandshakeField;
use rendezvous::{
    Channel, ChannelError, ChannelKind, HandshakeError, LaunchConfig, Rendezvous, SpawnError,
    StderrMode, Token, TransferError, clone_channel, launch,
};

const ECHO_WORKER: &str = env!("CARGO_BIN_EXE_rendezvous-echo");
const DEADLINE: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(100);

fn launch_echo() -> Channel {
    launch(LaunchConfig::new(ECHO_WORKER)).expect("echo worker should launch")
}

fn expect_echo(channel: &mut Channel, payload: &[u8]) {
    channel.write_full(payload).unwrap();
    assert!(
        channel.poll_readable(DEADLINE).unwrap(),
        "no echo for {payload:?} within {DEADLINE:?}"
    );
    let mut buf = vec![0u8; payload.len()];
    channel.read_full(&mut buf).unwrap();
    assert_eq!(buf, payload);
}

fn assert_quiet(channel: &Channel) {
    assert!(
        !channel.poll_readable(QUIET).unwrap(),
        "unexpected bytes pending on {channel:?}"
    );
}

#[test]
fn hi_ee_then_clone_by() {
    let mut channel = launch_echo();
    assert_eq!(channel.kind(), ChannelKind::TopLevel);
    assert!(channel.worker_pid().is_some());

    expect_echo(&mut channel, b"hi");
    expect_echo(&mut channel, b"ee");

    let mut cloned = channel.clone_channel().unwrap();
    assert_eq!(cloned.kind(), ChannelKind::Cloned);
    assert_eq!(cloned.rendezvous(), channel.rendezvous());
    expect_echo(&mut cloned, b"by");

    assert_quiet(&channel);
    expect_echo(&mut channel, b"ok");

    cloned.close().unwrap();
    channel.close().unwrap();
}

#[test]
fn round_trip_sizes() {
    let mut channel = launch_echo();
    let mut cloned = channel.clone_channel().unwrap();

    for size in [1usize, 2, 8] {
        let payload: Vec<u8> = (0..size as u8).map(|b| b.wrapping_mul(37)).collect();
        expect_echo(&mut channel, &payload);
        expect_echo(&mut cloned, &payload);
    }
}

#[test]
fn clones_are_independent() {
    let mut channel = launch_echo();
    let mut clones: Vec<Channel> = (0..4).map(|_| channel.clone_channel().unwrap()).collect();

    // Write everything first so traffic is in flight on all contexts at once.
    for (i, clone) in clones.iter_mut().enumerate() {
        clone.write_full(format!("ctx{i}").as_bytes()).unwrap();
    }
    for (i, clone) in clones.iter_mut().enumerate() {
        assert!(clone.poll_readable(DEADLINE).unwrap());
        let mut buf = [0u8; 4];
        clone.read_full(&mut buf).unwrap();
        assert_eq!(buf, *format!("ctx{i}").as_bytes());
    }

    assert_quiet(&channel);
    for clone in &clones {
        assert_quiet(clone);
    }
}

#[test]
fn closing_a_clone_leaves_the_rest_running() {
    let mut channel = launch_echo();
    let mut first = channel.clone_channel().unwrap();
    let mut second = channel.clone_channel().unwrap();
    expect_echo(&mut first, b"1");

    first.close().unwrap();
    assert!(!first.is_open());

    expect_echo(&mut second, b"22");
    expect_echo(&mut channel, b"top");

    let mut third = channel.clone_channel().unwrap();
    expect_echo(&mut third, b"333");
}

#[test]
fn closing_top_level_ends_every_clone() {
    let mut channel = launch_echo();
    let mut cloned = channel.clone_channel().unwrap();
    expect_echo(&mut cloned, b"up");
    let address = channel.address().path().to_path_buf();
    assert!(address.exists());

    channel.close().unwrap();
    assert!(channel.worker_pid().is_none());

    assert!(cloned.poll_readable(DEADLINE).unwrap());
    let mut buf = [0u8; 1];
    match cloned.read_full(&mut buf) {
        Err(ChannelError::Io(_)) => {}
        other => panic!("expected clone to be dead, got {other:?}"),
    }

    assert!(!address.exists(), "worker left its socket behind");
    assert!(matches!(
        channel.clone_channel(),
        Err(ChannelError::Clone { .. })
    ));
}

#[test]
fn close_is_idempotent() {
    let mut channel = launch_echo();
    let mut cloned = channel.clone_channel().unwrap();

    cloned.close().unwrap();
    cloned.close().unwrap();
    channel.close().unwrap();
    channel.close().unwrap();

    assert!(channel.read_side().is_none());
    assert!(cloned.write_side().is_none());
    assert!(matches!(cloned.write_full(b"x"), Err(ChannelError::Closed)));
}

#[test]
fn closed_channel_can_still_be_cloned_from() {
    let mut channel = launch_echo();
    let mut first = channel.clone_channel().unwrap();
    first.close().unwrap();

    let mut second = first.clone_channel().unwrap();
    expect_echo(&mut second, b"again");
    expect_echo(&mut channel, b"still");
}

#[test]
fn wrong_token_is_turned_away() {
    let mut channel = launch_echo();
    let forged = Rendezvous::new(*channel.address(), Token::from_bytes([b'0'; 32]));

    // Connecting succeeds; the worker hangs up once it sees the token.
    let mut intruder = clone_channel(&forged).unwrap();
    assert!(intruder.poll_readable(DEADLINE).unwrap());
    let mut buf = [0u8; 1];
    assert!(matches!(
        intruder.read_full(&mut buf),
        Err(ChannelError::Io(_))
    ));

    let mut legit = channel.clone_channel().unwrap();
    expect_echo(&mut legit, b"fine");
}

#[test]
fn socket_dir_comes_from_environment() {
    let channel = launch(LaunchConfig::new(ECHO_WORKER).with_env("RENDEZVOUS_SOCKET_DIR", "/tmp"))
        .unwrap();
    let path = channel.address().to_string();
    assert!(path.starts_with("/tmp/rv-"), "{path}");
}

#[test]
fn oversized_socket_dir_fails_handshake() {
    let config = LaunchConfig::new(ECHO_WORKER)
        .with_args(["--socket-dir", "/tmp/a/directory/name/that/is/far/too/long"])
        .with_stderr(StderrMode::Null);
    match launch(config) {
        Err(ChannelError::Handshake(HandshakeError::Transfer {
            field: HandshakeField::Header,
            source: TransferError::EndOfStream { transferred: 0, .. },
        })) => {}
        other => panic!("expected handshake failure, got {other:?}"),
    }
}

#[test]
fn truncated_header_fails_handshake() {
    let config = LaunchConfig::new("/bin/sh").with_args(["-c", "printf 58000000"]);
    match launch(config) {
        Err(ChannelError::Handshake(HandshakeError::Transfer {
            field: HandshakeField::Header,
            source: TransferError::EndOfStream { transferred: 8, .. },
        })) => {}
        other => panic!("expected truncated header, got {other:?}"),
    }
}

#[test]
fn foreign_header_fails_handshake() {
    let config = LaunchConfig::new("/bin/sh").with_args(["-c", "head -c 96 /dev/zero"]);
    match launch(config) {
        Err(ChannelError::Handshake(HandshakeError::HeaderMismatch { .. })) => {}
        other => panic!("expected header mismatch, got {other:?}"),
    }
}

#[test]
fn missing_executable_fails_launch() {
    match launch(LaunchConfig::new("/nonexistent/echo-worker")) {
        Err(ChannelError::Launch(SpawnError::Spawn(_))) => {}
        other => panic!("expected launch failure, got {other:?}"),
    }
}
