//! Integration Tests for the Router
//!
//! Two routers on localhost exercising:
//! - forwarding over UDP and TCP by requested channel capabilities
//! - self-loop detection
//! - HELLO/ACK bootstrap, name propagation, PING and BYE

use network::transports::udp::frame_packet;
use network::{encode_envelope, Delivery, Router, TransportError};
use runtime_config::RuntimeConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use types::{ChannelCaps, Command, Control, Envelope, Payload, ProcessId, Term};

const WAIT: Duration = Duration::from_secs(3);

fn config() -> RuntimeConfig {
    RuntimeConfig {
        hostname: "127.0.0.1".into(),
        tcp_retry_wait_ms: 10,
        tcp_connect_timeout_ms: 2_000,
        ..RuntimeConfig::default()
    }
}

fn started(name: &str) -> Arc<Router> {
    let router = Arc::new(Router::new(name, config()).unwrap());
    router.start().unwrap();
    router
}

fn message(body: impl Into<Term>) -> Payload {
    Command::Message {
        clock: None,
        body: body.into(),
    }
    .into()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn host_process(
    router: &Router,
    name: Option<&str>,
) -> (ProcessId, crossbeam_channel::Receiver<Delivery>) {
    let id = router.new_process_id("Test", name.map(str::to_string));
    let (tx, rx) = crossbeam_channel::unbounded();
    router.register_local_process(id.clone(), tx);
    (id, rx)
}

#[test_log::test]
fn test_self_loop_is_circular_routing() {
    let router = started("selfloop");
    let ghost = router.new_process_id("Ghost", None);

    let err = router
        .send(None, Some(&ghost), message(1), ChannelCaps::empty())
        .unwrap_err();
    assert!(matches!(err, TransportError::CircularRouting { .. }), "{err}");
    assert_eq!(router.transports().transports()[0].metrics().packets_sent, 0);
    router.stop();
}

#[test_log::test]
fn test_forward_over_udp_and_tcp() {
    let a = started("fwd-a");
    let b = started("fwd-b");
    let (sender, _sender_rx) = host_process(&a, None);
    let (receiver, rx) = host_process(&b, None);

    a.send(Some(&sender), Some(&receiver), message("udp"), ChannelCaps::empty())
        .unwrap();
    let delivery = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.src.as_ref(), Some(&sender));
    assert_eq!(
        delivery.command,
        Command::Message {
            clock: None,
            body: Term::from("udp")
        }
    );

    for i in 0..20 {
        a.send(Some(&sender), Some(&receiver), message(i), ChannelCaps::RELIABLE_FIFO)
            .unwrap();
    }
    for i in 0..20i64 {
        let delivery = rx.recv_timeout(WAIT).unwrap();
        match delivery.command {
            Command::Message { body, .. } => assert_eq!(body.as_int(), Some(i)),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(a.stats().forwarded, 21);
    assert!(b.stats().local_deliveries >= 21);

    a.stop();
    b.stop();
}

#[test]
fn test_missing_transport_address() {
    let a = started("notarget");
    let udp_only = ProcessId::new("Far", None, "127.0.0.1", vec![Some(9), None]);

    let err = a
        .send(None, Some(&udp_only), message(1), ChannelCaps::RELIABLE_FIFO)
        .unwrap_err();
    assert!(
        matches!(err, TransportError::NoTargetTransport { slot: 1, .. }),
        "{err}"
    );
    a.stop();
}

#[test_log::test]
fn test_bootstrap_and_membership() {
    let a = started("boot-a");
    let b = started("boot-b");
    let (pong, _pong_rx) = host_process(&b, Some("pong"));
    let b_udp = b.transports().addresses()[0].unwrap();

    let peer = a
        .bootstrap_node("127.0.0.1", b_udp, Duration::from_secs(2))
        .unwrap();
    assert_eq!(Some(peer.clone()), b.node_id());
    assert_eq!(a.peers(), vec![peer]);
    assert_eq!(a.resolve_name("pong"), Some(pong));
    assert!(wait_for(|| b.peers().len() == 1));

    let (late, _late_rx) = host_process(&b, Some("late"));
    assert_eq!(b.ping_peers(), 1);
    assert!(wait_for(|| a.resolve_name("late") == Some(late.clone())));

    b.stop();
    assert!(wait_for(|| a.peers().is_empty()));
    assert!(a.resolve_name("late").is_none());
    a.stop();
}

#[test_log::test]
fn test_bootstrap_without_peer_fails() {
    let a = started("boot-none");
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let err = a
        .bootstrap_node("127.0.0.1", closed_port, Duration::from_millis(200))
        .unwrap_err();
    assert!(matches!(err, TransportError::Bootstrap { .. }), "{err}");
    a.stop();
}

#[test_log::test]
fn test_bootstrap_ignores_ack_from_elsewhere() {
    let a = started("boot-stray-a");
    let other = started("boot-stray-c");
    let a_udp = a.transports().addresses()[0].unwrap();
    // takes HELLO and never answers
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let silent_port = silent.local_addr().unwrap().port();

    let node = other.node_id().unwrap();
    let ack = Envelope::new(
        Some(node.clone()),
        None,
        Control::Ack {
            node,
            known: vec![],
        }
        .into(),
    );
    let packet = frame_packet(&encode_envelope(&ack).unwrap(), None);
    let stray = std::thread::spawn(move || {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..20 {
            socket.send_to(&packet, ("127.0.0.1", a_udp)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
    });

    let err = a
        .bootstrap_node("127.0.0.1", silent_port, Duration::from_millis(300))
        .unwrap_err();
    stray.join().unwrap();
    assert!(matches!(err, TransportError::Bootstrap { .. }), "{err}");
    a.stop();
    other.stop();
}

#[test]
fn test_parked_messages_replayed_on_start() {
    let b = started("parked-b");
    let (dest, rx) = host_process(&b, None);

    let a = Arc::new(Router::new("parked-a", config()).unwrap());
    let src = a.new_process_id("Early", None);
    a.send(Some(&src), Some(&dest), message(5), ChannelCaps::empty())
        .unwrap();
    assert_eq!(a.stats().pending, 1);
    assert!(rx.try_recv().is_err());

    a.start().unwrap();
    let delivery = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.src, Some(src));
    a.stop();
    b.stop();
}
