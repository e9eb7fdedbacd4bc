//! Transport tests over real localhost sockets

use super::frame::frame_header;
use super::*;
use std::io::{Read, Write};
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream, UdpSocket as StdUdpSocket};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn options(key: Option<&[u8]>) -> TransportOptions {
    TransportOptions {
        hostname: "127.0.0.1".into(),
        authkey: key.map(<[u8]>::to_vec),
        tcp_connect_timeout: Duration::from_secs(2),
        tcp_retry_wait: Duration::from_millis(10),
        ..TransportOptions::default()
    }
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// A started transport with its own loop and inbound queue
struct Endpoint<T: Transport> {
    transport: T,
    mesgloop: MessageLoop,
    inbound: InboundReceiver,
}

impl<T: Transport + Default> Endpoint<T> {
    fn start(name: &str, key: Option<&[u8]>) -> Self {
        Self::start_with(name, &options(key))
    }

    fn start_with(name: &str, options: &TransportOptions) -> Self {
        let transport = T::default();
        transport.initialize(options).unwrap();
        let mesgloop = MessageLoop::new(name);
        mesgloop.start().unwrap();
        let (tx, inbound) = crossbeam_channel::unbounded();
        transport.start(tx, &mesgloop).unwrap();
        Self {
            transport,
            mesgloop,
            inbound,
        }
    }

    fn addr(&self) -> SocketAddr {
        localhost(self.transport.address().unwrap())
    }
}

impl<T: Transport> Drop for Endpoint<T> {
    fn drop(&mut self) {
        self.transport.close();
        self.mesgloop.stop();
    }
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

#[test_log::test]
fn test_udp_hello_delivered() {
    let receiver = Endpoint::<UdpTransport>::start("udp-recv", Some(b"K"));
    let sender = UdpTransport::new();
    sender.initialize(&options(Some(b"K"))).unwrap();

    sender
        .send(b"hello", receiver.addr(), &SendOptions::default())
        .unwrap();

    let packet = receiver.inbound.recv_timeout(WAIT).unwrap();
    assert_eq!(packet.kind, TransportKind::Udp);
    assert_eq!(&packet.payload[..], b"hello");
    assert!(receiver.inbound.try_recv().is_err());
    assert_eq!(sender.metrics().packets_sent, 1);
}

#[test_log::test]
fn test_udp_mismatched_key_dropped() {
    let receiver = Endpoint::<UdpTransport>::start("udp-auth", Some(b"K"));
    let sender = UdpTransport::new();
    sender.initialize(&options(Some(b"other"))).unwrap();

    sender
        .send(b"hello", receiver.addr(), &SendOptions::default())
        .unwrap();

    assert!(wait_for(|| receiver.transport.metrics().auth_failures == 1));
    assert!(receiver.inbound.try_recv().is_err());
}

#[test]
fn test_udp_oversized_payload() {
    let sender = UdpTransport::new();
    let mut opts = options(None);
    opts.buffer_size = 8;
    sender.initialize(&opts).unwrap();

    let err = sender
        .send(&[0u8; 9], localhost(9), &SendOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::PacketSizeExceeded { size: 9, limit: 8 }
    ));
}

#[test_log::test]
fn test_tcp_frames_arrive_in_order() {
    let a = Endpoint::<TcpTransport>::start("tcp-a", None);
    let b = Endpoint::<TcpTransport>::start("tcp-b", None);

    b.transport
        .send(b"12345", a.addr(), &SendOptions::default())
        .unwrap();
    b.transport
        .send(b"abc", a.addr(), &SendOptions::default())
        .unwrap();

    let first = a.inbound.recv_timeout(WAIT).unwrap();
    let second = a.inbound.recv_timeout(WAIT).unwrap();
    assert_eq!(&first.payload[..], b"12345");
    assert_eq!(&second.payload[..], b"abc");
    // the accepted connection is keyed by b's listen address
    assert_eq!(first.remote, b.addr());
}

#[test_log::test]
fn test_tcp_reply_reuses_accepted_connection() {
    let a = Endpoint::<TcpTransport>::start("tcp-reuse-a", Some(b"secret"));
    let b = Endpoint::<TcpTransport>::start("tcp-reuse-b", Some(b"secret"));

    b.transport
        .send(b"ping", a.addr(), &SendOptions::default())
        .unwrap();
    a.inbound.recv_timeout(WAIT).unwrap();
    assert!(wait_for(|| a.transport.is_connected(b.addr())));

    a.transport
        .send(b"pong", b.addr(), &SendOptions::default())
        .unwrap();
    let reply = b.inbound.recv_timeout(WAIT).unwrap();
    assert_eq!(&reply.payload[..], b"pong");
    assert_eq!(reply.remote, a.addr());
    assert_eq!(a.transport.connection_count(), 1);
    assert_eq!(b.transport.connection_count(), 1);
}

#[test_log::test]
fn test_tcp_wrong_key_rejected() {
    let a = Endpoint::<TcpTransport>::start("tcp-key-a", Some(b"one"));
    let b = Endpoint::<TcpTransport>::start("tcp-key-b", Some(b"two"));

    let err = b
        .transport
        .send(b"hi", a.addr(), &SendOptions::default())
        .unwrap_err();
    assert!(matches!(err, TransportError::Authentication { .. }), "{err}");
    assert!(wait_for(|| a.transport.metrics().auth_failures == 1));
    assert!(a.inbound.try_recv().is_err());
    assert_eq!(b.transport.connection_count(), 0);
}

#[test_log::test]
fn test_tcp_keyless_connector_meets_keyed_acceptor() {
    let a = Endpoint::<TcpTransport>::start("tcp-cookie-a", Some(b"one"));
    let b = Endpoint::<TcpTransport>::start("tcp-cookie-b", None);

    let err = b
        .transport
        .send(b"hi", a.addr(), &SendOptions::default())
        .unwrap_err();
    assert!(matches!(err, TransportError::Authentication { .. }), "{err}");
}

/// Connect with a plain blocking socket and complete the keyless handshake,
/// announcing `port` as our listen port.
fn raw_handshake(acceptor: SocketAddr, port: u32) -> (StdTcpStream, std::io::Result<Vec<u8>>) {
    let mut client = StdTcpStream::connect(acceptor).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();

    let mut challenge = [0u8; 4 + types::VERSION_BYTES];
    client.read_exact(&mut challenge).unwrap();
    assert_eq!(&challenge[..4], types::VER_CHALLENGE);
    assert_eq!(&challenge[4..], &types::PROTOCOL_VERSION);

    let mut reply = port.to_be_bytes().to_vec();
    reply.extend_from_slice(types::VER_CHALLENGE);
    client.write_all(&reply).unwrap();

    let mut response = vec![0u8; types::WELCOME.len()];
    let outcome = client.read_exact(&mut response).map(|()| response);
    (client, outcome)
}

#[test_log::test]
fn test_tcp_acceptor_welcomes_fresh_connection() {
    let a = Endpoint::<TcpTransport>::start("tcp-welcome", None);

    let (mut client, response) = raw_handshake(a.addr(), 4321);
    assert_eq!(response.unwrap(), types::WELCOME);
    assert!(wait_for(|| a.transport.is_connected(localhost(4321))));

    client.write_all(&frame_header(2)).unwrap();
    client.write_all(b"hi").unwrap();
    let packet = a.inbound.recv_timeout(WAIT).unwrap();
    assert_eq!(&packet.payload[..], b"hi");
    assert_eq!(packet.remote, localhost(4321));
}

#[test_log::test]
fn test_tcp_duplicate_connection_dropped() {
    let a = Endpoint::<TcpTransport>::start("tcp-duplicate", None);

    let (_first, response) = raw_handshake(a.addr(), 4322);
    assert_eq!(response.unwrap(), types::WELCOME);
    assert!(wait_for(|| a.transport.is_connected(localhost(4322))));

    // same host and announced listen port as a cached connection
    let (_second, response) = raw_handshake(a.addr(), 4322);
    assert!(response.is_err());
    assert_eq!(a.transport.connection_count(), 1);
}

#[test_log::test]
fn test_tcp_keyed_connector_meets_keyless_acceptor() {
    let a = Endpoint::<TcpTransport>::start("tcp-nocookie-a", None);
    let b = Endpoint::<TcpTransport>::start("tcp-nocookie-b", Some(b"one"));

    let err = b
        .transport
        .send(b"hi", a.addr(), &SendOptions::default())
        .unwrap_err();
    assert!(matches!(err, TransportError::Authentication { .. }), "{err}");
    assert!(wait_for(|| a.transport.metrics().auth_failures == 1));
    assert!(a.inbound.try_recv().is_err());
    assert_eq!(a.transport.connection_count(), 0);
}

#[test_log::test]
fn test_tcp_empty_payload_not_delivered() {
    let a = Endpoint::<TcpTransport>::start("tcp-empty-a", None);
    let b = Endpoint::<TcpTransport>::start("tcp-empty-b", None);

    b.transport
        .send(b"", a.addr(), &SendOptions::default())
        .unwrap();
    b.transport
        .send(b"after", a.addr(), &SendOptions::default())
        .unwrap();

    let packet = a.inbound.recv_timeout(WAIT).unwrap();
    assert_eq!(&packet.payload[..], b"after");
    assert!(a.inbound.try_recv().is_err());
}

#[test_log::test]
fn test_tcp_oversized_payload() {
    let mut opts = options(None);
    opts.max_frame_size = 8;
    let b = Endpoint::<TcpTransport>::start_with("tcp-oversized", &opts);

    let err = b
        .transport
        .send(&[0u8; 9], localhost(9), &SendOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::PacketSizeExceeded { size: 9, limit: 8 }
    ));
    assert_eq!(b.transport.connection_count(), 0);
    assert_eq!(b.transport.metrics().packets_sent, 0);
}

#[test_log::test]
fn test_tcp_send_racing_loop_stop() {
    let a = Endpoint::<TcpTransport>::start("tcp-race-a", None);
    let b = Endpoint::<TcpTransport>::start("tcp-race-b", None);
    let target = a.addr();

    b.transport
        .send(b"warm", target, &SendOptions::default())
        .unwrap();
    a.inbound.recv_timeout(WAIT).unwrap();

    let outcome = std::thread::scope(|scope| {
        let sender = scope.spawn(|| {
            let mut outcome = Ok(());
            while outcome.is_ok() {
                outcome = b.transport.send(&[1u8; 1024], target, &SendOptions::default());
            }
            outcome
        });
        std::thread::sleep(Duration::from_millis(20));
        b.mesgloop.stop();
        sender.join().expect("sender must not panic")
    });
    assert!(outcome.is_err());
}

#[test_log::test]
fn test_tcp_refused_not_retried_by_default() {
    let b = Endpoint::<TcpTransport>::start("tcp-refused", None);
    let closed_port = {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let err = b
        .transport
        .send(b"hi", localhost(closed_port), &SendOptions::default())
        .unwrap_err();
    assert!(err.is_refused(), "{err}");
    assert_eq!(b.transport.metrics().retries, 0);

    let err = b
        .transport
        .send(
            b"hi",
            localhost(closed_port),
            &SendOptions {
                retry_refused: true,
            },
        )
        .unwrap_err();
    assert!(matches!(err, TransportError::RetriesExhausted { .. }), "{err}");
    assert!(b.transport.metrics().retries > 0);
}

#[test]
fn test_lifecycle_order_enforced() {
    let transport = TcpTransport::new();
    let mesgloop = MessageLoop::new("lifecycle");
    mesgloop.start().unwrap();
    let (tx, _rx) = crossbeam_channel::unbounded();

    assert!(matches!(
        transport.start(tx.clone(), &mesgloop),
        Err(TransportError::InvalidState { .. })
    ));
    transport.initialize(&options(None)).unwrap();
    assert!(matches!(
        transport.initialize(&options(None)),
        Err(TransportError::InvalidState { .. })
    ));
    transport.start(tx, &mesgloop).unwrap();
    assert_eq!(transport.state(), TransportState::Started);

    transport.close();
    transport.close();
    assert_eq!(transport.state(), TransportState::Closed);
    assert!(matches!(
        transport.send(b"x", localhost(9), &SendOptions::default()),
        Err(TransportError::InvalidState { .. })
    ));
    assert!(mesgloop.is_empty());
    mesgloop.stop();
}

#[test]
fn test_strict_binding_requires_port() {
    let mut opts = options(None);
    opts.strict = true;
    let err = UdpTransport::new().initialize(&opts).unwrap_err();
    assert!(matches!(err, TransportError::Binding { .. }));
}

#[test]
fn test_linear_binding_skips_taken_port() {
    let taken = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    if port > u16::MAX - 16 {
        return;
    }
    let mut opts = options(None);
    opts.port = Some(port);
    opts.linear = true;
    opts.bind_retries = 10;
    opts.min_port = port;
    opts.max_port = port + 10;

    let transport = UdpTransport::new();
    transport.initialize(&opts).unwrap();
    let bound = transport.address().unwrap();
    assert_ne!(bound, port);
    assert!(bound > port && bound <= port + 10);
}

#[test_log::test]
fn test_manager_lifecycle() {
    let manager = TransportManager::new("manager");
    manager.initialize(&options(None)).unwrap();
    manager.start().unwrap();

    let addresses = manager.addresses();
    assert_eq!(addresses.len(), 2);
    assert!(addresses.iter().all(Option::is_some));
    assert_eq!(manager.slot_of(TransportKind::Tcp), Some(1));
    assert_eq!(manager.mesgloop().len(), 2);

    let udp = manager.transport(TransportKind::Udp.slot()).unwrap();
    udp.send(
        b"self",
        localhost(addresses[0].unwrap()),
        &SendOptions::default(),
    )
    .unwrap();
    let packet = manager.inbound().recv_timeout(WAIT).unwrap();
    assert_eq!(&packet.payload[..], b"self");

    manager.close();
    assert!(!manager.mesgloop().is_alive());
}
