//! Rejected UDP packets are visible only as a log warning.
//!
//! Lives in its own test binary because it installs a global subscriber: the
//! receive path logs from the message loop thread.

use network::{MessageLoop, SendOptions, Transport, TransportOptions, UdpTransport};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn options(key: &[u8]) -> TransportOptions {
    TransportOptions {
        hostname: "127.0.0.1".into(),
        authkey: Some(key.to_vec()),
        ..TransportOptions::default()
    }
}

#[test]
fn test_mismatched_key_logs_warning() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let receiver = UdpTransport::new();
    receiver.initialize(&options(b"K")).unwrap();
    let mesgloop = MessageLoop::new("auth-logging");
    mesgloop.start().unwrap();
    let (tx, inbound) = crossbeam_channel::unbounded();
    receiver.start(tx, &mesgloop).unwrap();
    let port = receiver.address().unwrap();

    let sender = UdpTransport::new();
    sender.initialize(&options(b"not-K")).unwrap();
    sender
        .send(
            b"hello",
            SocketAddr::from(([127, 0, 0, 1], port)),
            &SendOptions::default(),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut logged = false;
    while Instant::now() < deadline && !logged {
        let text = String::from_utf8_lossy(&captured.0.lock()).into_owned();
        logged = text.contains("Packet dropped") && text.contains("wrong digest");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(logged, "no warning for the rejected packet");
    assert!(inbound.try_recv().is_err());
    assert_eq!(receiver.metrics().auth_failures, 1);
    receiver.close();
    mesgloop.stop();
}
