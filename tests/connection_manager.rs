use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use sinkwatch::detect::{BackendRegistry, Detection, DetectorBackend};
use sinkwatch::error::{ConnectionError, TransportError};
use sinkwatch::frame::Frame;
use sinkwatch::server::{DetectionServer, ServerConfig, ServerHandle};
use sinkwatch::{BackoffPolicy, ConnectionManager, ConnectionState, Connector, TcpConnector};

/// Refuses every connect and counts the attempts.
struct Unreachable {
    attempts: Arc<AtomicU32>,
}

impl Connector for Unreachable {
    type Conn = TcpStream;

    fn connect(&mut self) -> Result<TcpStream, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ConnectionError::PeerClosed)
    }

    fn describe(&self) -> String {
        "unreachable".to_string()
    }
}

/// Sleeps before answering. `slow_calls` limits how many calls are slow,
/// counted across every instance built by one factory.
struct SlowBackend {
    delay: Duration,
    calls: Arc<AtomicUsize>,
    slow_calls: usize,
}

impl DetectorBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn detect(&mut self, _image: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.slow_calls {
            thread::sleep(self.delay);
        }
        Ok(Vec::new())
    }
}

fn slow_server(delay: Duration, slow_calls: usize) -> ServerHandle {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = BackendRegistry::new();
    registry.register("slow", move || {
        Ok(Box::new(SlowBackend {
            delay,
            calls: Arc::clone(&calls),
            slow_calls,
        }) as Box<dyn DetectorBackend>)
    });
    let cfg = ServerConfig {
        addr: "127.0.0.1:0".to_string(),
        backend: "slow".to_string(),
        poll_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    DetectionServer::new(cfg, registry).spawn().expect("spawn server")
}

fn client(server: &ServerHandle, io_timeout: Duration) -> ConnectionManager<TcpConnector> {
    let connector = TcpConnector::new(server.addr.to_string(), Duration::from_secs(2), io_timeout);
    ConnectionManager::new(connector, BackoffPolicy::default())
}

fn frame(seq: u32) -> Frame {
    Frame::new(seq, 0, 8, 8, vec![0; 8 * 8 * 3])
}

#[test]
fn gives_up_after_max_attempts_with_growing_delays() {
    let attempts = Arc::new(AtomicU32::new(0));
    let slept = Arc::new(Mutex::new(Vec::new()));
    let policy = BackoffPolicy {
        max_attempts: 4,
        base_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(25),
    };
    let recorder = Arc::clone(&slept);
    let manager = ConnectionManager::new(
        Unreachable {
            attempts: Arc::clone(&attempts),
        },
        policy,
    )
    .with_sleeper(move |delay| recorder.lock().unwrap().push(delay));

    let err = manager.send_frame(&frame(1)).unwrap_err();
    assert!(matches!(
        err,
        TransportError::Connection(ConnectionError::RetriesExhausted { attempts: 4, .. })
    ));
    assert!(err.is_recoverable());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(manager.state(), ConnectionState::Degraded);

    let slept = slept.lock().unwrap().clone();
    assert_eq!(
        slept,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(25)
        ]
    );
    assert!(slept.windows(2).all(|pair| pair[0] <= pair[1]));

    // A later call starts a fresh round.
    let _ = manager.send_frame(&frame(2));
    assert_eq!(attempts.load(Ordering::SeqCst), 8);
}

#[test]
fn second_caller_waits_for_the_outstanding_frame() {
    let delay = Duration::from_millis(300);
    let server = slow_server(delay, usize::MAX);
    let manager = Arc::new(client(&server, Duration::from_secs(5)));
    manager.connect().expect("connect");
    let start = Instant::now();

    let first = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let result = manager.send_frame(&frame(1));
            (result, start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(100));
    let second = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let result = manager.send_frame(&frame(2));
            (result, start.elapsed())
        })
    };

    let (first_result, first_done) = first.join().unwrap();
    let (second_result, second_done) = second.join().unwrap();
    assert_eq!(first_result.expect("first frame").seq, 1);
    assert_eq!(second_result.expect("second frame").seq, 2);
    assert!(second_done >= first_done);
    assert!(
        second_done >= delay * 2,
        "second frame answered after {:?}, before two detector runs",
        second_done
    );
    assert_eq!(manager.round_trips(), 2);

    drop(manager);
    server.stop().unwrap();
}

#[test]
fn timeout_drops_connection_and_next_frame_reconnects() {
    let server = slow_server(Duration::from_millis(800), 1);
    let manager = client(&server, Duration::from_millis(200));

    let err = manager.send_frame(&frame(1)).unwrap_err();
    assert!(matches!(err, TransportError::Timeout { seq: 1 }), "{:?}", err);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let result = manager.send_frame(&frame(2)).expect("fresh connection answers");
    assert_eq!(result.seq, 2);
    assert_eq!(manager.state(), ConnectionState::Connected);

    drop(manager);
    server.stop().unwrap();
}

#[test]
fn close_unblocks_an_in_flight_request() {
    let server = slow_server(Duration::from_secs(2), usize::MAX);
    let manager = Arc::new(client(&server, Duration::from_secs(10)));
    manager.connect().expect("connect");

    let in_flight = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let start = Instant::now();
            (manager.send_frame(&frame(1)), start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(200));
    manager.close();

    let (result, elapsed) = in_flight.join().unwrap();
    assert!(matches!(result, Err(TransportError::Closed)), "{:?}", result);
    assert!(elapsed < Duration::from_millis(1500), "close took {:?}", elapsed);
    assert!(manager.is_closed());
    assert!(matches!(manager.send_frame(&frame(2)), Err(TransportError::Closed)));

    drop(manager);
    server.stop().unwrap();
}

#[test]
fn oversized_frame_keeps_the_live_connection() {
    let server = slow_server(Duration::ZERO, 0);
    let manager = client(&server, Duration::from_secs(5)).with_max_payload(1024);

    assert_eq!(manager.send_frame(&frame(1)).expect("small frame").seq, 1);
    let big = Frame::new(2, 0, 64, 64, vec![0; 4096]);
    assert!(manager.send_frame(&big).is_err());
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.send_frame(&frame(3)).expect("next frame").seq, 3);
    assert_eq!(server.stats().total_connections, 1);

    drop(manager);
    server.stop().unwrap();
}

#[test]
fn fps_reads_zero_after_the_server_goes_away() {
    let server = slow_server(Duration::ZERO, 0);
    let manager = client(&server, Duration::from_secs(2)).with_fps_window(Duration::from_millis(500));
    for seq in 1..=5 {
        manager.send_frame(&frame(seq)).expect("answered");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(manager.fps() > 0.0);

    server.stop().unwrap();
    thread::sleep(Duration::from_millis(600));
    assert_eq!(manager.fps(), 0.0);
}
