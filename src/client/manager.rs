use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::detect::DetectionResult;
use crate::error::{is_timeout, ConnectionError, ProtocolError, TransportError};
use crate::frame::Frame;
use crate::wire::{self, ErrorCode, Message, WireError, DEFAULT_MAX_PAYLOAD};

use super::backoff::BackoffPolicy;
use super::connector::{Closer, Connection, Connector};
use super::fps::FpsMeter;

/// Slice used when waiting out a backoff delay, so `close` is noticed promptly.
const PAUSE_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connect round used up its attempts. The next call starts a new round.
    Degraded,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Degraded => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Degraded,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Degraded => "DEGRADED",
        };
        f.write_str(label)
    }
}

pub type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

struct Session<C: Connector> {
    connector: C,
    conn: Option<C::Conn>,
    /// Seq of the last frame answered on the current connection.
    last_seq: Option<u32>,
}

/// Owns the connection to the detection server and exchanges frames for
/// results in strict lockstep.
///
/// `send_frame` holds the session lock for the whole round trip, so a second
/// caller blocks until the outstanding frame is answered or fails. Connection
/// health and throughput are readable at any time without that lock (the FPS
/// meter has its own short-lived lock), and
/// `close` never waits for it: it shuts the socket down underneath any
/// in-flight read or write.
pub struct ConnectionManager<C: Connector> {
    session: Mutex<Session<C>>,
    state: AtomicU8,
    fps: Mutex<FpsMeter>,
    round_trips: AtomicU64,
    closed: AtomicBool,
    closer: Mutex<Option<Box<dyn Closer>>>,
    policy: BackoffPolicy,
    max_payload: u32,
    sleeper: Option<Sleeper>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Does not connect; the first `send_frame` (or `connect`) does.
    pub fn new(connector: C, policy: BackoffPolicy) -> Self {
        Self {
            session: Mutex::new(Session {
                connector,
                conn: None,
                last_seq: None,
            }),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            fps: Mutex::new(FpsMeter::default()),
            round_trips: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closer: Mutex::new(None),
            policy,
            max_payload: DEFAULT_MAX_PAYLOAD,
            sleeper: None,
        }
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Width of the sliding window behind `fps`.
    pub fn with_fps_window(mut self, window: Duration) -> Self {
        self.fps = Mutex::new(FpsMeter::new(window));
        self
    }

    /// Replace the backoff sleep, e.g. to record delays in tests.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Some(Box::new(sleeper));
        self
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Round trips per second over the meter window ending now. Drops to zero
    /// once no frame has been answered for a full window, and whenever the
    /// connection is lost.
    pub fn fps(&self) -> f64 {
        lock(&self.fps).rate(Instant::now())
    }

    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connect now instead of on the first frame. No-op when already connected.
    pub fn connect(&self) -> Result<(), TransportError> {
        let mut session = lock(&self.session);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if session.conn.is_none() {
            self.establish(&mut session)?;
        }
        Ok(())
    }

    /// Send one frame and wait for its result.
    ///
    /// The returned result's `latency` is the measured round trip. A detector
    /// failure on the server comes back as `Ok` with an error-flagged result.
    /// On timeout or I/O failure the connection is dropped and the next call
    /// reconnects.
    pub fn send_frame(&self, frame: &Frame) -> Result<DetectionResult, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut session = lock(&self.session);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(last) = session.last_seq {
            if frame.seq() <= last {
                return Err(TransportError::OutOfOrder {
                    seq: frame.seq(),
                    last,
                });
            }
        }
        let length = frame.wire_len() as u64;
        if length > u64::from(self.max_payload) {
            // Refused before any byte is written, so the session stays usable.
            return Err(ProtocolError::PayloadTooLarge {
                length,
                max: self.max_payload,
            }
            .into());
        }
        if session.conn.is_none() {
            self.establish(&mut session)?;
        }

        let started = Instant::now();
        match self.round_trip(&mut session, frame) {
            Ok(mut result) => {
                let now = Instant::now();
                result.latency = now.saturating_duration_since(started);
                session.last_seq = Some(frame.seq());
                lock(&self.fps).record(now);
                self.round_trips.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(err) => {
                self.drop_connection(&mut session);
                if self.is_closed() {
                    return Err(TransportError::Closed);
                }
                log::warn!("frame {} failed: {}", frame.seq(), err);
                Err(err)
            }
        }
    }

    /// Close the connection and refuse further frames.
    ///
    /// Safe to call from any thread while a `send_frame` is in flight: that call
    /// returns `TransportError::Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(closer) = lock(&self.closer).take() {
            closer.close();
        }
        self.set_state(ConnectionState::Disconnected);
        log::info!("connection manager closed");
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = ConnectionState::from_u8(self.state.swap(next.as_u8(), Ordering::SeqCst));
        if prev != next {
            log::debug!("connection state {} -> {}", prev, next);
        }
    }

    fn establish(&self, session: &mut Session<C>) -> Result<(), TransportError> {
        let attempts = self.policy.max_attempts.max(1);
        let target = session.connector.describe();
        let mut last_err = None;

        for attempt in 1..=attempts {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            self.set_state(ConnectionState::Connecting);
            log::info!("connecting to {} (attempt {}/{})", target, attempt, attempts);

            let outcome = session.connector.connect().and_then(|conn| {
                let closer = conn.closer().map_err(ConnectionError::Io)?;
                Ok((conn, closer))
            });
            match outcome {
                Ok((conn, closer)) => {
                    *lock(&self.closer) = Some(closer);
                    // close() may have run before the closer was installed.
                    if self.is_closed() {
                        if let Some(closer) = lock(&self.closer).take() {
                            closer.close();
                        }
                        return Err(TransportError::Closed);
                    }
                    session.conn = Some(conn);
                    session.last_seq = None;
                    lock(&self.fps).reset();
                    self.set_state(ConnectionState::Connected);
                    log::info!("connected to {}", target);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "connect attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        target,
                        err
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        self.pause(self.policy.delay_for(attempt));
                    }
                }
            }
        }

        self.set_state(ConnectionState::Degraded);
        Err(ConnectionError::RetriesExhausted {
            attempts,
            last: Box::new(last_err.unwrap_or(ConnectionError::PeerClosed)),
        }
        .into())
    }

    fn pause(&self, delay: Duration) {
        if let Some(sleeper) = &self.sleeper {
            sleeper(delay);
            return;
        }
        let deadline = Instant::now() + delay;
        while !self.is_closed() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    fn round_trip(&self, session: &mut Session<C>, frame: &Frame) -> Result<DetectionResult, TransportError> {
        let seq = frame.seq();
        let conn = session
            .conn
            .as_mut()
            .ok_or(TransportError::Connection(ConnectionError::PeerClosed))?;

        wire::write_frame(conn, frame, self.max_payload).map_err(|err| map_wire_error(err, seq))?;

        match wire::read_message(conn, self.max_payload) {
            Ok(Some(Message::Result(result))) => {
                if result.seq != seq {
                    return Err(ProtocolError::SeqMismatch {
                        expected: seq,
                        got: result.seq,
                    }
                    .into());
                }
                Ok(result)
            }
            Ok(Some(Message::Error(error))) => match error.code {
                ErrorCode::DetectorFailed | ErrorCode::Other(_) if error.seq == seq => {
                    Ok(DetectionResult::failed(seq, error.code, error.message))
                }
                code => Err(ProtocolError::Rejected {
                    code,
                    message: error.message,
                }
                .into()),
            },
            Ok(Some(other)) => Err(ProtocolError::UnexpectedMessage(other.kind()).into()),
            Ok(None) => Err(ConnectionError::PeerClosed.into()),
            Err(err) => Err(map_wire_error(err, seq)),
        }
    }

    fn drop_connection(&self, session: &mut Session<C>) {
        session.conn = None;
        session.last_seq = None;
        lock(&self.fps).reset();
        lock(&self.closer).take();
        if !self.is_closed() {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(closer) = lock(&self.closer).take() {
            closer.close();
        }
    }
}

fn map_wire_error(err: WireError, seq: u32) -> TransportError {
    match err {
        WireError::Idle => TransportError::Timeout { seq },
        WireError::Io(err) if is_timeout(&err) => TransportError::Timeout { seq },
        WireError::Io(err) => ConnectionError::Io(err).into(),
        WireError::Protocol(err) => err.into(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};
    use crate::wire::ErrorMessage;
    use std::io::{self, Cursor, Read, Write};
    use std::sync::Arc;

    /// Replays canned server bytes and swallows whatever the client writes.
    struct Canned {
        replies: Cursor<Vec<u8>>,
    }

    impl Read for Canned {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.replies.read(buf)?;
            if n == 0 && !buf.is_empty() {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            Ok(n)
        }
    }

    impl Write for Canned {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct NoopCloser;

    impl Closer for NoopCloser {
        fn close(&self) {}
    }

    impl Connection for Canned {
        fn closer(&self) -> io::Result<Box<dyn Closer>> {
            Ok(Box::new(NoopCloser))
        }
    }

    struct CannedConnector {
        replies: Vec<Message>,
        connects: Arc<AtomicU64>,
    }

    impl Connector for CannedConnector {
        type Conn = Canned;

        fn connect(&mut self) -> Result<Canned, ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let mut bytes = Vec::new();
            for reply in &self.replies {
                wire::write_message(&mut bytes, reply, DEFAULT_MAX_PAYLOAD).unwrap();
            }
            Ok(Canned {
                replies: Cursor::new(bytes),
            })
        }

        fn describe(&self) -> String {
            "canned".to_string()
        }
    }

    fn manager(replies: Vec<Message>) -> (ConnectionManager<CannedConnector>, Arc<AtomicU64>) {
        let connects = Arc::new(AtomicU64::new(0));
        let connector = CannedConnector {
            replies,
            connects: Arc::clone(&connects),
        };
        (
            ConnectionManager::new(connector, BackoffPolicy::default()).with_sleeper(|_| {}),
            connects,
        )
    }

    fn frame(seq: u32) -> Frame {
        Frame::new(seq, 0, 4, 4, vec![0; 48])
    }

    #[test]
    fn result_is_matched_and_timed() {
        let det = Detection::new(0, 0.9, BoundingBox::new(10.0, 10.0, 5.0, 5.0));
        let (mgr, _) = manager(vec![Message::Result(DetectionResult::new(1, vec![det.clone()]))]);

        let result = mgr.send_frame(&frame(1)).unwrap();
        assert_eq!(result.seq, 1);
        assert_eq!(result.detections, vec![det]);
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.round_trips(), 1);
    }

    #[test]
    fn detector_error_is_a_flagged_result() {
        let (mgr, _) = manager(vec![Message::Error(ErrorMessage {
            seq: 3,
            code: ErrorCode::DetectorFailed,
            message: "model crashed".to_string(),
        })]);

        let result = mgr.send_frame(&frame(3)).unwrap();
        assert!(result.is_error());
        assert!(result.detections.is_empty());
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn mismatched_seq_is_a_protocol_error() {
        let (mgr, _) = manager(vec![Message::Result(DetectionResult::new(9, Vec::new()))]);
        let err = mgr.send_frame(&frame(1)).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::SeqMismatch { expected: 1, got: 9 })
        ));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stale_seq_is_rejected_without_sending() {
        let (mgr, connects) = manager(vec![
            Message::Result(DetectionResult::new(5, Vec::new())),
            Message::Result(DetectionResult::new(6, Vec::new())),
        ]);
        mgr.send_frame(&frame(5)).unwrap();
        let err = mgr.send_frame(&frame(5)).unwrap_err();
        assert!(matches!(err, TransportError::OutOfOrder { seq: 5, last: 5 }));
        assert!(!err.is_recoverable());
        mgr.send_frame(&frame(6)).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_reply_times_out_and_next_call_reconnects() {
        let (mgr, connects) = manager(Vec::new());
        let err = mgr.send_frame(&frame(1)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout { seq: 1 }));
        assert!(err.is_recoverable());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        let _ = mgr.send_frame(&frame(2));
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn oversized_frame_is_refused_without_dropping_the_session() {
        let (mgr, connects) = manager(vec![
            Message::Result(DetectionResult::new(1, Vec::new())),
            Message::Result(DetectionResult::new(3, Vec::new())),
        ]);
        let mgr = mgr.with_max_payload(64);
        mgr.send_frame(&frame(1)).unwrap();

        let big = Frame::new(2, 0, 32, 32, vec![0; 32 * 32 * 3]);
        let err = mgr.send_frame(&big).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::PayloadTooLarge { max: 64, .. })
        ));
        assert_eq!(mgr.state(), ConnectionState::Connected);

        assert_eq!(mgr.send_frame(&frame(3)).unwrap().seq, 3);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fps_falls_to_zero_when_the_connection_drops() {
        let replies = (1..=3)
            .map(|seq| Message::Result(DetectionResult::new(seq, Vec::new())))
            .collect();
        let (mgr, _) = manager(replies);
        for seq in 1..=3 {
            mgr.send_frame(&frame(seq)).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(mgr.fps() > 0.0);

        assert!(matches!(
            mgr.send_frame(&frame(4)),
            Err(TransportError::Timeout { seq: 4 })
        ));
        assert_eq!(mgr.fps(), 0.0);
    }

    #[test]
    fn fps_decays_once_answers_stop() {
        let replies = (1..=2)
            .map(|seq| Message::Result(DetectionResult::new(seq, Vec::new())))
            .collect();
        let (mgr, _) = manager(replies);
        let mgr = mgr.with_fps_window(Duration::from_millis(100));
        mgr.send_frame(&frame(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        mgr.send_frame(&frame(2)).unwrap();
        assert!(mgr.fps() > 0.0);
        assert_eq!(mgr.state(), ConnectionState::Connected);

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(mgr.fps(), 0.0);
    }

    #[test]
    fn closed_manager_refuses_frames() {
        let (mgr, connects) = manager(Vec::new());
        mgr.close();
        assert!(matches!(mgr.send_frame(&frame(1)), Err(TransportError::Closed)));
        assert!(matches!(mgr.connect(), Err(TransportError::Closed)));
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }
}
