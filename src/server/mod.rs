//! Server dispatcher: FRAME in, RESULT out.
//!
//! One accept thread plus one worker thread per connection. Workers own their
//! detector instance and share only the read-only configuration and the atomic
//! `ServerStats`.

mod stats;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::detect::{classes, BackendRegistry, DetectionResult, DetectorBackend};
use crate::error::{is_timeout, ProtocolError, ResourceError};
use crate::frame::Frame;
use crate::wire::{self, ErrorCode, ErrorMessage, Message, WireError, DEFAULT_MAX_PAYLOAD};

pub use stats::{ConnectionGuard, ServerStats, StatsSnapshot};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    /// Detector backend name, resolved through the registry for every connection.
    pub backend: String,
    pub max_payload: u32,
    /// Read timeout used to wake workers so they notice shutdown.
    pub poll_interval: Duration,
    /// Sessions with no frame for this long are closed.
    pub idle_timeout: Duration,
    /// Longest stall tolerated inside a message, and the socket write timeout.
    pub io_timeout: Duration,
    /// Log per-connection throughput every this many frames (0 disables).
    pub stats_every: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            backend: "stub".to_string(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            poll_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(60),
            io_timeout: Duration::from_secs(10),
            stats_every: 30,
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    stats: Arc<ServerStats>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting, let every worker finish its current frame, then join.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("detection server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct DetectionServer {
    cfg: ServerConfig,
    registry: Arc<BackendRegistry>,
}

impl DetectionServer {
    pub fn new(cfg: ServerConfig, registry: BackendRegistry) -> Self {
        Self {
            cfg,
            registry: Arc::new(registry),
        }
    }

    /// Check the backend can be built, bind, and start the accept thread.
    ///
    /// Errors here are start-up failures: an unusable backend surfaces as a
    /// `ResourceError`, a bind failure as an I/O error with context.
    pub fn spawn(self) -> Result<ServerHandle> {
        probe_backend(&self.registry, &self.cfg.backend)?;

        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("failed to bind {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ServerStats::new());
        let ctx = Arc::new(WorkerContext {
            cfg: self.cfg,
            registry: self.registry,
            stats: Arc::clone(&stats),
            shutdown: Arc::clone(&shutdown),
        });
        let join = std::thread::Builder::new()
            .name("sinkwatch-accept".to_string())
            .spawn(move || run_accept_loop(listener, ctx))
            .context("failed to spawn accept thread")?;

        Ok(ServerHandle {
            addr,
            stats,
            shutdown,
            join: Some(join),
        })
    }
}

struct WorkerContext {
    cfg: ServerConfig,
    registry: Arc<BackendRegistry>,
    stats: Arc<ServerStats>,
    shutdown: Arc<AtomicBool>,
}

fn probe_backend(registry: &BackendRegistry, name: &str) -> Result<()> {
    let mut backend = registry.create(name).map_err(|err| ResourceError::Detector {
        backend: name.to_string(),
        reason: format!("{:#}", err),
    })?;
    backend.warm_up().map_err(|err| ResourceError::Detector {
        backend: name.to_string(),
        reason: format!("warm-up failed: {:#}", err),
    })?;
    Ok(())
}

fn run_accept_loop(listener: TcpListener, ctx: Arc<WorkerContext>) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                workers.retain(|worker| !worker.is_finished());
                let worker_ctx = Arc::clone(&ctx);
                let spawned = std::thread::Builder::new()
                    .name(format!("sinkwatch-conn-{}", peer))
                    .spawn(move || {
                        if let Err(err) = serve_connection(stream, peer, &worker_ctx) {
                            log::warn!("connection {} closed: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(worker) => workers.push(worker),
                    Err(err) => log::error!("failed to spawn worker for {}: {}", peer, err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                log::warn!("accept failed: {}", err);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    for worker in workers {
        if worker.join().is_err() {
            log::error!("connection worker panicked");
        }
    }
}

fn serve_connection(stream: TcpStream, peer: SocketAddr, ctx: &WorkerContext) -> Result<()> {
    let _guard = ctx.stats.connection_opened();
    let cfg = &ctx.cfg;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(cfg.poll_interval))?;
    stream.set_write_timeout(Some(cfg.io_timeout))?;
    stream.set_nodelay(true)?;
    let mut stream = WorkerStream::new(stream, cfg.io_timeout);
    log::info!("connected to {}", peer);

    let mut detector = match open_detector(&ctx.registry, &cfg.backend) {
        Ok(detector) => detector,
        Err(err) => {
            notify_error(&mut stream, ErrorCode::Unavailable, &format!("{:#}", err), cfg.max_payload);
            return Err(err);
        }
    };

    let mut session = SessionCounters::new();
    let mut last_frame_at = Instant::now();
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            log::info!("closing {} for shutdown", peer);
            return Ok(());
        }

        stream.at_boundary();
        let frame = match wire::read_message(&mut stream, cfg.max_payload) {
            Ok(Some(Message::Frame(frame))) => frame,
            Ok(Some(other)) => {
                let err = ProtocolError::UnexpectedMessage(other.kind());
                notify_error(&mut stream, ErrorCode::ProtocolViolation, &err.to_string(), cfg.max_payload);
                return Err(err.into());
            }
            Ok(None) => {
                log::info!("{} disconnected after {} frames", peer, session.frames);
                return Ok(());
            }
            Err(WireError::Idle) => {
                if last_frame_at.elapsed() >= cfg.idle_timeout {
                    log::warn!(
                        "closing {}: no frame for {}s",
                        peer,
                        cfg.idle_timeout.as_secs()
                    );
                    return Ok(());
                }
                continue;
            }
            Err(WireError::Protocol(err)) => {
                notify_error(&mut stream, ErrorCode::ProtocolViolation, &err.to_string(), cfg.max_payload);
                return Err(err.into());
            }
            Err(WireError::Io(err)) => {
                return Err(anyhow!(err).context(format!("read from {} failed", peer)));
            }
        };
        last_frame_at = Instant::now();

        let reply = process_frame(detector.as_mut(), &frame, &ctx.stats, &mut session);
        wire::write_message(&mut stream, &reply, cfg.max_payload)
            .with_context(|| format!("write to {} failed", peer))?;

        if cfg.stats_every > 0 && session.frames % cfg.stats_every == 0 {
            session.log(peer);
        }
    }
}

fn open_detector(registry: &BackendRegistry, name: &str) -> Result<Box<dyn DetectorBackend>> {
    let mut detector = registry
        .create(name)
        .with_context(|| format!("failed to create detector '{}'", name))?;
    detector
        .warm_up()
        .with_context(|| format!("detector '{}' warm-up failed", name))?;
    Ok(detector)
}

/// Run the detector on one frame and build the reply.
///
/// A detector error never ends the session: the reply is an error-flagged,
/// empty result for the same seq.
fn process_frame(
    detector: &mut dyn DetectorBackend,
    frame: &Frame,
    stats: &ServerStats,
    session: &mut SessionCounters,
) -> Message {
    let started = Instant::now();
    let outcome = detector.detect(frame.image(), frame.width() as u32, frame.height() as u32);
    let latency = started.elapsed();
    stats.record_frame(latency);
    session.record(latency);

    match outcome {
        Ok(mut detections) => {
            detections.truncate(u16::MAX as usize);
            session.utensils = detections.iter().filter(|d| classes::is_utensil(d.class_id)).count();
            session.hands = detections.iter().filter(|d| classes::is_hand(d.class_id)).count();
            let mut result = DetectionResult::new(frame.seq(), detections);
            result.latency = latency;
            Message::from(result)
        }
        Err(err) => {
            stats.record_detector_failure();
            log::warn!("detector failed on frame {}: {:#}", frame.seq(), err);
            Message::from(DetectionResult::failed(
                frame.seq(),
                ErrorCode::DetectorFailed,
                format!("{:#}", err),
            ))
        }
    }
}

/// Best-effort ERROR before the connection is dropped.
fn notify_error<W: Write>(stream: &mut W, code: ErrorCode, text: &str, max_payload: u32) {
    let message = Message::Error(ErrorMessage {
        seq: 0,
        code,
        message: text.to_string(),
    });
    if let Err(err) = wire::write_message(stream, &message, max_payload) {
        log::debug!("could not deliver {:?} notice: {}", code, err);
    }
}

/// Worker side of a connection.
///
/// The socket read timeout is the short poll interval. While waiting for the
/// first byte of a message a timeout is passed through, so the worker can
/// check for shutdown. Once a message has started, timeouts are retried until
/// no byte has arrived for `stall_limit`.
struct WorkerStream {
    stream: TcpStream,
    in_message: bool,
    stall_limit: Duration,
}

impl WorkerStream {
    fn new(stream: TcpStream, stall_limit: Duration) -> Self {
        Self {
            stream,
            in_message: false,
            stall_limit,
        }
    }

    fn at_boundary(&mut self) {
        self.in_message = false;
    }
}

impl Read for WorkerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stalled_since: Option<Instant> = None;
        loop {
            match self.stream.read(buf) {
                Ok(n) => {
                    if n > 0 {
                        self.in_message = true;
                    }
                    return Ok(n);
                }
                Err(err) if self.in_message && is_timeout(&err) => {
                    let since = *stalled_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.stall_limit {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Write for WorkerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

struct SessionCounters {
    started: Instant,
    frames: u64,
    last_latency: Duration,
    utensils: usize,
    hands: usize,
}

impl SessionCounters {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            last_latency: Duration::ZERO,
            utensils: 0,
            hands: 0,
        }
    }

    fn record(&mut self, latency: Duration) {
        self.frames += 1;
        self.last_latency = latency;
    }

    fn log(&self, peer: SocketAddr) {
        let secs = self.started.elapsed().as_secs_f64();
        let fps = if secs > 0.0 { self.frames as f64 / secs } else { 0.0 };
        log::info!(
            "{}: processed {} frames | FPS {:.1} | detection time {:.1}ms | utensils {} | hands {}",
            peer,
            self.frames,
            fps,
            self.last_latency.as_secs_f64() * 1000.0,
            self.utensils,
            self.hands
        );
    }
}
