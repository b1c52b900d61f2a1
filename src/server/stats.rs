use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smoothing factor for the rolling latency average.
const LATENCY_ALPHA: f64 = 0.1;

/// Aggregate throughput counters shared by all connection workers.
///
/// Every field is updated atomically; there is no lock and no
/// read-modify-write outside an atomic operation.
#[derive(Debug)]
pub struct ServerStats {
    started: Instant,
    frames: AtomicU64,
    detector_failures: AtomicU64,
    latency_sum_us: AtomicU64,
    /// f64 bits of the exponentially weighted latency in microseconds; NaN until the first frame.
    latency_ewma_bits: AtomicU64,
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub detector_failures: u64,
    pub active_connections: usize,
    pub total_connections: u64,
    /// Rolling (exponentially weighted) per-frame processing latency.
    pub rolling_latency: Duration,
    /// Mean processing latency since start.
    pub mean_latency: Duration,
    /// Frames processed per second since start.
    pub fps: f64,
    pub uptime: Duration,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: AtomicU64::new(0),
            detector_failures: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_ewma_bits: AtomicU64::new(f64::NAN.to_bits()),
            active_connections: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
        }
    }

    /// Record one answered frame and the time spent processing it.
    pub fn record_frame(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(micros, Ordering::Relaxed);
        let sample = micros as f64;
        let _ = self
            .latency_ewma_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = f64::from_bits(bits);
                let next = if current.is_nan() {
                    sample
                } else {
                    current + LATENCY_ALPHA * (sample - current)
                };
                Some(next.to_bits())
            });
    }

    pub fn record_detector_failure(&self) {
        self.detector_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connection as active until the returned guard drops.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let frames = self.frames.load(Ordering::Relaxed);
        let sum_us = self.latency_sum_us.load(Ordering::Relaxed);
        let ewma = f64::from_bits(self.latency_ewma_bits.load(Ordering::Acquire));
        let uptime = self.started.elapsed();
        let mean_latency = if frames == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(sum_us / frames)
        };
        let rolling_latency = if ewma.is_nan() {
            Duration::ZERO
        } else {
            Duration::from_micros(ewma.round() as u64)
        };
        let secs = uptime.as_secs_f64();
        StatsSnapshot {
            frames,
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rolling_latency,
            mean_latency,
            fps: if secs > 0.0 { frames as f64 / secs } else { 0.0 },
            uptime,
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active connection count on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<ServerStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_sample_seeds_rolling_average() {
        let stats = ServerStats::new();
        stats.record_frame(Duration::from_millis(40));
        let snap = stats.snapshot();
        assert_eq!(snap.frames, 1);
        assert_eq!(snap.rolling_latency, Duration::from_millis(40));
        assert_eq!(snap.mean_latency, Duration::from_millis(40));
    }

    #[test]
    fn rolling_average_moves_toward_new_samples() {
        let stats = ServerStats::new();
        stats.record_frame(Duration::from_millis(100));
        stats.record_frame(Duration::from_millis(0));
        let snap = stats.snapshot();
        assert_eq!(snap.rolling_latency, Duration::from_millis(90));
        assert_eq!(snap.mean_latency, Duration::from_millis(50));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(ServerStats::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_frame(Duration::from_micros(10));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.frames, 8000);
        assert_eq!(snap.mean_latency, Duration::from_micros(10));
        assert_eq!(snap.rolling_latency, Duration::from_micros(10));
    }

    #[test]
    fn connection_guard_tracks_active_sessions() {
        let stats = Arc::new(ServerStats::new());
        let first = stats.connection_opened();
        let second = stats.connection_opened();
        assert_eq!(stats.snapshot().active_connections, 2);
        drop(first);
        drop(second);
        let snap = stats.snapshot();
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.total_connections, 2);
    }
}
