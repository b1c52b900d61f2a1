//! Debounced attended/unattended state from noisy per-frame detections.
//!
//! Each result is reduced to a raw `Classification` by a policy and pushed
//! into a window of the last `window` readings. The tracked state moves only
//! when at least `majority` of those readings agree on a different value, and
//! every accepted move emits one alert unless an alert for the same target
//! state went out less than `cooldown` ago.

mod alert;
mod policy;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::detect::DetectionResult;

pub use alert::{alert_message, AlertEvent, AlertSink, ChannelAlertSink, LogAlertSink};
pub use policy::{
    ClassificationPolicy, Policy, PolicyKind, PresencePolicy, ProximityPolicy, DEFAULT_MIN_CONFIDENCE,
    DEFAULT_PROXIMITY_MARGIN,
};

pub const DEFAULT_WINDOW: usize = 5;
pub const DEFAULT_MAJORITY: usize = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Raw per-frame reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Classification {
    Attended,
    Unattended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttendanceState {
    /// Fewer than `window` results seen, or no majority yet.
    Unknown,
    Attended,
    Unattended,
}

impl From<Classification> for AttendanceState {
    fn from(value: Classification) -> Self {
        match value {
            Classification::Attended => AttendanceState::Attended,
            Classification::Unattended => AttendanceState::Unattended,
        }
    }
}

impl fmt::Display for AttendanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttendanceState::Unknown => "UNKNOWN",
            AttendanceState::Attended => "ATTENDED",
            AttendanceState::Unattended => "UNATTENDED",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    pub window: usize,
    pub majority: usize,
    /// Minimum spacing between alerts for the same target state.
    pub cooldown: Duration,
    /// Remind while UNATTENDED persists. Never more often than `cooldown`.
    pub repeat_interval: Option<Duration>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            majority: DEFAULT_MAJORITY,
            cooldown: DEFAULT_COOLDOWN,
            repeat_interval: None,
        }
    }
}

impl TrackerConfig {
    /// `majority` must be a strict majority of `window`, so two states can
    /// never both qualify.
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(anyhow!("tracker window must be at least 1"));
        }
        if self.majority > self.window || self.majority * 2 <= self.window {
            return Err(anyhow!(
                "tracker majority {} must be more than half of window {} and at most the window",
                self.majority,
                self.window
            ));
        }
        if let Some(interval) = self.repeat_interval {
            if interval.is_zero() {
                return Err(anyhow!("tracker repeat interval must be non-zero"));
            }
        }
        Ok(())
    }
}

/// An accepted state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: AttendanceState,
    pub to: AttendanceState,
}

/// What one `update` did.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerUpdate {
    pub state: AttendanceState,
    /// False when the result was stale (seq already seen) and ignored.
    pub applied: bool,
    /// `None` for stale or error-flagged results, which never enter the window.
    pub classification: Option<Classification>,
    pub transition: Option<Transition>,
    pub alert: Option<AlertEvent>,
}

pub struct StateTracker<P, S> {
    cfg: TrackerConfig,
    policy: P,
    sink: S,
    window: VecDeque<Classification>,
    state: AttendanceState,
    last_transition: Option<Instant>,
    last_alert: HashMap<AttendanceState, Instant>,
    last_seq: Option<u32>,
}

impl<P: ClassificationPolicy, S: AlertSink> StateTracker<P, S> {
    pub fn new(cfg: TrackerConfig, policy: P, sink: S) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            window: VecDeque::with_capacity(cfg.window),
            cfg,
            policy,
            sink,
            state: AttendanceState::Unknown,
            last_transition: None,
            last_alert: HashMap::new(),
            last_seq: None,
        })
    }

    pub fn state(&self) -> AttendanceState {
        self.state
    }

    pub fn last_transition(&self) -> Option<Instant> {
        self.last_transition
    }

    /// Raw readings currently in the window, oldest first.
    pub fn window(&self) -> impl Iterator<Item = Classification> + '_ {
        self.window.iter().copied()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Forget the last seen seq, keeping the window and state.
    ///
    /// Needed when the producer restarts its numbering, e.g. a caller that
    /// counts seqs per connection and has just reconnected.
    pub fn reset_seq(&mut self) {
        self.last_seq = None;
    }

    /// Feed one result observed at `now`.
    ///
    /// A result whose seq is not above every seq seen since construction (or
    /// the last `reset_seq`) is ignored, so no result is applied twice. Seqs
    /// must therefore keep increasing across reconnects unless `reset_seq`
    /// is called.
    pub fn update(&mut self, result: &DetectionResult, now: Instant) -> TrackerUpdate {
        if let Some(last) = self.last_seq {
            if result.seq <= last {
                log::debug!("ignoring stale result seq {} (last {})", result.seq, last);
                return self.outcome(false, None, None, None);
            }
        }
        self.last_seq = Some(result.seq);

        if let Some(error) = &result.error {
            log::debug!(
                "result seq {} carries detector error {:?}; window unchanged",
                result.seq,
                error.code
            );
            return self.outcome(true, None, None, None);
        }

        let reading = self.policy.classify(&result.detections);
        self.window.push_back(reading);
        while self.window.len() > self.cfg.window {
            self.window.pop_front();
        }

        if let Some(target) = self.majority_target() {
            let transition = Transition {
                from: self.state,
                to: target,
            };
            self.state = target;
            self.last_transition = Some(now);
            log::info!("state {} -> {} at seq {}", transition.from, transition.to, result.seq);
            let alert = self.alert_for_transition(transition, result, now);
            return self.outcome(true, Some(reading), Some(transition), alert);
        }

        let alert = self.repeat_alert(result, now);
        self.outcome(true, Some(reading), None, alert)
    }

    /// New state backed by at least `majority` of a full window, if it differs
    /// from the current one.
    fn majority_target(&self) -> Option<AttendanceState> {
        if self.window.len() < self.cfg.window {
            return None;
        }
        let unattended = self
            .window
            .iter()
            .filter(|c| **c == Classification::Unattended)
            .count();
        let attended = self.window.len() - unattended;
        let target = if attended >= self.cfg.majority {
            AttendanceState::Attended
        } else if unattended >= self.cfg.majority {
            AttendanceState::Unattended
        } else {
            return None;
        };
        (target != self.state).then_some(target)
    }

    fn alert_for_transition(
        &mut self,
        transition: Transition,
        result: &DetectionResult,
        now: Instant,
    ) -> Option<AlertEvent> {
        if let Some(previous) = self.last_alert.get(&transition.to) {
            let since = now.saturating_duration_since(*previous);
            if since < self.cfg.cooldown {
                log::debug!(
                    "suppressing {} alert; last one {}ms ago",
                    transition.to,
                    since.as_millis()
                );
                return None;
            }
        }
        let event = AlertEvent::new(
            transition.to,
            transition.from,
            result.seq,
            false,
            &result.detections,
            now,
        );
        self.emit(event)
    }

    fn repeat_alert(&mut self, result: &DetectionResult, now: Instant) -> Option<AlertEvent> {
        if self.state != AttendanceState::Unattended {
            return None;
        }
        let interval = self.cfg.repeat_interval?.max(self.cfg.cooldown);
        let last = self.last_alert.get(&AttendanceState::Unattended).copied();
        if let Some(last) = last {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }
        let event = AlertEvent::new(
            self.state,
            self.state,
            result.seq,
            true,
            &result.detections,
            now,
        );
        self.emit(event)
    }

    fn emit(&mut self, event: AlertEvent) -> Option<AlertEvent> {
        self.last_alert.insert(event.state, event.at);
        self.sink.alert(&event);
        Some(event)
    }

    fn outcome(
        &self,
        applied: bool,
        classification: Option<Classification>,
        transition: Option<Transition>,
        alert: Option<AlertEvent>,
    ) -> TrackerUpdate {
        TrackerUpdate {
            state: self.state,
            applied,
            classification,
            transition,
            alert,
        }
    }
}
