use std::sync::mpsc::Sender;
use std::time::Instant;

use crate::detect::classes::{class_name, is_utensil};
use crate::detect::Detection;

use super::AttendanceState;

/// One alert handed to the alerting collaborator (speech, notification, ...).
#[derive(Clone, Debug, PartialEq)]
pub struct AlertEvent {
    pub state: AttendanceState,
    pub previous: AttendanceState,
    /// Seq of the result that triggered the alert.
    pub seq: u32,
    /// True for a reminder while the state persists, false for a transition.
    pub repeat: bool,
    pub message: String,
    pub at: Instant,
}

impl AlertEvent {
    pub(crate) fn new(
        state: AttendanceState,
        previous: AttendanceState,
        seq: u32,
        repeat: bool,
        detections: &[Detection],
        at: Instant,
    ) -> Self {
        Self {
            state,
            previous,
            seq,
            repeat,
            message: alert_message(state, detections),
            at,
        }
    }
}

/// "Warning! fork, spoon left unattended in sink!" for unattended states.
pub fn alert_message(state: AttendanceState, detections: &[Detection]) -> String {
    match state {
        AttendanceState::Unattended => {
            let mut names: Vec<&'static str> = Vec::new();
            for det in detections.iter().filter(|d| is_utensil(d.class_id)) {
                let name = class_name(det.class_id);
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            if names.is_empty() {
                "Warning! Utensils left unattended in sink!".to_string()
            } else {
                format!("Warning! {} left unattended in sink!", names.join(", "))
            }
        }
        AttendanceState::Attended => "Sink attended.".to_string(),
        AttendanceState::Unknown => "Sink state unknown.".to_string(),
    }
}

/// Receives alert events from the tracker.
pub trait AlertSink {
    fn alert(&mut self, event: &AlertEvent);
}

/// Writes alerts to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&mut self, event: &AlertEvent) {
        match event.state {
            AttendanceState::Unattended => log::warn!("ALERT (seq {}): {}", event.seq, event.message),
            _ => log::info!("ALERT (seq {}): {}", event.seq, event.message),
        }
    }
}

/// Forwards alerts to another thread. A dropped receiver is ignored.
#[derive(Clone, Debug)]
pub struct ChannelAlertSink {
    tx: Sender<AlertEvent>,
}

impl ChannelAlertSink {
    pub fn new(tx: Sender<AlertEvent>) -> Self {
        Self { tx }
    }
}

impl AlertSink for ChannelAlertSink {
    fn alert(&mut self, event: &AlertEvent) {
        if self.tx.send(event.clone()).is_err() {
            log::debug!("alert receiver gone; dropping alert for seq {}", event.seq);
        }
    }
}

/// Collects alerts in memory.
impl AlertSink for Vec<AlertEvent> {
    fn alert(&mut self, event: &AlertEvent) {
        self.push(event.clone());
    }
}
