use std::time::{Duration, Instant};

use sinkwatch::detect::{Detection, DetectionResult};
use sinkwatch::tracker::{
    AlertEvent, AttendanceState, Classification, StateTracker, TrackerConfig,
};

/// Result whose single detection encodes the reading: class 1 means unattended.
fn result(seq: u32, reading: Classification) -> DetectionResult {
    let class_id = match reading {
        Classification::Attended => 0,
        Classification::Unattended => 1,
    };
    DetectionResult::new(seq, vec![Detection::new(class_id, 1.0, Default::default())])
}

fn by_class(detections: &[Detection]) -> Classification {
    if detections.iter().any(|d| d.class_id == 1) {
        Classification::Unattended
    } else {
        Classification::Attended
    }
}

type Tracker = StateTracker<fn(&[Detection]) -> Classification, Vec<AlertEvent>>;

fn tracker(window: usize, majority: usize, cooldown: Duration) -> Tracker {
    let cfg = TrackerConfig {
        window,
        majority,
        cooldown,
        repeat_interval: None,
    };
    StateTracker::new(cfg, by_class as fn(&[Detection]) -> Classification, Vec::new()).unwrap()
}

const A: Classification = Classification::Attended;
const U: Classification = Classification::Unattended;

/// Reference model: after each reading, move to any state other than the
/// current one that at least `majority` of the trailing `window` agree on.
fn expected_states(readings: &[Classification], window: usize, majority: usize) -> Vec<AttendanceState> {
    let mut state = AttendanceState::Unknown;
    let mut out = Vec::with_capacity(readings.len());
    for end in 1..=readings.len() {
        if end >= window {
            let tail = &readings[end - window..end];
            for target in [A, U] {
                let agree = tail.iter().filter(|r| **r == target).count();
                let candidate = AttendanceState::from(target);
                if agree >= majority && candidate != state {
                    state = candidate;
                }
            }
        }
        out.push(state);
    }
    out
}

#[test]
fn state_changes_exactly_where_the_majority_first_forms() {
    let patterns: Vec<Vec<Classification>> = vec![
        vec![A, A, A, A, A, U, U, A, U, U, U, A, A, U, A, A],
        vec![U, A, U, A, U, U, A, A, A, U, U, U, U],
        vec![A, U, A, U, A, U, A, U, A, U],
        vec![U, U, U, U, U, U, A, U, U, U],
    ];
    for (window, majority) in [(5, 3), (5, 4), (3, 2), (4, 3)] {
        for readings in &patterns {
            let mut t = tracker(window, majority, Duration::ZERO);
            let now = Instant::now();
            let expected = expected_states(readings, window, majority);
            for (i, reading) in readings.iter().enumerate() {
                let update = t.update(&result(i as u32 + 1, *reading), now);
                assert_eq!(
                    update.state, expected[i],
                    "window {} majority {} index {} in {:?}",
                    window, majority, i, readings
                );
            }
        }
    }
}

#[test]
fn single_outlier_never_flips_state() {
    let mut t = tracker(5, 3, Duration::ZERO);
    let now = Instant::now();
    let mut seq = 0;
    for _ in 0..5 {
        seq += 1;
        t.update(&result(seq, A), now);
    }
    assert_eq!(t.state(), AttendanceState::Attended);
    for _ in 0..20 {
        seq += 1;
        let outlier = t.update(&result(seq, U), now);
        assert_eq!(outlier.state, AttendanceState::Attended);
        for _ in 0..4 {
            seq += 1;
            assert_eq!(t.update(&result(seq, A), now).state, AttendanceState::Attended);
        }
    }
}

#[test]
fn flips_on_the_majority_th_disagreeing_reading() {
    let mut t = tracker(5, 3, Duration::ZERO);
    let now = Instant::now();
    for seq in 1..=5 {
        t.update(&result(seq, A), now);
    }
    assert!(t.update(&result(6, U), now).transition.is_none());
    assert!(t.update(&result(7, U), now).transition.is_none());
    let update = t.update(&result(8, U), now);
    let transition = update.transition.expect("third disagreeing reading flips");
    assert_eq!(transition.from, AttendanceState::Attended);
    assert_eq!(transition.to, AttendanceState::Unattended);
}

#[test]
fn repeated_transition_within_cooldown_alerts_once() {
    let mut t = tracker(1, 1, Duration::from_secs(10));
    let start = Instant::now();

    let first = t.update(&result(1, U), start);
    assert!(first.alert.is_some());
    let back = t.update(&result(2, A), start + Duration::from_secs(1));
    assert!(back.alert.is_some(), "different target state always alerts");
    let again = t.update(&result(3, U), start + Duration::from_secs(2));
    assert_eq!(again.state, AttendanceState::Unattended);
    assert!(again.transition.is_some());
    assert!(again.alert.is_none(), "same target within cooldown is suppressed");

    let alerts = t.sink();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].state, AttendanceState::Unattended);
    assert_eq!(alerts[1].state, AttendanceState::Attended);
}

#[test]
fn transition_after_cooldown_alerts_again() {
    let mut t = tracker(1, 1, Duration::from_secs(5));
    let start = Instant::now();
    t.update(&result(1, U), start);
    t.update(&result(2, A), start + Duration::from_secs(1));
    let later = t.update(&result(3, U), start + Duration::from_secs(6));
    assert!(later.alert.is_some());
    assert_eq!(t.sink().len(), 3);
}

#[test]
fn alert_fires_once_per_accepted_transition() {
    let mut t = tracker(3, 2, Duration::ZERO);
    let now = Instant::now();
    let readings = [U, U, U, U, A, A, A, U, A, A];
    let mut transitions = 0;
    for (i, reading) in readings.iter().enumerate() {
        let update = t.update(&result(i as u32 + 1, *reading), now);
        if update.transition.is_some() {
            transitions += 1;
            assert!(update.alert.is_some());
        } else {
            assert!(update.alert.is_none());
        }
    }
    assert_eq!(t.sink().len(), transitions);
    assert_eq!(transitions, 2);
}

#[test]
fn restarted_numbering_is_ignored_until_seq_is_reset() {
    let mut t = tracker(1, 1, Duration::ZERO);
    let now = Instant::now();
    assert!(t.update(&result(7, A), now).applied);

    let stale = t.update(&result(1, U), now);
    assert!(!stale.applied);
    assert_eq!(stale.state, AttendanceState::Attended);

    t.reset_seq();
    let fresh = t.update(&result(1, U), now);
    assert!(fresh.applied);
    assert_eq!(fresh.state, AttendanceState::Unattended);
    assert_eq!(t.window().collect::<Vec<_>>(), vec![U]);
}
