use serde::{Deserialize, Serialize};

use crate::detect::classes::{is_hand, is_utensil};
use crate::detect::Detection;

use super::Classification;

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
/// Pixels between a utensil box and a hand box still counted as "near".
pub const DEFAULT_PROXIMITY_MARGIN: f32 = 50.0;

/// Reduces one frame's detections to a raw attended/unattended reading.
pub trait ClassificationPolicy {
    fn classify(&self, detections: &[Detection]) -> Classification;
}

impl<F> ClassificationPolicy for F
where
    F: Fn(&[Detection]) -> Classification,
{
    fn classify(&self, detections: &[Detection]) -> Classification {
        self(detections)
    }
}

/// Utensils with no hand anywhere in frame are unattended.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PresencePolicy {
    pub min_confidence: f32,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl ClassificationPolicy for PresencePolicy {
    fn classify(&self, detections: &[Detection]) -> Classification {
        let confident = detections.iter().filter(|d| d.confidence >= self.min_confidence);
        let (mut utensils, mut hands) = (false, false);
        for det in confident {
            utensils |= is_utensil(det.class_id);
            hands |= is_hand(det.class_id);
        }
        if utensils && !hands {
            Classification::Unattended
        } else {
            Classification::Attended
        }
    }
}

/// Utensils are attended only while some hand box overlaps or comes within
/// `margin` pixels of one of them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProximityPolicy {
    pub min_confidence: f32,
    pub margin: f32,
}

impl Default for ProximityPolicy {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            margin: DEFAULT_PROXIMITY_MARGIN,
        }
    }
}

impl ClassificationPolicy for ProximityPolicy {
    fn classify(&self, detections: &[Detection]) -> Classification {
        let confident: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.min_confidence)
            .collect();
        let hands: Vec<&Detection> = confident.iter().copied().filter(|d| is_hand(d.class_id)).collect();
        let mut utensils = confident.iter().filter(|d| is_utensil(d.class_id)).peekable();
        if utensils.peek().is_none() {
            return Classification::Attended;
        }
        let near_hand = utensils.any(|u| hands.iter().any(|h| u.bbox.gap(&h.bbox) <= self.margin));
        if near_hand {
            Classification::Attended
        } else {
            Classification::Unattended
        }
    }
}

/// Policy chosen by configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Presence,
    Proximity,
}

impl std::str::FromStr for PolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "presence" => Ok(PolicyKind::Presence),
            "proximity" => Ok(PolicyKind::Proximity),
            other => Err(anyhow::anyhow!(
                "unknown policy '{}' (expected presence or proximity)",
                other
            )),
        }
    }
}

/// Either built-in policy, selected at run time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Policy {
    Presence(PresencePolicy),
    Proximity(ProximityPolicy),
}

impl Policy {
    pub fn new(kind: PolicyKind, min_confidence: f32, margin: f32) -> Self {
        match kind {
            PolicyKind::Presence => Policy::Presence(PresencePolicy { min_confidence }),
            PolicyKind::Proximity => Policy::Proximity(ProximityPolicy {
                min_confidence,
                margin,
            }),
        }
    }
}

impl ClassificationPolicy for Policy {
    fn classify(&self, detections: &[Detection]) -> Classification {
        match self {
            Policy::Presence(policy) => policy.classify(detections),
            Policy::Proximity(policy) => policy.classify(detections),
        }
    }
}
