//! Events published on the device-state hub's topics, for push-style
//! delivery to external subscribers (the HTTP/SSE layer this crate does
//! not implement).

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// Topic an [`Event`] is published under. Subscribers on the externally
/// implemented SSE/HTTP layer filter by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
pub enum Topic {
    TanksChanged,
    Weight,
    StatusChanged,
    FeedingProgress,
    FeedingComplete,
    Error,
}

/// Payloads published on the device-state hub's event bus, one variant per
/// [`Topic`] exactly as the external interface's event table describes.
/// `TanksChanged` carries no payload - subscribers that want the current
/// tank list call the registry/hub snapshot, not the event itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Event {
    TanksChanged,
    Weight { weight: f32, raw: i32 },
    StatusChanged { state: String },
    FeedingProgress { weight: f32, target: f32 },
    FeedingComplete { success: bool, dispensed: f32 },
    Error { code: String, message: String },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::TanksChanged => Topic::TanksChanged,
            Event::Weight { .. } => Topic::Weight,
            Event::StatusChanged { .. } => Topic::StatusChanged,
            Event::FeedingProgress { .. } => Topic::FeedingProgress,
            Event::FeedingComplete { .. } => Topic::FeedingComplete,
            Event::Error { .. } => Topic::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_topic_matches_its_variant() {
        let event = Event::StatusChanged { state: "idle".into() };
        assert_eq!(event.topic(), Topic::StatusChanged);
    }

    #[test]
    fn weight_event_round_trips_through_json() {
        let event = Event::Weight { weight: 12.5, raw: 40231 };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Event::Weight { weight, raw } if weight == 12.5 && raw == 40231));
    }

    #[test]
    fn error_event_carries_a_code_and_message() {
        let event = Event::Error { code: "motor_stall".into(), message: "auger stalled".into() };
        assert_eq!(event.topic(), Topic::Error);
    }
}
