//! Feed commands come from the device-state hub's single-slot command
//! inbox. Only one command occupies the inbox at a time; submitting a
//! second while one is pending is rejected by the hub, not queued.

use serde::{Deserialize, Serialize};

/// What the command asks the feed dispatcher to do. A tagged union rather
/// than separate optional fields per spec section 9's "polymorphic
/// dispensing operations" redesign flag: the phase/command shape is a
/// plain enum matched exhaustively, not a family of near-identical
/// structs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedCommandKind {
    None,
    Immediate { tank_uid: u64, grams: f32 },
    Recipe { recipe_uid: u32, servings: u16 },
    EmergencyStop,
    TareScale,
}

/// One inbox slot: the command plus whether the dispatcher has picked it
/// up yet. `processed` is set the instant the dispatcher claims the
/// command, before the feed itself runs to completion, so a caller polling
/// it learns "in flight" promptly rather than only at the very end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedCommand {
    pub kind: FeedCommandKind,
    pub processed: bool,
}

impl FeedCommand {
    pub fn new(kind: FeedCommandKind) -> Self {
        FeedCommand { kind, processed: false }
    }

    pub fn immediate(tank_uid: u64, grams: f32) -> Self {
        FeedCommand::new(FeedCommandKind::Immediate { tank_uid, grams })
    }

    pub fn recipe(recipe_uid: u32, servings: u16) -> Self {
        FeedCommand::new(FeedCommandKind::Recipe { recipe_uid, servings })
    }

    pub fn emergency_stop() -> Self {
        FeedCommand::new(FeedCommandKind::EmergencyStop)
    }

    pub fn tare_scale() -> Self {
        FeedCommand::new(FeedCommandKind::TareScale)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self.kind, FeedCommandKind::EmergencyStop)
    }
}

/// Flat JSON shape the external interface's command inbox fields describe:
/// `{type, tankUid, amountGrams, recipeUid, servings, processed}`. Kept
/// separate from [`FeedCommand`] so the internal tagged union stays a
/// plain enum while the wire shape stays exactly what section 6 promises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct FeedCommandWire {
    #[serde(rename = "type")]
    kind: WireKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    tank_uid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    amount_grams: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    recipe_uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    servings: Option<u16>,
    processed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
enum WireKind {
    None,
    Immediate,
    Recipe,
    EmergencyStop,
    TareScale,
}

impl From<FeedCommand> for FeedCommandWire {
    fn from(cmd: FeedCommand) -> Self {
        let mut wire = FeedCommandWire {
            kind: WireKind::None,
            tank_uid: None,
            amount_grams: None,
            recipe_uid: None,
            servings: None,
            processed: cmd.processed,
        };
        match cmd.kind {
            FeedCommandKind::None => wire.kind = WireKind::None,
            FeedCommandKind::Immediate { tank_uid, grams } => {
                wire.kind = WireKind::Immediate;
                wire.tank_uid = Some(tank_uid);
                wire.amount_grams = Some(grams);
            }
            FeedCommandKind::Recipe { recipe_uid, servings } => {
                wire.kind = WireKind::Recipe;
                wire.recipe_uid = Some(recipe_uid);
                wire.servings = Some(servings);
            }
            FeedCommandKind::EmergencyStop => wire.kind = WireKind::EmergencyStop,
            FeedCommandKind::TareScale => wire.kind = WireKind::TareScale,
        }
        wire
    }
}

impl TryFrom<FeedCommandWire> for FeedCommand {
    type Error = String;

    fn try_from(wire: FeedCommandWire) -> Result<Self, Self::Error> {
        let kind = match wire.kind {
            WireKind::None => FeedCommandKind::None,
            WireKind::Immediate => FeedCommandKind::Immediate {
                tank_uid: wire.tank_uid.ok_or("immediate command missing tankUid")?,
                grams: wire.amount_grams.ok_or("immediate command missing amountGrams")?,
            },
            WireKind::Recipe => FeedCommandKind::Recipe {
                recipe_uid: wire.recipe_uid.ok_or("recipe command missing recipeUid")?,
                servings: wire.servings.ok_or("recipe command missing servings")?,
            },
            WireKind::EmergencyStop => FeedCommandKind::EmergencyStop,
            WireKind::TareScale => FeedCommandKind::TareScale,
        };
        Ok(FeedCommand { kind, processed: wire.processed })
    }
}

impl Serialize for FeedCommand {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        FeedCommandWire::from(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FeedCommand {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = FeedCommandWire::deserialize(deserializer)?;
        FeedCommand::try_from(wire).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"type":"None","processed":false}"#)]
    #[case(r#"{"type":"Immediate","tankUid":42,"amountGrams":50.0,"processed":false}"#)]
    #[case(r#"{"type":"Recipe","recipeUid":3,"servings":2,"processed":true}"#)]
    #[case(r#"{"type":"EmergencyStop","processed":false}"#)]
    #[case(r#"{"type":"TareScale","processed":false}"#)]
    fn feed_command_parses_from_the_wire_shape(#[case] json: &str) {
        serde_json::from_str::<FeedCommand>(json).unwrap();
    }

    #[test]
    fn immediate_command_round_trips_through_json() {
        let cmd = FeedCommand::immediate(99, 42.5);
        let json = serde_json::to_string(&cmd).unwrap();
        let back: FeedCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn immediate_without_tank_uid_is_rejected() {
        let json = r#"{"type":"Immediate","amountGrams":50.0,"processed":false}"#;
        assert!(serde_json::from_str::<FeedCommand>(json).is_err());
    }

    #[test]
    fn is_stop_only_true_for_emergency_stop() {
        assert!(FeedCommand::emergency_stop().is_stop());
        assert!(!FeedCommand::tare_scale().is_stop());
    }
}
