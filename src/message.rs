//! Typed model of the OS2L message kinds.
//!
//! The decode layer hands observers raw `serde_json::Value` objects; this
//! module classifies them into the four kinds the protocol emits today.
//! Classification is best-effort: a shape that does not match any known
//! kind (unknown `evt`, missing `evt`, wrong field types) yields `None`
//! and only surfaces through the generic data observable.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// An on/off switch state as OS2L encodes it.
///
/// The canonical wire form is the string `"on"`/`"off"`, but feedback
/// broadcasts carry a raw JSON boolean, so deserialization accepts both.
/// Any other string is treated as off, matching the reference behavior of
/// keying on `state == "on"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Switch {
    /// The button or feedback indicator is active.
    On,
    /// The button or feedback indicator is inactive.
    #[default]
    Off,
}

impl Switch {
    /// String form used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    /// True for [`Switch::On`].
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

impl From<bool> for Switch {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl std::fmt::Display for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Switch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Switch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SwitchVisitor;

        impl Visitor<'_> for SwitchVisitor {
            type Value = Switch;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("\"on\", \"off\", or a boolean")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Switch, E> {
                Ok(Switch::from(value == "on"))
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<Switch, E> {
                Ok(Switch::from(value))
            }
        }

        deserializer.deserialize_any(SwitchVisitor)
    }
}

/// A classified OS2L message, tagged by its `evt` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "evt")]
pub enum Os2lMessage {
    /// A button press or release.
    #[serde(rename = "btn")]
    Button {
        /// Name of the button.
        name: String,
        /// Whether the button went on or off.
        state: Switch,
    },

    /// A numbered command with a parameter, expected (not validated) in [0, 1].
    #[serde(rename = "cmd")]
    Command {
        /// Command identifier.
        id: u32,
        /// Command parameter.
        param: f64,
    },

    /// A beat tick from the audio side.
    #[serde(rename = "beat")]
    Beat {
        /// Whether the tempo changed on this beat.
        change: bool,
        /// Beat position.
        pos: f64,
        /// Beats per minute.
        bpm: f64,
    },

    /// Feedback from the lighting side. All fields are optional on the
    /// wire; missing ones default (`name` to empty, `state` to off).
    #[serde(rename = "feedback")]
    Feedback {
        /// Name of the button the feedback refers to.
        #[serde(default)]
        name: String,
        /// Indicator state.
        #[serde(default)]
        state: Switch,
        /// Page the button lives on, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<String>,
    },
}

impl Os2lMessage {
    /// Classify a decoded object into a known message kind.
    ///
    /// Returns `None` for unknown or malformed shapes; those still reach
    /// generic observers as raw values.
    pub fn classify(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Serialize to the OS2L wire form (`evt` field first, no delimiter).
    pub fn to_wire(&self) -> String {
        to_json_string(self)
    }
}

/// Serialize a value to its JSON string form.
///
/// Infallible for everything this crate sends: plain structs and `Value`
/// trees, which have string keys and no failing `Serialize` impls.
pub(crate) fn to_json_string<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("JSON serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_button_wire_form() {
        let msg = Os2lMessage::Button {
            name: "flash".into(),
            state: Switch::On,
        };
        assert_eq!(msg.to_wire(), r#"{"evt":"btn","name":"flash","state":"on"}"#);
    }

    #[test]
    fn test_command_wire_form() {
        let msg = Os2lMessage::Command { id: 3, param: 0.5 };
        assert_eq!(msg.to_wire(), r#"{"evt":"cmd","id":3,"param":0.5}"#);
    }

    #[test]
    fn test_beat_wire_form() {
        let msg = Os2lMessage::Beat {
            change: true,
            pos: 16.0,
            bpm: 128.0,
        };
        assert_eq!(
            msg.to_wire(),
            r#"{"evt":"beat","change":true,"pos":16.0,"bpm":128.0}"#
        );
    }

    #[test]
    fn test_classify_button() {
        let value = json!({"evt": "btn", "name": "x", "state": "on"});
        assert_eq!(
            Os2lMessage::classify(&value),
            Some(Os2lMessage::Button {
                name: "x".into(),
                state: Switch::On,
            })
        );
    }

    #[test]
    fn test_classify_unknown_evt_is_none() {
        assert_eq!(Os2lMessage::classify(&json!({"evt": "mystery", "x": 1})), None);
    }

    #[test]
    fn test_classify_missing_evt_is_none() {
        assert_eq!(Os2lMessage::classify(&json!({"name": "x"})), None);
    }

    #[test]
    fn test_classify_feedback_defaults() {
        let value = json!({"evt": "feedback"});
        assert_eq!(
            Os2lMessage::classify(&value),
            Some(Os2lMessage::Feedback {
                name: String::new(),
                state: Switch::Off,
                page: None,
            })
        );
    }

    #[test]
    fn test_classify_feedback_boolean_state() {
        let value = json!({"evt": "feedback", "name": "go", "state": true, "page": "main"});
        assert_eq!(
            Os2lMessage::classify(&value),
            Some(Os2lMessage::Feedback {
                name: "go".into(),
                state: Switch::On,
                page: Some("main".into()),
            })
        );
    }

    #[test]
    fn test_classify_feedback_unrecognized_state_string_is_off() {
        let value = json!({"evt": "feedback", "name": "go", "state": "dim"});
        assert_eq!(
            Os2lMessage::classify(&value),
            Some(Os2lMessage::Feedback {
                name: "go".into(),
                state: Switch::Off,
                page: None,
            })
        );
    }

    #[test]
    fn test_classify_beat_integer_positions() {
        let value = json!({"evt": "beat", "change": false, "pos": 4, "bpm": 120});
        assert_eq!(
            Os2lMessage::classify(&value),
            Some(Os2lMessage::Beat {
                change: false,
                pos: 4.0,
                bpm: 120.0,
            })
        );
    }

    #[test]
    fn test_classify_tolerates_extra_fields() {
        let value = json!({"evt": "cmd", "id": 1, "param": 0.2, "extra": "ignored"});
        assert_eq!(
            Os2lMessage::classify(&value),
            Some(Os2lMessage::Command { id: 1, param: 0.2 })
        );
    }
}
