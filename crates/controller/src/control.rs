//! Desired-state documents from the remote store and their translation into
//! per-namespace commands.
//!
//! The document is kept as raw JSON so that structural equality covers every
//! field the store sends, including ones this controller does not know.
//! Decoding is lenient: unknown keys are skipped and a namespace holding a
//! value of the wrong shape is ignored rather than failing the document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlDocument(Value);

impl ControlDocument {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// True for `null` and `{}`; the store returns `null` for a missing node.
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(m) => m.is_empty(),
            _ => false,
        }
    }

    /// Commands for every known namespace present, in application order.
    pub fn commands(&self) -> Vec<ControlCommand> {
        let Value::Object(map) = &self.0 else {
            return Vec::new();
        };
        Namespace::ALL
            .iter()
            .filter_map(|ns| map.get(ns.key()).and_then(|v| ControlCommand::decode(*ns, v)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Irrigation,
    Lighting,
    Ventilation,
    Emergency,
}

impl Namespace {
    /// Emergency is last so a stop in the same document wins.
    pub const ALL: [Namespace; 4] = [
        Self::Irrigation,
        Self::Lighting,
        Self::Ventilation,
        Self::Emergency,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Irrigation => "irrigation",
            Self::Lighting => "lighting",
            Self::Ventilation => "ventilation",
            Self::Emergency => "emergency",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.key() == key)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Mode-bearing namespaces either hand the actuator to automation or pin it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeCommand {
    Auto,
    Manual { enabled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Irrigation(ModeCommand),
    Lighting(ModeCommand),
    Ventilation { enabled: bool },
    Emergency { stopped: bool },
}

impl ControlCommand {
    /// Decode one namespace value. `null` decodes with every field absent;
    /// any other non-object is ignored.
    pub fn decode(ns: Namespace, value: &Value) -> Option<Self> {
        let empty = serde_json::Map::new();
        let fields = match value {
            Value::Object(m) => m,
            Value::Null => &empty,
            _ => return None,
        };
        let flag = |name: &str| fields.get(name).is_some_and(truthy);

        Some(match ns {
            Namespace::Irrigation => Self::Irrigation(if flag("autoMode") {
                ModeCommand::Auto
            } else {
                ModeCommand::Manual {
                    enabled: flag("enabled"),
                }
            }),
            Namespace::Lighting => {
                let auto = fields.get("preset").and_then(Value::as_str) == Some("auto");
                Self::Lighting(if auto {
                    ModeCommand::Auto
                } else {
                    ModeCommand::Manual {
                        enabled: flag("enabled"),
                    }
                })
            }
            Namespace::Ventilation => Self::Ventilation {
                enabled: flag("enabled"),
            },
            Namespace::Emergency => Self::Emergency {
                stopped: flag("stopped"),
            },
        })
    }
}

/// JSON truthiness as the mobile app writes it: `true`, non-zero numbers,
/// and non-empty strings/containers count as set.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// One change to the remote control tree, self-contained: the engine never
/// has to read the store to apply it.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlChange {
    /// The whole tree (path `/`), or a patch of several namespaces at once.
    Snapshot(ControlDocument),
    /// A single top-level key with the store's current value for it.
    Key { key: String, value: Value },
}

impl ControlChange {
    pub fn commands(&self) -> Vec<ControlCommand> {
        match self {
            Self::Snapshot(doc) => doc.commands(),
            Self::Key { key, value } => Namespace::from_key(key)
                .and_then(|ns| ControlCommand::decode(ns, value))
                .into_iter()
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Split a store event path ("/lighting/enabled") into its segments.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> ControlDocument {
        ControlDocument::new(v)
    }

    // -- Document decoding ----------------------------------------------------

    #[test]
    fn full_document_decodes_in_order() {
        let d = doc(json!({
            "emergency": {"stopped": false},
            "ventilation": {"enabled": true},
            "lighting": {"preset": "auto", "enabled": false},
            "irrigation": {"autoMode": false, "enabled": true},
        }));
        assert_eq!(
            d.commands(),
            vec![
                ControlCommand::Irrigation(ModeCommand::Manual { enabled: true }),
                ControlCommand::Lighting(ModeCommand::Auto),
                ControlCommand::Ventilation { enabled: true },
                ControlCommand::Emergency { stopped: false },
            ]
        );
    }

    #[test]
    fn absent_namespaces_produce_no_commands() {
        let d = doc(json!({"ventilation": {"enabled": false}}));
        assert_eq!(d.commands(), vec![ControlCommand::Ventilation { enabled: false }]);
    }

    #[test]
    fn unknown_keys_ignored() {
        let d = doc(json!({"sprinklers": {"enabled": true}, "version": 3}));
        assert!(d.commands().is_empty());
    }

    #[test]
    fn non_object_root_yields_nothing() {
        assert!(doc(json!("garbage")).commands().is_empty());
        assert!(doc(Value::Null).commands().is_empty());
    }

    #[test]
    fn malformed_namespace_value_ignored() {
        let d = doc(json!({"irrigation": 5, "ventilation": {"enabled": true}}));
        assert_eq!(d.commands(), vec![ControlCommand::Ventilation { enabled: true }]);
    }

    #[test]
    fn null_namespace_decodes_as_defaults() {
        let d = doc(json!({"irrigation": null}));
        assert_eq!(
            d.commands(),
            vec![ControlCommand::Irrigation(ModeCommand::Manual { enabled: false })]
        );
    }

    #[test]
    fn lighting_manual_preset() {
        let cmd = ControlCommand::decode(
            Namespace::Lighting,
            &json!({"preset": "manual", "enabled": true}),
        );
        assert_eq!(
            cmd,
            Some(ControlCommand::Lighting(ModeCommand::Manual { enabled: true }))
        );
    }

    #[test]
    fn lighting_missing_preset_is_manual() {
        let cmd = ControlCommand::decode(Namespace::Lighting, &json!({"enabled": true}));
        assert_eq!(
            cmd,
            Some(ControlCommand::Lighting(ModeCommand::Manual { enabled: true }))
        );
    }

    #[test]
    fn irrigation_auto_ignores_enabled() {
        let cmd = ControlCommand::decode(
            Namespace::Irrigation,
            &json!({"autoMode": true, "enabled": false}),
        );
        assert_eq!(cmd, Some(ControlCommand::Irrigation(ModeCommand::Auto)));
    }

    #[test]
    fn truthy_flags() {
        let cases = [
            (json!({"enabled": 1}), true),
            (json!({"enabled": 0}), false),
            (json!({"enabled": "yes"}), true),
            (json!({"enabled": ""}), false),
            (json!({"enabled": null}), false),
            (json!({}), false),
        ];
        for (v, expected) in cases {
            assert_eq!(
                ControlCommand::decode(Namespace::Ventilation, &v),
                Some(ControlCommand::Ventilation { enabled: expected }),
                "{v}"
            );
        }
    }

    #[test]
    fn emergency_stopped() {
        let cmd = ControlCommand::decode(Namespace::Emergency, &json!({"stopped": true}));
        assert_eq!(cmd, Some(ControlCommand::Emergency { stopped: true }));
    }

    // -- Equality -------------------------------------------------------------

    #[test]
    fn documents_compare_structurally() {
        let a = doc(json!({"lighting": {"preset": "auto", "enabled": true}}));
        let b: ControlDocument =
            serde_json::from_str(r#"{"lighting":{"enabled":true,"preset":"auto"}}"#).unwrap();
        assert_eq!(a, b);
        let c = doc(json!({"lighting": {"preset": "auto", "enabled": false}}));
        assert_ne!(a, c);
    }

    #[test]
    fn empty_documents() {
        assert!(doc(Value::Null).is_empty());
        assert!(doc(json!({})).is_empty());
        assert!(!doc(json!({"x": 1})).is_empty());
    }

    // -- Change events --------------------------------------------------------

    #[test]
    fn key_change_decodes_single_namespace() {
        let change = ControlChange::Key {
            key: "ventilation".into(),
            value: json!({"enabled": true}),
        };
        assert_eq!(change.commands(), vec![ControlCommand::Ventilation { enabled: true }]);
    }

    #[test]
    fn key_change_unknown_namespace_ignored() {
        let change = ControlChange::Key {
            key: "schedule".into(),
            value: json!({"enabled": true}),
        };
        assert!(change.commands().is_empty());
    }

    // -- Paths ----------------------------------------------------------------

    #[test]
    fn path_segments_split() {
        assert_eq!(path_segments("/"), Vec::<&str>::new());
        assert_eq!(path_segments(""), Vec::<&str>::new());
        assert_eq!(path_segments("/lighting"), vec!["lighting"]);
        assert_eq!(path_segments("/lighting/enabled"), vec!["lighting", "enabled"]);
        assert_eq!(path_segments("irrigation/autoMode/"), vec!["irrigation", "autoMode"]);
    }
}
