//! The control plane's wire shapes (spec §4.7, §6). `ControlRequest` is
//! what a peer sends in: the single `COMMAND` request envelope, whether it
//! arrives as a `POST /api` body or as inbound WebSocket text.
//! `ControlMessage` is what the control plane pushes back out over the
//! WebSocket: a stage's `NOTIFY` response array, or a `DASHBOARD` envelope
//! mirroring spec §4.7's `{class, id, kind, value}` shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "UPPERCASE")]
pub enum ControlRequest {
    Command {
        node: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "UPPERCASE")]
pub enum ControlMessage {
    Notify {
        node: String,
        args: Vec<Value>,
    },
    Dashboard {
        #[serde(default)]
        node: String,
        args: Vec<Value>,
    },
}

impl ControlMessage {
    pub fn notify(node: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Notify {
            node: node.into(),
            args,
        }
    }

    /// Build a DASHBOARD event. `node` is always the empty string on the
    /// wire (spec §6: `{response:"DASHBOARD", node:"", args:[type,id,kind,value]}`);
    /// the block's own id travels inside `args` instead.
    pub fn dashboard(
        class: impl Into<String>,
        id: impl Into<String>,
        kind: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::Dashboard {
            node: String::new(),
            args: vec![
                Value::String(class.into()),
                Value::String(id.into()),
                Value::String(kind.into()),
                value,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_request_round_trips_through_json() {
        let msg = ControlRequest::Command {
            node: "vad1".into(),
            args: vec![json!("mute")],
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"request\":\"COMMAND\""));
        let back: ControlRequest = serde_json::from_str(&text).unwrap();
        match back {
            ControlRequest::Command { node, args } => {
                assert_eq!(node, "vad1");
                assert_eq!(args, vec![json!("mute")]);
            }
        }
    }

    #[test]
    fn notify_serialises_to_the_documented_response_shape() {
        let msg = ControlMessage::notify("trace", vec![json!("mute")]);
        let text = serde_json::to_string(&msg).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["response"], json!("NOTIFY"));
        assert_eq!(value["node"], json!("trace"));
        assert_eq!(value["args"], json!(["mute"]));
    }

    #[test]
    fn dashboard_serialises_to_the_documented_response_shape() {
        let msg = ControlMessage::dashboard("audio", "vad1", "final", json!(0.42));
        let text = serde_json::to_string(&msg).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["response"], json!("DASHBOARD"));
        assert_eq!(value["node"], json!(""));
        assert_eq!(value["args"], json!(["audio", "vad1", "final", 0.42]));
    }
}
