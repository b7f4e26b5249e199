//! Messages sent up to the parent agent and events coming from the local
//! notification listener.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Notification code signalling that KVM data is waiting in the data channel.
pub const KVM_DATA_READY_CODE: &str = "iAMT0052-3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    Console,
    Notify,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreInfo {
    pub state: i32,
    pub flags: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum AgentMessage {
    Msg {
        #[serde(rename = "type")]
        kind: MsgKind,
        value: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    Coreinfo {
        intelamt: CoreInfo,
    },
}

impl AgentMessage {
    pub fn console(value: impl Into<String>) -> Self {
        AgentMessage::Msg {
            kind: MsgKind::Console,
            value: value.into(),
            tag: None,
        }
    }

    pub fn notify(value: impl Into<String>) -> Self {
        AgentMessage::Msg {
            kind: MsgKind::Notify,
            value: value.into(),
            tag: Some("general".to_string()),
        }
    }

    pub fn deactivated() -> Self {
        AgentMessage::Coreinfo {
            intelamt: CoreInfo {
                state: 0,
                flags: 0,
                user: None,
                pass: None,
            },
        }
    }

    pub fn activated(user: &str, pass: &str) -> Self {
        AgentMessage::Coreinfo {
            intelamt: CoreInfo {
                state: 2,
                flags: 2,
                user: Some(user.to_string()),
                pass: Some(pass.to_string()),
            },
        }
    }
}

/// Upward channel to the parent agent process.
pub trait Notifier {
    fn send_command(&mut self, message: &AgentMessage);
}

/// Second local channel carrying user notifications; it also wakes the KVM
/// signaling poll.
pub trait NotificationChannel {
    /// Starts the listener. Connection progress arrives later as
    /// [`NotificationEvent`]s.
    fn connect(&mut self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Connected,
    Error(String),
    Notify {
        data: Option<Value>,
        text: Option<String>,
        code: Option<String>,
    },
}

/// Turns a firmware user notification into the text shown to operators.
pub fn describe_notification(message: &Value) -> Option<&'static str> {
    let body = message.get("Body")?;
    let id = body.get("MessageID")?.as_str()?;
    let arg = body.get("MessageArguments")?.get(0)?;
    let arg = match arg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match (id, arg.as_str()) {
        ("iAMT0050", "48") => Some("Intel&reg; AMT Serial-over-LAN connected"),
        ("iAMT0050", "49") => Some("Intel&reg; AMT Serial-over-LAN disconnected"),
        ("iAMT0052", "1") => Some("Intel&reg; AMT KVM connected"),
        ("iAMT0052", "2") => Some("Intel&reg; AMT KVM disconnected"),
        _ => None,
    }
}
