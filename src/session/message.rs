//! Wire envelope exchanged with the browser terminal.
//!
//! ```json
//! { "type": "stdin" | "stdout" | "resize", "data": "...", "height": 40, "width": 120 }
//! ```

use serde::{Deserialize, Serialize};

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Stdin,
    Stdout,
    Resize,
    /// Any tag this server does not handle. Never serialized by us.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u16>,
}

impl RelayMessage {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Stdout,
            data: data.into(),
            height: None,
            width: None,
        }
    }

    pub fn stdin(data: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Stdin,
            ..Self::stdout(data)
        }
    }

    pub fn resize(height: u16, width: u16) -> Self {
        Self {
            kind: MessageKind::Resize,
            data: String::new(),
            height: Some(height),
            width: Some(width),
        }
    }

    /// Serialize for a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
