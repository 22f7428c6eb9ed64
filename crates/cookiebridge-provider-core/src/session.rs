use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub text: String,
}

/// Per-conversation state kept between chat turns.
///
/// `metadata` is opaque to everything but the connector that produced it
/// (for the Gemini web app: conversation, response and candidate ids).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: Vec<String>,
    #[serde(default)]
    pub turns: Vec<ChatTurn>,
}

impl ChatSession {
    pub fn with_conversation_id(id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn record_exchange(&mut self, user: &str, assistant: &str) {
        self.turns.push(ChatTurn {
            role: TurnRole::User,
            text: user.to_string(),
        });
        self.turns.push(ChatTurn {
            role: TurnRole::Assistant,
            text: assistant.to_string(),
        });
    }
}
