use serde::{Deserialize, Serialize};

use crate::openai::chat::types::{
    ChatCompletionFunctions, ChatCompletionRequestMessage, ChatCompletionStreamOptions,
    ChatCompletionToolChoiceMode, ChatCompletionToolChoiceOption, ChatCompletionToolDefinition,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CreateChatCompletionRequestBody {
    /// A list of messages comprising the conversation so far.
    /// Must contain at least 1 message (not enforced here).
    pub messages: Vec<ChatCompletionRequestMessage>,
    /// Requested model; resolved through the alias table when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Only valid when `stream` is true (not enforced here).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<ChatCompletionStreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatCompletionToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ChatCompletionToolChoiceOption>,
    /// Deprecated; folded into `tools`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<ChatCompletionFunctions>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl CreateChatCompletionRequestBody {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options
            .as_ref()
            .and_then(|options| options.include_usage)
            .unwrap_or(false)
    }

    /// Tool definitions from `tools` followed by legacy `functions`.
    pub fn tool_definitions(&self) -> Vec<ChatCompletionToolDefinition> {
        let mut out = self.tools.clone().unwrap_or_default();
        if let Some(functions) = &self.functions {
            out.extend(functions.iter().cloned().map(Into::into));
        }
        out
    }

    /// True when tools were supplied and `tool_choice` is not `none`.
    pub fn wants_tool_calls(&self) -> bool {
        let disabled = matches!(
            self.tool_choice,
            Some(ChatCompletionToolChoiceOption::Mode(
                ChatCompletionToolChoiceMode::None
            ))
        );
        !disabled && !self.tool_definitions().is_empty()
    }
}
