use cookiebridge_protocol::openai::chat::types::{
    ChatCompletionRequestMessage, ChatCompletionToolDefinition,
};
use serde_json::json;

const TOOL_INSTRUCTIONS: &str = r#"You have access to the following tools. When you need to use a tool, respond with ONLY a JSON object in this exact format (no markdown, no extra text):

{"tool_calls": [{"id": "call_<unique_id>", "type": "function", "function": {"name": "<tool_name>", "arguments": "<json_string_of_args>"}}]}

Important:
- The "arguments" field must be a JSON string (escaped), not a raw object
- Generate a unique id like "call_abc123" for each tool call
- You can call multiple tools in one response
- If you don't need to use a tool, respond normally with text

Available tools:
"#;

/// Collapses a multi-role conversation into the single prompt string the
/// upstream accepts.
///
/// System and developer bodies are hoisted to the top; tool results and
/// assistant tool-call echoes keep their position in the dialogue. When
/// `tools` is non-empty the tool instruction block is prepended.
pub fn collapse_messages(
    messages: &[ChatCompletionRequestMessage],
    tools: &[ChatCompletionToolDefinition],
) -> String {
    let mut system_section: Vec<String> = Vec::new();
    let mut parts: Vec<String> = Vec::with_capacity(messages.len());

    for message in messages {
        match message {
            ChatCompletionRequestMessage::System(message)
            | ChatCompletionRequestMessage::Developer(message) => {
                system_section.push(message.content.to_text());
            }
            ChatCompletionRequestMessage::User(message) => {
                parts.push(format!("USER: {}", message.content.to_text()));
            }
            ChatCompletionRequestMessage::Assistant(message) => match &message.tool_calls {
                Some(calls) if !calls.is_empty() => {
                    let echoed = calls
                        .iter()
                        .map(|call| format!("Called {}(id={})", call.function().name, call.id()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    parts.push(format!("ASSISTANT: [Tool calls: {echoed}]"));
                }
                _ => {
                    let content = message
                        .content
                        .as_ref()
                        .map(|content| content.to_text())
                        .unwrap_or_default();
                    parts.push(format!("ASSISTANT: {content}"));
                }
            },
            ChatCompletionRequestMessage::Tool(message) => {
                parts.push(tool_result(
                    message.name.as_deref(),
                    message.tool_call_id.as_deref(),
                    &message.content.to_text(),
                ));
            }
            ChatCompletionRequestMessage::Function(message) => {
                parts.push(tool_result(
                    Some(&message.name),
                    None,
                    message.content.as_deref().unwrap_or_default(),
                ));
            }
        }
    }

    let dialogue = parts.join("\n");
    let base = if system_section.is_empty() {
        dialogue
    } else {
        format!("{}\n\n{}", system_section.join("\n"), dialogue)
    };

    if tools.is_empty() {
        return base;
    }
    format!("{}\n\n{}", tool_instruction_block(tools), base)
}

/// The instruction block describing the tool-call envelope followed by the
/// pretty-printed tool list. Deterministic for a given tool list.
pub fn tool_instruction_block(tools: &[ChatCompletionToolDefinition]) -> String {
    let listed: Vec<serde_json::Value> = tools
        .iter()
        .map(|tool| {
            let function = tool.function();
            json!({
                "type": "function",
                "function": {
                    "name": function.name,
                    "description": function.description,
                    "parameters": function.parameters,
                },
            })
        })
        .collect();
    // Serializing plain `Value`s cannot fail.
    let tools_json = serde_json::to_string_pretty(&listed).unwrap_or_else(|_| "[]".to_string());
    format!("{TOOL_INSTRUCTIONS}{tools_json}\n")
}

fn tool_result(name: Option<&str>, id: Option<&str>, content: &str) -> String {
    format!(
        "[Tool Result for {} (id: {})]\n{}",
        name.unwrap_or("unknown"),
        id.unwrap_or("unknown"),
        content
    )
}
