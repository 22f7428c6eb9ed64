//! Text-level transforms between the OpenAI chat protocol and a plain-text
//! upstream: prompt collapsing, tool-call recovery and SSE framing.

pub mod prompt;
mod repair;
pub mod stream;
pub mod tool_calls;

pub use prompt::{collapse_messages, tool_instruction_block};
pub use stream::{ChatCompletionStreamFramer, encode_chunk, segment_text};
pub use tool_calls::{Extraction, ToolCall, extract, extract_tool_calls};
