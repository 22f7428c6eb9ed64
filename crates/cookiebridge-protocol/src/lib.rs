pub mod openai;
pub mod sse;
