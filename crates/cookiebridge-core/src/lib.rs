pub mod bootstrap;
pub mod chat_completion;
pub mod error;
pub mod session;
pub mod state;

pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env};
pub use chat_completion::{
    ChatCompletionReply, chat_stream_frames, create_chat_completion, list_models,
};
pub use error::{ErrorKind, SessionError, SessionResult};
pub use session::{ChatReply, ChatReplyStream, SessionPhase, UpstreamSession};
pub use state::AppState;
