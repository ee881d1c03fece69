//! Lyra Core Runtime
//!
//! Shared runtime types for the Lyra voice agent:
//!
//! - Error types and `Result` alias
//! - Provider credential resolution (settings value, then named env var)
//! - Agent reply streaming with incremental block reads
//! - Tool (function-calling) registry
//! - Bounded conversation log

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conversation;
pub mod error;
pub mod function_calling;
pub mod streaming;

pub use config::{has_api_key, load_env, resolve_api_key};
pub use conversation::{ConversationLog, ConversationTurn, TurnRole, DEFAULT_MAX_TURNS};
pub use error::{LyraError, Result};
pub use function_calling::{
    create_tool_definition, ToolCall, ToolDefinition, ToolHandler, ToolRegistry,
};
pub use streaming::{create_text_stream, drain_reply, ReplyReader, TextChunk, TextStream, TextStreamSender};
