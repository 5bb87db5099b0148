//! Provider clients for chat streaming, title generation, and file summaries.

mod anthropic;
mod error;
mod factory;
mod openai;
mod provider;
mod sse;
mod types;

pub use anthropic::AnthropicClient;
pub use error::LlmError;
pub use factory::{ClientFactory, ProviderFactory, SessionClients};
pub use openai::OpenAiCompatibleClient;
pub use provider::{ChatModel, TitleModel};
pub use types::{ChatMessage, ChatRequest, ChatStream, StreamEvent, to_wire};
