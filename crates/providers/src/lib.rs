//! LLM provider adapters for ChatRelay.
//!
//! All adapters implement `chatrelay_core::Provider` and emit the same
//! `ProviderEvent` sequence regardless of wire protocol. The router builds
//! them from configuration.

pub mod anthropic;
pub mod cli;
pub mod extract;
pub mod normalize;
pub mod openai_compat;
pub mod router;

mod sse;
mod think;
mod tool_args;

pub use anthropic::AnthropicProvider;
pub use cli::CliProvider;
pub use extract::{StructuredReply, interpret_reply};
pub use normalize::{ProviderMessages, from_provider_format, to_provider_format};
pub use openai_compat::OpenAiCompatProvider;
pub use router::{ProviderRouter, build_from_config, build_provider};
