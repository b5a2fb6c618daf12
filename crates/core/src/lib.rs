//! # ChatRelay Core
//!
//! Domain types, traits, and error definitions for the ChatRelay gateway.
//! This crate has **no HTTP or runtime dependencies** beyond channels; it
//! defines the model every other crate speaks:
//!
//! - [`Message`] / [`Part`]: the unified conversation representation
//! - [`Provider`]: the streaming strategy interface, one impl per [`ProviderFamily`]
//! - [`ProviderEvent`]: what adapters emit, identical across families
//! - [`StreamEvent`]: the outbound wire protocol the client consumes

pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use context::{ContextBlock, SkillExcerpt, UserContext};
pub use error::{Error, ProtocolError, ProviderError, Result};
pub use event::{DONE_SENTINEL, StreamEvent, StreamValidator};
pub use message::{Conversation, Message, Part, Role};
pub use provider::{
    EventReceiver, FinishReason, Provider, ProviderEvent, ProviderFamily, ProviderRequest,
    ToolDefinition,
};
