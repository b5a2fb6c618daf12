//! The request pipeline for ChatRelay.
//!
//! Each chat request is one stateless step of a client-driven agent loop:
//!
//! 1. **Parse** the client's full history ([`inbound`])
//! 2. **Intercept** local slash commands ([`command`])
//! 3. **Build context**: system text from instructions, environment and user
//!    context, plus a bounded history ([`context`])
//! 4. **Stream** the active provider's answer as wire events ([`encoder`])
//! 5. **Finish** with `tool-calls` when the client should run tools and resubmit
//!
//! [`ChatPipeline`] drives the steps; nothing is stored between requests.

pub mod command;
pub mod context;
pub mod encoder;
pub mod inbound;
pub mod pipeline;
pub mod settings;

pub use command::{Command, CommandReply};
pub use context::{
    AssembledContext, AssemblyMetadata, ContextSource, FileContextSource, SegmentStats, SkillsMode,
    StaticContextSource, TrimStats,
};
pub use encoder::StreamEncoder;
pub use inbound::ChatRequest;
pub use pipeline::{ChatPipeline, ContextPreview, PipelineStatus, RequestContext, RequestPhase};
pub use settings::{RuntimeSettings, SettingsHandle};
