//! Per-request system context.
//!
//! | Step | Module |
//! |------|--------|
//! | Load instructions, environment, user context | [`source`] |
//! | Cap and concatenate segments | [`assembler`] |
//! | Bound history, compact old tool output | [`history`] |

pub mod assembler;
pub mod history;
pub mod source;
pub mod text;

pub use assembler::{AssembledContext, AssemblyMetadata, SegmentStats, SkillsMode, assemble, assemble_block};
pub use history::{OMITTED_RESULT, TrimStats, trim};
pub use source::{ContextSource, FileContextSource, StaticContextSource, fallback_instructions};
