//! Per-request context snapshot: the text the assembler turns into the
//! system prompt.

use serde::{Deserialize, Serialize};

use crate::provider::ToolDefinition;

/// Everything read from the context source at the start of one request.
///
/// Built fresh per request and never mutated while streaming, so edits to
/// the source files take effect on the next request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub base_instructions: String,
    /// Pre-computed description of the host environment
    #[serde(default)]
    pub environment_summary: String,
    #[serde(default)]
    pub user_context: UserContext,
    /// Tools offered when the request carries none
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub skills: Vec<SkillExcerpt>,
}

impl UserContext {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
            && self.persona.as_deref().is_none_or(str::is_empty)
            && self.goals.is_empty()
            && self.skills.is_empty()
    }

    pub fn skill(&self, id: &str) -> Option<&SkillExcerpt> {
        self.skills.iter().find(|s| s.id == id)
    }
}

/// An on-demand instruction pack the user can pull into context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillExcerpt {
    pub id: String,
    pub name: String,
    /// One line shown when the full text does not fit
    pub summary: String,
    pub body: String,
    /// Activated with `/skill <id>`; kept in full even in summary mode
    #[serde(default)]
    pub pinned: bool,
}

impl SkillExcerpt {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        summary: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            summary: summary.into(),
            body: body.into(),
            pinned: false,
        }
    }
}
