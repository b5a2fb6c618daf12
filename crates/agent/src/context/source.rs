//! Where per-request context comes from.
//!
//! [`FileContextSource`] reads a directory at the start of every request, so
//! edits show up on the next request without a restart and never mid-stream.
//!
//! Layout (every file optional):
//!
//! ```text
//! <context_dir>/
//!   instructions.md     base instructions (built-in fallback when missing)
//!   environment.md      pre-computed environment summary
//!   persona.md
//!   rules/*.md          one rule per file, or one per bullet line
//!   goals/*.md          same as rules
//!   skills/*.md         `# Name` heading, first paragraph is the summary
//!   tools.json          default tool specs when a request sends none
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chatrelay_core::context::{ContextBlock, SkillExcerpt, UserContext};
use chatrelay_core::provider::ToolDefinition;
use serde_json::Value;
use tracing::{debug, warn};

pub const INSTRUCTIONS_FILE: &str = "instructions.md";
pub const ENVIRONMENT_FILE: &str = "environment.md";
pub const PERSONA_FILE: &str = "persona.md";
pub const TOOLS_FILE: &str = "tools.json";
pub const RULES_DIR: &str = "rules";
pub const GOALS_DIR: &str = "goals";
pub const SKILLS_DIR: &str = "skills";

/// Base instructions used when none are configured.
pub fn fallback_instructions() -> String {
    concat!(
        "You are a helpful assistant embedded in the user's application. ",
        "You can call the tools provided to act on the application; the application runs them ",
        "and sends the results back in a follow-up message. ",
        "Be concise and accurate, and ask for clarification when a request is ambiguous.",
    )
    .into()
}

/// Produces a fresh context snapshot for one request.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn load(&self) -> ContextBlock;
}

/// A fixed snapshot, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticContextSource {
    block: ContextBlock,
}

impl StaticContextSource {
    pub fn new(block: ContextBlock) -> Self {
        Self { block }
    }
}

#[async_trait]
impl ContextSource for StaticContextSource {
    async fn load(&self) -> ContextBlock {
        self.block.clone()
    }
}

/// Reads the context directory on every [`load`](ContextSource::load).
#[derive(Debug, Clone)]
pub struct FileContextSource {
    dir: PathBuf,
}

impl FileContextSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read(&self, name: &str) -> Option<String> {
        read_nonempty(&self.dir.join(name)).await
    }

    async fn load_list(&self, subdir: &str) -> Vec<String> {
        let mut items = Vec::new();
        for path in markdown_files(&self.dir.join(subdir)).await {
            if let Some(content) = read_nonempty(&path).await {
                items.extend(list_items(&content));
            }
        }
        items
    }

    async fn load_skills(&self) -> Vec<SkillExcerpt> {
        let mut skills = Vec::new();
        for path in markdown_files(&self.dir.join(SKILLS_DIR)).await {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(content) = read_nonempty(&path).await {
                skills.push(parse_skill(id, &content));
            }
        }
        skills
    }

    async fn load_tools(&self) -> Vec<ToolDefinition> {
        let Some(raw) = self.read(TOOLS_FILE).await else {
            return Vec::new();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => items.iter().filter_map(ToolDefinition::from_value).collect(),
            Ok(_) => {
                warn!(file = TOOLS_FILE, "Expected a JSON array of tool specs");
                Vec::new()
            }
            Err(e) => {
                warn!(file = TOOLS_FILE, error = %e, "Failed to parse tool specs");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl ContextSource for FileContextSource {
    async fn load(&self) -> ContextBlock {
        let base_instructions = self.read(INSTRUCTIONS_FILE).await.unwrap_or_else(|| {
            debug!(dir = %self.dir.display(), "No instructions file, using fallback");
            fallback_instructions()
        });

        let block = ContextBlock {
            base_instructions,
            environment_summary: self.read(ENVIRONMENT_FILE).await.unwrap_or_default(),
            user_context: UserContext {
                rules: self.load_list(RULES_DIR).await,
                persona: self.read(PERSONA_FILE).await,
                goals: self.load_list(GOALS_DIR).await,
                skills: self.load_skills().await,
            },
            default_tools: self.load_tools().await,
        };

        debug!(
            dir = %self.dir.display(),
            rules = block.user_context.rules.len(),
            goals = block.user_context.goals.len(),
            skills = block.user_context.skills.len(),
            tools = block.default_tools.len(),
            "Context loaded"
        );
        block
    }
}

/// Read a file, treating missing, unreadable and blank files alike.
async fn read_nonempty(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if !content.trim().is_empty() => Some(content.trim().to_string()),
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Failed to read context file");
            None
        }
    }
}

/// `.md` and `.txt` files in a directory, sorted for deterministic order.
async fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut files = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                let is_text = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "md" || ext == "txt");
                if is_text {
                    files.push(path);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to list context directory");
                break;
            }
        }
    }
    files.sort();
    files
}

/// Bullet lines become separate items; otherwise the whole file is one.
fn list_items(content: &str) -> Vec<String> {
    let bullets: Vec<String> = content
        .lines()
        .filter_map(|l| {
            let l = l.trim_start();
            l.strip_prefix("- ").or_else(|| l.strip_prefix("* "))
        })
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    if bullets.is_empty() {
        vec![content.to_string()]
    } else {
        bullets
    }
}

fn parse_skill(id: &str, content: &str) -> SkillExcerpt {
    let mut lines = content.lines().peekable();
    let name = match lines.peek().and_then(|l| l.trim().strip_prefix("# ")) {
        Some(heading) => {
            let heading = heading.trim().to_string();
            lines.next();
            heading
        }
        None => id.to_string(),
    };

    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    let summary = body
        .split("\n\n")
        .next()
        .unwrap_or_default()
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" ");

    SkillExcerpt::new(id, name, summary, body)
}
