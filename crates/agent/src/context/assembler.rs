//! System-context assembly.
//!
//! Builds the system text from three segments in a fixed order:
//!
//! | Segment | Source | Cap |
//! |---------|--------|-----|
//! | base instructions | `instructions.md` | `base_instructions_cap` |
//! | environment | `environment.md` | `system_context_cap` |
//! | user context | rules, persona, goals, skills | `user_context_cap` |
//!
//! Each segment, heading and separator included, is cut to its own cap
//! before concatenation, so a long early segment cannot starve a later one
//! and the total never exceeds the sum of the caps.
//!
//! # Determinism
//!
//! No clock, randomness or hash-map iteration is involved: identical inputs
//! always produce an identical string.

use chatrelay_config::BudgetConfig;
use chatrelay_core::context::{ContextBlock, SkillExcerpt, UserContext};
use serde::{Deserialize, Serialize};

use crate::context::text::truncate_to;

const SEPARATOR: &str = "\n\n";

// ── Types ─────────────────────────────────────────────────────────────────

/// The assembled system text plus what happened to each segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub system_text: String,
    pub metadata: AssemblyMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    pub segments: Vec<SegmentStats>,
    pub skills_mode: SkillsMode,
    pub total_chars: usize,
}

impl AssemblyMetadata {
    pub fn any_truncated(&self) -> bool {
        self.segments.iter().any(|s| s.truncated)
    }
}

/// Statistics for a single segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub name: String,
    /// Bytes in the final text, separator included
    pub chars: usize,
    /// Bytes before truncation
    pub original_chars: usize,
    pub cap: usize,
    pub truncated: bool,
}

/// How skills were rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillsMode {
    /// No skills available
    None,
    /// Every skill body verbatim
    Full,
    /// One line per skill, pinned skills verbatim
    Summary,
}

// ── Assembly ──────────────────────────────────────────────────────────────

/// Assemble the system text for one request.
pub fn assemble(
    base_instructions: &str,
    environment_summary: &str,
    user_context: &UserContext,
    budget: &BudgetConfig,
) -> AssembledContext {
    let (user_text, skills_mode) = render_user_context(user_context, budget.skill_full_text_threshold);

    let sources = [
        ("base_instructions", base_instructions.trim().to_string(), budget.base_instructions_cap),
        (
            "environment",
            section("Environment", environment_summary.trim()),
            budget.system_context_cap,
        ),
        ("user_context", user_text, budget.user_context_cap),
    ];

    let mut system_text = String::new();
    let mut segments = Vec::with_capacity(sources.len());

    for (name, body, cap) in sources {
        if body.is_empty() {
            segments.push(SegmentStats {
                name: name.into(),
                chars: 0,
                original_chars: 0,
                cap,
                truncated: false,
            });
            continue;
        }

        let raw = if system_text.is_empty() {
            body
        } else {
            format!("{SEPARATOR}{body}")
        };
        let (text, truncated) = truncate_to(&raw, cap);
        system_text.push_str(&text);
        segments.push(SegmentStats {
            name: name.into(),
            chars: text.len(),
            original_chars: raw.len(),
            cap,
            truncated,
        });
    }

    AssembledContext {
        metadata: AssemblyMetadata {
            total_chars: system_text.len(),
            segments,
            skills_mode,
        },
        system_text,
    }
}

/// [`assemble`] over a loaded context snapshot.
pub fn assemble_block(block: &ContextBlock, budget: &BudgetConfig) -> AssembledContext {
    assemble(
        &block.base_instructions,
        &block.environment_summary,
        &block.user_context,
        budget,
    )
}

fn section(heading: &str, body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!("## {heading}\n{body}")
    }
}

fn render_user_context(ctx: &UserContext, full_text_threshold: usize) -> (String, SkillsMode) {
    let mut parts: Vec<String> = Vec::new();

    if !ctx.rules.is_empty() {
        parts.push(format!("### Rules\n{}", bullets(&ctx.rules)));
    }
    if let Some(persona) = ctx.persona.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        parts.push(format!("### Persona\n{persona}"));
    }
    if !ctx.goals.is_empty() {
        parts.push(format!("### Goals\n{}", bullets(&ctx.goals)));
    }

    let (skills_text, mode) = render_skills(&ctx.skills, full_text_threshold);
    if !skills_text.is_empty() {
        parts.push(skills_text);
    }

    if parts.is_empty() {
        return (String::new(), mode);
    }
    (section("User context", &parts.join("\n\n")), mode)
}

fn bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|i| i.trim())
        .filter(|i| !i.is_empty())
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Skills go in verbatim while their combined bodies stay under the
/// threshold; past it each unpinned skill shrinks to one line that still
/// names its id.
fn render_skills(skills: &[SkillExcerpt], full_text_threshold: usize) -> (String, SkillsMode) {
    if skills.is_empty() {
        return (String::new(), SkillsMode::None);
    }

    let combined: usize = skills.iter().map(|s| s.body.len()).sum();
    let mode = if combined < full_text_threshold {
        SkillsMode::Full
    } else {
        SkillsMode::Summary
    };

    let mut out = String::from("### Skills\n");
    for skill in skills {
        if mode == SkillsMode::Full || skill.pinned {
            out.push_str(&format!(
                "#### {} (id: {})\n{}\n",
                skill.name,
                skill.id,
                skill.body.trim()
            ));
        } else {
            out.push_str(&format!("- {} (id: {}): {}\n", skill.name, skill.id, skill.summary.trim()));
        }
    }
    if mode == SkillsMode::Summary {
        out.push_str("Ask the user to run `/skill <id>` to load a skill's full text.\n");
    }

    (out.trim_end().to_string(), mode)
}
