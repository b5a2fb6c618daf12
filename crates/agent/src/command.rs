//! Local slash commands answered without a provider call.
//!
//! Only the newest message is inspected, and only when it is a user message
//! starting with `/`. Anything that does not parse as a known command, with
//! the right number of arguments, falls through as ordinary chat text.

use chatrelay_core::context::SkillExcerpt;
use chatrelay_providers::ProviderRouter;
use serde_json::{Value, json};
use tracing::info;

use crate::pipeline::PipelineStatus;
use crate::settings::SettingsHandle;
use chatrelay_core::message::Conversation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    ListProviders,
    SwitchProvider(String),
    ListSkills,
    ActivateSkill(String),
    DeactivateSkill(String),
    /// Tell the client to start a fresh conversation
    NewSession,
}

impl Command {
    /// Parse one line of user text.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.trim().strip_prefix('/')?;
        let mut words = rest.split_whitespace();
        let name = words.next()?;
        let args: Vec<&str> = words.collect();

        match (name, args.as_slice()) {
            ("help", []) => Some(Self::Help),
            ("status", []) => Some(Self::Status),
            ("provider" | "providers", []) => Some(Self::ListProviders),
            ("provider", [name]) => Some(Self::SwitchProvider((*name).to_string())),
            ("skills", []) => Some(Self::ListSkills),
            ("skill", ["off", id]) => Some(Self::DeactivateSkill((*id).to_string())),
            // `off` is never a skill id
            ("skill", ["off"]) => None,
            ("skill", [id]) => Some(Self::ActivateSkill((*id).to_string())),
            ("new", []) => Some(Self::NewSession),
            _ => None,
        }
    }

    /// Command word, as reported in response metadata.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Status => "status",
            Self::ListProviders | Self::SwitchProvider(_) => "provider",
            Self::ListSkills => "skills",
            Self::ActivateSkill(_) | Self::DeactivateSkill(_) => "skill",
            Self::NewSession => "new",
        }
    }
}

/// The command in the newest message, if any.
pub fn intercept(conversation: &Conversation) -> Option<Command> {
    Command::parse(&conversation.last_user_text()?)
}

/// What a command needs to run.
pub struct CommandEnv<'a> {
    pub settings: &'a SettingsHandle,
    pub providers: &'a ProviderRouter,
    pub skills: &'a [SkillExcerpt],
    pub status: &'a PipelineStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub text: String,
    /// Sent as `messageMetadata` on the `start` event
    pub metadata: Value,
}

pub fn execute(command: &Command, env: &CommandEnv<'_>) -> CommandReply {
    let mut metadata = json!({ "local": true, "command": command.name() });

    let text = match command {
        Command::Help => HELP.to_string(),
        Command::Status => status_text(env.status),
        Command::ListProviders => {
            let current = &env.status.active_provider;
            let lines: Vec<String> = env
                .providers
                .names()
                .into_iter()
                .map(|name| {
                    let marker = if &name == current { "*" } else { " " };
                    match env.providers.get(&name) {
                        Some(p) => format!("{marker} {name} ({}, {})", p.family(), p.model()),
                        None => format!("{marker} {name}"),
                    }
                })
                .collect();
            format!("Providers:\n{}", lines.join("\n"))
        }
        Command::SwitchProvider(name) => {
            if env.providers.contains(name) {
                env.settings.set_provider(name.clone());
                info!(provider = %name, "Active provider switched");
                metadata["provider"] = json!(name);
                format!("Switched to provider `{name}`. It applies from your next message.")
            } else {
                format!(
                    "Unknown provider `{name}`. Available: {}",
                    env.providers.names().join(", ")
                )
            }
        }
        Command::ListSkills => {
            if env.skills.is_empty() {
                "No skills are available.".to_string()
            } else {
                let active = &env.status.active_skills;
                let lines: Vec<String> = env
                    .skills
                    .iter()
                    .map(|s| {
                        let marker = if active.contains(&s.id) { "*" } else { " " };
                        format!("{marker} {} (id: {}): {}", s.name, s.id, s.summary)
                    })
                    .collect();
                format!("Skills (* = active):\n{}", lines.join("\n"))
            }
        }
        Command::ActivateSkill(id) => match env.skills.iter().find(|s| &s.id == id) {
            Some(skill) => {
                if env.settings.activate_skill(id) {
                    info!(skill = %id, "Skill activated");
                    format!("Skill `{}` is now active.", skill.name)
                } else {
                    format!("Skill `{}` is already active.", skill.name)
                }
            }
            None => format!("Unknown skill `{id}`. Use /skills to list them."),
        },
        Command::DeactivateSkill(id) => {
            if env.settings.deactivate_skill(id) {
                info!(skill = %id, "Skill deactivated");
                format!("Skill `{id}` is no longer active.")
            } else {
                format!("Skill `{id}` was not active.")
            }
        }
        Command::NewSession => {
            metadata["action"] = json!("new-session");
            "Starting a new conversation.".to_string()
        }
    };

    CommandReply { text, metadata }
}

const HELP: &str = "\
Commands:
  /help              this list
  /status            active provider and budgets
  /provider          list providers
  /provider <name>   switch the active provider
  /skills            list skills
  /skill <id>        load a skill in full
  /skill off <id>    unload a skill
  /new               start a new conversation";

fn status_text(status: &PipelineStatus) -> String {
    let provider = match (&status.family, &status.model) {
        (Some(family), Some(model)) => format!("{} ({family}, model {model})", status.active_provider),
        _ => format!("{} (not available)", status.active_provider),
    };
    let skills = if status.active_skills.is_empty() {
        "none".to_string()
    } else {
        status.active_skills.join(", ")
    };
    format!(
        "Provider: {provider}\nActive skills: {skills}\nHistory: last {} messages, tool output kept for {} rounds",
        status.budget.max_history_messages, status.budget.tool_rounds_kept_in_full
    )
}
