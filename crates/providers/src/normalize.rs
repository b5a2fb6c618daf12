//! Family-level message normalization.
//!
//! Each adapter owns the details of its wire shape; this module gives one
//! entry point over all three so callers (and the debug endpoint) can see
//! exactly what a family would be sent, and read it back.

use chatrelay_core::message::Message;
use chatrelay_core::provider::{ProviderFamily, ToolDefinition};
use serde::Serialize;

use crate::anthropic::{self, AnthropicMessage};
use crate::cli;
use crate::openai_compat::{self, ApiMessage};

/// A conversation in one family's wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum ProviderMessages {
    ChatCompletions { messages: Vec<ApiMessage> },
    MessageBlock {
        #[serde(skip_serializing_if = "Option::is_none")]
        system: Option<String>,
        messages: Vec<AnthropicMessage>,
    },
    #[serde(rename = "cli-subprocess")]
    CliPrompt { prompt: String },
}

impl ProviderMessages {
    pub fn family(&self) -> ProviderFamily {
        match self {
            Self::ChatCompletions { .. } => ProviderFamily::ChatCompletions,
            Self::MessageBlock { .. } => ProviderFamily::MessageBlock,
            Self::CliPrompt { .. } => ProviderFamily::CliSubprocess,
        }
    }
}

/// Convert unified messages into a family's shape.
///
/// `system` is prepended as system text. Tools only affect the CLI prompt;
/// the HTTP families send tools as a separate request field.
pub fn to_provider_format(
    system: &str,
    messages: &[Message],
    family: ProviderFamily,
    tools: &[ToolDefinition],
) -> ProviderMessages {
    // Local command echoes never reach a model
    let messages: Vec<Message> = messages.iter().filter(|m| !m.local).cloned().collect();

    match family {
        ProviderFamily::ChatCompletions => ProviderMessages::ChatCompletions {
            messages: openai_compat::to_api_messages(system, &messages),
        },
        ProviderFamily::MessageBlock => {
            let (lifted, converted) = anthropic::to_api_messages(&messages);
            let joined = [system, lifted.as_deref().unwrap_or("")]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            ProviderMessages::MessageBlock {
                system: (!joined.is_empty()).then_some(joined),
                messages: converted,
            }
        }
        ProviderFamily::CliSubprocess => ProviderMessages::CliPrompt {
            prompt: cli::render_prompt(system, &messages, tools),
        },
    }
}

/// Read a family's shape back into unified messages.
///
/// System text comes back as a leading system message.
pub fn from_provider_format(messages: &ProviderMessages) -> Vec<Message> {
    match messages {
        ProviderMessages::ChatCompletions { messages } => openai_compat::from_api_messages(messages),
        ProviderMessages::MessageBlock { system, messages } => {
            anthropic::from_api_messages(system.as_deref(), messages)
        }
        ProviderMessages::CliPrompt { prompt } => cli::parse_prompt(prompt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::message::{Part, Role};
    use serde_json::json;

    fn tool_round() -> Vec<Message> {
        vec![
            Message::user("Add a noise node"),
            Message::new(
                Role::Assistant,
                vec![
                    Part::text("On it."),
                    Part::tool_call("call_1", "add_node", json!({"kind": "noise"})),
                ],
            ),
            Message::tool_result("call_1", json!({"id": 7})),
            Message::assistant("Added node 7."),
        ]
    }

    fn with_system(messages: Vec<Message>) -> Vec<Message> {
        let mut out = vec![Message::system("Be brief.")];
        out.extend(messages);
        out
    }

    #[test]
    fn chat_completions_round_trip() {
        let shaped = to_provider_format("Be brief.", &tool_round(), ProviderFamily::ChatCompletions, &[]);
        assert_eq!(shaped.family(), ProviderFamily::ChatCompletions);
        assert_eq!(from_provider_format(&shaped), with_system(tool_round()));
    }

    #[test]
    fn serialized_tag_is_the_family_name() {
        for family in [
            ProviderFamily::ChatCompletions,
            ProviderFamily::MessageBlock,
            ProviderFamily::CliSubprocess,
        ] {
            let shaped = to_provider_format("Be brief.", &tool_round(), family, &[]);
            let value = serde_json::to_value(&shaped).unwrap();
            assert_eq!(value["family"], family.as_str());
        }
    }

    #[test]
    fn message_block_round_trip() {
        let shaped = to_provider_format("Be brief.", &tool_round(), ProviderFamily::MessageBlock, &[]);
        assert_eq!(from_provider_format(&shaped), with_system(tool_round()));
    }

    #[test]
    fn cli_round_trip() {
        let shaped = to_provider_format("Be brief.", &tool_round(), ProviderFamily::CliSubprocess, &[]);
        assert_eq!(from_provider_format(&shaped), with_system(tool_round()));
    }

    #[test]
    fn local_messages_are_not_forwarded() {
        let mut local = Message::assistant("Active provider: openai");
        local.local = true;
        let messages = vec![Message::user("/status"), local, Message::user("hello")];

        let ProviderMessages::ChatCompletions { messages } =
            to_provider_format("", &messages, ProviderFamily::ChatCompletions, &[])
        else {
            panic!("wrong family");
        };
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.role == "user"));
    }

    #[test]
    fn message_block_merges_system_sources() {
        let messages = vec![Message::system("Lifted."), Message::user("hi")];
        let ProviderMessages::MessageBlock { system, messages } =
            to_provider_format("Base.", &messages, ProviderFamily::MessageBlock, &[])
        else {
            panic!("wrong family");
        };
        assert_eq!(system.as_deref(), Some("Base.\n\nLifted."));
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn serializes_with_family_tag() {
        let shaped = to_provider_format("", &[Message::user("hi")], ProviderFamily::CliSubprocess, &[]);
        let value = serde_json::to_value(&shaped).unwrap();
        assert_eq!(value["family"], "cli-subprocess");
        assert!(value["prompt"].as_str().unwrap().contains("### user"));
    }
}
