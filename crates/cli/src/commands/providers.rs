//! `chatrelay providers`: List configured providers.

use std::path::Path;

use chatrelay_config::{AppConfig, ProviderConfig};
use chatrelay_core::ProviderFamily;

use super::load_config;

pub fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path).map_err(|e| format!("Failed to load config: {e}"))?;

    println!("Configured providers (* = active)");
    println!();
    for row in provider_rows(&config) {
        println!("  {row}");
    }
    println!();
    println!("  Switch at runtime with `/provider <name>` in chat.");
    println!("  Environment: CHATRELAY_PROVIDER, CHATRELAY_MODEL, CHATRELAY_API_KEY");

    Ok(())
}

fn provider_rows(config: &AppConfig) -> Vec<String> {
    config
        .provider_names()
        .into_iter()
        .filter_map(|name| {
            let provider = config.providers.get(&name)?;
            let marker = if name == config.active_provider { "*" } else { " " };
            Some(format!(
                "{marker} {name:<14} {:<17} {:<28} {:<34} {}",
                provider.family.as_str(),
                provider.model_or_default(),
                endpoint(provider),
                readiness(&name, provider)
            ))
        })
        .collect()
}

fn endpoint(provider: &ProviderConfig) -> String {
    match provider.family {
        ProviderFamily::CliSubprocess => provider
            .executable_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(no executable)".into()),
        _ => provider.base_url(),
    }
}

fn readiness(name: &str, provider: &ProviderConfig) -> String {
    if let Err(e) = chatrelay_providers::build_provider(name, provider) {
        return format!("unavailable: {e}");
    }
    match provider.family {
        ProviderFamily::CliSubprocess => "ready".into(),
        _ if provider.api_key.is_some() => "ready".into(),
        _ => "no API key".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_provider_is_marked() {
        let mut config = AppConfig::default();
        config
            .providers
            .insert("claude".into(), ProviderConfig::new(ProviderFamily::MessageBlock));

        let rows = provider_rows(&config);
        assert_eq!(rows.len(), 2);
        let claude = rows.iter().find(|r| r.contains("claude")).unwrap();
        let openai = rows.iter().find(|r| r.contains("openai")).unwrap();
        assert!(claude.starts_with("  claude"));
        assert!(openai.starts_with("* openai"));
        assert!(claude.contains("message-block"));
    }

    #[test]
    fn cli_provider_shows_executable() {
        let mut provider = ProviderConfig::new(ProviderFamily::CliSubprocess);
        provider.executable_path = Some("/usr/local/bin/llm".into());
        assert_eq!(endpoint(&provider), "/usr/local/bin/llm");
        assert_eq!(readiness("local", &provider), "ready");
    }

    #[test]
    fn http_provider_without_key_is_flagged() {
        let provider = ProviderConfig::new(ProviderFamily::ChatCompletions);
        assert_eq!(readiness("openai", &provider), "no API key");
    }
}
