//! `chatrelay config`: Configuration management commands.

use std::path::Path;

use chatrelay_config::AppConfig;

use super::load_config;

pub fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   Config parsed and validated");

    let warnings = warnings(&config);
    for w in &warnings {
        println!("   warning: {w}");
    }

    println!();
    println!("   Provider:  {}", config.active_provider);
    println!("   Gateway:   {}:{}", config.gateway.host, config.gateway.port);
    println!("   Context:   {}", config.context_dir().display());
    println!(
        "   History:   {} messages, {} tool rounds in full",
        config.budget.max_history_messages, config.budget.tool_rounds_kept_in_full
    );
    Ok(())
}

/// Problems that do not stop the gateway from starting.
fn warnings(config: &AppConfig) -> Vec<String> {
    let mut out = Vec::new();

    if let Some((name, provider)) = config.active() {
        if provider.family != chatrelay_core::ProviderFamily::CliSubprocess && provider.api_key.is_none() {
            out.push(format!("active provider '{name}' has no API key"));
        }
    }
    if config.gateway.host == "0.0.0.0" && config.gateway.allowed_origins.is_empty() {
        out.push("gateway is bound to all interfaces and accepts any CORS origin".into());
    }
    if !config.context_dir().exists() {
        out.push(format!(
            "context directory {} does not exist; built-in instructions will be used",
            config.context_dir().display()
        ));
    }
    out
}

pub fn show(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path).map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", redacted_toml(&config)?);
    Ok(())
}

fn redacted_toml(config: &AppConfig) -> Result<String, toml::ser::Error> {
    let mut config = config.clone();
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some("***REDACTED***".into());
        }
    }
    toml::to_string_pretty(&config)
}

pub fn print_default() {
    println!("{}", AppConfig::default_toml());
}

pub fn path(config_path: Option<&Path>) {
    match config_path {
        Some(p) => println!("{}", p.display()),
        None => println!("{}", AppConfig::config_dir().join("config.toml").display()),
    }
}
