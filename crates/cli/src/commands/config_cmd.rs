//! `colloquy config`: configuration management commands.

use clap::Subcommand;
use colloquy_config::AppConfig;
use std::path::Path;

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (API key masked)
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
    /// Load and validate the configuration
    Validate,
}

pub fn run(config_path: &Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => show(config_path),
        ConfigAction::Init { force } => init(config_path, force),
        ConfigAction::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
        ConfigAction::Validate => validate(config_path),
    }
}

fn show(config_path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load_at(config_path)?;
    println!("{}", toml::to_string_pretty(&config.redacted())?);
    Ok(())
}

/// Returns whether a file was written.
fn write_default(config_path: &Path, force: bool) -> anyhow::Result<bool> {
    if config_path.exists() && !force {
        return Ok(false);
    }
    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(config_path, AppConfig::default_toml())?;
    Ok(true)
}

fn init(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if write_default(config_path, force)? {
        println!("Created {}", config_path.display());
        println!();
        println!("Next steps:");
        println!("  1. Set COLLOQUY_API_KEY (or add api_key under [model])");
        println!("  2. Run: colloquy chat");
    } else {
        println!("Config already exists at {}", config_path.display());
        println!("Edit it manually or re-run with --force.");
    }
    Ok(())
}

fn validate(config_path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load_at(config_path)?;
    println!("Config OK: {}", config_path.display());

    let mut warnings = Vec::new();
    if !config.has_api_key() {
        warnings.push("No API key set (COLLOQUY_API_KEY or OPENAI_API_KEY)");
    }
    if config.retrieval.enabled && config.retrieval.documents_path.is_none() {
        warnings.push("retrieval.enabled without retrieval.documents_path");
    }
    if config.validation.enabled && !config.retrieval.enabled {
        warnings.push("validation without retrieval: evaluators judge against empty context");
    }
    for w in &warnings {
        println!("  warning: {w}");
    }

    println!();
    println!("  Model:     {}", config.model.model);
    println!("  Advisors:  {}", config.pipeline.advisors.join(", "));
    println!("  Memory:    {:?} (window {})", config.memory.backend, config.memory.window);
    println!("  Tools:     {}", config.tools.enabled.join(", "));
    Ok(())
}
