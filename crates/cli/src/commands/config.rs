//! Configuration Commands

use std::path::Path;

use anyhow::{bail, Result};
use clap::Subcommand;
use stepwise_engine::EngineConfig;

use crate::output::{print_success, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn execute(cmd: ConfigCommands, config: &EngineConfig, path: &Path, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let rendered = match format {
                OutputFormat::Json => serde_json::to_string_pretty(config)?,
                OutputFormat::Yaml => serde_yaml::to_string(config)?,
                OutputFormat::Table | OutputFormat::Plain => config.to_toml()?,
            };
            println!("{}", rendered.trim_end());
        }

        ConfigCommands::Init { force } => {
            init(path, force)?;
            print_success(&format!("Wrote {}", path.display()));
        }
    }

    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    EngineConfig::default().save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stepwise/config.toml");

        init(&path, false).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.run.step_timeout_ms, EngineConfig::default().run.step_timeout_ms);
        assert_eq!(loaded.browser.node_binary, "node");
    }

    #[test]
    fn test_init_keeps_existing_file_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[run]\ncontinue_on_failure = true\n").unwrap();

        assert!(init(&path, false).is_err());
        assert!(EngineConfig::load(&path).unwrap().run.continue_on_failure);

        init(&path, true).unwrap();
        assert!(!EngineConfig::load(&path).unwrap().run.continue_on_failure);
    }
}
