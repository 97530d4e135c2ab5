//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use stepwise_common::BrowserKind;

use crate::driver::LaunchOptions;
use crate::playwright::NodeSettings;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Run behaviour
    pub run: RunConfig,

    /// Browser and Playwright bridge settings
    pub browser: BrowserConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: stepwise_common::default_store_path(),
            run: RunConfig::default(),
            browser: BrowserConfig::default(),
        }
    }
}

/// Run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Budget for a single step
    pub step_timeout_ms: u64,

    /// Budget for the initial navigation to the project base URL
    pub navigation_timeout_ms: u64,

    /// Keep executing after a failed step
    pub continue_on_failure: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 15_000,
            navigation_timeout_ms: 30_000,
            continue_on_failure: false,
        }
    }
}

/// Browser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Browser used when a run does not name one
    pub default_browser: BrowserKind,

    pub headless: bool,

    /// Node.js binary that hosts the Playwright bridge
    pub node_binary: String,

    /// npx binary used to install browser engines
    pub npx_binary: String,

    /// Directory containing the `playwright` package, exported as NODE_PATH
    pub node_path: Option<PathBuf>,

    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            default_browser: BrowserKind::Chromium,
            headless: true,
            node_binary: "node".to_string(),
            npx_binary: "npx".to_string(),
            node_path: None,
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

impl BrowserConfig {
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            headless: self.headless,
            viewport_width: self.viewport_width,
            viewport_height: self.viewport_height,
            executable_path: None,
        }
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            node_binary: self.node_binary.clone(),
            npx_binary: self.npx_binary.clone(),
            node_path: self.node_path.clone(),
        }
    }
}

/// Settings a run reads when it starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub step_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    pub continue_on_failure: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        RunConfig::default().into()
    }
}

impl From<RunConfig> for RunSettings {
    fn from(run: RunConfig) -> Self {
        Self {
            step_timeout_ms: run.step_timeout_ms,
            navigation_timeout_ms: run.navigation_timeout_ms,
            continue_on_failure: run.continue_on_failure,
        }
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Render as the TOML that `load` reads
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Get the artifacts root
    pub fn artifacts_dir(&self) -> PathBuf {
        self.store_path.join("artifacts")
    }

    pub fn run_settings(&self) -> RunSettings {
        self.run.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.run.step_timeout_ms, 15_000);
        assert_eq!(config.browser.default_browser, BrowserKind::Chromium);
        assert!(!config.run.continue_on_failure);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "store_path = \"/tmp/stepwise\"\n[run]\ncontinue_on_failure = true\n[browser]\ndefault_browser = \"firefox\"\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert!(config.run.continue_on_failure);
        assert_eq!(config.run.navigation_timeout_ms, 30_000);
        assert_eq!(config.browser.default_browser, BrowserKind::Firefox);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/stepwise/state.db"));
        assert_eq!(config.artifacts_dir(), PathBuf::from("/tmp/stepwise/artifacts"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = EngineConfig::default();
        config.browser.node_path = Some(PathBuf::from("/opt/pw/node_modules"));
        config.run.step_timeout_ms = 5_000;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.browser.node_path, config.browser.node_path);
        assert_eq!(loaded.run_settings().step_timeout_ms, 5_000);
    }
}
