// Language runtime configuration for the judge worker
use anyhow::{Context, Result};
use ojudge_common::config::{default_runtimes, LanguageRuntime, LanguagesFile};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageRuntime>,
}

impl LanguageConfigManager {
    pub fn from_runtimes(runtimes: Vec<LanguageRuntime>) -> Self {
        let configs = runtimes
            .into_iter()
            .map(|runtime| (runtime.name.to_lowercase(), runtime))
            .collect();
        Self { configs }
    }

    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let languages_json: LanguagesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        if languages_json.languages.is_empty() {
            anyhow::bail!("No languages configured in {}", config_path.display());
        }

        Ok(Self::from_runtimes(languages_json.languages))
    }

    /// Load the file if it exists, otherwise fall back to the built-in runtimes
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }
        warn!(
            path = %config_path.display(),
            "Language config file not found, using built-in runtimes"
        );
        Ok(Self::from_runtimes(default_runtimes()))
    }

    /// Runtime descriptor for a language tag. An unknown tag is a configuration error.
    pub fn get_runtime(&self, language: &str) -> Result<&LanguageRuntime> {
        self.configs
            .get(&language.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("No runtime configured for language: {}", language))
    }

    pub fn runtimes(&self) -> impl Iterator<Item = &LanguageRuntime> {
        self.configs.values()
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}
