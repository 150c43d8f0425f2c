//! Build configuration
//!
//! The repository's `.kiln.json`, as resolved by the control plane and
//! shipped inside the job.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Top-level build configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Image for steps that don't name one
    #[serde(default)]
    pub image: Option<String>,
    /// Environment shared by every step
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepConfig>,
}

/// One user-defined step
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    pub key: String,
    #[serde(default)]
    pub image: Option<String>,
    /// Working directory relative to the repository checkout
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub commands: Vec<String>,
    /// Keeps the build going when the step fails
    #[serde(default)]
    pub allow_failure: bool,
}

impl BuildConfig {
    /// Parses and checks a raw configuration
    pub fn parse(raw: &str) -> Result<Self, String> {
        let config: BuildConfig =
            serde_json::from_str(raw).map_err(|e| format!("invalid build config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("build config has no steps".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.key.trim().is_empty() {
                return Err("step key cannot be empty".to_string());
            }
            if !seen.insert(step.key.as_str()) {
                return Err(format!("duplicate step key '{}'", step.key));
            }
            if step.commands.is_empty() {
                return Err(format!("step '{}' has no commands", step.key));
            }
            if step.dir.as_deref().is_some_and(|d| d.split('/').any(|p| p == "..")) {
                return Err(format!("step '{}' leaves the repository", step.key));
            }
        }
        Ok(())
    }
}
