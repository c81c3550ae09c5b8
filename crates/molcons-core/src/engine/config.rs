use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MAX_PASSES: usize = 10;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Invalid value for parameter '{0}': {1}")]
    Invalid(&'static str, String),
}

/// Iteration budgets for `Constraints::apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ApplyConfig {
    /// Passes over the ordinary constraints before giving up.
    pub max_passes: usize,
    /// Resolution passes over the molecule constraints before giving up.
    pub max_molecule_passes: usize,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_passes: DEFAULT_MAX_PASSES,
            max_molecule_passes: DEFAULT_MAX_PASSES,
        }
    }
}

#[derive(Default)]
pub struct ApplyConfigBuilder {
    max_passes: Option<usize>,
    max_molecule_passes: Option<usize>,
}

impl ApplyConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_passes(mut self, passes: usize) -> Self {
        self.max_passes = Some(passes);
        self
    }
    pub fn max_molecule_passes(mut self, passes: usize) -> Self {
        self.max_molecule_passes = Some(passes);
        self
    }

    pub fn build(self) -> Result<ApplyConfig, ConfigError> {
        let config = ApplyConfig {
            max_passes: self.max_passes.unwrap_or(DEFAULT_MAX_PASSES),
            max_molecule_passes: self.max_molecule_passes.unwrap_or(DEFAULT_MAX_PASSES),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ApplyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_passes == 0 {
            return Err(ConfigError::Invalid("max_passes", "must be at least 1".into()));
        }
        if self.max_molecule_passes == 0 {
            return Err(ConfigError::Invalid(
                "max_molecule_passes",
                "must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
