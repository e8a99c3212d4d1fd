use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::model::SOURCE;

pub const DEFAULT_REGISTRY_DB: &str = "data/registry/scraper_registry.db";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub registry_db: PathBuf,
    pub min_delay_s: f64,
    pub max_delay_s: f64,
    pub http_timeout_s: u64,
    pub user_agent: String,
    pub source: String,
}

impl Settings {
    /// Defaults, then `nexo.toml` if present, then `NEXO_*` variables.
    pub fn load() -> Result<Self> {
        Self::from_builder(
            Config::builder()
                .add_source(File::with_name("nexo").required(false))
                .add_source(Environment::with_prefix("NEXO").try_parsing(true)),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let settings: Settings = Config::builder()
            .set_default("registry_db", DEFAULT_REGISTRY_DB)?
            .set_default("min_delay_s", 0.0)?
            .set_default("max_delay_s", 0.0)?
            .set_default("http_timeout_s", 25)?
            .set_default("user_agent", DEFAULT_USER_AGENT)?
            .set_default("source", SOURCE)?
            .add_source(builder.build().context("Failed to read configuration")?)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// CLI flags win over every other layer.
    pub fn with_delays(mut self, min: Option<f64>, max: Option<f64>) -> Result<Self> {
        if let Some(min) = min {
            self.min_delay_s = min;
        }
        if let Some(max) = max {
            self.max_delay_s = max;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_registry_db(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.registry_db = path;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("min delay", self.min_delay_s), ("max delay", self.max_delay_s)] {
            if !v.is_finite() || v < 0.0 {
                bail!("{} must be a non-negative number of seconds, got {}", name, v);
            }
        }
        if self.max_delay_s < self.min_delay_s {
            bail!(
                "max delay ({}s) is lower than min delay ({}s)",
                self.max_delay_s,
                self.min_delay_s
            );
        }
        if self.http_timeout_s == 0 {
            bail!("HTTP timeout must be at least one second");
        }
        Ok(())
    }
}
