use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};
use serde::de::DeserializeOwned;

use crate::config::{
    models::{OperatorConfig, ResolverConfig},
    validation::ConfigValidator,
};

fn file_format(config_path: &Path) -> FileFormat {
    match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    }
}

/// Build settings from an optional file layered under the process
/// environment. Environment variables win.
pub fn load_settings<T: DeserializeOwned>(config_path: Option<&str>) -> Result<T> {
    let mut builder = Config::builder();
    if let Some(config_path) = config_path {
        let path = Path::new(config_path);
        builder = builder.add_source(File::new(config_path, file_format(path)).required(true));
    }
    let settings = builder
        .add_source(Environment::default().try_parsing(true))
        .build()
        .with_context(|| format!("Failed to build config from {config_path:?}"))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {config_path:?}"))
}

/// Load and validate the resolver configuration
pub fn load_resolver_config(config_path: Option<&str>) -> Result<ResolverConfig> {
    let config: ResolverConfig = load_settings(config_path)?;
    ConfigValidator::validate_resolver(&config).context("Invalid resolver configuration")?;
    Ok(config)
}

/// Load and validate the operator configuration
pub fn load_operator_config(config_path: Option<&str>) -> Result<OperatorConfig> {
    let config: OperatorConfig = load_settings(config_path)?;
    ConfigValidator::validate_operator(&config).context("Invalid operator configuration")?;
    Ok(config)
}
