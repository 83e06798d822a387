//! Layered configuration loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`{PREFIX}SECTION__FIELD`)
//! 2. YAML file
//! 3. `T::default()`

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::error::Result;

/// Nested keys in environment variables are separated by `__`
pub const ENV_SPLIT: &str = "__";

pub fn load_config<T>(file: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    match file {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        },
        Some(path) => warn!("Config file {} not found, using defaults", path.display()),
        None => {},
    }

    let config = figment
        .merge(Env::prefixed(env_prefix).split(ENV_SPLIT))
        .extract()?;
    Ok(config)
}
