//! Environment lookup for channel resolution.
//!
//! Resolution reads through the [`Environment`] trait so a record can be
//! resolved from the process environment or from any map of values.

use std::collections::HashMap;
use std::env;

use crate::error::ConfigError;

pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const CLOUDWATCH_LOG_GROUP: &str = "CLOUDWATCH_LOG_GROUP";
pub const CLOUDWATCH_LOG_STREAM: &str = "CLOUDWATCH_LOG_STREAM";

/// Source of optional string variables.
pub trait Environment {
    /// Returns `Ok(None)` when `key` is not set.
    fn var(&self, key: &str) -> Result<Option<String>, ConfigError>;
}

/// The environment of the running process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match env::var_os(key) {
            None => Ok(None),
            Some(value) => value
                .into_string()
                .map(Some)
                .map_err(|_| ConfigError::NotUnicode {
                    var: key.to_string(),
                }),
        }
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.get(key).cloned())
    }
}

impl<E: Environment + ?Sized> Environment for &E {
    fn var(&self, key: &str) -> Result<Option<String>, ConfigError> {
        (**self).var(key)
    }
}

/// Reads `key`, falling back to `default` only when the variable is unset.
/// A set but empty variable stays empty.
pub fn env_or<E: Environment + ?Sized>(
    env: &E,
    key: &str,
    default: &str,
) -> Result<String, ConfigError> {
    Ok(env.var(key)?.unwrap_or_else(|| default.to_string()))
}
