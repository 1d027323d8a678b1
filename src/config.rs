use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_core::LevelFilter;

use crate::env::{self, env_or, Environment, ProcessEnv};
use crate::error::ConfigError;

pub const CHANNEL_NAME: &str = "cloudwatch";
pub const FACTORY_ID: &str = "CloudWatchLoggerFactory";

pub const DEFAULT_REGION: &str = "eu-west-1";
pub const DEFAULT_GROUP_NAME: &str = "group-log";
pub const DEFAULT_STREAM_NAME: &str = "error-log";
pub const SDK_VERSION: &str = "latest";
pub const RETENTION_DAYS: u32 = 30;
pub const LEVEL: &str = "info";

/// Strategy used to construct a channel's handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Single,
    Daily,
    Slack,
    Syslog,
    Errorlog,
    Monolog,
    Custom,
    Stack,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Single => "single",
            Driver::Daily => "daily",
            Driver::Slack => "slack",
            Driver::Syslog => "syslog",
            Driver::Errorlog => "errorlog",
            Driver::Monolog => "monolog",
            Driver::Custom => "custom",
            Driver::Stack => "stack",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
    #[serde(default)]
    pub token: Option<String>,
}

// Secrets stay out of debug output.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &redact(&self.secret))
            .field("token", &self.token.as_deref().map(redact))
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// Options handed to the SDK client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkOptions {
    pub region: String,
    pub version: String,
    pub credentials: Credentials,
}

/// A resolved log channel.
///
/// Resolved once at startup and passed by reference to whatever builds the
/// channel's handler; nothing mutates it afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub driver: Driver,
    /// Identifier of the factory that builds the handler.
    pub via: String,
    pub sdk: SdkOptions,
    /// Days the remote store should keep records.
    pub retention: u32,
    /// Minimum severity; anything more verbose is dropped.
    pub level: String,
    pub group_name: String,
    pub stream_name: String,
}

impl ChannelConfig {
    /// Resolves the `cloudwatch` channel, defaulting every unset variable.
    pub fn cloudwatch<E: Environment + ?Sized>(env: &E) -> Result<Self, ConfigError> {
        let config = Self {
            driver: Driver::Custom,
            via: FACTORY_ID.to_string(),
            sdk: SdkOptions {
                region: env_or(env, env::AWS_DEFAULT_REGION, DEFAULT_REGION)?,
                version: SDK_VERSION.to_string(),
                credentials: Credentials {
                    key: env_or(env, env::AWS_ACCESS_KEY_ID, "")?,
                    secret: env_or(env, env::AWS_SECRET_ACCESS_KEY, "")?,
                    token: None,
                },
            },
            retention: RETENTION_DAYS,
            level: LEVEL.to_string(),
            group_name: env_or(env, env::CLOUDWATCH_LOG_GROUP, DEFAULT_GROUP_NAME)?,
            stream_name: env_or(env, env::CLOUDWATCH_LOG_STREAM, DEFAULT_STREAM_NAME)?,
        };
        tracing::debug!(
            region = %config.sdk.region,
            group_name = %config.group_name,
            stream_name = %config.stream_name,
            "resolved cloudwatch log channel"
        );
        Ok(config)
    }

    pub fn cloudwatch_from_env() -> Result<Self, ConfigError> {
        Self::cloudwatch(&ProcessEnv)
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.level).map_err(|_| ConfigError::InvalidLevel {
            level: self.level.clone(),
        })
    }
}

/// Named log channels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl LoggingConfig {
    pub fn resolve<E: Environment + ?Sized>(env: &E) -> Result<Self, ConfigError> {
        let mut channels = BTreeMap::new();
        channels.insert(CHANNEL_NAME.to_string(), ChannelConfig::cloudwatch(env)?);
        Ok(Self { channels })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(&ProcessEnv)
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.get(name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Malformed(&'static str);

    impl Environment for Malformed {
        fn var(&self, key: &str) -> Result<Option<String>, ConfigError> {
            if key == self.0 {
                Err(ConfigError::NotUnicode {
                    var: key.to_string(),
                })
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn defaults_without_environment() {
        let config = ChannelConfig::cloudwatch(&vars(&[])).unwrap();
        assert_eq!(config.driver, Driver::Custom);
        assert_eq!(config.via, "CloudWatchLoggerFactory");
        assert_eq!(config.sdk.region, "eu-west-1");
        assert_eq!(config.sdk.version, "latest");
        assert_eq!(config.sdk.credentials.key, "");
        assert_eq!(config.sdk.credentials.secret, "");
        assert_eq!(config.sdk.credentials.token, None);
        assert_eq!(config.retention, 30);
        assert_eq!(config.level, "info");
        assert_eq!(config.group_name, "group-log");
        assert_eq!(config.stream_name, "error-log");
    }

    #[test]
    fn group_override_leaves_the_rest() {
        let defaults = ChannelConfig::cloudwatch(&vars(&[])).unwrap();
        let config =
            ChannelConfig::cloudwatch(&vars(&[(env::CLOUDWATCH_LOG_GROUP, "prod-logs")])).unwrap();
        assert_eq!(config.group_name, "prod-logs");
        assert_eq!(
            config,
            ChannelConfig {
                group_name: "prod-logs".to_string(),
                ..defaults
            }
        );
    }

    #[test]
    fn present_variables_are_taken_verbatim() {
        let env = vars(&[
            (env::AWS_DEFAULT_REGION, "us-east-2"),
            (env::AWS_ACCESS_KEY_ID, "AKIAEXAMPLE"),
            (env::AWS_SECRET_ACCESS_KEY, "s3cr3t/+="),
            (env::CLOUDWATCH_LOG_GROUP, "/app/Prod"),
            (env::CLOUDWATCH_LOG_STREAM, "web 01"),
        ]);
        let config = ChannelConfig::cloudwatch(&env).unwrap();
        assert_eq!(config.sdk.region, "us-east-2");
        assert_eq!(config.sdk.credentials.key, "AKIAEXAMPLE");
        assert_eq!(config.sdk.credentials.secret, "s3cr3t/+=");
        assert_eq!(config.group_name, "/app/Prod");
        assert_eq!(config.stream_name, "web 01");
    }

    #[test]
    fn driver_and_level_ignore_environment() {
        let env = vars(&[("LOG_LEVEL", "debug"), ("LOG_CHANNEL", "stack")]);
        let config = ChannelConfig::cloudwatch(&env).unwrap();
        assert_eq!(config.driver, Driver::Custom);
        assert_eq!(config.level, "info");
        assert_eq!(config.level_filter().unwrap(), LevelFilter::INFO);
    }

    #[test]
    fn malformed_variable_fails_resolution() {
        let err = ChannelConfig::cloudwatch(&Malformed(env::CLOUDWATCH_LOG_STREAM)).unwrap_err();
        assert!(matches!(err, ConfigError::NotUnicode { ref var } if var == "CLOUDWATCH_LOG_STREAM"));
    }

    #[test]
    fn invalid_level_is_rejected() {
        let mut config = ChannelConfig::cloudwatch(&vars(&[])).unwrap();
        config.level = "loud".to_string();
        assert!(matches!(
            config.level_filter(),
            Err(ConfigError::InvalidLevel { .. })
        ));
    }

    #[test]
    fn logging_config_holds_cloudwatch_channel() {
        let logging = LoggingConfig::resolve(&vars(&[])).unwrap();
        assert_eq!(logging.channels.len(), 1);
        assert_eq!(
            logging.channel(CHANNEL_NAME).map(|c| c.stream_name.as_str()),
            Some("error-log")
        );
    }

    #[test]
    fn serialized_shape_uses_channel_keys() {
        let config = ChannelConfig::cloudwatch(&vars(&[])).unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "driver": "custom",
                "via": "CloudWatchLoggerFactory",
                "sdk": {
                    "region": "eu-west-1",
                    "version": "latest",
                    "credentials": { "key": "", "secret": "", "token": null }
                },
                "retention": 30,
                "level": "info",
                "group_name": "group-log",
                "stream_name": "error-log"
            })
        );
    }

    #[test]
    fn token_is_optional_when_deserializing() {
        let config: ChannelConfig = serde_json::from_str(
            r#"{
                "driver": "custom",
                "via": "CloudWatchLoggerFactory",
                "sdk": {
                    "region": "eu-west-1",
                    "version": "latest",
                    "credentials": { "key": "k", "secret": "s" }
                },
                "retention": 30,
                "level": "info",
                "group_name": "group-log",
                "stream_name": "error-log"
            }"#,
        )
        .unwrap();
        assert_eq!(config.sdk.credentials.token, None);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let credentials = Credentials {
            key: "AKIAEXAMPLE".to_string(),
            secret: "hunter2".to_string(),
            token: Some("session".to_string()),
        };
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("AKIAEXAMPLE"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("session"));
    }
}
