//! Builds log handlers from resolved channel records.
//!
//! A channel whose driver is [`Driver::Custom`] names a factory through its
//! `via` field. [`FactoryRegistry`] looks that factory up and asks it for a
//! [`ChannelHandler`]. Every failure here happens while the application
//! starts, never on an individual log call.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::str::FromStr;

use rusoto_core::credential::{DefaultCredentialsProvider, StaticProvider};
use rusoto_core::{HttpClient, Region};
use rusoto_logs::CloudWatchLogsClient;
use tracing_core::{Level, LevelFilter, Metadata};
use tracing_subscriber::fmt::MakeWriter;

use crate::config::{ChannelConfig, Credentials, Driver, LoggingConfig, FACTORY_ID, SDK_VERSION};
use crate::error::FactoryError;
use crate::writer::CloudWatchMakeWriterBuilder;

/// Retention periods, in days, that CloudWatch Logs accepts.
pub const ACCEPTED_RETENTION_DAYS: &[u32] = &[
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

pub trait ChannelFactory: Send + Sync {
    fn create(&self, name: &str, config: &ChannelConfig) -> Result<ChannelHandler, FactoryError>;
}

trait ErasedMakeWriter: Send + Sync {
    fn make_boxed(&self) -> Box<dyn io::Write + Send>;
    fn make_boxed_for(&self, metadata: &Metadata<'_>) -> Box<dyn io::Write + Send>;
}

impl<M> ErasedMakeWriter for M
where
    M: MakeWriter + Send + Sync,
    M::Writer: Send + 'static,
{
    fn make_boxed(&self) -> Box<dyn io::Write + Send> {
        Box::new(self.make_writer())
    }

    fn make_boxed_for(&self, metadata: &Metadata<'_>) -> Box<dyn io::Write + Send> {
        Box::new(self.make_writer_for(metadata))
    }
}

/// A built channel: its name, minimum level, and writer.
///
/// Records more verbose than the channel level are written to a sink, so
/// they never reach the underlying writer.
pub struct ChannelHandler {
    name: String,
    level: LevelFilter,
    make_writer: Box<dyn ErasedMakeWriter>,
}

impl ChannelHandler {
    pub fn new<M>(name: impl Into<String>, level: LevelFilter, make_writer: M) -> Self
    where
        M: MakeWriter + Send + Sync + 'static,
        M::Writer: Send + 'static,
    {
        Self {
            name: name.into(),
            level,
            make_writer: Box::new(make_writer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn enabled(&self, level: &Level) -> bool {
        *level <= self.level
    }
}

impl fmt::Debug for ChannelHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChannelHandler")
            .field("name", &self.name)
            .field("level", &self.level)
            .finish()
    }
}

impl MakeWriter for ChannelHandler {
    type Writer = Box<dyn io::Write + Send>;

    fn make_writer(&self) -> Self::Writer {
        self.make_writer.make_boxed()
    }

    fn make_writer_for(&self, metadata: &Metadata<'_>) -> Self::Writer {
        if self.enabled(metadata.level()) {
            self.make_writer.make_boxed_for(metadata)
        } else {
            Box::new(io::sink())
        }
    }
}

/// Factories keyed by the identifier channels name in `via`.
pub struct FactoryRegistry {
    factories: HashMap<String, Box<dyn ChannelFactory>>,
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(FACTORY_ID, CloudWatchLoggerFactory);
        registry
    }
}

impl FactoryRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, via: impl Into<String>, factory: F) -> &mut Self
    where
        F: ChannelFactory + 'static,
    {
        self.factories.insert(via.into(), Box::new(factory));
        self
    }

    pub fn build(&self, name: &str, config: &ChannelConfig) -> Result<ChannelHandler, FactoryError> {
        if config.driver != Driver::Custom {
            return Err(FactoryError::UnsupportedDriver {
                channel: name.to_string(),
                driver: config.driver,
            });
        }
        let factory = self
            .factories
            .get(&config.via)
            .ok_or_else(|| FactoryError::UnknownFactory {
                channel: name.to_string(),
                via: config.via.clone(),
            })?;
        factory.create(name, config)
    }

    /// Builds every channel, stopping at the first that fails.
    pub fn build_all(
        &self,
        logging: &LoggingConfig,
    ) -> Result<BTreeMap<String, ChannelHandler>, FactoryError> {
        logging
            .channels
            .iter()
            .map(|(name, config)| Ok((name.clone(), self.build(name, config)?)))
            .collect()
    }
}

/// Ships a channel's records to the CloudWatch Logs group and stream it names.
#[derive(Clone, Copy, Debug, Default)]
pub struct CloudWatchLoggerFactory;

impl ChannelFactory for CloudWatchLoggerFactory {
    fn create(&self, name: &str, config: &ChannelConfig) -> Result<ChannelHandler, FactoryError> {
        let level = config.level_filter()?;
        if config.sdk.version != SDK_VERSION {
            return Err(FactoryError::UnsupportedSdkVersion {
                version: config.sdk.version.clone(),
            });
        }
        let region =
            Region::from_str(&config.sdk.region).map_err(|source| FactoryError::InvalidRegion {
                region: config.sdk.region.clone(),
                source,
            })?;
        if !ACCEPTED_RETENTION_DAYS.contains(&config.retention) {
            return Err(FactoryError::InvalidRetention {
                days: config.retention,
            });
        }

        let client = cloudwatch_client(&config.sdk.credentials, region)?;
        let make_writer = CloudWatchMakeWriterBuilder::new(&config.group_name, &config.stream_name)
            .with_client(client)
            .retention_days(i64::from(config.retention))
            .build()
            .map_err(FactoryError::Runtime)?;

        tracing::info!(
            channel = name,
            log_group = make_writer.log_group(),
            log_stream = make_writer.log_stream(),
            level = %level,
            "built cloudwatch log channel"
        );
        Ok(ChannelHandler::new(name, level, make_writer))
    }
}

/// Empty key and secret defer to the default credentials chain.
fn cloudwatch_client(
    credentials: &Credentials,
    region: Region,
) -> Result<CloudWatchLogsClient, FactoryError> {
    match (credentials.key.is_empty(), credentials.secret.is_empty()) {
        (true, true) => Ok(CloudWatchLogsClient::new_with(
            HttpClient::new()?,
            DefaultCredentialsProvider::new()?,
            region,
        )),
        (false, false) => Ok(CloudWatchLogsClient::new_with(
            HttpClient::new()?,
            StaticProvider::new(
                credentials.key.clone(),
                credentials.secret.clone(),
                credentials.token.clone(),
                None,
            ),
            region,
        )),
        _ => Err(FactoryError::IncompleteCredentials),
    }
}
