//! A `cloudwatch` log channel for `tracing` subscribers.
//!
//! The channel record is resolved once from the environment, then handed to
//! the factory it names, which returns a [`ChannelHandler`] usable as a
//! `tracing_subscriber` writer:
//!
//! ```no_run
//! # fn main() -> Result<(), cloudwatch_log_channel::Error> {
//! let handler = cloudwatch_log_channel::cloudwatch_channel()?;
//! tracing_subscriber::fmt()
//!     .with_max_level(handler.level())
//!     .with_writer(handler)
//!     .init();
//! # Ok(())
//! # }
//! ```

mod config;
mod env;
mod error;
mod factory;
mod worker;
mod writer;

const CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH: usize = 10_000;
const CLOUDWATCH_MAX_BATCH_SIZE: usize = 1024 * 1024;
const CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE: usize = 26;
const CLOUDWATCH_MAX_BATCH_SPAN_MILLIS: i64 = 24 * 60 * 60 * 1000;

pub use config::{
    ChannelConfig, Credentials, Driver, LoggingConfig, SdkOptions, CHANNEL_NAME, FACTORY_ID,
};
pub use env::{Environment, ProcessEnv};
pub use error::{CloudWatchLogsError, ConfigError, Error, FactoryError};
pub use factory::{ChannelFactory, ChannelHandler, CloudWatchLoggerFactory, FactoryRegistry};
pub use writer::{CloudWatchMakeWriter, CloudWatchMakeWriterBuilder, CloudWatchWriter};

pub mod vars {
    pub use crate::env::{
        AWS_ACCESS_KEY_ID, AWS_DEFAULT_REGION, AWS_SECRET_ACCESS_KEY, CLOUDWATCH_LOG_GROUP,
        CLOUDWATCH_LOG_STREAM,
    };
}

pub fn writer(log_group: &str, log_stream: &str) -> CloudWatchMakeWriterBuilder<()> {
    CloudWatchMakeWriterBuilder::new(log_group, log_stream)
}

/// Resolves the `cloudwatch` channel from the process environment and builds
/// it with the default factories.
pub fn cloudwatch_channel() -> Result<ChannelHandler, Error> {
    let config = ChannelConfig::cloudwatch_from_env()?;
    Ok(FactoryRegistry::default().build(CHANNEL_NAME, &config)?)
}
