use std::convert::Infallible;
use std::io;

use rusoto_core::credential::CredentialsError;
use rusoto_core::region::ParseRegionError;
use rusoto_core::request::TlsError;
use rusoto_core::RusotoError;
use rusoto_logs::{
    CreateLogGroupError, CreateLogStreamError, PutLogEventsError, PutRetentionPolicyError,
};

use crate::config::Driver;

/// Failure while resolving a channel record from its environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {var} is not valid unicode")]
    NotUnicode { var: String },
    #[error("invalid log level {level:?}")]
    InvalidLevel { level: String },
}

/// Failure while turning a resolved channel record into a handler.
///
/// These are startup errors: a channel that fails to build never accepts a
/// record.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("channel {channel:?} uses driver {driver:?}, only custom channels can be built")]
    UnsupportedDriver { channel: String, driver: Driver },
    #[error("channel {channel:?} names unknown factory {via:?}")]
    UnknownFactory { channel: String, via: String },
    #[error("invalid region {region:?}")]
    InvalidRegion {
        region: String,
        #[source]
        source: ParseRegionError,
    },
    #[error("unsupported sdk version {version:?}")]
    UnsupportedSdkVersion { version: String },
    #[error("CloudWatch does not accept a retention of {days} days")]
    InvalidRetention { days: u32 },
    #[error("credentials need both a key and a secret, or neither")]
    IncompleteCredentials,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up http client: {0}")]
    Tls(#[from] TlsError),
    #[error("failed to set up credentials provider: {0}")]
    Credentials(#[from] CredentialsError),
    #[error("failed to start log delivery runtime: {0}")]
    Runtime(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
}

/// Delivery failure reported by a CloudWatch Logs call.
#[derive(Debug, thiserror::Error)]
pub enum CloudWatchLogsError {
    #[error(transparent)]
    Transport(RusotoError<Infallible>),
    #[error(transparent)]
    CreateLogGroup(CreateLogGroupError),
    #[error(transparent)]
    PutRetentionPolicy(PutRetentionPolicyError),
    #[error(transparent)]
    CreateLogStream(CreateLogStreamError),
    #[error(transparent)]
    PutLogEvents(PutLogEventsError),
}

/// Separates the operation specific error from the errors every call shares.
fn split_service<E>(error: RusotoError<E>) -> Result<E, RusotoError<Infallible>> {
    match error {
        RusotoError::Service(err) => Ok(err),
        RusotoError::HttpDispatch(err) => Err(RusotoError::HttpDispatch(err)),
        RusotoError::Credentials(err) => Err(RusotoError::Credentials(err)),
        RusotoError::Validation(msg) => Err(RusotoError::Validation(msg)),
        RusotoError::ParseError(msg) => Err(RusotoError::ParseError(msg)),
        RusotoError::Unknown(resp) => Err(RusotoError::Unknown(resp)),
        RusotoError::Blocking => Err(RusotoError::Blocking),
    }
}

macro_rules! from_rusoto_error {
    ($($service:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<RusotoError<$service>> for CloudWatchLogsError {
                fn from(error: RusotoError<$service>) -> Self {
                    match split_service(error) {
                        Ok(err) => Self::$variant(err),
                        Err(err) => Self::Transport(err),
                    }
                }
            }
        )*
    };
}

from_rusoto_error! {
    CreateLogGroupError => CreateLogGroup,
    PutRetentionPolicyError => PutRetentionPolicy,
    CreateLogStreamError => CreateLogStream,
    PutLogEventsError => PutLogEvents,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_keep_their_operation() {
        let error: CloudWatchLogsError = RusotoError::Service(
            PutLogEventsError::InvalidSequenceToken("stale".to_string()),
        )
        .into();
        assert!(matches!(
            error,
            CloudWatchLogsError::PutLogEvents(PutLogEventsError::InvalidSequenceToken(_))
        ));
    }

    #[test]
    fn shared_errors_become_transport() {
        let error: CloudWatchLogsError =
            RusotoError::<CreateLogStreamError>::Validation("bad name".to_string()).into();
        assert!(matches!(
            error,
            CloudWatchLogsError::Transport(RusotoError::Validation(_))
        ));
    }
}
