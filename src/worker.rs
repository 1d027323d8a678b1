use std::sync::Arc;
use std::time::Duration;

use async_recursion::async_recursion;
use rusoto_core::RusotoError;
use rusoto_logs::{
    CloudWatchLogs, CreateLogGroupError, CreateLogGroupRequest, CreateLogStreamError,
    CreateLogStreamRequest, InputLogEvent, PutLogEventsError, PutLogEventsRequest,
    PutRetentionPolicyRequest,
};
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout_at, Instant};

use crate::error::CloudWatchLogsError;
use crate::{
    CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE, CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH,
    CLOUDWATCH_MAX_BATCH_SIZE, CLOUDWATCH_MAX_BATCH_SPAN_MILLIS,
};

pub(crate) const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const SEQUENCE_TOKEN_RETRIES: usize = 3;

/// Where a worker delivers its events.
#[derive(Clone, Debug)]
pub(crate) struct StreamTarget {
    pub(crate) log_group: String,
    pub(crate) log_stream: String,
    pub(crate) retention_days: Option<i64>,
}

/// Events waiting for the next `PutLogEvents` call.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    events: Vec<InputLogEvent>,
    size: usize,
    oldest: i64,
    newest: i64,
}

fn event_size(event: &InputLogEvent) -> usize {
    event.message.len() + CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE
}

impl Batch {
    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether `event` can join without breaking a `PutLogEvents` limit.
    pub(crate) fn fits(&self, event: &InputLogEvent) -> bool {
        if self.events.is_empty() {
            return true;
        }
        let oldest = self.oldest.min(event.timestamp);
        let newest = self.newest.max(event.timestamp);
        self.events.len() < CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH
            && self.size + event_size(event) <= CLOUDWATCH_MAX_BATCH_SIZE
            && newest - oldest <= CLOUDWATCH_MAX_BATCH_SPAN_MILLIS
    }

    pub(crate) fn push(&mut self, event: InputLogEvent) {
        if self.events.is_empty() {
            self.oldest = event.timestamp;
            self.newest = event.timestamp;
        } else {
            self.oldest = self.oldest.min(event.timestamp);
            self.newest = self.newest.max(event.timestamp);
        }
        self.size += event_size(&event);
        self.events.push(event);
    }

    /// Empties the batch, returning its events in chronological order.
    pub(crate) fn take(&mut self) -> Vec<InputLogEvent> {
        let mut events = std::mem::take(&mut self.events);
        self.size = 0;
        events.sort_by_key(|event| event.timestamp);
        events
    }
}

/// Extracts the token CloudWatch names in an `InvalidSequenceToken` or
/// `DataAlreadyAccepted` message.
pub(crate) fn expected_sequence_token(message: &str) -> Option<String> {
    let token = message.rsplit(':').next()?.trim();
    if token.is_empty() || token == "null" || token.contains(' ') {
        None
    } else {
        Some(token.to_string())
    }
}

pub(crate) struct Worker<C> {
    client: Arc<C>,
    target: StreamTarget,
    sequence_token: Option<String>,
    prepared: bool,
}

impl<C> Worker<C>
where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    pub(crate) fn new(client: Arc<C>, target: StreamTarget) -> Self {
        Self {
            client,
            target,
            sequence_token: None,
            prepared: false,
        }
    }

    /// Batches events until the channel closes, then flushes what is left.
    pub(crate) async fn run(mut self, mut receiver: Receiver<InputLogEvent>) {
        let mut batch = Batch::default();
        let mut deadline = Instant::now() + FLUSH_INTERVAL;
        loop {
            let next = if batch.is_empty() {
                receiver.recv().await
            } else {
                match timeout_at(deadline, receiver.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.flush(&mut batch).await;
                        continue;
                    }
                }
            };
            match next {
                Some(event) => {
                    if !batch.fits(&event) {
                        self.flush(&mut batch).await;
                    }
                    if batch.is_empty() {
                        deadline = Instant::now() + FLUSH_INTERVAL;
                    }
                    batch.push(event);
                }
                None => {
                    self.flush(&mut batch).await;
                    break;
                }
            }
        }
    }

    async fn flush(&mut self, batch: &mut Batch) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(err) = self.deliver(batch.take()).await {
            eprintln!(
                "Failed to deliver {} log events to {}/{}: {}",
                count, self.target.log_group, self.target.log_stream, err
            );
        }
    }

    pub(crate) async fn deliver(
        &mut self,
        events: Vec<InputLogEvent>,
    ) -> Result<(), CloudWatchLogsError> {
        if !self.prepared {
            self.prepare().await?;
            self.prepared = true;
        }
        self.put(events, SEQUENCE_TOKEN_RETRIES).await
    }

    /// Creates the group and stream if missing and applies the retention.
    async fn prepare(&self) -> Result<(), CloudWatchLogsError> {
        let group = CreateLogGroupRequest {
            log_group_name: self.target.log_group.clone(),
            ..Default::default()
        };
        match self.client.create_log_group(group).await {
            Ok(()) | Err(RusotoError::Service(CreateLogGroupError::ResourceAlreadyExists(_))) => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(retention_in_days) = self.target.retention_days {
            self.client
                .put_retention_policy(PutRetentionPolicyRequest {
                    log_group_name: self.target.log_group.clone(),
                    retention_in_days,
                })
                .await?;
        }

        let stream = CreateLogStreamRequest {
            log_group_name: self.target.log_group.clone(),
            log_stream_name: self.target.log_stream.clone(),
        };
        match self.client.create_log_stream(stream).await {
            Ok(())
            | Err(RusotoError::Service(CreateLogStreamError::ResourceAlreadyExists(_))) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[async_recursion]
    async fn put(
        &mut self,
        events: Vec<InputLogEvent>,
        retries: usize,
    ) -> Result<(), CloudWatchLogsError> {
        let request = PutLogEventsRequest {
            log_events: events.clone(),
            log_group_name: self.target.log_group.clone(),
            log_stream_name: self.target.log_stream.clone(),
            sequence_token: self.sequence_token.clone(),
        };
        match self.client.put_log_events(request).await {
            Ok(response) => {
                if let Some(rejected) = response.rejected_log_events_info {
                    eprintln!(
                        "CloudWatch rejected log events in {}/{}: {:?}",
                        self.target.log_group, self.target.log_stream, rejected
                    );
                }
                self.sequence_token = response.next_sequence_token;
                Ok(())
            }
            Err(RusotoError::Service(PutLogEventsError::InvalidSequenceToken(message)))
                if retries > 0 =>
            {
                self.sequence_token = expected_sequence_token(&message);
                self.put(events, retries - 1).await
            }
            Err(RusotoError::Service(PutLogEventsError::DataAlreadyAccepted(message))) => {
                self.sequence_token = expected_sequence_token(&message);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
