use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use rusoto_logs::{CloudWatchLogs, InputLogEvent};
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_core::Metadata;
use tracing_subscriber::fmt::MakeWriter;

use crate::worker::{StreamTarget, Worker};
use crate::{
    CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE, CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH,
    CLOUDWATCH_MAX_BATCH_SIZE,
};

const MAX_MESSAGE_SIZE: usize = CLOUDWATCH_MAX_BATCH_SIZE - CLOUDWATCH_EXTRA_MSG_PAYLOAD_SIZE;

/// How long dropping a writer waits for its worker to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct CloudWatchMakeWriterBuilder<C> {
    client: C,
    target: StreamTarget,
}

impl CloudWatchMakeWriterBuilder<()> {
    pub fn new(log_group: &str, log_stream: &str) -> Self {
        Self {
            client: (),
            target: StreamTarget {
                log_group: log_group.to_string(),
                log_stream: log_stream.to_string(),
                retention_days: None,
            },
        }
    }
}

impl<C> CloudWatchMakeWriterBuilder<C> {
    pub fn with_client<C2>(self, client: C2) -> CloudWatchMakeWriterBuilder<C2>
    where
        C2: CloudWatchLogs + Send + Sync + 'static,
    {
        CloudWatchMakeWriterBuilder {
            client,
            target: self.target,
        }
    }

    /// Retention policy applied to the log group before the first batch.
    pub fn retention_days(mut self, days: i64) -> Self {
        self.target.retention_days = Some(days);
        self
    }
}

impl<C> CloudWatchMakeWriterBuilder<C>
where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    /// Starts the delivery runtime on its own thread.
    ///
    /// The thread lives until the returned writer is dropped. Dropping it
    /// closes the worker's channel and blocks for up to ten seconds while the
    /// worker flushes what it holds.
    pub fn build(self) -> io::Result<CloudWatchMakeWriter<C>> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let runtime_handle = runtime.handle().clone();
        let (signal, shutdown) = oneshot::channel::<Option<JoinHandle<()>>>();
        let thread = thread::Builder::new()
            .name("cloudwatch-logs".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    if let Ok(Some(worker)) = shutdown.await {
                        if tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err() {
                            eprintln!("Timed out flushing log events on shutdown");
                        }
                    }
                });
            })?;
        Ok(CloudWatchMakeWriter {
            client: Arc::new(self.client),
            target: self.target,
            worker: RwLock::new(None),
            runtime_handle,
            shutdown: Some(Shutdown { signal, thread }),
        })
    }
}

struct WorkerSlot {
    sender: Sender<InputLogEvent>,
    task: JoinHandle<()>,
}

struct Shutdown {
    signal: oneshot::Sender<Option<JoinHandle<()>>>,
    thread: thread::JoinHandle<()>,
}

/// Hands each formatted line to a background worker that ships it to one
/// CloudWatch log stream.
pub struct CloudWatchMakeWriter<C> {
    client: Arc<C>,
    target: StreamTarget,
    worker: RwLock<Option<WorkerSlot>>,
    runtime_handle: Handle,
    shutdown: Option<Shutdown>,
}

impl<C> CloudWatchMakeWriter<C>
where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    pub fn log_group(&self) -> &str {
        &self.target.log_group
    }

    pub fn log_stream(&self) -> &str {
        &self.target.log_stream
    }

    /// Returns the live worker's sender, respawning the worker if its
    /// channel has closed.
    fn get_or_spawn_worker(&self) -> Sender<InputLogEvent> {
        if let Some(slot) = self.worker.read().as_ref() {
            if !slot.sender.is_closed() {
                return slot.sender.clone();
            }
        }
        let mut write_guard = self.worker.write();
        // Another writer may have respawned it while we waited.
        if let Some(slot) = write_guard.as_ref() {
            if !slot.sender.is_closed() {
                return slot.sender.clone();
            }
        }
        let (sender, receiver) = channel(CLOUDWATCH_MAX_BATCH_EVENTS_LENGTH);
        let worker = Worker::new(self.client.clone(), self.target.clone());
        let task = self.runtime_handle.spawn(worker.run(receiver));
        *write_guard = Some(WorkerSlot {
            sender: sender.clone(),
            task,
        });
        sender
    }
}

impl<C> Drop for CloudWatchMakeWriter<C> {
    fn drop(&mut self) {
        // Dropping the slot's sender lets the worker drain and exit.
        let task = self.worker.get_mut().take().map(|slot| slot.task);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.signal.send(task);
            if shutdown.thread.join().is_err() {
                eprintln!("CloudWatch log delivery thread panicked");
            }
        }
    }
}

impl<C> MakeWriter for CloudWatchMakeWriter<C>
where
    C: CloudWatchLogs + Send + Sync + 'static,
{
    type Writer = CloudWatchWriter;

    fn make_writer(&self) -> Self::Writer {
        CloudWatchWriter::new(self.get_or_spawn_worker(), self.runtime_handle.clone())
    }

    fn make_writer_for(&self, _metadata: &Metadata<'_>) -> Self::Writer {
        self.make_writer()
    }
}

/// Line-buffered writer; every complete line becomes one log event.
pub struct CloudWatchWriter {
    line_writer: io::LineWriter<Inner>,
}

impl CloudWatchWriter {
    fn new(channel: Sender<InputLogEvent>, runtime_handle: Handle) -> Self {
        Self {
            line_writer: io::LineWriter::new(Inner {
                channel,
                runtime_handle,
            }),
        }
    }
}

impl io::Write for CloudWatchWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line_writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.line_writer.flush()
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.line_writer.write_all(buf)
    }
}

struct Inner {
    channel: Sender<InputLogEvent>,
    runtime_handle: Handle,
}

impl io::Write for Inner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let buf_len = buf.len();
        let event = log_event(buf, timestamp())?;
        let channel = self.channel.clone();
        self.runtime_handle.spawn(async move {
            let _ = channel.send(event).await;
        });
        Ok(buf_len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write(buf).map(|_| ())
    }
}

/// Turns one formatted line into an event, truncating it to what a single
/// batch can carry.
fn log_event(buf: &[u8], timestamp: i64) -> io::Result<InputLogEvent> {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    let mut message = String::from_utf8(buf.to_vec())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if message.len() > MAX_MESSAGE_SIZE {
        eprintln!("Message size exceeds max payload size, truncated");
        let mut end = MAX_MESSAGE_SIZE;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    Ok(InputLogEvent { message, timestamp })
}

/// Returns current unix timestamp in milliseconds
fn timestamp() -> i64 {
    use std::convert::TryFrom;
    use std::time::SystemTime;
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(err) => -i64::try_from(err.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rusoto_core::Region;
    use rusoto_logs::CloudWatchLogsClient;
    use rusoto_mock::{MockCredentialsProvider, MockRequestDispatcher};

    use super::*;

    fn make_writer() -> CloudWatchMakeWriter<CloudWatchLogsClient> {
        let client = CloudWatchLogsClient::new_with(
            MockRequestDispatcher::default().with_body("{}"),
            MockCredentialsProvider,
            Region::EuWest1,
        );
        crate::writer("group-log", "error-log")
            .with_client(client)
            .retention_days(30)
            .build()
            .unwrap()
    }

    #[test]
    fn writer_sends_one_event_per_line() {
        let runtime = Builder::new_current_thread().enable_all().build().unwrap();
        let (sender, mut receiver) = channel(8);
        let mut writer = CloudWatchWriter::new(sender, runtime.handle().clone());

        writer.write_all(b"first line\npartial").unwrap();
        let first = runtime.block_on(receiver.recv()).unwrap();
        assert_eq!(first.message, "first line");
        assert!(first.timestamp > 0);

        writer.flush().unwrap();
        let second = runtime.block_on(receiver.recv()).unwrap();
        assert_eq!(second.message, "partial");
    }

    #[test]
    fn writer_rejects_invalid_utf8_line() {
        let runtime = Builder::new_current_thread().enable_all().build().unwrap();
        let (sender, _receiver) = channel(8);
        let mut writer = CloudWatchWriter::new(sender, runtime.handle().clone());
        let err = writer.write_all(&[0xff, 0xfe, b'\n']).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn writers_share_one_worker() {
        let make_writer = make_writer();
        assert_eq!(make_writer.log_group(), "group-log");
        assert_eq!(make_writer.log_stream(), "error-log");

        let mut writer = make_writer.make_writer();
        writer.write_all(b"hello\n").unwrap();
        let first = make_writer.get_or_spawn_worker();
        let second = make_writer.get_or_spawn_worker();
        assert!(first.same_channel(&second));
    }

    #[test]
    fn closed_worker_is_respawned() {
        let make_writer = make_writer();
        let (stale, receiver) = channel(1);
        drop(receiver);
        let task = make_writer.runtime_handle.spawn(async {});
        *make_writer.worker.write() = Some(WorkerSlot {
            sender: stale.clone(),
            task,
        });

        let _writer = make_writer.make_writer();
        let fresh = make_writer
            .worker
            .read()
            .as_ref()
            .map(|slot| slot.sender.clone())
            .unwrap();
        assert!(!fresh.same_channel(&stale));
        assert!(!fresh.is_closed());
    }

    #[test]
    fn drop_stops_delivery_thread() {
        let make_writer = make_writer();
        let mut writer = make_writer.make_writer();
        writer.write_all(b"last words\n").unwrap();
        drop(writer);
        // Returns once the worker has flushed and the runtime thread exited.
        drop(make_writer);
    }

    #[test]
    fn trailing_newline_is_stripped() {
        let event = log_event(b"INFO request served\n", 42).unwrap();
        assert_eq!(event.message, "INFO request served");
        assert_eq!(event.timestamp, 42);
    }

    #[test]
    fn oversized_message_is_truncated_on_char_boundary() {
        let mut line = "a".repeat(MAX_MESSAGE_SIZE - 1);
        line.push('é');
        line.push_str("tail");
        let event = log_event(line.as_bytes(), 0).unwrap();
        assert_eq!(event.message.len(), MAX_MESSAGE_SIZE - 1);
        assert!(event.message.chars().all(|c| c == 'a'));
    }
}
