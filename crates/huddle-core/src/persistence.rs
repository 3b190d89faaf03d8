//! Write-behind message persistence.
//!
//! Chat-bearing messages are handed to a [`MessageSink`] through a bounded
//! queue drained by a background task. Submitting never waits: if the queue is
//! full the message is dropped from the log and counted. Sink failures are
//! logged and counted. Neither affects delivery.

use crate::message::Message;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default persistence queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// An append-only destination for messages.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Append one message.
    async fn append(&self, message: &Message) -> Result<(), SinkError>;

    /// Get the sink name (e.g., "log", "jsonl").
    fn name(&self) -> &'static str;
}

/// Sink that writes each message to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    async fn append(&self, message: &Message) -> Result<(), SinkError> {
        info!(
            target: "huddle::history",
            id = message.id,
            sender = %message.sender,
            room = message.room().unwrap_or_default(),
            recipient = message.recipient().unwrap_or_default(),
            private = message.is_private(),
            timestamp = message.timestamp,
            "Message"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Sink that appends messages to a file, one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    /// Open (or create) the file for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), "Opened message log");

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageSink for JsonLinesSink {
    async fn append(&self, message: &Message) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    appended: AtomicU64,
    failed: AtomicU64,
}

/// Persistence statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    /// Messages accepted into the queue.
    pub submitted: u64,
    /// Messages dropped because the queue was full or stopped.
    pub dropped: u64,
    /// Messages the sink stored.
    pub appended: u64,
    /// Messages the sink failed to store.
    pub failed: u64,
}

/// Handle to the write-behind queue.
///
/// Cheap to clone. When persistence is disabled, submissions are ignored.
#[derive(Debug, Clone)]
pub struct WriteBehind {
    sender: Option<mpsc::Sender<Arc<Message>>>,
    counters: Arc<Counters>,
}

impl WriteBehind {
    /// Start a background task that appends queued messages to `sink`.
    ///
    /// Must be called from within a tokio runtime. The task ends once every
    /// handle has been dropped and the queue is drained.
    pub fn spawn(sink: Arc<dyn MessageSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Arc<Message>>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);

        info!(sink = sink.name(), capacity, "Starting message persistence");

        let handle = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match sink.append(&message).await {
                    Ok(()) => {
                        worker_counters.appended.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            sink = sink.name(),
                            message_id = message.id,
                            error = %e,
                            "Failed to persist message"
                        );
                    }
                }
            }
            debug!(sink = sink.name(), "Message persistence stopped");
        });

        (
            Self {
                sender: Some(sender),
                counters,
            },
            handle,
        )
    }

    /// A handle that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sender: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Check if persistence is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue a message for persistence without waiting.
    ///
    /// Returns `true` if the message was queued.
    pub fn submit(&self, message: Arc<Message>) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        match sender.try_send(message) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                let message = match &e {
                    mpsc::error::TrySendError::Full(m) | mpsc::error::TrySendError::Closed(m) => m,
                };
                warn!(message_id = message.id, error = %e, "Message not persisted");
                false
            }
        }
    }

    /// Get persistence statistics.
    #[must_use]
    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            appended: self.counters.appended.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: StdMutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn append(&self, message: &Message) -> Result<(), SinkError> {
            self.messages.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct FailingSink;

    #[async_trait]
    impl MessageSink for FailingSink {
        async fn append(&self, _message: &Message) -> Result<(), SinkError> {
            Err(SinkError::Other("disk on fire".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn message(text: &str) -> Arc<Message> {
        Arc::new(Message::in_room("alice", "general", MessageBody::text(text)))
    }

    #[tokio::test]
    async fn test_messages_reach_sink_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let (persistence, handle) = WriteBehind::spawn(sink.clone(), 16);

        assert!(persistence.submit(message("one")));
        assert!(persistence.submit(message("two")));
        drop(persistence);
        handle.await.unwrap();

        let stored = sink.messages.lock().unwrap();
        let bodies: Vec<_> = stored.iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec![MessageBody::text("one"), MessageBody::text("two")]);
    }

    #[tokio::test]
    async fn test_sink_failure_is_counted() {
        let (persistence, handle) = WriteBehind::spawn(Arc::new(FailingSink), 16);
        let stats_handle = persistence.clone();

        assert!(persistence.submit(message("lost")));
        drop(persistence);
        handle.await.unwrap();

        let stats = stats_handle.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.appended, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (persistence, _handle) = WriteBehind::spawn(Arc::new(LogSink), 1);

        // The worker has not run yet on the current-thread runtime.
        assert!(persistence.submit(message("one")));
        assert!(!persistence.submit(message("two")));
        assert_eq!(persistence.stats().dropped, 1);
    }

    #[test]
    fn test_disabled_discards() {
        let persistence = WriteBehind::disabled();
        assert!(!persistence.is_enabled());
        assert!(!persistence.submit(message("ignored")));
        assert_eq!(persistence.stats(), PersistenceStats::default());
    }

    #[tokio::test]
    async fn test_json_lines_sink() {
        let path = std::env::temp_dir().join(format!(
            "huddle-sink-{}.jsonl",
            crate::message::generate_message_id()
        ));
        let sink = JsonLinesSink::open(&path).await.unwrap();

        sink.append(&message("hello")).await.unwrap();
        sink.append(&Message::private("alice", "bob", MessageBody::text("hi")))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["target"]["room"], "general");
        assert_eq!(lines[1]["target"]["recipient"], "bob");

        let _ = tokio::fs::remove_file(&path).await;
    }
}
