//! In-process sinks: capture-for-inspection and publish-to-nowhere.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{FileMessage, MessageSink, Result};

/// A sink that records every published message in memory.
///
/// Used by tests and by local runs that want to inspect what would have been
/// published.
#[derive(Debug, Default)]
pub struct MemorySink {
    published: Mutex<Vec<FileMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Returns a copy of everything published so far.
    pub fn published(&self) -> Vec<FileMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn publish(&self, msg: &FileMessage) -> Result<()> {
        self.published.lock().unwrap().push(msg.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A sink that accepts and discards every message.
///
/// Selected when the queue is disabled in configuration; each message is
/// still logged so a disabled deployment remains debuggable.
#[derive(Debug, Default)]
pub struct NoopSink;

impl NoopSink {
    pub fn new() -> Self {
        NoopSink
    }
}

#[async_trait]
impl MessageSink for NoopSink {
    async fn publish(&self, msg: &FileMessage) -> Result<()> {
        debug!(
            id = %msg.id,
            filename = %msg.filename,
            size = msg.size,
            "Discarding message (sink disabled)"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fingerprint, IngestRecord};

    fn message() -> FileMessage {
        let record = IngestRecord::new("/inbox/a.xml", 128);
        let fingerprint = Fingerprint::parse("7".repeat(64)).unwrap();
        FileMessage::from_record(&record, &fingerprint)
    }

    #[tokio::test]
    async fn memory_sink_captures_messages() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        sink.publish(&message()).await.unwrap();
        sink.publish(&message()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.published()[0].filename, "a.xml");
    }

    #[tokio::test]
    async fn noop_sink_always_succeeds() {
        let sink = NoopSink::new();
        sink.publish(&message()).await.unwrap();
        sink.close().await.unwrap();
    }
}
