//! HTTP transport to a remote ingest endpoint.
//!
//! Messages are POSTed as JSON with the routing key and destination carried
//! as headers, so one endpoint can fan deliveries out to multiple queues.
//! A non-2xx response is a publish failure; the retry/breaker layer above
//! decides what to do with it.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{FileMessage, MessageSink, Result, SinkError};

/// Header carrying the configured routing key.
const ROUTING_KEY_HEADER: &str = "x-routing-key";

/// Header carrying the destination queue/topic name.
const DESTINATION_HEADER: &str = "x-destination";

/// Configuration for the HTTP sink.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Full URL of the ingest endpoint.
    pub endpoint: String,
    /// Routing key attached to every message.
    pub routing_key: String,
    /// Destination queue/topic name attached to every message.
    pub destination: String,
}

/// [`MessageSink`] implementation that forwards messages over HTTP.
#[derive(Debug)]
pub struct HttpSink {
    client: reqwest::Client,
    cfg: HttpSinkConfig,
}

impl HttpSink {
    /// Creates a sink targeting the configured endpoint.
    pub fn new(cfg: HttpSinkConfig) -> Result<Self> {
        if cfg.endpoint.trim().is_empty() {
            return Err(SinkError::Publish(
                "sink endpoint must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| SinkError::Publish(e.to_string()))?;
        Ok(HttpSink { client, cfg })
    }
}

#[async_trait]
impl MessageSink for HttpSink {
    #[instrument(skip(self, msg), fields(id = %msg.id, filename = %msg.filename))]
    async fn publish(&self, msg: &FileMessage) -> Result<()> {
        let response = self
            .client
            .post(&self.cfg.endpoint)
            .header(ROUTING_KEY_HEADER, &self.cfg.routing_key)
            .header(DESTINATION_HEADER, &self.cfg.destination)
            .json(msg)
            .send()
            .await
            .map_err(|e| SinkError::Publish(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected(status.as_u16()));
        }

        debug!(
            id = %msg.id,
            destination = %self.cfg.destination,
            routing_key = %self.cfg.routing_key,
            "Message published"
        );

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // reqwest clients close their pool on drop.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_endpoint_is_rejected() {
        let result = HttpSink::new(HttpSinkConfig {
            endpoint: "  ".to_string(),
            routing_key: "files.new".to_string(),
            destination: "ingest".to_string(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn valid_endpoint_builds_a_client() {
        let sink = HttpSink::new(HttpSinkConfig {
            endpoint: "http://localhost:9000/publish".to_string(),
            routing_key: "files.new".to_string(),
            destination: "ingest".to_string(),
        });
        assert!(sink.is_ok());
    }
}
