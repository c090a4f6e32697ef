//! Handlers and sinks that move batches out of the pipeline

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tideway_core::{
    error::{Result, TidewayError},
    traits::{Appender, DeadLetterSink, DownstreamSink},
    types::{Batch, DeadLetter},
};
use tracing::{debug, error, warn};

use crate::handler::BatchHandler;

/// Dead-letter sink that only logs; used when no durable sink is configured
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()> {
        error!(
            partition_id = %dead_letter.partition_id,
            first_token = ?dead_letter.first_token,
            last_token = ?dead_letter.last_token,
            records = dead_letter.records.len(),
            attempts = dead_letter.attempts,
            error = %dead_letter.error,
            "Dropping dead-lettered batch (no dead-letter store configured)"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordBody {
    token: u64,
    timestamp: chrono::DateTime<chrono::Utc>,
    payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchBody<'a> {
    partition_id: &'a str,
    records: Vec<RecordBody>,
}

/// JSON body posted for a batch
///
/// Payloads that are valid JSON are embedded as-is; anything else is sent as
/// a (lossy) UTF-8 string.
pub fn encode_batch(batch: &Batch) -> Value {
    let records = batch
        .records
        .iter()
        .map(|r| RecordBody {
            token: r.token.value(),
            timestamp: r.timestamp,
            payload: serde_json::from_slice(&r.payload)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&r.payload).into_owned())),
        })
        .collect();

    serde_json::to_value(BatchBody {
        partition_id: &batch.partition_id,
        records,
    })
    .unwrap_or(Value::Null)
}

/// Posts batches as JSON to an HTTP endpoint
pub struct HttpSink {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| TidewayError::Config(format!("invalid sink url {}: {}", url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TidewayError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl DownstreamSink for HttpSink {
    async fn post(&self, batch: &Batch) -> Result<u16> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&encode_batch(batch))
            .send()
            .await
            .map_err(|e| TidewayError::Transient(format!("POST {} failed: {}", self.url, e)))?;
        Ok(response.status().as_u16())
    }
}

/// Forwards every batch to a downstream sink
///
/// Delivery failures are logged and dropped; the batch is still treated as
/// handled.
pub struct ForwardingHandler {
    sink: Arc<dyn DownstreamSink>,
}

impl ForwardingHandler {
    pub fn new(sink: Arc<dyn DownstreamSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl BatchHandler for ForwardingHandler {
    fn name(&self) -> &str {
        "forward"
    }

    async fn handle(&self, batch: &Batch) -> Result<()> {
        match self.sink.post(batch).await {
            Ok(status) if (200..300).contains(&status) => {
                debug!(partition_id = %batch.partition_id, records = batch.len(), status, "Forwarded batch");
            }
            Ok(status) => {
                warn!(partition_id = %batch.partition_id, status, "Downstream rejected batch");
            }
            Err(e) => {
                warn!(partition_id = %batch.partition_id, error = %e, "Failed to forward batch");
            }
        }
        Ok(())
    }
}

/// Copies each record's payload into another feed, keeping its partition
pub struct CopyHandler {
    destination: Arc<dyn Appender>,
}

impl CopyHandler {
    pub fn new(destination: Arc<dyn Appender>) -> Self {
        Self { destination }
    }
}

#[async_trait]
impl BatchHandler for CopyHandler {
    fn name(&self) -> &str {
        "copy"
    }

    async fn handle(&self, batch: &Batch) -> Result<()> {
        for record in &batch.records {
            self.destination
                .append(&record.partition_id, &record.payload)
                .await?;
        }
        debug!(partition_id = %batch.partition_id, records = batch.len(), "Copied batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use parking_lot::Mutex;
    use tideway_core::traits::ChangeFeed;
    use tideway_core::types::{ChangeRecord, ResumeToken};

    fn batch() -> Batch {
        Batch::new(
            "p1",
            vec![
                ChangeRecord::new("p1", ResumeToken::new(1), br#"{"item":"Unisex Socks"}"#.to_vec()),
                ChangeRecord::new("p1", ResumeToken::new(2), b"plain".to_vec()),
            ],
        )
    }

    struct RecordingSink {
        status: Result<u16>,
        posted: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl DownstreamSink for RecordingSink {
        async fn post(&self, batch: &Batch) -> Result<u16> {
            self.posted.lock().push(batch.len());
            match &self.status {
                Ok(s) => Ok(*s),
                Err(_) => Err(TidewayError::Transient("connection refused".into())),
            }
        }
    }

    #[test]
    fn test_encode_batch() {
        let body = encode_batch(&batch());
        assert_eq!(body["partitionId"], "p1");
        assert_eq!(body["records"][0]["payload"]["item"], "Unisex Socks");
        assert_eq!(body["records"][1]["payload"], "plain");
        assert_eq!(body["records"][1]["token"], 2);
    }

    #[test]
    fn test_http_sink_rejects_bad_url() {
        assert!(matches!(
            HttpSink::new("not a url", Duration::from_secs(1)),
            Err(TidewayError::Config(_))
        ));
        let sink = HttpSink::new("http://localhost:8080/ingest", Duration::from_secs(1)).unwrap();
        assert_eq!(sink.url(), "http://localhost:8080/ingest");
    }

    #[tokio::test]
    async fn test_forwarding_never_fails_the_batch() {
        for status in [Ok(200), Ok(503), Err(TidewayError::Transient("x".into()))] {
            let sink = Arc::new(RecordingSink {
                status,
                posted: Mutex::new(Vec::new()),
            });
            let handler = ForwardingHandler::new(sink.clone());
            handler.handle(&batch()).await.unwrap();
            assert_eq!(*sink.posted.lock(), vec![2]);
        }
    }

    #[tokio::test]
    async fn test_copy_handler_appends_payloads() {
        let destination = Arc::new(InMemoryStore::new());
        let handler = CopyHandler::new(destination.clone());
        handler.handle(&batch()).await.unwrap();

        let page = destination.fetch_changes("p1", None, 10).await.unwrap();
        assert_eq!(page.batch.len(), 2);
        assert_eq!(page.batch.records[1].payload, b"plain".to_vec());
    }
}
