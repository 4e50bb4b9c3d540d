use crate::buffer::{BufferError, TelemetryBuffer};
use crate::client::CloudApi;
use crate::models::farm::{FarmIdentity, SensorReading, TelemetryBatch};
use crate::utils::run_every;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub enum IngestError {
    /// Not JSON, or JSON that is not an object.
    Malformed(String),
    Buffer(BufferError),
}

impl core::fmt::Display for IngestError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IngestError::Malformed(s) => write!(f, "malformed payload: {}", s),
            IngestError::Buffer(e) => write!(f, "buffer error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

/// Parse a sensor payload, stamp it with its receipt time and append it to the buffer.
pub fn ingest<B: TelemetryBuffer + ?Sized>(
    buffer: &B,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<SensorReading, IngestError> {
    let fields = match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => map,
        Ok(other) => return Err(IngestError::Malformed(format!("expected a JSON object, got {}", other))),
        Err(e) => return Err(IngestError::Malformed(e.to_string())),
    };

    let reading = SensorReading::received(fields, received_at);
    buffer.append(&reading).map_err(IngestError::Buffer)?;
    Ok(reading)
}

/// Listener-side entry point: never fails, only logs.
pub fn on_sensor_message<B: TelemetryBuffer + ?Sized>(buffer: &B, topic: &str, payload: &[u8]) {
    match ingest(buffer, payload, Utc::now()) {
        Ok(reading) => debug!("Buffered reading from {}: {:?}", topic, reading.fields()),
        Err(IngestError::Malformed(e)) => warn!(
            "Dropping sensor message on {} ({}): {}",
            topic,
            e,
            String::from_utf8_lossy(payload)
        ),
        Err(e) => warn!("Failed to buffer sensor message on {}: {}", topic, e),
    }
}

/// What one forwarding cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Empty,
    /// Every buffered entry was unparseable; nothing was sent and nothing cleared.
    NothingValid { skipped: usize },
    Delivered { sent: usize, skipped: usize },
    /// The buffer is untouched and will be retried next cycle.
    Failed(String),
}

pub struct TelemetryForwarder<B: TelemetryBuffer, C: CloudApi> {
    buffer: Arc<B>,
    cloud: C,
    farm: FarmIdentity,
}

impl<B: TelemetryBuffer, C: CloudApi> TelemetryForwarder<B, C> {
    pub fn new(buffer: Arc<B>, cloud: C, farm: FarmIdentity) -> Self {
        TelemetryForwarder { buffer, cloud, farm }
    }

    pub fn forward_once(&self) -> ForwardOutcome {
        let snapshot = match self.buffer.drain_snapshot() {
            Ok(s) => s,
            Err(e) => return ForwardOutcome::Failed(format!("reading buffer failed: {}", e)),
        };
        if snapshot.is_empty() {
            return ForwardOutcome::Empty;
        }

        let mut data = Vec::with_capacity(snapshot.len());
        let mut skipped = 0;
        for entry in &snapshot.entries {
            match serde_json::from_str::<Value>(entry) {
                Ok(v) => data.push(v),
                Err(e) => {
                    warn!("Skipping invalid buffered entry ({}): {}", e, entry);
                    skipped += 1;
                }
            }
        }
        if data.is_empty() {
            return ForwardOutcome::NothingValid { skipped };
        }

        let sent = data.len();
        let batch = TelemetryBatch {
            farm_key: self.farm.key.clone(),
            data,
        };
        if let Err(e) = self.cloud.post_telemetry(self.farm.id, &batch) {
            return ForwardOutcome::Failed(format!("posting telemetry failed: {}", e));
        }

        // Accepted by the cloud; a failure from here on means re-delivery next cycle.
        match self.buffer.clear(&snapshot) {
            Ok(()) => ForwardOutcome::Delivered { sent, skipped },
            Err(e) => ForwardOutcome::Failed(format!("clearing buffer after delivery failed: {}", e)),
        }
    }

    pub fn run_loop(&self, interval: Duration) -> ! {
        run_every("telemetry forwarder", interval, || match self.forward_once() {
            ForwardOutcome::Empty => debug!("No buffered telemetry to forward"),
            ForwardOutcome::NothingValid { skipped } => {
                warn!("No valid telemetry to forward ({} invalid entries kept)", skipped)
            }
            ForwardOutcome::Delivered { sent, skipped } => {
                info!("Forwarded {} reading(s) to cloud, buffer cleared ({} invalid skipped)", sent, skipped)
            }
            ForwardOutcome::Failed(e) => warn!("Telemetry forward failed, retrying next cycle: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FileBuffer;
    use crate::client::{CloudClientError, MockCloudApi};
    use crate::models::farm::FarmId;
    use chrono::TimeZone;
    use serde_json::json;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn farm() -> FarmIdentity {
        FarmIdentity {
            id: FarmId(1),
            key: "K".into(),
        }
    }

    fn open_buffer() -> (TempDir, Arc<FileBuffer>) {
        let dir = tempdir().unwrap();
        let buffer = FileBuffer::open(dir.path().join("received.jsonl")).unwrap();
        (dir, Arc::new(buffer))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap()
    }

    #[test]
    fn ingest_stamps_receipt_time() {
        let (_dir, buffer) = open_buffer();
        ingest(buffer.as_ref(), br#"{"moisture": 42}"#, t0()).unwrap();

        let snapshot = buffer.drain_snapshot().unwrap();
        assert_eq!(
            snapshot.entries,
            vec![r#"{"moisture":42,"timestamp":"2024-05-01T06:00:00.000000Z"}"#.to_string()]
        );
    }

    #[test]
    fn ingest_rejects_malformed_payloads() {
        let (_dir, buffer) = open_buffer();
        assert!(matches!(
            ingest(buffer.as_ref(), b"not json", t0()),
            Err(IngestError::Malformed(_))
        ));
        assert!(matches!(
            ingest(buffer.as_ref(), b"[1,2,3]", t0()),
            Err(IngestError::Malformed(_))
        ));
        on_sensor_message(buffer.as_ref(), "farm/moisture/4", b"\xff\xfe");
        assert!(buffer.drain_snapshot().unwrap().is_empty());
    }

    #[test]
    fn successful_post_clears_buffer() {
        let (_dir, buffer) = open_buffer();
        ingest(buffer.as_ref(), br#"{"moisture": 42}"#, t0()).unwrap();

        let mut cloud = MockCloudApi::new();
        cloud
            .expect_post_telemetry()
            .withf(|farm_id, batch| {
                *farm_id == FarmId(1)
                    && serde_json::to_value(batch).unwrap()
                        == json!({
                            "farm_key": "K",
                            "data": [{"moisture": 42, "timestamp": "2024-05-01T06:00:00.000000Z"}]
                        })
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let forwarder = TelemetryForwarder::new(Arc::clone(&buffer), cloud, farm());
        assert_eq!(forwarder.forward_once(), ForwardOutcome::Delivered { sent: 1, skipped: 0 });
        assert!(buffer.drain_snapshot().unwrap().is_empty());
    }

    #[test]
    fn failed_post_leaves_buffer_untouched() {
        let (_dir, buffer) = open_buffer();
        ingest(buffer.as_ref(), br#"{"moisture": 40}"#, t0()).unwrap();
        ingest(buffer.as_ref(), br#"{"moisture": 41}"#, t0()).unwrap();
        let before = fs::read(buffer.path()).unwrap();

        let mut cloud = MockCloudApi::new();
        let mut responses = vec![
            CloudClientError::Transport("timed out".into()),
            CloudClientError::Http {
                status: 500,
                message: "boom".into(),
            },
        ];
        cloud
            .expect_post_telemetry()
            .times(2)
            .returning(move |_, _| Err(responses.remove(0)));

        let forwarder = TelemetryForwarder::new(Arc::clone(&buffer), cloud, farm());
        assert!(matches!(forwarder.forward_once(), ForwardOutcome::Failed(_)));
        assert!(matches!(forwarder.forward_once(), ForwardOutcome::Failed(_)));
        assert_eq!(fs::read(buffer.path()).unwrap(), before);
    }

    #[test]
    fn corrupt_entry_does_not_abort_batch() {
        let (_dir, buffer) = open_buffer();
        ingest(buffer.as_ref(), br#"{"moisture": 1}"#, t0()).unwrap();
        let mut raw = fs::read_to_string(buffer.path()).unwrap();
        raw.push_str("{corrupt\n");
        fs::write(buffer.path(), raw).unwrap();
        ingest(buffer.as_ref(), br#"{"moisture": 2}"#, t0()).unwrap();

        let mut cloud = MockCloudApi::new();
        cloud
            .expect_post_telemetry()
            .withf(|_, batch| {
                batch.data.iter().map(|d| d["moisture"].as_i64().unwrap()).collect::<Vec<_>>() == vec![1, 2]
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let forwarder = TelemetryForwarder::new(Arc::clone(&buffer), cloud, farm());
        assert_eq!(forwarder.forward_once(), ForwardOutcome::Delivered { sent: 2, skipped: 1 });
        assert!(buffer.drain_snapshot().unwrap().is_empty());
    }

    #[test]
    fn empty_or_all_invalid_buffer_makes_no_call() {
        let (_dir, buffer) = open_buffer();
        let mut cloud = MockCloudApi::new();
        cloud.expect_post_telemetry().never();
        let forwarder = TelemetryForwarder::new(Arc::clone(&buffer), cloud, farm());

        assert_eq!(forwarder.forward_once(), ForwardOutcome::Empty);

        fs::write(buffer.path(), "garbage\n").unwrap();
        assert_eq!(forwarder.forward_once(), ForwardOutcome::NothingValid { skipped: 1 });
        assert_eq!(buffer.drain_snapshot().unwrap().len(), 1);
    }
}
