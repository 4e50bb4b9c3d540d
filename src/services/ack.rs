use crate::client::CloudApi;
use crate::models::farm::{
    FIELD_FARM_ID, FIELD_FARM_KEY, FIELD_SECTION_DEVICE_ID, FIELD_TIMESTAMP, FarmIdentity, SectionDeviceId, ValveAck,
};
use crate::utils::format_timestamp;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::Value;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    Malformed(String),
    /// No usable `section_device_id` (absent, or not safe as a path segment), so there is no endpoint to post to.
    Unroutable,
}

impl core::fmt::Display for AckError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AckError::Malformed(s) => write!(f, "malformed payload: {}", s),
            AckError::Unroutable => write!(f, "{} is missing or invalid", FIELD_SECTION_DEVICE_ID),
        }
    }
}

impl std::error::Error for AckError {}

/// An acknowledgement ready to be posted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAck {
    pub device: SectionDeviceId,
    pub body: ValveAck,
}

/// Turn a device acknowledgement into the cloud body: the device id moves into the URL,
/// and the farm identity plus the bridge's receipt time are injected.
pub fn prepare(farm: &FarmIdentity, payload: &[u8], received_at: DateTime<Utc>) -> Result<PendingAck, AckError> {
    let mut fields = match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => map,
        Ok(other) => return Err(AckError::Malformed(format!("expected a JSON object, got {}", other))),
        Err(e) => return Err(AckError::Malformed(e.to_string())),
    };

    let device = fields
        .remove(FIELD_SECTION_DEVICE_ID)
        .as_ref()
        .and_then(SectionDeviceId::from_value)
        .ok_or(AckError::Unroutable)?;

    for injected in [FIELD_TIMESTAMP, FIELD_FARM_ID, FIELD_FARM_KEY] {
        fields.remove(injected);
    }

    Ok(PendingAck {
        device,
        body: ValveAck {
            farm_key: farm.key.clone(),
            farm_id: farm.id,
            timestamp: format_timestamp(received_at),
            fields,
        },
    })
}

/// Listener side: prepares acks and queues them for the relay thread so HTTP never blocks the listener.
pub struct AckDispatcher {
    farm: FarmIdentity,
    queue: SyncSender<PendingAck>,
}

impl AckDispatcher {
    pub fn new(farm: FarmIdentity, queue: SyncSender<PendingAck>) -> Self {
        AckDispatcher { farm, queue }
    }

    pub fn on_ack_message(&self, topic: &str, payload: &[u8]) {
        let ack = match prepare(&self.farm, payload, Utc::now()) {
            Ok(a) => a,
            Err(e) => {
                warn!(
                    "Discarding valve ack on {} ({}): {}",
                    topic,
                    e,
                    String::from_utf8_lossy(payload)
                );
                return;
            }
        };

        match self.queue.try_send(ack) {
            Ok(()) => {}
            Err(TrySendError::Full(ack)) => warn!("Ack relay queue full, dropping ack for device {}", ack.device),
            Err(TrySendError::Disconnected(ack)) => {
                warn!("Ack relay is not running, dropping ack for device {}", ack.device)
            }
        }
    }
}

/// Posts acknowledgements to the cloud. Failures are logged and not retried.
pub struct AckRelay<C: CloudApi> {
    cloud: C,
}

impl<C: CloudApi> AckRelay<C> {
    pub fn new(cloud: C) -> Self {
        AckRelay { cloud }
    }

    pub fn deliver(&self, ack: &PendingAck) -> bool {
        match self.cloud.post_valve_ack(&ack.device, &ack.body) {
            Ok(()) => {
                info!("Relayed valve ack for device {}", ack.device);
                true
            }
            Err(e) => {
                warn!("Relaying valve ack for device {} failed: {}", ack.device, e);
                false
            }
        }
    }

    /// Runs until every dispatcher is gone.
    pub fn run(&self, queue: Receiver<PendingAck>) {
        for ack in queue {
            self.deliver(&ack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CloudClientError, MockCloudApi};
    use crate::models::farm::FarmId;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::mpsc;

    fn farm() -> FarmIdentity {
        FarmIdentity {
            id: FarmId(1),
            key: "K".into(),
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap()
    }

    #[test]
    fn prepare_moves_device_id_into_route() {
        let ack = prepare(
            &farm(),
            br#"{"section_device_id": 6, "mode": "auto", "status": "off", "farm_key": "spoofed"}"#,
            at(),
        )
        .unwrap();

        assert_eq!(ack.device, SectionDeviceId("6".into()));
        assert_eq!(
            serde_json::to_value(&ack.body).unwrap(),
            json!({
                "farm_key": "K",
                "farm_id": 1,
                "timestamp": "2024-05-01T07:00:00.000000Z",
                "mode": "auto",
                "status": "off"
            })
        );
    }

    #[test]
    fn prepare_rejects_unroutable_and_malformed() {
        assert_eq!(
            prepare(&farm(), br#"{"mode": "auto", "status": "on"}"#, at()),
            Err(AckError::Unroutable)
        );
        assert_eq!(
            prepare(&farm(), br#"{"section_device_id": null}"#, at()),
            Err(AckError::Unroutable)
        );
        assert_eq!(
            prepare(&farm(), br#"{"section_device_id": "6/../../farms"}"#, at()),
            Err(AckError::Unroutable)
        );
        assert!(matches!(prepare(&farm(), b"{oops", at()), Err(AckError::Malformed(_))));
        assert!(matches!(prepare(&farm(), b"\"text\"", at()), Err(AckError::Malformed(_))));
    }

    #[test]
    fn missing_device_id_never_reaches_cloud() {
        let (tx, rx) = mpsc::sync_channel(4);
        let dispatcher = AckDispatcher::new(farm(), tx);
        dispatcher.on_ack_message("/farm/valve/post/6", br#"{"mode": "manual", "status": "off"}"#);
        drop(dispatcher);

        let mut cloud = MockCloudApi::new();
        cloud.expect_post_valve_ack().never();
        AckRelay::new(cloud).run(rx);
    }

    #[test]
    fn relay_posts_to_device_endpoint() {
        let (tx, rx) = mpsc::sync_channel(4);
        let dispatcher = AckDispatcher::new(farm(), tx);
        dispatcher.on_ack_message("/farm/valve/post/S1", br#"{"section_device_id": "S1", "status": "on"}"#);
        drop(dispatcher);

        let mut cloud = MockCloudApi::new();
        cloud
            .expect_post_valve_ack()
            .withf(|device, body| {
                device.0 == "S1" && body.fields.get("status") == Some(&json!("on")) && body.farm_id == FarmId(1)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        AckRelay::new(cloud).run(rx);
    }

    #[test]
    fn relay_failure_is_not_retried() {
        let mut cloud = MockCloudApi::new();
        cloud
            .expect_post_valve_ack()
            .times(1)
            .returning(|_, _| Err(CloudClientError::Transport("connection refused".into())));

        let ack = prepare(&farm(), br#"{"section_device_id": "S1"}"#, at()).unwrap();
        assert!(!AckRelay::new(cloud).deliver(&ack));
    }
}
