use crate::broker::CommandSink;
use crate::client::CloudApi;
use crate::models::farm::{CommandError, FarmIdentity, SectionDeviceId, ValveCommand, ValveCommandsRequest};
use crate::utils::run_every;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { topic: String },
    Duplicate,
    Rejected(CommandError),
    /// The broker link refused the message; the device's last-published timestamp is unchanged.
    Failed(String),
}

/// Publishes fetched commands to their devices, suppressing repeats of an unchanged timestamp.
///
/// `auto` commands are re-published every cycle so a device that (re)connects
/// picks up the standing policy without waiting for a state change.
pub struct DedupPublisher<S: CommandSink> {
    sink: S,
    topic_base: String,
    /// Last successfully published timestamp per device. `None` means published without a timestamp.
    last_published: HashMap<SectionDeviceId, Option<Value>>,
}

impl<S: CommandSink> DedupPublisher<S> {
    pub fn new(sink: S, topic_base: &str) -> Self {
        DedupPublisher {
            sink,
            topic_base: topic_base.trim_end_matches('/').to_string(),
            last_published: HashMap::new(),
        }
    }

    pub fn topic_for(&self, device: &SectionDeviceId) -> String {
        format!("{}/{}", self.topic_base, device)
    }

    pub fn publish(&mut self, entry: &Value) -> PublishOutcome {
        let command = match ValveCommand::from_value(entry) {
            Ok(c) => c,
            Err(e) => return PublishOutcome::Rejected(e),
        };

        let unchanged = self
            .last_published
            .get(&command.section_device_id)
            .is_some_and(|last| *last == command.timestamp);
        if unchanged && !command.valve_mode.is_auto() {
            return PublishOutcome::Duplicate;
        }

        let topic = self.topic_for(&command.section_device_id);
        let payload = match serde_json::to_vec(&command.payload) {
            Ok(p) => p,
            Err(e) => return PublishOutcome::Failed(format!("encoding command failed: {}", e)),
        };
        if let Err(e) = self.sink.publish(&topic, payload) {
            return PublishOutcome::Failed(e.to_string());
        }

        self.last_published.insert(command.section_device_id, command.timestamp);
        PublishOutcome::Published { topic }
    }
}

/// Fetches the farm's desired valve states and hands each one to the dedup publisher.
pub struct ValvePoller<C: CloudApi, S: CommandSink> {
    cloud: C,
    farm: FarmIdentity,
    publisher: DedupPublisher<S>,
}

impl<C: CloudApi, S: CommandSink> ValvePoller<C, S> {
    pub fn new(cloud: C, farm: FarmIdentity, publisher: DedupPublisher<S>) -> Self {
        ValvePoller { cloud, farm, publisher }
    }

    /// One poll cycle; returns how many commands went out. Cloud errors count as "no data".
    pub fn poll_once(&mut self) -> usize {
        let request = ValveCommandsRequest {
            farm_key: self.farm.key.clone(),
        };
        let response = match self.cloud.fetch_valve_commands(self.farm.id, &request) {
            Ok(r) => r,
            Err(e) => {
                warn!("Fetching valve commands failed, skipping this cycle: {}", e);
                return 0;
            }
        };
        debug!("Fetched {} valve command(s)", response.data.len());

        let mut published = 0;
        for entry in &response.data {
            match self.publisher.publish(entry) {
                PublishOutcome::Published { topic } => {
                    info!("Published valve command to {}", topic);
                    published += 1;
                }
                PublishOutcome::Duplicate => debug!("Valve command already published: {}", entry),
                PublishOutcome::Rejected(e) => warn!("Rejecting valve command ({}): {}", e, entry),
                PublishOutcome::Failed(e) => warn!("Publishing valve command failed, retrying next cycle: {}", e),
            }
        }
        published
    }

    pub fn run_loop(&mut self, interval: Duration) -> ! {
        run_every("valve poller", interval, || {
            self.poll_once();
        })
    }
}
