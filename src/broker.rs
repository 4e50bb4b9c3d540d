//! Broker link: MQTT connection, subscriptions, inbound routing and outbound command publishing.
//!
//! - Blocking `rumqttc` client; the event loop is driven by iterating the `Connection`.
//! - A failed poll is followed by a fixed delay and the same loop reconnects on its next poll.
//! - Subscriptions are re-issued on every CONNACK since sessions are clean, and retried
//!   on later notifications until the request channel accepts them.
//! - Publishing never blocks the caller on a down link.

use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::thread;
use std::time::Duration;

use crate::config::MqttSettings;

/// Capacity of the request channel between client handles and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug)]
pub enum BrokerError {
    Publish(String),
    Subscribe(String),
}

impl core::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BrokerError::Publish(s) => write!(f, "publish failed: {}", s),
            BrokerError::Subscribe(s) => write!(f, "subscribe failed: {}", s),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Outbound side of the broker link.
#[cfg_attr(test, mockall::automock)]
pub trait CommandSink: Send {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Publishes with QoS 1, not retained.
///
/// Never blocks: while the link is down the request channel fills up and the
/// publish fails, leaving the command to be retried on the next poll.
pub struct MqttCommandSink {
    client: Client,
}

impl MqttCommandSink {
    pub fn new(client: Client) -> Self {
        MqttCommandSink { client }
    }
}

impl CommandSink for MqttCommandSink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }
}

/// Subscription requests towards the broker.
#[cfg_attr(test, mockall::automock)]
pub trait SubscribeRequest {
    fn request_subscription(&self, filter: &str) -> Result<(), BrokerError>;
}

impl SubscribeRequest for Client {
    fn request_subscription(&self, filter: &str) -> Result<(), BrokerError> {
        self.try_subscribe(filter, QoS::AtLeastOnce).map_err(|e| BrokerError::Subscribe(e.to_string()))
    }
}

/// Build the client handle and its (not yet connected) event loop.
pub fn connect(settings: &MqttSettings) -> (Client, Connection) {
    let mut options = MqttOptions::new(settings.client_id.as_str(), settings.host.as_str(), settings.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    if let Some(user) = settings.username.as_deref() {
        options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
    }
    Client::new(options, REQUEST_CHANNEL_CAPACITY)
}

/// MQTT filter matching with `+` (one level) and `#` (this level and everything below).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageClass {
    SensorReading,
    ValveAck,
}

/// Inbound messages, one method per class.
pub trait MessageHandler {
    fn on_sensor_reading(&self, topic: &str, payload: &[u8]);
    fn on_valve_ack(&self, topic: &str, payload: &[u8]);
}

/// Topic filters of the enabled roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    pub sensor: Option<String>,
    pub valve_ack: Option<String>,
}

impl Subscriptions {
    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.sensor.iter().chain(self.valve_ack.iter()).map(String::as_str)
    }

    /// Acks are checked first since the default filters could overlap on a custom layout.
    pub fn classify(&self, topic: &str) -> Option<MessageClass> {
        if self.valve_ack.as_deref().is_some_and(|f| topic_matches(f, topic)) {
            Some(MessageClass::ValveAck)
        } else if self.sensor.as_deref().is_some_and(|f| topic_matches(f, topic)) {
            Some(MessageClass::SensorReading)
        } else {
            None
        }
    }

    pub fn dispatch<H: MessageHandler + ?Sized>(&self, handler: &H, topic: &str, payload: &[u8]) {
        match self.classify(topic) {
            Some(MessageClass::SensorReading) => handler.on_sensor_reading(topic, payload),
            Some(MessageClass::ValveAck) => handler.on_valve_ack(topic, payload),
            None => debug!("Ignoring message on unsubscribed topic {}", topic),
        }
    }
}

/// What the listener loop should do after a notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerAction {
    Continue,
    /// The connection failed; wait the reconnect delay before polling again.
    Backoff,
}

/// Per-connection listener state: which subscriptions still have to be requested.
pub struct Listener<'a, H: MessageHandler + ?Sized> {
    subscriptions: &'a Subscriptions,
    handler: &'a H,
    connected: bool,
    pending: Vec<String>,
}

impl<'a, H: MessageHandler + ?Sized> Listener<'a, H> {
    pub fn new(subscriptions: &'a Subscriptions, handler: &'a H) -> Self {
        Listener {
            subscriptions,
            handler,
            connected: false,
            pending: Vec::new(),
        }
    }

    /// Filters not yet accepted by the request channel on the current connection.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    pub fn on_notification<S, E>(&mut self, subscriber: &S, notification: Result<Event, E>) -> ListenerAction
    where
        S: SubscribeRequest + ?Sized,
        E: core::fmt::Display,
    {
        let action = match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                // Clean sessions forget subscriptions, so every connection starts with all of them pending.
                self.connected = true;
                self.pending = self.subscriptions.filters().map(str::to_string).collect();
                ListenerAction::Continue
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.subscriptions.dispatch(self.handler, &publish.topic, &publish.payload);
                ListenerAction::Continue
            }
            Ok(_) => ListenerAction::Continue,
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                self.connected = false;
                ListenerAction::Backoff
            }
        };

        if self.connected {
            self.request_pending(subscriber);
        }
        action
    }

    fn request_pending<S: SubscribeRequest + ?Sized>(&mut self, subscriber: &S) {
        self.pending.retain(|filter| match subscriber.request_subscription(filter) {
            Ok(()) => {
                info!("Subscribed to {}", filter);
                false
            }
            Err(e) => {
                warn!("Subscribing to {} failed, will retry: {}", filter, e);
                true
            }
        });
    }
}

/// Drive the connection until every client handle is dropped.
///
/// Connection errors never end the loop: each one is followed by `reconnect_delay`
/// and the next iteration reconnects.
pub fn run_listener<H: MessageHandler + ?Sized>(
    client: &Client,
    mut connection: Connection,
    subscriptions: &Subscriptions,
    handler: &H,
    reconnect_delay: Duration,
) {
    let mut listener = Listener::new(subscriptions, handler);
    for notification in connection.iter() {
        if listener.on_notification(client, notification) == ListenerAction::Backoff {
            info!("Reconnecting to MQTT broker in {}s", reconnect_delay.as_secs());
            thread::sleep(reconnect_delay);
        }
    }
    warn!("MQTT event loop ended");
}
