pub mod models {
    pub mod farm;
}

pub mod broker;
pub mod buffer;
pub mod client;
pub mod config;
pub mod utils;
pub mod services {
    pub mod ack;
    pub mod telemetry;
    pub mod valve;
}

use crate::broker::{MessageHandler, MqttCommandSink, Subscriptions};
use crate::buffer::{FileBuffer, TelemetryBuffer};
use crate::client::CloudClient;
use crate::config::Config;
use crate::services::ack::{AckDispatcher, AckRelay};
use crate::services::telemetry::{self, TelemetryForwarder};
use crate::services::valve::{DedupPublisher, ValvePoller};
use log::{debug, error, info};
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::thread;

/// Acks waiting for the relay thread; beyond this the listener drops them.
const ACK_QUEUE_CAPACITY: usize = 256;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

/// Routes inbound broker messages to the enabled paths.
struct BridgeHandler {
    buffer: Option<Arc<FileBuffer>>,
    acks: Option<AckDispatcher>,
}

impl MessageHandler for BridgeHandler {
    fn on_sensor_reading(&self, topic: &str, payload: &[u8]) {
        match &self.buffer {
            Some(buffer) => telemetry::on_sensor_message(buffer.as_ref(), topic, payload),
            None => debug!("Telemetry disabled; ignoring message on {}", topic),
        }
    }

    fn on_valve_ack(&self, topic: &str, payload: &[u8]) {
        match &self.acks {
            Some(acks) => acks.on_ack_message(topic, payload),
            None => debug!("Valve bridge disabled; ignoring message on {}", topic),
        }
    }
}

fn spawn_named(name: &str, f: impl FnOnce() + Send + 'static) -> Result<(), String> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| format!("spawning {} thread failed: {}", name, e))
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (broker={}:{}, cloud={}, farm_id={}, telemetry_enabled={}, valve_enabled={}, forward_interval={}s, poll_interval={}s, http_timeout={}s)",
        cfg.mqtt.host,
        cfg.mqtt.port,
        cfg.cloud_url,
        cfg.farm.id.0,
        cfg.telemetry_enabled,
        cfg.valve_enabled,
        cfg.forward_interval.as_secs(),
        cfg.poll_interval.as_secs(),
        cfg.http_timeout.as_secs()
    );

    // 2) Cloud client and broker handles (the connection is established by the listener loop)
    let cloud = CloudClient::new(&cfg.cloud_url, cfg.http_timeout);
    let (client, connection) = broker::connect(&cfg.mqtt);

    let mut subscriptions = Subscriptions::default();
    let mut handler = BridgeHandler {
        buffer: None,
        acks: None,
    };

    // 3) Telemetry path: ingest on the listener, forward on a timer
    if cfg.telemetry_enabled {
        let buffer = FileBuffer::open(&cfg.buffer_path)
            .map_err(|e| format!("Opening telemetry buffer {} failed: {}", cfg.buffer_path, e))?;
        let pending = buffer
            .drain_snapshot()
            .map_err(|e| format!("Reading telemetry buffer {} failed: {}", cfg.buffer_path, e))?
            .len();
        info!(
            "Telemetry buffer {} opened with {} pending reading(s)",
            buffer.path().display(),
            pending
        );
        let buffer = Arc::new(buffer);

        let forwarder = TelemetryForwarder::new(Arc::clone(&buffer), cloud.clone(), cfg.farm.clone());
        let interval = cfg.forward_interval;
        spawn_named("telemetry-forwarder", move || {
            forwarder.run_loop(interval);
        })?;

        subscriptions.sensor = Some(cfg.telemetry_topic.clone());
        handler.buffer = Some(buffer);
    } else {
        info!("Telemetry bridge disabled via TELEMETRY_ENABLED");
    }

    // 4) Valve path: poll + publish on a timer, acks relayed off the listener thread
    if cfg.valve_enabled {
        let publisher = DedupPublisher::new(MqttCommandSink::new(client.clone()), &cfg.valve_command_topic);
        let mut poller = ValvePoller::new(cloud.clone(), cfg.farm.clone(), publisher);
        let interval = cfg.poll_interval;
        spawn_named("valve-poller", move || {
            poller.run_loop(interval);
        })?;

        let (ack_tx, ack_rx) = mpsc::sync_channel(ACK_QUEUE_CAPACITY);
        let relay = AckRelay::new(cloud.clone());
        spawn_named("ack-relay", move || relay.run(ack_rx))?;

        subscriptions.valve_ack = Some(cfg.valve_ack_topic.clone());
        handler.acks = Some(AckDispatcher::new(cfg.farm.clone(), ack_tx));
    } else {
        info!("Valve bridge disabled via VALVE_ENABLED");
    }

    // 5) Listener loop (runs for the life of the process)
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        cfg.mqtt.host, cfg.mqtt.port, cfg.mqtt.client_id
    );
    broker::run_listener(
        &client,
        connection,
        &subscriptions,
        &handler,
        cfg.mqtt.reconnect_delay,
    );

    Err("MQTT event loop ended unexpectedly".to_string())
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let mut args = std::env::args_os().skip(1);
    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let value = match arg.as_str() {
            "--" => break,
            "--env-file" => args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            s if s.starts_with("--env-file=") => {
                let path = &s["--env-file=".len()..];
                if path.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                PathBuf::from(path)
            }
            other => return Err(format!("unrecognised argument: {}", other)),
        };
        if env_file.replace(value).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    let (path, explicit) = match env_file {
        Some(path) if path.is_file() => (path, true),
        Some(path) => return Err(format!("env file not found: {}", path.display())),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            (default_path, false)
        }
    };

    config::load_env_file(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "farm-bridge {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
