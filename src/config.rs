//! Runtime configuration from environment variables (optionally seeded from a `.env` file).
//! Defaults match a bridge running next to a local broker.

use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use crate::models::farm::{FarmId, FarmIdentity};

pub const DEFAULT_MQTT_HOST: &str = "localhost";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_CLIENT_ID: &str = "farm-bridge";
pub const DEFAULT_CLOUD_URL: &str = "http://localhost:3000";
pub const DEFAULT_TELEMETRY_TOPIC: &str = "farm/moisture/#";
pub const DEFAULT_VALVE_ACK_TOPIC: &str = "/farm/valve/post/#";
pub const DEFAULT_VALVE_COMMAND_TOPIC: &str = "/farm/valve";
pub const DEFAULT_BUFFER_PATH: &str = "received_data.jsonl";
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const FARM_KEY_FILE: &str = "farm_key.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mqtt: MqttSettings,
    pub cloud_url: String,
    pub farm: FarmIdentity,
    /// Subscription filter for sensor telemetry.
    pub telemetry_topic: String,
    /// Subscription filter for device command acknowledgements.
    pub valve_ack_topic: String,
    /// Commands go to `<valve_command_topic>/<section_device_id>`.
    pub valve_command_topic: String,
    pub forward_interval: Duration,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub buffer_path: String,
    pub telemetry_enabled: bool,
    pub valve_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok(), |path| fs::read_to_string(path))
    }

    /// `var` resolves environment variables; `read_file` is used for the farm key file fallback.
    pub fn from_lookup(
        var: impl Fn(&str) -> Option<String>,
        read_file: impl Fn(&Path) -> io::Result<String>,
    ) -> Result<Self, String> {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let farm_id = non_empty("FARM_ID")
            .ok_or_else(|| "Missing FARM_ID".to_string())?
            .parse::<i64>()
            .map_err(|_| "FARM_ID must be an integer".to_string())?;

        // Prefer env var; fall back to a key file in the working directory
        let farm_key = match non_empty("FARM_KEY") {
            Some(v) => v,
            None => match read_file(Path::new(FARM_KEY_FILE)) {
                Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
                _ => {
                    return Err(format!(
                        "Missing farm key: set FARM_KEY or provide {} in working directory",
                        FARM_KEY_FILE
                    ));
                }
            },
        };

        let port = match non_empty("MQTT_PORT") {
            Some(s) => s.parse::<u16>().map_err(|_| "MQTT_PORT must be a port number".to_string())?,
            None => DEFAULT_MQTT_PORT,
        };

        let mqtt = MqttSettings {
            host: non_empty("MQTT_HOST").unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port,
            client_id: non_empty("MQTT_CLIENT_ID").unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            username: non_empty("MQTT_USERNAME"),
            password: var("MQTT_PASSWORD"),
            keep_alive: secs(&non_empty, "MQTT_KEEP_ALIVE_SECS", 60)?,
            reconnect_delay: secs(&non_empty, "MQTT_RECONNECT_DELAY_SECS", 5)?,
        };

        let telemetry_enabled = flag(&non_empty, "TELEMETRY_ENABLED")?;
        let valve_enabled = flag(&non_empty, "VALVE_ENABLED")?;
        if !telemetry_enabled && !valve_enabled {
            return Err("TELEMETRY_ENABLED and VALVE_ENABLED are both off; nothing to do".to_string());
        }

        Ok(Config {
            mqtt,
            cloud_url: non_empty("CLOUD_URL")
                .unwrap_or_else(|| DEFAULT_CLOUD_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            farm: FarmIdentity {
                id: FarmId(farm_id),
                key: farm_key,
            },
            telemetry_topic: non_empty("TELEMETRY_TOPIC").unwrap_or_else(|| DEFAULT_TELEMETRY_TOPIC.to_string()),
            valve_ack_topic: non_empty("VALVE_ACK_TOPIC").unwrap_or_else(|| DEFAULT_VALVE_ACK_TOPIC.to_string()),
            valve_command_topic: non_empty("VALVE_COMMAND_TOPIC")
                .unwrap_or_else(|| DEFAULT_VALVE_COMMAND_TOPIC.to_string()),
            forward_interval: secs(&non_empty, "FORWARD_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?,
            poll_interval: secs(&non_empty, "POLL_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?,
            http_timeout: secs(&non_empty, "HTTP_TIMEOUT_SECS", 30)?,
            buffer_path: non_empty("BUFFER_PATH").unwrap_or_else(|| DEFAULT_BUFFER_PATH.to_string()),
            telemetry_enabled,
            valve_enabled,
        })
    }
}

fn secs(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration, String> {
    let secs = match var(key) {
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| format!("{} must be a whole number of seconds", key))?,
        None => default,
    };
    if secs == 0 {
        return Err(format!("{} must be greater than zero", key));
    }
    Ok(Duration::from_secs(secs))
}

fn flag(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool, String> {
    match var(key).as_deref() {
        None | Some("1" | "true" | "TRUE") => Ok(true),
        Some("0" | "false" | "FALSE") => Ok(false),
        Some(other) => Err(format!("{} must be true or false, got {:?}", key, other)),
    }
}

/// Load `KEY=VALUE` lines into the process environment. Variables already set are left alone.
pub fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

    for (index, line) in contents.lines().enumerate() {
        let Some((key, value)) =
            parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        if std::env::var_os(&key).is_none() {
            // Mutating the environment is only sound before other threads start.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parse one `.env` line. Blank lines and `#` comments yield `None`.
pub fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(format!("invalid variable name {:?}", key));
    }

    let raw = raw.trim();
    let value = if let Some(rest) = raw.strip_prefix('"') {
        parse_double_quoted(rest)?
    } else if let Some(rest) = raw.strip_prefix('\'') {
        parse_single_quoted(rest)?
    } else {
        raw.split(" #").next().unwrap_or_default().trim_end().to_string()
    };
    Ok(Some((key.to_string(), value)))
}

/// Only whitespace or a comment may follow a closing quote.
fn check_after_quote(remainder: &str, quote: &str) -> Result<(), String> {
    let remainder = remainder.trim();
    if remainder.is_empty() || remainder.starts_with('#') {
        Ok(())
    } else {
        Err(format!("unexpected characters after closing {} quote", quote))
    }
}

/// Double-quoted values understand `\n`, `\r`, `\t`, `\\` and `\"`; any other
/// escaped character stands for itself.
fn parse_double_quoted(input: &str) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    let mut escape = false;

    while let Some(ch) = chars.next() {
        if escape {
            result.push(match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            escape = false;
            continue;
        }
        match ch {
            '\\' => escape = true,
            '"' => {
                check_after_quote(chars.as_str(), "double")?;
                return Ok(result);
            }
            other => result.push(other),
        }
    }

    if escape {
        Err("unterminated escape sequence in double-quoted value".to_string())
    } else {
        Err("unterminated double-quoted value".to_string())
    }
}

/// Single-quoted values are taken literally.
fn parse_single_quoted(input: &str) -> Result<String, String> {
    let (value, rest) = input
        .split_once('\'')
        .ok_or_else(|| "unterminated single-quoted value".to_string())?;
    check_after_quote(rest, "single")?;
    Ok(value.to_string())
}
