//! Blocking HTTP client for the farm cloud service.
//!
//! - Uses `ureq` (no async); every call is bounded by a global timeout.
//! - Only `200 OK` counts as success. Other statuses come back as `CloudClientError::Http`.
//! - Request and response bodies are the types in `crate::models::farm`.

use http::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::models::farm::*;

#[derive(Debug)]
pub enum CloudClientError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
}

impl core::fmt::Display for CloudClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CloudClientError::Transport(s) => write!(f, "transport error: {}", s),
            CloudClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            CloudClientError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for CloudClientError {}

impl From<ureq::Error> for CloudClientError {
    fn from(value: ureq::Error) -> Self {
        CloudClientError::Transport(value.to_string())
    }
}

/// Cloud endpoints used by the bridge.
#[cfg_attr(test, mockall::automock)]
pub trait CloudApi: Send + Sync {
    /// `POST /iot/moisture/<farm_id>`
    fn post_telemetry(&self, farm_id: FarmId, batch: &TelemetryBatch) -> Result<(), CloudClientError>;

    /// `GET /iot/valve/<farm_id>` (with a JSON body)
    fn fetch_valve_commands(
        &self,
        farm_id: FarmId,
        request: &ValveCommandsRequest,
    ) -> Result<ValveCommandsResponse, CloudClientError>;

    /// `POST /iot/valve/<section_device_id>`
    fn post_valve_ack(&self, device: &SectionDeviceId, ack: &ValveAck) -> Result<(), CloudClientError>;
}

#[derive(Clone)]
pub struct CloudClient {
    agent: ureq::Agent,
    base_url: String,
}

impl CloudClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();

        CloudClient {
            agent: ureq::Agent::new_with_config(config),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn check_status(mut resp: http::Response<ureq::Body>) -> Result<http::Response<ureq::Body>, CloudClientError> {
        let status = resp.status();
        if status == StatusCode::OK {
            return Ok(resp);
        }
        let body = resp
            .body_mut()
            .read_to_string()
            .unwrap_or_else(|_| String::from("<no body>"));
        Err(CloudClientError::Http {
            status: status.as_u16(),
            message: body,
        })
    }

    fn decode<T: DeserializeOwned>(mut resp: http::Response<ureq::Body>) -> Result<T, CloudClientError> {
        let text = resp.body_mut().read_to_string()?;
        let de = &mut serde_json::Deserializer::from_str(&text);
        serde_path_to_error::deserialize(de).map_err(|e| CloudClientError::Json(e.to_string()))
    }

    fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), CloudClientError> {
        let resp = self
            .agent
            .post(&self.url(path))
            .header("Accept", "application/json")
            .send_json(body)?;
        Self::check_status(resp).map(|_| ())
    }

    /// The cloud reads the farm key from the body even on GET.
    fn get_json_with_body<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, CloudClientError> {
        let resp = self
            .agent
            .get(&self.url(path))
            .header("Accept", "application/json")
            .force_send_body()
            .send_json(body)?;
        Self::decode(Self::check_status(resp)?)
    }
}

impl CloudApi for CloudClient {
    fn post_telemetry(&self, farm_id: FarmId, batch: &TelemetryBatch) -> Result<(), CloudClientError> {
        self.post_json(&format!("/iot/moisture/{}", farm_id.0), batch)
    }

    fn fetch_valve_commands(
        &self,
        farm_id: FarmId,
        request: &ValveCommandsRequest,
    ) -> Result<ValveCommandsResponse, CloudClientError> {
        self.get_json_with_body(&format!("/iot/valve/{}", farm_id.0), request)
    }

    fn post_valve_ack(&self, device: &SectionDeviceId, ack: &ValveAck) -> Result<(), CloudClientError> {
        // Ids are restricted to path-safe characters when parsed, so no escaping is needed.
        self.post_json(&format!("/iot/valve/{}", device), ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_onto_base_url() {
        let client = CloudClient::new("http://cloud.local:3000/", Duration::from_secs(5));
        assert_eq!(client.url("/iot/moisture/1"), "http://cloud.local:3000/iot/moisture/1");
        assert_eq!(client.url("iot/valve/6"), "http://cloud.local:3000/iot/valve/6");
    }

    #[test]
    fn http_error_display_includes_status_and_body() {
        let err = CloudClientError::Http {
            status: 503,
            message: "maintenance".into(),
        };
        assert_eq!(err.to_string(), "http 503: maintenance");
    }
}
