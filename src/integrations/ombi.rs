//! Ombi media-request sensors.
//!
//! Polls the Ombi v1 API every 60 seconds and publishes six request counters
//! as `sensor.ombi_*` entities. A failed poll sets every sensor to `unknown`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::api::AppState;
use crate::error::OmbiError;
use crate::state::{slugify, Attributes, STATE_UNKNOWN};

pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct OmbiConfig {
    pub host: String,
    pub api_key: String,
    pub username: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    /// Path prefix when Ombi runs behind a reverse proxy.
    #[serde(default)]
    pub urlbase: String,
}

fn default_port() -> u16 {
    5000
}

impl OmbiConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        let urlbase = self.urlbase.trim_matches('/');
        let urlbase = if urlbase.is_empty() {
            String::new()
        } else {
            format!("{}/", urlbase)
        };
        format!("{}://{}:{}/{}api/v1/", scheme, self.host, self.port, urlbase)
    }
}

pub struct OmbiSensorType {
    pub key: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
}

pub const SENSOR_TYPES: [OmbiSensorType; 6] = [
    OmbiSensorType { key: "movies", name: "Movie requests", icon: "mdi:movie" },
    OmbiSensorType { key: "tv", name: "TV Show requests", icon: "mdi:television-classic" },
    OmbiSensorType { key: "music", name: "Music album requests", icon: "mdi:album" },
    OmbiSensorType { key: "pending", name: "Pending requests", icon: "mdi:clock-alert-outline" },
    OmbiSensorType { key: "approved", name: "Approved requests", icon: "mdi:check" },
    OmbiSensorType { key: "available", name: "Available requests", icon: "mdi:download" },
];

impl OmbiSensorType {
    pub fn friendly_name(&self) -> String {
        format!("Ombi {}", self.name)
    }

    pub fn entity_id(&self) -> String {
        format!("sensor.{}", slugify(&self.friendly_name()))
    }
}

// ── Ombi JSON structures ───────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub approved: u64,
    #[serde(default)]
    pub available: u64,
}

/// Everything the sensors show, fetched in one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OmbiSnapshot {
    pub movie_requests: u64,
    pub tv_requests: u64,
    pub music_requests: u64,
    pub total_requests: RequestCounts,
}

impl OmbiSnapshot {
    pub fn value(&self, key: &str) -> Option<u64> {
        match key {
            "movies" => Some(self.movie_requests),
            "tv" => Some(self.tv_requests),
            "music" => Some(self.music_requests),
            "pending" => Some(self.total_requests.pending),
            "approved" => Some(self.total_requests.approved),
            "available" => Some(self.total_requests.available),
            _ => None,
        }
    }
}

// ── Client ──────────────────────────────────────────────────────

pub struct OmbiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    username: String,
}

impl OmbiClient {
    pub fn new(config: &OmbiConfig) -> Result<Self, OmbiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| OmbiError::Request {
                endpoint: String::new(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            api_key: config.api_key.clone(),
            username: config.username.clone(),
        })
    }

    async fn get_json(&self, endpoint: &str) -> Result<serde_json::Value, OmbiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self
            .client
            .get(&url)
            .header("ApiKey", &self.api_key)
            .header("UserName", &self.username)
            .send()
            .await
            .map_err(|source| OmbiError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OmbiError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        resp.json().await.map_err(|e| OmbiError::InvalidResponse {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    async fn request_count(&self, endpoint: &str) -> Result<u64, OmbiError> {
        let body = self.get_json(endpoint).await?;
        count_requests(endpoint, &body)
    }

    pub async fn fetch(&self) -> Result<OmbiSnapshot, OmbiError> {
        let movie_requests = self.request_count("Request/movie").await?;
        let tv_requests = self.request_count("Request/tv").await?;
        let music_requests = self.request_count("Request/music").await?;
        let totals = self.get_json("Request/count").await?;
        let total_requests =
            serde_json::from_value(totals).map_err(|e| OmbiError::InvalidResponse {
                endpoint: "Request/count".to_string(),
                message: e.to_string(),
            })?;
        Ok(OmbiSnapshot {
            movie_requests,
            tv_requests,
            music_requests,
            total_requests,
        })
    }
}

fn count_requests(endpoint: &str, body: &serde_json::Value) -> Result<u64, OmbiError> {
    body.as_array()
        .map(|requests| requests.len() as u64)
        .ok_or_else(|| OmbiError::InvalidResponse {
            endpoint: endpoint.to_string(),
            message: "expected a list of requests".to_string(),
        })
}

// ── Poller ──────────────────────────────────────────────────────

/// Spawn the task that polls Ombi and updates the sensors.
pub fn start_ombi_poller(app_state: Arc<AppState>, config: OmbiConfig) -> Result<(), OmbiError> {
    let client = OmbiClient::new(&config)?;
    tracing::info!("Ombi integration active for {}", config.base_url());

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let result = client.fetch().await;
            update_sensors(&app_state, &result);
        }
    });
    Ok(())
}

pub fn update_sensors(app_state: &AppState, result: &Result<OmbiSnapshot, OmbiError>) {
    if let Err(e) = result {
        tracing::warn!("Unable to update Ombi sensor: {}", e);
    }

    for sensor in &SENSOR_TYPES {
        let state = match result {
            Ok(snapshot) => snapshot
                .value(sensor.key)
                .map(|v| v.to_string())
                .unwrap_or_else(|| STATE_UNKNOWN.to_string()),
            Err(_) => STATE_UNKNOWN.to_string(),
        };

        let mut attrs = Attributes::new();
        attrs.insert("friendly_name".into(), serde_json::json!(sensor.friendly_name()));
        attrs.insert("icon".into(), serde_json::json!(sensor.icon));
        app_state.state_machine.set(sensor.entity_id(), state, attrs);
    }
}
