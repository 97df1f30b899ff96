//! HTTP transport for the broker's session API.
//!
//! Fixed contract: `POST /api/start`, `POST /api/reset`,
//! `GET /api/transcript` (full snapshot, JSON).

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::PollConfig;
use crate::poller::SessionTransport;
use crate::store::Snapshot;

pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &PollConfig) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str) -> Result<(), String> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| format!("POST {path} failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("POST {path} returned {}", response.status()));
        }
        debug!("POST {path} ok");
        Ok(())
    }
}

impl SessionTransport for HttpTransport {
    async fn start_session(&self) -> Result<(), String> {
        // The broker completes the whole negotiation before answering this
        // request, so it gets a much longer timeout than the snapshot polls.
        let url = format!("{}/api/start", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(600))
            .send()
            .await
            .map_err(|e| format!("POST /api/start failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("POST /api/start returned {}", response.status()));
        }
        debug!("POST /api/start ok");
        Ok(())
    }

    async fn reset_session(&self) -> Result<(), String> {
        self.post("/api/reset").await
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, String> {
        let url = format!("{}/api/transcript", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("GET /api/transcript failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("GET /api/transcript returned {}", response.status()));
        }

        response
            .json::<Snapshot>()
            .await
            .map_err(|e| format!("Failed to parse transcript snapshot: {e}"))
    }
}
