//! Collaborators backed by the counselling platform's own backend: safety alerts and emotion estimates.

use super::{AffectSource, SafetyAlerter};
use crate::error::ProviderError;
use crate::voice::memory::AffectSnapshot;
use crate::voice::safety::SafetyAlert;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Records alerts in the audit log only. Used when no backend is configured.
pub struct LogAlerter;

#[async_trait]
impl SafetyAlerter for LogAlerter {
    async fn send_alert(&self, alert: &SafetyAlert) -> Result<(), ProviderError> {
        warn!(
            target: "audit",
            user_id = %alert.user_id,
            session_id = %alert.session_id,
            risk_level = %alert.risk_level,
            urgent = alert.urgent,
            "Safety alert: {}",
            alert.summary
        );
        Ok(())
    }
}

/// Posts alerts to `{base}/api/alerts/` with the internal service token.
pub struct HttpAlerter {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl HttpAlerter {
    pub fn new(http: reqwest::Client, base_url: &str, token: &str) -> Self {
        Self {
            http,
            url: format!("{}/api/alerts/", base_url.trim_end_matches('/')),
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl SafetyAlerter for HttpAlerter {
    async fn send_alert(&self, alert: &SafetyAlert) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(&self.url)
            .header("X-Internal-Token", &self.token)
            .json(alert)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Http(format!("alert rejected: {}", response.status())));
        }
        debug!(session_id = %alert.session_id, "Safety alert delivered");
        Ok(())
    }
}

#[derive(Deserialize)]
struct EmotionResponse {
    #[serde(default)]
    emotion: Option<BTreeMap<String, f32>>,
}

/// Reads the latest emotion estimate from `{base}/api/emotions/{user_id}/latest/`.
///
/// Answers (including "nothing known") are cached per user for `ttl`, so a
/// chatty session does not hit the backend on every utterance.
pub struct HttpAffectSource {
    http: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, Option<AffectSnapshot>)>>,
}

impl HttpAffectSource {
    pub fn new(http: reqwest::Client, base_url: &str, ttl: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<AffectSnapshot>, ProviderError> {
        let url = format!("{}/api/emotions/{}/latest/", self.base_url, user_id);
        let response = self.http.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ProviderError::Http(format!("emotion lookup failed: {}", response.status())));
        }

        let body: EmotionResponse = response.json().await?;
        Ok(body.emotion.filter(|scores| !scores.is_empty()).map(AffectSnapshot))
    }

    /// Store a fresh answer and drop every entry past its TTL.
    async fn remember(&self, user_id: &str, snapshot: Option<AffectSnapshot>) {
        let mut cache = self.cache.lock().await;
        let ttl = self.ttl;
        cache.retain(|_, (fetched_at, _)| fetched_at.elapsed() < ttl);
        cache.insert(user_id.to_string(), (Instant::now(), snapshot));
    }
}

#[async_trait]
impl AffectSource for HttpAffectSource {
    async fn latest(&self, user_id: &str) -> Result<Option<AffectSnapshot>, ProviderError> {
        {
            let cache = self.cache.lock().await;
            if let Some((fetched_at, snapshot)) = cache.get(user_id) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let snapshot = self.fetch(user_id).await?;
        self.remember(user_id, snapshot.clone()).await;
        Ok(snapshot)
    }
}
