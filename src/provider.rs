//! # Building Data Provider Boundary
//!
//! Client interface to the external service that owns the per-user building
//! footprints and the project area polygon. Reads are retried a bounded
//! number of times with a fixed backoff; after that the error surfaces as a
//! provider failure (missing input, not a crash).

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::types::{EngineError, EngineResult, UserId};

/// Layer names the engine reads from the provider.
pub const LAYER_PROJECT_AREA: &str = "project_area";
pub const LAYER_BUILDINGS: &str = "buildings";
pub const LAYER_UPPERFLOOR: &str = "upperfloor";

/// The building/geometry data provider, at the granularity the engine needs.
#[async_trait]
pub trait BuildingProvider: Send + Sync {
    /// Fetch one named GeoJSON layer for a user.
    async fn layer(&self, user: &UserId, layer: &str) -> EngineResult<geojson::FeatureCollection>;

    /// The user's building snapshot. Prefers the `buildings` layer and falls
    /// back to `upperfloor` for users that only maintain floor outlines.
    async fn buildings(&self, user: &UserId) -> EngineResult<geojson::FeatureCollection> {
        match self.layer(user, LAYER_BUILDINGS).await {
            Ok(fc) => Ok(fc),
            Err(e) => {
                debug!("no '{}' layer for {} ({}), falling back to '{}'",
                    LAYER_BUILDINGS, user, e, LAYER_UPPERFLOOR);
                self.layer(user, LAYER_UPPERFLOOR).await
            }
        }
    }

    /// The user's area of interest polygon(s).
    async fn project_area(&self, user: &UserId) -> EngineResult<geojson::FeatureCollection> {
        self.layer(user, LAYER_PROJECT_AREA).await
    }
}

/// Provider configuration for the HTTP client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Bounded retry count for reads.
    pub max_retries: u32,
    /// Fixed delay between retries.
    pub retry_backoff: std::time::Duration,
}

/// HTTP client for the building data provider.
pub struct HttpProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_layer(
        &self,
        user: &UserId,
        layer: &str,
    ) -> EngineResult<geojson::FeatureCollection> {
        #[derive(serde::Serialize)]
        struct LayerRequest<'a> {
            userid: &'a str,
            layer: &'a str,
        }

        let response = self
            .client
            .get(format!("{}/getLayer", self.config.base_url))
            .json(&LayerRequest { userid: user.as_str(), layer })
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("getLayer {layer}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Provider(format!(
                "getLayer {layer} for {user} returned status {status}"
            )));
        }

        response
            .json::<geojson::FeatureCollection>()
            .await
            .map_err(|e| EngineError::Provider(format!("getLayer {layer}: malformed GeoJSON: {e}")))
    }
}

#[async_trait]
impl BuildingProvider for HttpProvider {
    async fn layer(&self, user: &UserId, layer: &str) -> EngineResult<geojson::FeatureCollection> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_layer(user, layer).await {
                Ok(fc) => return Ok(fc),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "provider read of '{}' for {} failed (attempt {}/{}): {}",
                        layer, user, attempt, self.config.max_retries, e
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
