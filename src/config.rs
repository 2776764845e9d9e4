//! # Engine Configuration
//!
//! All tunables of the tiling/orchestration/caching engine in one place,
//! with defaults matching the production deployment and env overrides for
//! the binary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum edge length the remote backend accepts for one project cell (m).
pub const MAX_PROJECT_CELL_SIZE: f64 = 500.0;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Edge length of one core tile in meters.
    pub tile_size: f64,
    /// Symmetric margin added around each tile before simulation and trimmed
    /// from the result afterwards, in meters. `tile_size + 2 * tile_buffer`
    /// must not exceed [`MAX_PROJECT_CELL_SIZE`].
    pub tile_buffer: f64,
    /// Grid resolution of the remote analysis in meters per cell.
    pub analysis_resolution: f64,
    /// UTM zone the projected coordinate system uses.
    pub utm_zone: u8,
    /// Maximum number of result poll attempts per tile.
    pub max_poll_attempts: u32,
    /// Delay between result poll attempts.
    pub poll_interval: Duration,
    /// Fixed backoff between remote project creation attempts.
    pub create_retry_backoff: Duration,
    /// Fixed backoff between building provider retries.
    pub provider_retry_backoff: Duration,
    /// Bounded retry count for building provider reads.
    pub provider_max_retries: u32,
    /// How long finalized groups and resolved tasks stay queryable before
    /// the retention sweep drops them.
    pub result_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let tile_size = 460.0;
        Self {
            tile_size,
            tile_buffer: (MAX_PROJECT_CELL_SIZE - tile_size) / 2.0,
            analysis_resolution: 10.0,
            utm_zone: 32,
            max_poll_attempts: 100,
            poll_interval: Duration::from_secs(2),
            create_retry_backoff: Duration::from_secs(1),
            provider_retry_backoff: Duration::from_secs(5),
            provider_max_retries: 10,
            result_retention: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Validate internal consistency of the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_size <= 0.0 {
            return Err("tile_size must be positive".into());
        }
        if self.tile_buffer < 0.0 {
            return Err("tile_buffer must not be negative".into());
        }
        if self.tile_size + 2.0 * self.tile_buffer > MAX_PROJECT_CELL_SIZE {
            return Err(format!(
                "buffered tile size {} exceeds backend cell limit {}",
                self.tile_size + 2.0 * self.tile_buffer,
                MAX_PROJECT_CELL_SIZE
            ));
        }
        if self.max_poll_attempts == 0 {
            return Err("max_poll_attempts must be at least 1".into());
        }
        if !(1..=60).contains(&self.utm_zone) {
            return Err(format!("utm_zone {} out of range 1..=60", self.utm_zone));
        }
        Ok(())
    }

    /// Edge length of a buffered tile in meters.
    pub fn buffered_tile_size(&self) -> f64 {
        self.tile_size + 2.0 * self.tile_buffer
    }
}
