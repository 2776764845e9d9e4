//! # Windgrid Engine
//!
//! Tiling, orchestration and caching engine for remote environmental
//! simulations (wind comfort, solar radiation, sunlight hours) over the
//! spatial extent of a city project area.
//!
//! The remote backend only simulates small square cells, so the engine
//! partitions the area of interest into buffered tiles, maintains one remote
//! project per tile, fans a calculation out across the tiles, crops and
//! dissolves the per-tile outputs into one city-wide result and memoizes
//! completed answers content-addressably.

pub mod aggregate;
pub mod api;
pub mod backend;
pub mod cache;
pub mod config;
pub mod geometry;
pub mod orchestrator;
pub mod project;
pub mod provider;
pub mod tiler;
pub mod types;

// Re-export the core types
pub use types::{
    CalculationSettings, EngineError, EngineResult, GroupId, SimulationKind, TaskId, TileId,
    UserId,
};

// Re-export the engine surface
pub use backend::{HttpBackend, SimulationBackend};
pub use cache::{CacheConfig, CacheKeys, ResultCache};
pub use config::EngineConfig;
pub use orchestrator::{GroupProgress, Orchestrator, TaskState};
pub use project::{ProjectLifecycle, RemoteProject, TileResult};
pub use provider::{BuildingProvider, HttpProvider};
pub use tiler::{build_tiles, Tile};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name used in health responses and logs.
pub const NAME: &str = "windgrid-node";
