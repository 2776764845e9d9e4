//! # Core Types
//!
//! Fundamental types shared across the windgrid engine: identifiers,
//! simulation kinds and settings, and the crate-wide error enum.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one tile of the area of interest.
///
/// Tile ids are the row-major enumeration index over kept tiles and are
/// stable for a fixed `(area, tile_size)`. Remote project resources are
/// keyed by them, so they must never be reassigned while an area is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId(pub u32);

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TileId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Unique identifier of a dispatched group of tile pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GroupId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier of a single submitted task (e.g. the group setup task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a planning front-end user. Owns an area of interest, a
/// building set and a set of remote tile projects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The simulation services offered by the remote backend.
///
/// Closed set dispatched through pattern matches; adding a service means
/// adding a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationKind {
    Wind,
    Solar,
    Sunlight,
}

impl fmt::Display for SimulationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationKind::Wind => write!(f, "wind"),
            SimulationKind::Solar => write!(f, "solar"),
            SimulationKind::Sunlight => write!(f, "sunlight"),
        }
    }
}

impl std::str::FromStr for SimulationKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wind" => Ok(SimulationKind::Wind),
            "solar" => Ok(SimulationKind::Solar),
            "sunlight" => Ok(SimulationKind::Sunlight),
            other => Err(EngineError::InvalidInput(format!(
                "unknown simulation kind '{other}'"
            ))),
        }
    }
}

/// Kind-specific calculation parameters. Immutable, hashable value; the
/// settings hash is one third of the result cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CalculationSettings {
    Wind { wind_speed: f64, wind_direction: f64 },
    Solar,
    Sunlight,
}

impl CalculationSettings {
    pub fn kind(&self) -> SimulationKind {
        match self {
            CalculationSettings::Wind { .. } => SimulationKind::Wind,
            CalculationSettings::Solar => SimulationKind::Solar,
            CalculationSettings::Sunlight => SimulationKind::Sunlight,
        }
    }
}

/// Error types for the windgrid engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Transient remote failure (network error, backend 5xx). Retried by the
    /// lifecycle manager where allowed, otherwise surfaced per-tile.
    #[error("remote backend error: {0}")]
    Remote(String),

    /// The remote backend answered 200 but the payload did not have the
    /// expected shape. Never silently treated as an empty object.
    #[error("remote protocol error: {0}")]
    RemoteProtocol(String),

    /// The building/geometry provider could not deliver required data.
    #[error("building provider error: {0}")]
    Provider(String),

    /// Malformed settings, unknown simulation kind, absent user data.
    /// Surfaced immediately as a client error; never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The per-tile poll budget was exhausted before the backend produced a
    /// result. Surfaced as "no result for this tile", not a request failure.
    #[error("result not ready after {attempts} poll attempts")]
    ResultNotReady { attempts: u32 },

    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for windgrid engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
