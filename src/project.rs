//! # Project Lifecycle Manager
//!
//! Per-tile representation of remote simulation state. Creates (and
//! recreates) the remote project resource for a tile, mirrors the local
//! building geometry into it, triggers calculations and retrieves/crops the
//! result.
//!
//! Creation is retried indefinitely with a short fixed backoff: the backend
//! is known to be flaky and eventual progress beats fast failure. The retry
//! is an explicit loop, never recursion. Triggering a calculation is NOT
//! retried here: it happens after expensive setup and a blind retry could
//! duplicate remote compute, so the error goes to the caller.

use std::sync::Arc;

use geo::{BooleanOps, MultiPolygon, Translate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{
    AnalysisOutput, BuildingPayload, ProjectHandle, ResultHandle, Session, SimulationBackend,
    SnapshotHandle,
};
use crate::config::EngineConfig;
use crate::geometry::{self, multipolygon_from_geojson};
use crate::tiler::{StoredTile, Tile};
use crate::types::{CalculationSettings, EngineError, EngineResult, TileId, UserId};

/// Lifecycle state of a tile's remote workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectState {
    Uninitialized,
    Creating,
    /// Error-absorbing self-loop: a failed creation attempt lands here
    /// before the next attempt.
    Recreating,
    BuildingsSyncing,
    Ready,
    CalculationTriggered,
    ResultCropped,
}

/// One tile's simulation workspace on the remote backend. Owned exclusively
/// by the lifecycle manager; never shared across tiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProject {
    pub tile_id: TileId,
    pub name: String,
    pub project: ProjectHandle,
    pub snapshot: SnapshotHandle,
    pub building_count: usize,
    pub state: ProjectState,
}

/// Cache value for the per-user project set: the backend session plus every
/// tile's workspace and stored tile geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProjectSet {
    pub session: Session,
    pub projects: Vec<StoredProject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProject {
    pub tile: StoredTile,
    pub project: RemoteProject,
}

/// Per-tile simulation output, already cropped to `core ∩ area of interest`
/// and reprojected to geographic coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileResult {
    pub tile_id: TileId,
    /// Cropped result features, coordinates in lon/lat degrees.
    pub features: geojson::FeatureCollection,
    /// Raw value matrix over the buffered bounds, for `result_format=raw`.
    pub raw: Option<Vec<Vec<f64>>>,
    /// South-west corner of the buffered bounds in lon/lat, raw-format metadata.
    pub sw_corner_wgs: [f64; 2],
}

/// Deterministic remote project name for a user's tile. Duplicate detection
/// on the backend relies on this being reproducible.
pub fn project_name(user: &UserId, tile_id: TileId) -> String {
    format!("{user}_{tile_id}")
}

/// Manages remote project resources, one tile at a time.
pub struct ProjectLifecycle {
    backend: Arc<dyn SimulationBackend>,
    config: EngineConfig,
}

impl ProjectLifecycle {
    pub fn new(backend: Arc<dyn SimulationBackend>, config: EngineConfig) -> Self {
        Self { backend, config }
    }

    /// Create the remote workspace for a tile, retrying until it exists.
    ///
    /// Each attempt: delete any remote project already carrying this tile's
    /// deterministic name, create the project anchored at the buffered
    /// bounds' south-west corner, fetch its root snapshot, and purge the
    /// geometry the backend auto-populates so the workspace starts empty.
    pub async fn ensure_project(
        &self,
        session: &Session,
        user: &UserId,
        tile: &Tile,
    ) -> EngineResult<RemoteProject> {
        let name = project_name(user, tile.id);
        debug!("project {} state: {:?}", name, ProjectState::Creating);

        loop {
            match self.create_attempt(session, &name, tile).await {
                Ok((project, snapshot)) => {
                    info!("project {} created as {}", name, project.0);
                    return Ok(RemoteProject {
                        tile_id: tile.id,
                        name,
                        project,
                        snapshot,
                        building_count: 0,
                        state: ProjectState::Ready,
                    });
                }
                Err(e) => {
                    warn!("creating project {} failed ({}), retrying", name, e);
                    debug!("project {} state: {:?}", name, ProjectState::Recreating);
                    tokio::time::sleep(self.config.create_retry_backoff).await;
                }
            }
        }
    }

    async fn create_attempt(
        &self,
        session: &Session,
        name: &str,
        tile: &Tile,
    ) -> EngineResult<(ProjectHandle, SnapshotHandle)> {
        // A leftover project with the same name means an earlier attempt
        // half-succeeded; remove it so the new one is authoritative.
        for existing in self.backend.list_projects(session).await? {
            if existing.name == name {
                warn!("project named {} already exists remotely, deleting it", name);
                self.backend
                    .delete_project(session, &ProjectHandle(existing.uuid))
                    .await?;
            }
        }

        let sw = tile.south_west();
        let sw_wgs = geometry::to_wgs(sw.x, sw.y, self.config.utm_zone);
        let project = self
            .backend
            .create_project(
                session,
                name,
                sw_wgs.x,
                sw_wgs.y,
                tile.buffered_size(),
                self.config.analysis_resolution,
            )
            .await?;

        let snapshot = self.backend.root_snapshot(session, &project).await?;

        // The backend seeds fresh workspaces with map-derived buildings.
        // The simulation must only see the user's own geometry.
        let seeded = self.backend.buildings_in_snapshot(session, &snapshot).await?;
        for uuid in seeded.keys() {
            self.backend.delete_building(session, &snapshot, uuid).await?;
        }

        Ok((project, snapshot))
    }

    /// Mirror the user's building set into the tile workspace.
    ///
    /// Computes the footprints intersecting the buffered bounds, translated
    /// to tile-local coordinates, diffs against the remote state and issues
    /// one create/delete per difference. Re-running with an unchanged set is
    /// a no-op after the diff.
    pub async fn sync_buildings(
        &self,
        session: &Session,
        project: &mut RemoteProject,
        tile: &Tile,
        building_set: &geojson::FeatureCollection,
    ) -> EngineResult<()> {
        project.state = ProjectState::BuildingsSyncing;

        let desired = self.buildings_for_tile(tile, building_set)?;
        let remote = self
            .backend
            .buildings_in_snapshot(session, &project.snapshot)
            .await?;

        let stale: Vec<&String> = remote
            .iter()
            .filter(|(_, payload)| !desired.contains(payload))
            .map(|(uuid, _)| uuid)
            .collect();
        let missing: Vec<&BuildingPayload> = desired
            .iter()
            .filter(|payload| !remote.values().any(|r| r == *payload))
            .collect();

        debug!(
            "project {}: {} buildings desired, {} stale, {} to create",
            project.name,
            desired.len(),
            stale.len(),
            missing.len()
        );

        for uuid in stale {
            self.backend
                .delete_building(session, &project.snapshot, uuid)
                .await?;
        }
        for payload in missing {
            self.backend
                .create_building(session, &project.snapshot, payload)
                .await?;
        }

        project.building_count = desired.len();
        project.state = ProjectState::Ready;
        Ok(())
    }

    /// Building footprints clipped to the tile's buffered bounds, in
    /// tile-local coordinates (origin at the buffered south-west corner).
    fn buildings_for_tile(
        &self,
        tile: &Tile,
        building_set: &geojson::FeatureCollection,
    ) -> EngineResult<Vec<BuildingPayload>> {
        let bbox = MultiPolygon(vec![tile.buffered.to_polygon()]);
        let sw = tile.south_west();
        let mut payloads = Vec::new();

        for feature in &building_set.features {
            let Some(geometry) = &feature.geometry else { continue };
            let footprint_wgs = multipolygon_from_geojson(geometry)?;
            let footprint = geometry::multipolygon_to_utm(&footprint_wgs, self.config.utm_zone);

            let clipped = footprint.intersection(&bbox);
            if clipped.0.is_empty() {
                continue;
            }

            let (height, use_type) = building_attributes(feature)?;
            let local = clipped.translate(-sw.x, -sw.y);
            // Multipolygon intersections are emitted one polygon per payload,
            // matching the backend's single-polygon building model.
            for polygon in local.0 {
                payloads.push(BuildingPayload {
                    geometry: geojson::Geometry::new(geojson::Value::from(&polygon)),
                    height,
                    use_type: use_type.clone(),
                });
            }
        }

        Ok(payloads)
    }

    /// Issue the service run for this tile. Not retried; see module docs.
    pub async fn trigger_calculation(
        &self,
        session: &Session,
        project: &mut RemoteProject,
        settings: &CalculationSettings,
    ) -> EngineResult<ResultHandle> {
        let handle = self
            .backend
            .run_service(session, &project.snapshot, settings)
            .await?;
        project.state = ProjectState::CalculationTriggered;
        info!("project {}: {} calculation triggered as {}", project.name, settings.kind(), handle.0);
        Ok(handle)
    }

    /// Poll for the result within the configured budget, then crop it first
    /// to the core bounds (removing the buffer margin, in tile-local space)
    /// and then to the area of interest. The order matters: the buffer trim
    /// must happen before re-clipping to the possibly irregular area polygon.
    pub async fn fetch_and_crop(
        &self,
        session: &Session,
        project: &mut RemoteProject,
        tile: &Tile,
        area: &MultiPolygon<f64>,
        handle: &ResultHandle,
    ) -> EngineResult<TileResult> {
        let mut attempts = 0u32;
        let output = loop {
            match self
                .backend
                .analysis_output(session, &project.snapshot, handle)
                .await
            {
                Ok(Some(output)) => break output,
                Ok(None) => {
                    attempts += 1;
                    if attempts >= self.config.max_poll_attempts {
                        warn!(
                            "project {}: result {} not ready after {} polls, abandoning tile",
                            project.name, handle.0, attempts
                        );
                        return Err(EngineError::ResultNotReady { attempts });
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_poll_attempts {
                        return Err(e);
                    }
                    warn!("project {}: result poll failed ({}), retrying", project.name, e);
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        };

        let result = self.crop_output(tile, area, &output)?;
        project.state = ProjectState::ResultCropped;
        Ok(result)
    }

    /// Convert the raw matrix into cropped, reprojected result features.
    fn crop_output(
        &self,
        tile: &Tile,
        area: &MultiPolygon<f64>,
        output: &AnalysisOutput,
    ) -> EngineResult<TileResult> {
        let core = MultiPolygon(vec![tile.core.to_polygon()]);
        let zone = self.config.utm_zone;

        let rows = output.values.len();
        let mut features = Vec::new();

        if rows > 0 {
            let cols = output.values[0].len();
            if cols == 0 {
                return Err(EngineError::RemoteProtocol(
                    "analysis output matrix has empty rows".into(),
                ));
            }
            let cell_w = tile.buffered.width() / cols as f64;
            let cell_h = tile.buffered.height() / rows as f64;
            let origin = tile.buffered.min();

            // Row 0 is the southernmost row of the buffered bounds.
            for (row, row_values) in output.values.iter().enumerate() {
                for (col, value) in row_values.iter().enumerate() {
                    if !value.is_finite() {
                        continue;
                    }
                    let cell = geo::Rect::new(
                        geo::Coord {
                            x: origin.x + cell_w * col as f64,
                            y: origin.y + cell_h * row as f64,
                        },
                        geo::Coord {
                            x: origin.x + cell_w * (col + 1) as f64,
                            y: origin.y + cell_h * (row + 1) as f64,
                        },
                    );
                    let cell_mp = MultiPolygon(vec![cell.to_polygon()]);

                    // Buffer trim first, then clip to the area of interest.
                    let trimmed = cell_mp.intersection(&core);
                    if trimmed.0.is_empty() {
                        continue;
                    }
                    let clipped = trimmed.intersection(area);

                    let rounded = (value * 10.0).round() / 10.0;
                    for polygon in clipped.0 {
                        features.push(geojson::Feature {
                            bbox: None,
                            geometry: Some(geometry::polygon_to_geojson_wgs(&polygon, zone)),
                            id: None,
                            properties: Some(
                                [("value".to_string(), serde_json::json!(rounded))]
                                    .into_iter()
                                    .collect(),
                            ),
                            foreign_members: None,
                        });
                    }
                }
            }
        }

        let sw = tile.south_west();
        let sw_wgs = geometry::to_wgs(sw.x, sw.y, zone);

        Ok(TileResult {
            tile_id: tile.id,
            features: geojson::FeatureCollection {
                bbox: None,
                features,
                foreign_members: None,
            },
            raw: Some(output.values.clone()),
            sw_corner_wgs: [sw_wgs.x, sw_wgs.y],
        })
    }

    /// Check whether every given project still exists on the backend.
    pub async fn projects_alive(
        &self,
        session: &Session,
        projects: &[RemoteProject],
    ) -> EngineResult<bool> {
        let remote = self.backend.list_projects(session).await?;
        let alive = projects.iter().all(|p| {
            remote.iter().any(|r| r.uuid == p.project.0 && r.name == p.name)
        });
        Ok(alive)
    }
}

fn building_attributes(feature: &geojson::Feature) -> EngineResult<(f64, String)> {
    let properties = feature
        .properties
        .as_ref()
        .ok_or_else(|| EngineError::InvalidInput("building feature without properties".into()))?;
    let height = properties
        .get("building_height")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| {
            EngineError::InvalidInput("building feature missing numeric 'building_height'".into())
        })?;
    let use_type = properties
        .get("land_use_detailed_type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    Ok((height, use_type))
}
