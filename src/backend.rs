//! # Simulation Backend Boundary
//!
//! Typed client interface to the remote simulation service. The engine only
//! ever talks to the backend through [`SimulationBackend`], so tests swap in
//! an in-process mock and the orchestrator never sees raw wire payloads.
//!
//! Responses are decoded into typed structs at this boundary; an expected
//! field that is absent becomes an [`EngineError::RemoteProtocol`], never a
//! silently empty value.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{CalculationSettings, EngineError, EngineResult};

/// Authenticated session with the backend: client uuid plus auth token,
/// carried with every call. Persisted alongside the per-user project set so
/// recreated workers can resume without a fresh login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub client_uuid: String,
    pub token: String,
}

/// Opaque handle of a remote project workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectHandle(pub String);

/// Opaque handle of a project's root snapshot; buildings and service runs
/// attach to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle(pub String);

/// Opaque handle of a triggered calculation, used to poll for its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultHandle(pub String);

/// Listing entry of a remote project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProjectInfo {
    pub uuid: String,
    pub name: String,
}

/// One building footprint as the backend stores it: geometry in tile-local
/// cartesian coordinates plus the attributes the simulation consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingPayload {
    pub geometry: geojson::Geometry,
    pub height: f64,
    #[serde(rename = "use")]
    pub use_type: String,
}

/// Raw output of one completed tile calculation: a row-major value matrix
/// covering the buffered tile bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub values: Vec<Vec<f64>>,
}

/// The remote simulation service, at the granularity the engine needs.
#[async_trait]
pub trait SimulationBackend: Send + Sync {
    /// Authenticate and obtain a session.
    async fn login(&self) -> EngineResult<Session>;

    /// List all projects owned by the session's client. Doubles as the
    /// keep-alive ping the backend requires.
    async fn list_projects(&self, session: &Session) -> EngineResult<Vec<RemoteProjectInfo>>;

    /// Create a project workspace anchored at a WGS84 south-west corner.
    async fn create_project(
        &self,
        session: &Session,
        name: &str,
        sw_lon: f64,
        sw_lat: f64,
        size: f64,
        resolution: f64,
    ) -> EngineResult<ProjectHandle>;

    async fn delete_project(&self, session: &Session, project: &ProjectHandle) -> EngineResult<()>;

    /// Fetch the root snapshot of a project.
    async fn root_snapshot(
        &self,
        session: &Session,
        project: &ProjectHandle,
    ) -> EngineResult<SnapshotHandle>;

    /// All buildings currently present in a snapshot, keyed by their remote
    /// uuid.
    async fn buildings_in_snapshot(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
    ) -> EngineResult<HashMap<String, BuildingPayload>>;

    async fn create_building(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
        building: &BuildingPayload,
    ) -> EngineResult<String>;

    async fn delete_building(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
        building_uuid: &str,
    ) -> EngineResult<()>;

    /// Trigger the service run for the given settings. Returns the handle to
    /// poll for the output.
    async fn run_service(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
        settings: &CalculationSettings,
    ) -> EngineResult<ResultHandle>;

    /// Poll a triggered calculation. `Ok(None)` means "not ready yet".
    async fn analysis_output(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
        result: &ResultHandle,
    ) -> EngineResult<Option<AnalysisOutput>>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// Backend configuration for the HTTP client.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// HTTP client for the remote simulation service.
pub struct HttpBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

/// Wire envelope for backend operations.
#[derive(Serialize)]
struct OpRequest<'a, T: Serialize> {
    operation: &'a str,
    #[serde(flatten)]
    params: T,
}

#[derive(Deserialize)]
struct UuidResponse {
    uuid: Option<String>,
    success: Option<bool>,
}

#[derive(Deserialize)]
struct ProjectListResponse {
    projects: Option<Vec<RemoteProjectInfo>>,
}

#[derive(Deserialize)]
struct SnapshotResponse {
    snapshot_uuid: Option<String>,
}

#[derive(Deserialize)]
struct BuildingsResponse {
    buildings: Option<HashMap<String, BuildingPayload>>,
}

#[derive(Deserialize)]
struct OutputResponse {
    ready: bool,
    values: Option<Vec<Vec<f64>>>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn call<P: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        session: &Session,
        operation: &str,
        params: P,
    ) -> EngineResult<R> {
        let response = self
            .client
            .post(format!("{}/api", self.config.base_url))
            .header("Cookie", &session.token)
            .json(&OpRequest { operation, params })
            .send()
            .await
            .map_err(|e| EngineError::Remote(format!("{operation}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Remote(format!(
                "{operation} returned status {status}"
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| EngineError::RemoteProtocol(format!("{operation}: {e}")))
    }
}

#[async_trait]
impl SimulationBackend for HttpBackend {
    async fn login(&self) -> EngineResult<Session> {
        #[derive(Serialize)]
        struct Credentials<'a> {
            username: &'a str,
            password: &'a str,
        }
        #[derive(Deserialize)]
        struct LoginResponse {
            client_uuid: Option<String>,
            token: Option<String>,
        }

        let response = self
            .client
            .post(&self.config.base_url)
            .json(&Credentials {
                username: &self.config.username,
                password: &self.config.password,
            })
            .send()
            .await
            .map_err(|e| EngineError::Remote(format!("login: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Remote(format!("login returned status {status}")));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| EngineError::RemoteProtocol(format!("login: {e}")))?;

        match (body.client_uuid, body.token) {
            (Some(client_uuid), Some(token)) => {
                debug!("backend login succeeded for client {}", client_uuid);
                Ok(Session { client_uuid, token })
            }
            _ => Err(EngineError::RemoteProtocol(
                "login response missing client_uuid or token".into(),
            )),
        }
    }

    async fn list_projects(&self, session: &Session) -> EngineResult<Vec<RemoteProjectInfo>> {
        #[derive(Serialize)]
        struct Params<'a> {
            client_uuid: &'a str,
        }
        let body: ProjectListResponse = self
            .call(session, "getProjectsByUserUuid", Params { client_uuid: &session.client_uuid })
            .await?;
        // An account without projects legitimately has none; only a missing
        // field is a protocol violation.
        body.projects.ok_or_else(|| {
            EngineError::RemoteProtocol("project listing missing 'projects' field".into())
        })
    }

    async fn create_project(
        &self,
        session: &Session,
        name: &str,
        sw_lon: f64,
        sw_lat: f64,
        size: f64,
        resolution: f64,
    ) -> EngineResult<ProjectHandle> {
        #[derive(Serialize)]
        struct Params<'a> {
            name: &'a str,
            longitude: f64,
            latitude: f64,
            size: f64,
            resolution: f64,
        }
        let body: UuidResponse = self
            .call(
                session,
                "createNewProject",
                Params { name, longitude: sw_lon, latitude: sw_lat, size, resolution },
            )
            .await?;

        if body.success != Some(true) {
            return Err(EngineError::Remote(format!(
                "backend refused to create project '{name}'"
            )));
        }
        body.uuid.map(ProjectHandle).ok_or_else(|| {
            EngineError::RemoteProtocol("createNewProject response missing 'uuid'".into())
        })
    }

    async fn delete_project(&self, session: &Session, project: &ProjectHandle) -> EngineResult<()> {
        #[derive(Serialize)]
        struct Params<'a> {
            project_uuid: &'a str,
        }
        let body: UuidResponse = self
            .call(session, "deleteProject", Params { project_uuid: &project.0 })
            .await?;
        if body.success != Some(true) {
            warn!("backend reported failure deleting project {}", project.0);
        }
        Ok(())
    }

    async fn root_snapshot(
        &self,
        session: &Session,
        project: &ProjectHandle,
    ) -> EngineResult<SnapshotHandle> {
        #[derive(Serialize)]
        struct Params<'a> {
            project_uuid: &'a str,
        }
        let body: SnapshotResponse = self
            .call(session, "getSnapshotsByProjectUuid", Params { project_uuid: &project.0 })
            .await?;
        body.snapshot_uuid.map(SnapshotHandle).ok_or_else(|| {
            EngineError::RemoteProtocol("snapshot response missing 'snapshot_uuid'".into())
        })
    }

    async fn buildings_in_snapshot(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
    ) -> EngineResult<HashMap<String, BuildingPayload>> {
        #[derive(Serialize)]
        struct Params<'a> {
            snapshot_uuid: &'a str,
        }
        let body: BuildingsResponse = self
            .call(session, "getSnapshotGeometryObjects", Params { snapshot_uuid: &snapshot.0 })
            .await?;
        // A snapshot with no buildings comes back as an empty map.
        Ok(body.buildings.unwrap_or_default())
    }

    async fn create_building(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
        building: &BuildingPayload,
    ) -> EngineResult<String> {
        #[derive(Serialize)]
        struct Params<'a> {
            snapshot_uuid: &'a str,
            building: &'a BuildingPayload,
        }
        let body: UuidResponse = self
            .call(
                session,
                "createNewBuilding",
                Params { snapshot_uuid: &snapshot.0, building },
            )
            .await?;
        body.uuid.ok_or_else(|| {
            EngineError::RemoteProtocol("createNewBuilding response missing 'uuid'".into())
        })
    }

    async fn delete_building(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
        building_uuid: &str,
    ) -> EngineResult<()> {
        #[derive(Serialize)]
        struct Params<'a> {
            snapshot_uuid: &'a str,
            building_uuid: &'a str,
        }
        let _: UuidResponse = self
            .call(
                session,
                "deleteBuilding",
                Params { snapshot_uuid: &snapshot.0, building_uuid },
            )
            .await?;
        Ok(())
    }

    async fn run_service(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
        settings: &CalculationSettings,
    ) -> EngineResult<ResultHandle> {
        // Closed dispatch over the service kinds; the wire operation name
        // is the only thing that differs per variant.
        let (operation, params) = match settings {
            CalculationSettings::Wind { wind_speed, wind_direction } => (
                "runServiceWindComfort",
                serde_json::json!({
                    "snapshot_uuid": snapshot.0,
                    "wind_speed": wind_speed,
                    "wind_direction": wind_direction,
                }),
            ),
            CalculationSettings::Solar => (
                "runServiceSolarRadiation",
                serde_json::json!({ "snapshot_uuid": snapshot.0 }),
            ),
            CalculationSettings::Sunlight => (
                "runServiceSunlightHours",
                serde_json::json!({ "snapshot_uuid": snapshot.0 }),
            ),
        };

        let body: UuidResponse = self.call(session, operation, params).await?;
        body.uuid.map(ResultHandle).ok_or_else(|| {
            EngineError::RemoteProtocol(format!("{operation} response missing 'uuid'"))
        })
    }

    async fn analysis_output(
        &self,
        session: &Session,
        snapshot: &SnapshotHandle,
        result: &ResultHandle,
    ) -> EngineResult<Option<AnalysisOutput>> {
        #[derive(Serialize)]
        struct Params<'a> {
            snapshot_uuid: &'a str,
            result_uuid: &'a str,
        }
        let body: OutputResponse = self
            .call(
                session,
                "getAnalysisOutput",
                Params { snapshot_uuid: &snapshot.0, result_uuid: &result.0 },
            )
            .await?;

        if !body.ready {
            return Ok(None);
        }
        let values = body.values.ok_or_else(|| {
            EngineError::RemoteProtocol("ready analysis output missing 'values'".into())
        })?;
        Ok(Some(AnalysisOutput { values }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_round_trips_through_json() {
        let session = Session {
            client_uuid: "c-1".into(),
            token: "InFraReD=abc".into(),
        };
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_building_payload_field_names() {
        let payload = BuildingPayload {
            geometry: geojson::Geometry::new(geojson::Value::Point(vec![0.0, 0.0])),
            height: 12.5,
            use_type: "residential".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["use"], "residential");
        assert_eq!(json["height"], 12.5);
    }
}
