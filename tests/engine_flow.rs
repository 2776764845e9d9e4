//! End-to-end engine tests against in-process backend/provider mocks: the
//! full trigger → dispatch → poll → crop → aggregate → cache path without
//! any network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use windgrid_node::backend::{
    AnalysisOutput, BuildingPayload, ProjectHandle, RemoteProjectInfo, ResultHandle, Session,
    SimulationBackend, SnapshotHandle,
};
use windgrid_node::cache::{CacheConfig, ResultCache};
use windgrid_node::geometry::{polygon_to_wgs, square, to_utm};
use windgrid_node::orchestrator::{Orchestrator, TaskState};
use windgrid_node::provider::BuildingProvider;
use windgrid_node::types::{CalculationSettings, EngineError, EngineResult, GroupId, TaskId, UserId};
use windgrid_node::EngineConfig;

const ZONE: u8 = 32;

// ============================================================================
// Mocks
// ============================================================================

#[derive(Default)]
struct BackendInner {
    /// project uuid -> name
    projects: HashMap<String, String>,
    /// snapshot uuid -> project uuid
    snapshots: HashMap<String, String>,
    /// snapshot uuid -> buildings
    buildings: HashMap<String, HashMap<String, BuildingPayload>>,
    /// result uuid -> snapshot uuid
    results: HashMap<String, String>,
    counter: u32,
}

/// In-memory simulation backend. Optionally refuses to trigger for specific
/// project names or never delivers results, for the failure-path tests.
struct MockBackend {
    inner: Mutex<BackendInner>,
    run_calls: AtomicU32,
    fail_trigger_names: Vec<String>,
    never_ready: bool,
    /// Project names whose results stay pending forever.
    pending_names: Vec<String>,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BackendInner::default()),
            run_calls: AtomicU32::new(0),
            fail_trigger_names: Vec::new(),
            never_ready: false,
            pending_names: Vec::new(),
        }
    }

    fn next_uuid(inner: &mut BackendInner, prefix: &str) -> String {
        inner.counter += 1;
        format!("{}-{}", prefix, inner.counter)
    }

    fn seeded_building() -> BuildingPayload {
        BuildingPayload {
            geometry: geojson::Geometry::new(geojson::Value::from(
                &square(10.0, 10.0, 5.0).to_polygon(),
            )),
            height: 30.0,
            use_type: "seeded".into(),
        }
    }
}

#[async_trait]
impl SimulationBackend for MockBackend {
    async fn login(&self) -> EngineResult<Session> {
        Ok(Session {
            client_uuid: "client-1".into(),
            token: "token-1".into(),
        })
    }

    async fn list_projects(&self, _session: &Session) -> EngineResult<Vec<RemoteProjectInfo>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .projects
            .iter()
            .map(|(uuid, name)| RemoteProjectInfo {
                uuid: uuid.clone(),
                name: name.clone(),
            })
            .collect())
    }

    async fn create_project(
        &self,
        _session: &Session,
        name: &str,
        _sw_lon: f64,
        _sw_lat: f64,
        _size: f64,
        _resolution: f64,
    ) -> EngineResult<ProjectHandle> {
        let mut inner = self.inner.lock().unwrap();
        let project = Self::next_uuid(&mut inner, "p");
        let snapshot = format!("s-{project}");
        inner.projects.insert(project.clone(), name.to_string());
        inner.snapshots.insert(snapshot.clone(), project.clone());
        // Fresh workspaces come pre-populated with map-derived geometry.
        inner
            .buildings
            .insert(snapshot, HashMap::from([("seed-1".to_string(), Self::seeded_building())]));
        Ok(ProjectHandle(project))
    }

    async fn delete_project(&self, _session: &Session, project: &ProjectHandle) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.projects.remove(&project.0);
        let snapshots: Vec<String> = inner
            .snapshots
            .iter()
            .filter(|(_, p)| **p == project.0)
            .map(|(s, _)| s.clone())
            .collect();
        for snapshot in snapshots {
            inner.snapshots.remove(&snapshot);
            inner.buildings.remove(&snapshot);
        }
        Ok(())
    }

    async fn root_snapshot(
        &self,
        _session: &Session,
        project: &ProjectHandle,
    ) -> EngineResult<SnapshotHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .snapshots
            .iter()
            .find(|(_, p)| **p == project.0)
            .map(|(s, _)| SnapshotHandle(s.clone()))
            .ok_or_else(|| EngineError::Remote(format!("no snapshot for {}", project.0)))
    }

    async fn buildings_in_snapshot(
        &self,
        _session: &Session,
        snapshot: &SnapshotHandle,
    ) -> EngineResult<HashMap<String, BuildingPayload>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.buildings.get(&snapshot.0).cloned().unwrap_or_default())
    }

    async fn create_building(
        &self,
        _session: &Session,
        snapshot: &SnapshotHandle,
        building: &BuildingPayload,
    ) -> EngineResult<String> {
        let mut inner = self.inner.lock().unwrap();
        let uuid = Self::next_uuid(&mut inner, "b");
        inner
            .buildings
            .entry(snapshot.0.clone())
            .or_default()
            .insert(uuid.clone(), building.clone());
        Ok(uuid)
    }

    async fn delete_building(
        &self,
        _session: &Session,
        snapshot: &SnapshotHandle,
        building_uuid: &str,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buildings) = inner.buildings.get_mut(&snapshot.0) {
            buildings.remove(building_uuid);
        }
        Ok(())
    }

    async fn run_service(
        &self,
        _session: &Session,
        snapshot: &SnapshotHandle,
        _settings: &CalculationSettings,
    ) -> EngineResult<ResultHandle> {
        let mut inner = self.inner.lock().unwrap();
        let project = inner
            .snapshots
            .get(&snapshot.0)
            .cloned()
            .ok_or_else(|| EngineError::Remote("unknown snapshot".into()))?;
        let name = inner.projects.get(&project).cloned().unwrap_or_default();
        if self.fail_trigger_names.contains(&name) {
            return Err(EngineError::Remote(format!("service refused for {name}")));
        }
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        let result = Self::next_uuid(&mut inner, "r");
        inner.results.insert(result.clone(), snapshot.0.clone());
        Ok(ResultHandle(result))
    }

    async fn analysis_output(
        &self,
        _session: &Session,
        snapshot: &SnapshotHandle,
        result: &ResultHandle,
    ) -> EngineResult<Option<AnalysisOutput>> {
        if self.never_ready {
            return Ok(None);
        }
        let inner = self.inner.lock().unwrap();
        if !inner.results.contains_key(&result.0) {
            return Err(EngineError::Remote("unknown result".into()));
        }
        let name = inner
            .snapshots
            .get(&snapshot.0)
            .and_then(|project| inner.projects.get(project))
            .cloned()
            .unwrap_or_default();
        if self.pending_names.contains(&name) {
            return Ok(None);
        }
        Ok(Some(AnalysisOutput {
            values: vec![vec![1.5; 8]; 8],
        }))
    }
}

/// Provider serving a fixed area of interest and building set.
struct FixedProvider {
    area: geojson::FeatureCollection,
    buildings: geojson::FeatureCollection,
}

#[async_trait]
impl BuildingProvider for FixedProvider {
    async fn layer(&self, _user: &UserId, layer: &str) -> EngineResult<geojson::FeatureCollection> {
        match layer {
            "project_area" => Ok(self.area.clone()),
            "buildings" => Ok(self.buildings.clone()),
            other => Err(EngineError::Provider(format!("no layer {other}"))),
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Metric origin of the test area, on the zone 32 grid near 10°E / 53.5°N.
fn origin() -> geo::Coord<f64> {
    to_utm(10.0, 53.5, ZONE)
}

fn polygon_feature(polygon: &geo::Polygon<f64>, properties: Option<serde_json::Map<String, serde_json::Value>>) -> geojson::Feature {
    geojson::Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(polygon))),
        id: None,
        properties,
        foreign_members: None,
    }
}

fn building_properties(height: f64) -> serde_json::Map<String, serde_json::Value> {
    [
        ("building_height".to_string(), serde_json::json!(height)),
        ("land_use_detailed_type".to_string(), serde_json::json!("residential")),
    ]
    .into_iter()
    .collect()
}

/// A 920 m square area (2x2 tile grid) with one building in the south-west
/// tile and one in the north-east tile.
fn fixture_provider() -> FixedProvider {
    let o = origin();
    let area = polygon_to_wgs(&square(o.x, o.y, 920.0).to_polygon(), ZONE);
    let sw_building = polygon_to_wgs(&square(o.x + 100.0, o.y + 100.0, 20.0).to_polygon(), ZONE);
    let ne_building = polygon_to_wgs(&square(o.x + 600.0, o.y + 600.0, 20.0).to_polygon(), ZONE);

    FixedProvider {
        area: geojson::FeatureCollection {
            bbox: None,
            features: vec![polygon_feature(&area, None)],
            foreign_members: None,
        },
        buildings: geojson::FeatureCollection {
            bbox: None,
            features: vec![
                polygon_feature(&sw_building, Some(building_properties(12.0))),
                polygon_feature(&ne_building, Some(building_properties(24.0))),
            ],
            foreign_members: None,
        },
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(5),
        create_retry_backoff: Duration::from_millis(5),
        ..Default::default()
    }
}

fn orchestrator(backend: Arc<MockBackend>, config: EngineConfig) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        backend,
        Arc::new(fixture_provider()),
        Arc::new(ResultCache::new(CacheConfig::default())),
        config,
    ))
}

fn wind_settings() -> CalculationSettings {
    CalculationSettings::Wind {
        wind_speed: 5.0,
        wind_direction: 90.0,
    }
}

async fn resolve_group(orchestrator: &Arc<Orchestrator>, task_id: TaskId) -> GroupId {
    for _ in 0..1000 {
        match orchestrator.task_state(task_id).unwrap() {
            TaskState::Pending => tokio::time::sleep(Duration::from_millis(10)).await,
            TaskState::Succeeded(group_id) => return group_id,
            TaskState::Failed(reason) => panic!("setup task failed: {reason}"),
        }
    }
    panic!("setup task never resolved");
}

async fn wait_processed(orchestrator: &Arc<Orchestrator>, group_id: GroupId) {
    for _ in 0..1000 {
        if orchestrator.collect(group_id).unwrap().processed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("group {group_id} never processed");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn wind_request_completes_and_second_request_hits_cache() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator(backend.clone(), fast_config());
    let user = UserId::new("alice");

    let task = orchestrator.run_calculation(user.clone(), wind_settings());
    let group = resolve_group(&orchestrator, task).await;
    wait_processed(&orchestrator, group).await;

    let progress = orchestrator.collect(group).unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.completed, 4);
    assert!(progress.processed);
    assert_eq!(progress.results.features.len(), 1);
    let value = progress.results.features[0].properties.as_ref().unwrap()["value"]
        .as_f64()
        .unwrap();
    assert_eq!(value, 1.5);
    assert_eq!(backend.run_calls.load(Ordering::SeqCst), 4);

    // Identical request: answered from the cache, nothing dispatched.
    let task2 = orchestrator.run_calculation(user, wind_settings());
    let group2 = resolve_group(&orchestrator, task2).await;
    let progress2 = orchestrator.collect(group2).unwrap();
    assert!(progress2.processed);
    assert_eq!(progress2.total, 0);
    assert_eq!(progress2.results.features.len(), 1);
    assert_eq!(backend.run_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn changed_settings_bypass_the_cache() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator(backend.clone(), fast_config());
    let user = UserId::new("bob");

    let task = orchestrator.run_calculation(user.clone(), wind_settings());
    let group = resolve_group(&orchestrator, task).await;
    wait_processed(&orchestrator, group).await;
    assert_eq!(backend.run_calls.load(Ordering::SeqCst), 4);

    let task2 = orchestrator.run_calculation(
        user,
        CalculationSettings::Wind {
            wind_speed: 5.0,
            wind_direction: 180.0,
        },
    );
    let group2 = resolve_group(&orchestrator, task2).await;
    wait_processed(&orchestrator, group2).await;
    assert_eq!(backend.run_calls.load(Ordering::SeqCst), 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_failure_still_processes_the_group() {
    let mut backend = MockBackend::new();
    backend.fail_trigger_names = vec!["carol_3".to_string()];
    let backend = Arc::new(backend);
    let orchestrator = orchestrator(backend.clone(), fast_config());

    let task = orchestrator.run_calculation(UserId::new("carol"), wind_settings());
    let group = resolve_group(&orchestrator, task).await;
    wait_processed(&orchestrator, group).await;

    let progress = orchestrator.collect(group).unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.completed, 3);
    assert!(progress.processed);
    // The three surviving tiles still dissolve into the one-value aggregate.
    assert_eq!(progress.results.features.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_poll_budget_abandons_tiles_without_blocking_the_group() {
    let mut backend = MockBackend::new();
    backend.never_ready = true;
    let backend = Arc::new(backend);
    let config = EngineConfig {
        max_poll_attempts: 2,
        ..fast_config()
    };
    let orchestrator = orchestrator(backend, config);

    let task = orchestrator.run_calculation(UserId::new("dave"), wind_settings());
    let group = resolve_group(&orchestrator, task).await;
    wait_processed(&orchestrator, group).await;

    let progress = orchestrator.collect(group).unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.completed, 0);
    assert!(progress.processed);
    assert!(progress.results.features.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn collect_before_completion_reports_unprocessed_empty_collection() {
    let mut backend = MockBackend::new();
    backend.never_ready = true;
    let backend = Arc::new(backend);
    // Large poll budget: the pipelines stay pending while we observe them.
    let config = EngineConfig {
        poll_interval: Duration::from_millis(50),
        create_retry_backoff: Duration::from_millis(5),
        ..Default::default()
    };
    let orchestrator = orchestrator(backend, config);

    let task = orchestrator.run_calculation(UserId::new("erin"), wind_settings());
    let group = resolve_group(&orchestrator, task).await;

    let progress = orchestrator.collect(group).unwrap();
    assert_eq!(progress.completed, 0);
    assert!(!progress.processed);
    assert!(progress.results.features.is_empty());
    assert_eq!(
        serde_json::to_value(&progress.results).unwrap(),
        serde_json::json!({ "type": "FeatureCollection", "features": [] })
    );

    orchestrator.cancel(group).unwrap();
    wait_processed(&orchestrator, group).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mid_flight_collect_serves_completed_tiles() {
    let mut backend = MockBackend::new();
    backend.pending_names = vec!["judy_3".to_string()];
    let backend = Arc::new(backend);
    // Generous poll budget so the pending tile keeps the group open while
    // the mid-flight observations run.
    let config = EngineConfig {
        max_poll_attempts: 1000,
        ..fast_config()
    };
    let orchestrator = orchestrator(backend, config);

    let task = orchestrator.run_calculation(UserId::new("judy"), wind_settings());
    let group = resolve_group(&orchestrator, task).await;

    let mut progress = orchestrator.collect(group).unwrap();
    for _ in 0..1000 {
        if progress.completed == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        progress = orchestrator.collect(group).unwrap();
    }

    // Three tiles are in; their features must already be visible even
    // though the fourth is still polling.
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.total, 4);
    assert!(!progress.processed);
    assert_eq!(progress.results.features.len(), 1);
    let value = progress.results.features[0].properties.as_ref().unwrap()["value"]
        .as_f64()
        .unwrap();
    assert_eq!(value, 1.5);

    // Once the pending tile exhausts its budget the group finalizes with
    // the same three contributions.
    wait_processed(&orchestrator, group).await;
    let final_progress = orchestrator.collect(group).unwrap();
    assert_eq!(final_progress.completed, 3);
    assert!(final_progress.processed);
    assert_eq!(final_progress.results.features.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn retention_sweep_drops_only_finalized_groups() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator(backend, fast_config());

    let task = orchestrator.run_calculation(UserId::new("kim"), wind_settings());
    let group = resolve_group(&orchestrator, task).await;
    wait_processed(&orchestrator, group).await;

    // Fresh results survive a sweep with the configured age.
    orchestrator.prune_finished(Duration::from_secs(3600));
    assert!(orchestrator.collect(group).is_ok());
    assert!(orchestrator.task_state(task).is_ok());

    // An expired group and its resolved task are dropped.
    orchestrator.prune_finished(Duration::ZERO);
    assert!(matches!(
        orchestrator.collect(group),
        Err(EngineError::GroupNotFound(_))
    ));
    assert!(matches!(
        orchestrator.task_state(task),
        Err(EngineError::TaskNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn retention_sweep_spares_running_groups() {
    let mut backend = MockBackend::new();
    backend.never_ready = true;
    let backend = Arc::new(backend);
    let config = EngineConfig {
        poll_interval: Duration::from_millis(50),
        create_retry_backoff: Duration::from_millis(5),
        ..Default::default()
    };
    let orchestrator = orchestrator(backend, config);

    let task = orchestrator.run_calculation(UserId::new("liam"), wind_settings());
    let group = resolve_group(&orchestrator, task).await;

    orchestrator.prune_finished(Duration::ZERO);
    assert!(orchestrator.collect(group).is_ok());

    orchestrator.cancel(group).unwrap();
    wait_processed(&orchestrator, group).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_building_geometry_fails_setup_once() {
    let backend = Arc::new(MockBackend::new());
    let mut provider = fixture_provider();
    // A point is not a footprint; the request must fail at setup instead of
    // failing every tile pipeline one by one.
    provider.buildings.features.push(geojson::Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::Point(vec![10.0, 53.5]))),
        id: None,
        properties: Some(building_properties(5.0)),
        foreign_members: None,
    });
    let orchestrator = Arc::new(Orchestrator::new(
        backend.clone(),
        Arc::new(provider),
        Arc::new(ResultCache::new(CacheConfig::default())),
        fast_config(),
    ));

    let task = orchestrator.run_calculation(UserId::new("lena"), wind_settings());
    for _ in 0..1000 {
        match orchestrator.task_state(task).unwrap() {
            TaskState::Pending => tokio::time::sleep(Duration::from_millis(10)).await,
            TaskState::Failed(_) => {
                assert_eq!(backend.run_calls.load(Ordering::SeqCst), 0);
                return;
            }
            TaskState::Succeeded(_) => panic!("setup accepted a malformed building set"),
        }
    }
    panic!("setup task never resolved");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_group_and_task_are_not_found() {
    let orchestrator = orchestrator(Arc::new(MockBackend::new()), fast_config());
    assert!(matches!(
        orchestrator.collect(GroupId::new()),
        Err(EngineError::GroupNotFound(_))
    ));
    assert!(matches!(
        orchestrator.task_state(TaskId::new()),
        Err(EngineError::TaskNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn project_set_validation_detects_remote_loss() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator(backend.clone(), fast_config());
    let user = UserId::new("frank");

    // No stored set yet.
    assert!(!orchestrator.check_projects_for_user(&user).await.unwrap());

    let task = orchestrator.run_calculation(user.clone(), wind_settings());
    let group = resolve_group(&orchestrator, task).await;
    wait_processed(&orchestrator, group).await;
    assert!(orchestrator.check_projects_for_user(&user).await.unwrap());

    // The backend loses everything; the stored set must be invalidated.
    backend.inner.lock().unwrap().projects.clear();
    assert!(!orchestrator.check_projects_for_user(&user).await.unwrap());
    assert!(!orchestrator.check_projects_for_user(&user).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_format_carries_per_tile_matrices() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator(backend, fast_config());

    let task = orchestrator.run_calculation(UserId::new("grace"), wind_settings());
    let group = resolve_group(&orchestrator, task).await;
    wait_processed(&orchestrator, group).await;

    let raw = orchestrator.collect_raw(group).unwrap();
    assert_eq!(raw.len(), 4);
    for (i, tile) in raw.iter().enumerate() {
        assert_eq!(tile.tile_id, windgrid_node::TileId(i as u32));
        assert_eq!(tile.values.len(), 8);
    }
}

// ============================================================================
// API surface
// ============================================================================

mod http_surface {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::Json;
    use windgrid_node::api::{
        check_on_singletask, collect_results, trigger_calculation, AppState, CollectQuery,
        TriggerRequest,
    };

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_then_collect_through_the_handlers() {
        let backend = Arc::new(MockBackend::new());
        let state = AppState {
            orchestrator: orchestrator(backend, fast_config()),
        };

        let request: TriggerRequest = serde_json::from_value(serde_json::json!({
            "user_id": "heidi",
            "kind": "wind",
            "wind_speed": 5.0,
            "wind_direction": 90.0,
        }))
        .unwrap();
        let Json(triggered) = trigger_calculation(State(state.clone()), Json(request))
            .await
            .unwrap();

        let task_id: TaskId = triggered.task_id.parse().unwrap();
        let group_id = resolve_group(&state.orchestrator, task_id).await;

        let Json(task_view) =
            check_on_singletask(State(state.clone()), Path(triggered.task_id.clone()))
                .await
                .unwrap();
        assert!(task_view.succeeded);
        assert_eq!(task_view.result.as_deref(), Some(group_id.to_string().as_str()));

        wait_processed(&state.orchestrator, group_id).await;
        let Json(collected) = collect_results(
            State(state.clone()),
            Path(group_id.to_string()),
            Query(CollectQuery {
                result_format: "geojson".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(collected.processed);
        assert_eq!(collected.tasks_total, 4);
        assert_eq!(collected.tasks_completed, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsupported_result_format_is_a_client_error() {
        let state = AppState {
            orchestrator: orchestrator(Arc::new(MockBackend::new()), fast_config()),
        };
        let task = state
            .orchestrator
            .run_calculation(UserId::new("ivan"), wind_settings());
        let group = resolve_group(&state.orchestrator, task).await;

        for format in ["png", "geotiff"] {
            let error = collect_results(
                State(state.clone()),
                Path(group.to_string()),
                Query(CollectQuery {
                    result_format: format.to_string(),
                }),
            )
            .await
            .unwrap_err();
            assert_eq!(error.0, axum::http::StatusCode::BAD_REQUEST);
        }
    }
}
