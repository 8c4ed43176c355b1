use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use indexmap::IndexMap;
use tracing::info;

use crate::api::health::{HealthResponse, HealthState};
use crate::cache::CacheStore;
use crate::error::AppError;
use crate::fetcher::{fetch_reunion_selections, SnapshotFetcher};
use crate::i18n::Locale;
use crate::types::{MeetingDate, Participant, RaceDetail, RaceScope};
use crate::view::{
    self, RaceCommand, RaceSnapshot, RaceView, ReunionCommand, ReunionSnapshot, ViewHandle,
};
use crate::ws::{ChannelManager, EngineEndpoint, ReconnectPolicy};

pub type ReunionHandle = ViewHandle<ReunionCommand, ReunionSnapshot>;
pub type RaceHandle = ViewHandle<RaceCommand, RaceSnapshot>;

/// Everything a race view needs besides its scope.
pub struct RaceFactory<F, C> {
    pub fetcher: Arc<F>,
    pub cache: Arc<C>,
    pub endpoint: EngineEndpoint,
    pub policy: ReconnectPolicy,
    pub date: MeetingDate,
    pub locale: Locale,
}

impl<F, C> RaceFactory<F, C>
where
    F: SnapshotFetcher + 'static,
    C: CacheStore + 'static,
{
    fn mount(&self, scope: RaceScope) -> RaceHandle {
        info!(scope = %scope, "mounting race view");
        let view = RaceView::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.cache),
            ChannelManager::with_policy(self.endpoint.clone(), self.policy),
            ChannelManager::with_policy(self.endpoint.clone(), self.policy),
            scope,
            self.locale,
        );
        let (handle, _task) = view::spawn(view);
        handle
    }
}

pub struct ApiState<F, C> {
    pub reunion: ReunionHandle,
    pub races: Arc<DashMap<RaceScope, RaceHandle>>,
    pub factory: Arc<RaceFactory<F, C>>,
    pub health: Arc<HealthState>,
}

impl<F, C> Clone for ApiState<F, C> {
    fn clone(&self) -> Self {
        Self {
            reunion: self.reunion.clone(),
            races: Arc::clone(&self.races),
            factory: Arc::clone(&self.factory),
            health: Arc::clone(&self.health),
        }
    }
}

impl<F, C> ApiState<F, C> {
    /// Unmounts every view. Used on shutdown.
    pub async fn unmount_all(&self) {
        let races: Vec<RaceHandle> = self.races.iter().map(|e| e.value().clone()).collect();
        self.races.clear();
        for race in races {
            let _ = race.send(RaceCommand::Unmount).await;
        }
        let _ = self.reunion.send(ReunionCommand::Unmount).await;
    }
}

pub fn router<F, C>(state: ApiState<F, C>) -> Router
where
    F: SnapshotFetcher + 'static,
    C: CacheStore + 'static,
{
    Router::new()
        .route("/health", get(get_health::<F, C>))
        .route("/reunion", get(get_reunion::<F, C>))
        .route("/reunion/next", post(next_reunion::<F, C>))
        .route("/reunion/previous", post(previous_reunion::<F, C>))
        .route("/reunion/dismiss", post(dismiss_reunion_notice::<F, C>))
        .route("/reunion/selections", get(get_reunion_selections::<F, C>))
        .route(
            "/races/:reunion/:race",
            get(get_race::<F, C>)
                .post(mount_race::<F, C>)
                .delete(delete_race::<F, C>),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health<F, C>(State(state): State<ApiState<F, C>>) -> Json<HealthResponse> {
    let reunion = state.reunion.snapshot();
    Json(HealthResponse {
        status: if state.reunion.is_closed() { "stopped" } else { "ok" },
        realtime: state.health.realtime_state(),
        reunion_mounted: reunion.mounted,
        load_state: reunion.load_state,
        last_update_ms: reunion.last_update_ms,
        race_views: state.races.len(),
        race_mounts: state.health.race_mounts(),
        uptime_s: state.health.uptime_s(),
    })
}

async fn get_reunion<F, C>(State(state): State<ApiState<F, C>>) -> Json<ReunionSnapshot> {
    Json(state.reunion.snapshot())
}

async fn next_reunion<F, C>(
    State(state): State<ApiState<F, C>>,
) -> Result<Json<ReunionSnapshot>, AppError> {
    Ok(Json(state.reunion.request(ReunionCommand::Next).await?))
}

async fn previous_reunion<F, C>(
    State(state): State<ApiState<F, C>>,
) -> Result<Json<ReunionSnapshot>, AppError> {
    Ok(Json(state.reunion.request(ReunionCommand::Previous).await?))
}

async fn dismiss_reunion_notice<F, C>(
    State(state): State<ApiState<F, C>>,
) -> Result<Json<ReunionSnapshot>, AppError> {
    Ok(Json(state.reunion.request(ReunionCommand::DismissNotice).await?))
}

/// Selections of every race in the reunion under the cursor.
async fn get_reunion_selections<F, C>(
    State(state): State<ApiState<F, C>>,
) -> Result<Json<IndexMap<String, Vec<Participant>>>, AppError>
where
    F: SnapshotFetcher + 'static,
{
    let reunion = state.reunion.snapshot();
    let label = reunion
        .label
        .ok_or_else(|| AppError::NotFound("no reunion loaded".to_string()))?;
    let races: Vec<RaceDetail> = reunion.races.into_iter().map(|row| row.detail).collect();
    let by_race =
        fetch_reunion_selections(&*state.factory.fetcher, &reunion.date, &label, &races).await;
    Ok(Json(by_race))
}

/// Mounts the race view (again, if it stopped) and returns its snapshot.
/// Only races listed in the loaded reunion schedule can be mounted.
async fn mount_race<F, C>(
    State(state): State<ApiState<F, C>>,
    Path((reunion, race)): Path<(String, String)>,
) -> Result<Json<RaceSnapshot>, AppError>
where
    F: SnapshotFetcher + 'static,
    C: CacheStore + 'static,
{
    let scheduled = state
        .reunion
        .snapshot()
        .schedule
        .get(&reunion)
        .is_some_and(|races| races.contains(&race));
    let scope = RaceScope::new(state.factory.date.clone(), reunion, race);
    if !scheduled {
        return Err(AppError::NotFound(format!("race {scope} is not scheduled")));
    }
    let handle = {
        let mut entry = state
            .races
            .entry(scope.clone())
            .or_insert_with(|| {
                state.health.inc_race_mounts();
                state.factory.mount(scope.clone())
            });
        if entry.is_closed() {
            state.health.inc_race_mounts();
            *entry = state.factory.mount(scope);
        }
        entry.clone()
    };
    Ok(Json(handle.snapshot()))
}

async fn get_race<F, C>(
    State(state): State<ApiState<F, C>>,
    Path((reunion, race)): Path<(String, String)>,
) -> Result<Json<RaceSnapshot>, AppError> {
    let scope = RaceScope::new(state.factory.date.clone(), reunion, race);
    let handle = state
        .races
        .get(&scope)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("race view {scope}")))?;
    Ok(Json(handle.snapshot()))
}

async fn delete_race<F, C>(
    State(state): State<ApiState<F, C>>,
    Path((reunion, race)): Path<(String, String)>,
) -> Result<Json<RaceSnapshot>, AppError> {
    let scope = RaceScope::new(state.factory.date.clone(), reunion, race);
    let (_, handle) = state
        .races
        .remove(&scope)
        .ok_or_else(|| AppError::NotFound(format!("race view {scope}")))?;
    Ok(Json(handle.request(RaceCommand::Unmount).await?))
}
