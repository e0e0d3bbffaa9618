use super::{AppResult, AppState, JsonResponse};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use reliquary_core::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_PAGE: usize = 100;

/// Read-only views plus the commands collaborators may trigger. Nothing here
/// writes observations or records directly.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/providers", get(providers))
        .route("/artifacts", get(list_artifacts))
        .route("/artifacts/:id", get(get_artifact))
        .route("/artifacts/:id/pin", post(pin_artifact))
        .route("/addresses", get(list_addresses).post(track_address))
        .route("/addresses/:address/sync", post(sync_address))
        .route("/pins/:content_id", get(get_pin))
        .route("/pins/:content_id/verify", post(verify_pin))
        .with_state(state)
}

fn parse_network(raw: Option<&str>) -> Result<Option<Network>> {
    raw.filter(|s| !s.is_empty()).map(str::parse::<Network>).transpose()
}

// --- Health ---

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: String,
    uptime_seconds: u64,
    stats: StatsData,
}

#[derive(Serialize)]
struct StatsData {
    tracked_addresses: u64,
    observations: u64,
    duplicate_groups: u64,
    artifact_records: u64,
    conflicting_records: u64,
    pins_by_status: BTreeMap<String, u64>,
    pending_content_retries: u64,
    cached_documents: u64,
    db_size_bytes: u64,
}

async fn health(State(state): State<AppState>) -> AppResult<Json<JsonResponse<HealthResponse>>> {
    let stats = state.reliquary.stats()?;
    let pins_by_status = stats
        .pin_records_by_status
        .into_iter()
        .map(|(status, n)| (format!("{:?}", status).to_lowercase(), n))
        .collect();

    Ok(Json(JsonResponse::ok(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        stats: StatsData {
            tracked_addresses: stats.tracked_addresses,
            observations: stats.observations,
            duplicate_groups: stats.duplicate_groups,
            artifact_records: stats.artifact_records,
            conflicting_records: stats.conflicting_records,
            pins_by_status,
            pending_content_retries: stats.pending_content_retries,
            cached_documents: stats.cached_documents,
            db_size_bytes: stats.db_size_bytes,
        },
    })))
}

async fn providers(State(state): State<AppState>) -> Json<JsonResponse<Vec<ProviderEndpoint>>> {
    Json(JsonResponse::ok(state.reliquary.health_snapshot()))
}

// --- Artifacts ---

#[derive(Deserialize, Default)]
struct ArtifactQuery {
    tag: Option<String>,
    network: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    #[serde(default)]
    conflicting: bool,
}

async fn list_artifacts(
    State(state): State<AppState>,
    Query(query): Query<ArtifactQuery>,
) -> AppResult<Json<JsonResponse<Vec<ArtifactRecord>>>> {
    let mut filter = ArtifactFilter::new()
        .with_limit(query.limit.unwrap_or(DEFAULT_PAGE))
        .with_offset(query.offset.unwrap_or(0));
    if let Some(tag) = query.tag.filter(|t| !t.is_empty()) {
        filter = filter.with_tag(tag);
    }
    if let Some(network) = parse_network(query.network.as_deref())? {
        filter = filter.with_network(network);
    }
    if query.conflicting {
        filter = filter.conflicting_only();
    }

    let records = state.reliquary.list_artifact_records(filter)?;
    Ok(Json(JsonResponse::ok(records)))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JsonResponse<ArtifactRecord>>> {
    let record = state
        .reliquary
        .get_artifact_record(id)?
        .ok_or_else(|| ReliquaryError::NotFound(format!("artifact record {}", id)))?;
    Ok(Json(JsonResponse::ok(record)))
}

async fn pin_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JsonResponse<PinPlan>>> {
    let plan = state.reliquary.pin_record(id)?;
    Ok(Json(JsonResponse::ok(plan)))
}

// --- Addresses ---

#[derive(Deserialize)]
struct TrackRequest {
    address: String,
    network: Option<String>,
    label: Option<String>,
    #[serde(default)]
    from_block: u64,
    #[serde(default)]
    role: AddressRole,
}

async fn list_addresses(State(state): State<AppState>) -> AppResult<Json<JsonResponse<Vec<TrackedAddress>>>> {
    Ok(Json(JsonResponse::ok(state.reliquary.list_tracked_addresses()?)))
}

async fn track_address(
    State(state): State<AppState>,
    Json(req): Json<TrackRequest>,
) -> AppResult<Json<JsonResponse<TrackedAddress>>> {
    let network = parse_network(req.network.as_deref())?;
    let tracked = state
        .reliquary
        .track_address_as(&req.address, network, req.label, req.from_block, req.role)?;
    tracing::info!(address = %tracked.address, network = %tracked.network, "Tracking address");
    Ok(Json(JsonResponse::ok(tracked)))
}

#[derive(Deserialize, Default)]
struct SyncQuery {
    network: Option<String>,
}

/// Runs the sync in the request. Provider exhaustion is reported in the body
/// as `temporarily_unavailable`, not as an error status.
async fn sync_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<SyncQuery>,
) -> AppResult<Json<JsonResponse<SyncReport>>> {
    let network = parse_network(query.network.as_deref())?;
    let tracked = state.reliquary.find_tracked(&address, network)?;
    let cancel = state.shutdown.child_token();
    let report = state.reliquary.trigger_sync(&tracked, &cancel).await?;
    Ok(Json(JsonResponse::ok(report)))
}

// --- Pins ---

async fn get_pin(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
) -> AppResult<Json<JsonResponse<PinRecord>>> {
    let record = state
        .reliquary
        .get_pin_status(&content_id)?
        .ok_or_else(|| ReliquaryError::NotFound(format!("pin record {}", content_id)))?;
    Ok(Json(JsonResponse::ok(record)))
}

async fn verify_pin(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
) -> AppResult<Json<JsonResponse<PinRecord>>> {
    let record = state
        .reliquary
        .verify_pin(&content_id)
        .await?
        .ok_or_else(|| ReliquaryError::NotFound(format!("pin record {}", content_id)))?;
    Ok(Json(JsonResponse::ok(record)))
}
