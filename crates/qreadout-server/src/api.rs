//! REST API endpoints for qreadout
//!
//! All endpoints are under /api/v1/ and return JSON. Streams in paths and
//! query strings are addressed either as a channel triple (`1.1.1`) or as
//! a stream ID (`0x0111` or `273`).

use crate::{AppState, EngineError, EngineStatus, Transfer};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use qreadout_core::{AcquisitionSettings, ChannelTriple, DigitizerError, DigitizerMode, Stream, StreamId};
use serde::{Deserialize, Serialize};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Application status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub build_date: String,
    #[serde(flatten)]
    pub engine: EngineStatus,
}

impl From<EngineStatus> for StatusResponse {
    fn from(engine: EngineStatus) -> Self {
        Self {
            version: qreadout_core::VERSION.to_string(),
            build_date: qreadout_core::BUILD_DATE.to_string(),
            engine,
        }
    }
}

/// Stream enable/disable request
#[derive(Deserialize)]
pub struct StreamRequest {
    /// Channel triple `a.b.c`
    pub stream: String,
}

/// Mode change request
#[derive(Serialize, Deserialize)]
pub struct ModeRequest {
    pub mode: DigitizerMode,
}

/// Correlator addressing: `?sids=1.1.1,1.2.1`
#[derive(Deserialize)]
pub struct CorrelationQuery {
    pub sids: String,
}

/// Snapshot or drained records
#[derive(Serialize, Deserialize)]
pub struct DataResponse {
    pub sids: Vec<StreamId>,
    pub data: Vec<f64>,
}

/// Remote URL response
#[derive(Serialize)]
pub struct RemoteUrlResponse {
    pub url: String,
}

/// HTTP status for a digitizer error
pub fn error_status(e: &DigitizerError) -> StatusCode {
    if e.is_configuration() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else if e.is_addressing() {
        StatusCode::NOT_FOUND
    } else {
        match e {
            DigitizerError::ModeError(_) | DigitizerError::Busy | DigitizerError::NotArmed => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn to_response(e: EngineError) -> (StatusCode, String) {
    let status = match &e {
        EngineError::Digitizer(inner) => error_status(inner),
        EngineError::ThreadDied => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "Request failed");
    }
    (status, e.to_string())
}

fn bad_request(msg: String) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg)
}

/// Parse `a.b.c`, `0x0111`, or a decimal stream ID
pub fn parse_sid(s: &str) -> Result<StreamId, String> {
    let s = s.trim();
    if s.contains('.') {
        return s.parse::<ChannelTriple>().map(StreamId::from_triple);
    }
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed
        .map(StreamId)
        .map_err(|e| format!("invalid stream '{}': {}", s, e))
}

fn parse_sids(list: &str) -> Result<Vec<StreamId>, String> {
    let sids = list
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_sid)
        .collect::<Result<Vec<_>, _>>()?;
    if sids.len() < 2 {
        return Err("a correlation needs at least two streams".to_string());
    }
    Ok(sids)
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let status = state.engine.get_status().await.map_err(to_response)?;
    Ok(Json(status.into()))
}

/// POST /api/v1/streams
pub async fn enable_stream(
    State(state): State<AppState>,
    Json(req): Json<StreamRequest>,
) -> ApiResult<Stream> {
    let triple: ChannelTriple = req.stream.parse().map_err(bad_request)?;
    let stream = state.engine.enable_stream(triple).await.map_err(to_response)?;
    Ok(Json(stream))
}

/// DELETE /api/v1/streams
pub async fn disable_stream(
    State(state): State<AppState>,
    Json(req): Json<StreamRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let triple: ChannelTriple = req.stream.parse().map_err(bad_request)?;
    state.engine.disable_stream(triple).await.map_err(to_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/settings
pub async fn get_settings(State(state): State<AppState>) -> ApiResult<AcquisitionSettings> {
    let status = state.engine.get_status().await.map_err(to_response)?;
    Ok(Json(status.settings))
}

/// PUT /api/v1/settings
///
/// Omitted fields take their defaults, as in a settings file.
pub async fn update_settings(
    State(state): State<AppState>,
    Json(settings): Json<AcquisitionSettings>,
) -> ApiResult<AcquisitionSettings> {
    let applied = state.engine.set_settings(settings).await.map_err(to_response)?;
    Ok(Json(applied))
}

/// PUT /api/v1/mode
pub async fn set_mode(
    State(state): State<AppState>,
    Json(req): Json<ModeRequest>,
) -> ApiResult<ModeRequest> {
    let mode = state.engine.set_mode(req.mode).await.map_err(to_response)?;
    Ok(Json(ModeRequest { mode }))
}

/// POST /api/v1/acquire
pub async fn acquire(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let status = state.engine.acquire().await.map_err(to_response)?;
    Ok(Json(status.into()))
}

/// POST /api/v1/stop
pub async fn stop(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let status = state.engine.stop().await.map_err(to_response)?;
    Ok(Json(status.into()))
}

async fn stream_transfer(state: &AppState, sid: &str, what: Transfer) -> ApiResult<DataResponse> {
    let sid = parse_sid(sid).map_err(bad_request)?;
    let data = state
        .engine
        .transfer_stream(sid, what)
        .await
        .map_err(to_response)?;
    Ok(Json(DataResponse {
        sids: vec![sid],
        data,
    }))
}

/// GET /api/v1/streams/{sid}/mean
pub async fn stream_mean(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<DataResponse> {
    stream_transfer(&state, &sid, Transfer::Mean).await
}

/// GET /api/v1/streams/{sid}/variance
pub async fn stream_variance(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<DataResponse> {
    stream_transfer(&state, &sid, Transfer::Variance).await
}

/// GET /api/v1/streams/{sid}/records
///
/// Drains whatever whole records are queued (digitizer mode only).
pub async fn stream_records(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<DataResponse> {
    stream_transfer(&state, &sid, Transfer::Records).await
}

async fn correlation_transfer(state: &AppState, sids: &str, what: Transfer) -> ApiResult<DataResponse> {
    let mut sids = parse_sids(sids).map_err(bad_request)?;
    sids.sort();
    let data = state
        .engine
        .transfer_correlation(sids.clone(), what)
        .await
        .map_err(to_response)?;
    Ok(Json(DataResponse { sids, data }))
}

/// GET /api/v1/correlations/mean?sids=..
pub async fn correlation_mean(
    State(state): State<AppState>,
    Query(query): Query<CorrelationQuery>,
) -> ApiResult<DataResponse> {
    correlation_transfer(&state, &query.sids, Transfer::Mean).await
}

/// GET /api/v1/correlations/variance?sids=..
pub async fn correlation_variance(
    State(state): State<AppState>,
    Query(query): Query<CorrelationQuery>,
) -> ApiResult<DataResponse> {
    correlation_transfer(&state, &query.sids, Transfer::Variance).await
}

/// GET /api/v1/remote-url
///
/// Address other machines on the network can reach this server at.
pub async fn get_remote_url(State(state): State<AppState>) -> Json<RemoteUrlResponse> {
    let ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    Json(RemoteUrlResponse {
        url: format!("http://{}:{}", ip, state.config.port),
    })
}
