//! HTTP RPC server exposing header submission, inclusion checks and chain
//! queries over REST endpoints.

use std::str::FromStr;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use bitcoin::{BlockHash, Txid, TxMerkleNode};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use spv_relay::{FeeParams, RelayError, RelayEvent};

use crate::app::AppClient;

/// Configuration for the RPC server
#[derive(Clone)]
pub struct RpcConfig {
    /// Host and port binding for the RPC server (e.g., "127.0.0.1:5000")
    pub rpc_host: String,
    /// Bearer token authorizing the owner endpoints (optional)
    pub owner_token: Option<String>,
}

/// Request body for header submission
#[derive(Debug, Deserialize)]
pub struct SubmitHeadersRequest {
    /// Anchor header, hex encoded (80 bytes)
    pub anchor: String,
    /// Concatenated new headers, hex encoded
    pub headers: String,
    /// Relayer identity credited on finalization
    pub submitter: String,
    /// Use the owner override path (requires the owner token)
    #[serde(default)]
    pub owner: bool,
}

/// Request body for header submission across a difficulty adjustment
#[derive(Debug, Deserialize)]
pub struct SubmitRetargetRequest {
    pub old_period_start: String,
    pub old_period_end: String,
    pub headers: String,
    pub submitter: String,
    #[serde(default)]
    pub owner: bool,
}

/// Request body for a transaction inclusion check
#[derive(Debug, Deserialize)]
pub struct InclusionRequest {
    /// Transaction id, big-endian hex
    pub txid: String,
    /// Height of the block claimed to contain the transaction
    pub height: u64,
    /// Merkle branch, leaf to root, big-endian hex nodes
    pub proof: Vec<String>,
    /// Position of the transaction in the block
    pub index: u32,
    /// Fee payment attached to the query, in native units
    pub payment: u64,
}

#[derive(Debug, Serialize)]
pub struct InclusionResponse {
    pub included: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetValueRequest {
    pub value: u64,
}

#[derive(Debug, Deserialize)]
pub struct SetPausedRequest {
    pub paused: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// HTTP RPC server forwarding requests to the application server
pub struct RpcServer {
    config: RpcConfig,
    client: AppClient,
    rx_shutdown: broadcast::Receiver<()>,
}

#[derive(Clone)]
pub struct AppState {
    client: AppClient,
    owner_token: Option<String>,
}

impl RpcServer {
    pub fn new(config: RpcConfig, client: AppClient, rx_shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            config,
            client,
            rx_shutdown,
        }
    }

    async fn run_inner(&self) -> Result<(), std::io::Error> {
        info!("Starting RPC server on {}", self.config.rpc_host);

        let app_state = AppState {
            client: self.client.clone(),
            owner_token: self.config.owner_token.clone(),
        };

        let app = Router::new()
            .route("/headers", post(submit_headers))
            .route("/headers/retarget", post(submit_headers_with_retarget))
            .route("/inclusion", post(check_inclusion))
            .route("/height/:hash", get(get_height))
            .route("/ancestor/:hash/:offset", get(get_ancestor))
            .route("/is-ancestor/:ancestor/:descendant/:limit", get(get_is_ancestor))
            .route("/candidates/:height", get(get_candidate_count))
            .route("/candidates/:height/:index", get(get_candidate_at))
            .route("/tip", get(get_tip))
            .route("/fee", get(get_fee))
            .route("/finalization-parameter", get(get_finalization_parameter))
            .route("/admin/paused", post(set_paused))
            .route("/admin/finalization-parameter", post(set_finalization_parameter))
            .route("/admin/epoch-length", post(set_epoch_length))
            .route("/admin/fee-params", post(set_fee_params))
            .with_state(app_state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.config.rpc_host).await?;
        let mut rx_shutdown = self.rx_shutdown.resubscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { rx_shutdown.recv().await.unwrap_or_default() })
            .await
    }

    pub async fn run(&self) -> Result<(), ()> {
        match self.run_inner().await {
            Err(err) => {
                error!("RPC server exited: {}", err);
                Err(())
            }
            Ok(()) => {
                info!("RPC server terminated");
                Ok(())
            }
        }
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: msg.into() }),
    )
}

fn internal_error(err: anyhow::Error) -> ApiError {
    error!("App request failed: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal error".into(),
        }),
    )
}

fn relay_error(err: RelayError) -> ApiError {
    let status = match err {
        RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
        RelayError::Paused => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::InsufficientFee { .. } => StatusCode::PAYMENT_REQUIRED,
        RelayError::UnknownBlock(_) | RelayError::UnknownParent(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Verify the owner bearer token when the request asks for owner privileges.
fn check_owner(state: &AppState, headers: &HeaderMap, owner: bool) -> Result<(), ApiError> {
    if !owner {
        return Ok(());
    }
    let expected = match &state.owner_token {
        Some(token) => token,
        None => return Err(relay_error(RelayError::Unauthorized)),
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(relay_error(RelayError::Unauthorized))
    }
}

fn parse_hex(field: &str, value: &str) -> Result<Vec<u8>, ApiError> {
    hex::decode(value).map_err(|e| bad_request(format!("invalid hex in {}: {}", field, e)))
}

fn parse_block_hash(value: &str) -> Result<BlockHash, ApiError> {
    BlockHash::from_str(value).map_err(|e| bad_request(format!("invalid block hash: {}", e)))
}

/// Submit a batch of headers extending a known parent
pub async fn submit_headers(
    State(state): State<AppState>,
    headers_map: HeaderMap,
    Json(req): Json<SubmitHeadersRequest>,
) -> Result<Json<Vec<RelayEvent>>, ApiError> {
    check_owner(&state, &headers_map, req.owner)?;
    let anchor = parse_hex("anchor", &req.anchor)?;
    let headers = parse_hex("headers", &req.headers)?;
    let events = state
        .client
        .submit_headers(anchor, headers, req.submitter, req.owner)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(events))
}

/// Submit a batch of headers crossing a difficulty epoch boundary
pub async fn submit_headers_with_retarget(
    State(state): State<AppState>,
    headers_map: HeaderMap,
    Json(req): Json<SubmitRetargetRequest>,
) -> Result<Json<Vec<RelayEvent>>, ApiError> {
    check_owner(&state, &headers_map, req.owner)?;
    let old_period_start = parse_hex("old_period_start", &req.old_period_start)?;
    let old_period_end = parse_hex("old_period_end", &req.old_period_end)?;
    let headers = parse_hex("headers", &req.headers)?;
    let events = state
        .client
        .submit_headers_with_retarget(
            old_period_start,
            old_period_end,
            headers,
            req.submitter,
            req.owner,
        )
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(events))
}

/// Check inclusion of a transaction in a finalized block
pub async fn check_inclusion(
    State(state): State<AppState>,
    Json(req): Json<InclusionRequest>,
) -> Result<Json<InclusionResponse>, ApiError> {
    let txid =
        Txid::from_str(&req.txid).map_err(|e| bad_request(format!("invalid txid: {}", e)))?;
    let proof = req
        .proof
        .iter()
        .map(|node| {
            TxMerkleNode::from_str(node)
                .map_err(|e| bad_request(format!("invalid proof node: {}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let included = state
        .client
        .check_inclusion(txid, req.height, proof, req.index, req.payment)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(InclusionResponse { included }))
}

/// Get the height of a known block hash
pub async fn get_height(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<u64>, ApiError> {
    let hash = parse_block_hash(&hash)?;
    let height = state
        .client
        .find_height(hash)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(height))
}

/// Walk `offset` parent links up from a block hash
pub async fn get_ancestor(
    State(state): State<AppState>,
    Path((hash, offset)): Path<(String, u64)>,
) -> Result<Json<BlockHash>, ApiError> {
    let hash = parse_block_hash(&hash)?;
    let ancestor = state
        .client
        .find_ancestor(hash, offset)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(ancestor))
}

/// Check whether one block is an ancestor of another within a walk limit
pub async fn get_is_ancestor(
    State(state): State<AppState>,
    Path((ancestor, descendant, limit)): Path<(String, String, u64)>,
) -> Result<Json<bool>, ApiError> {
    let ancestor = parse_block_hash(&ancestor)?;
    let descendant = parse_block_hash(&descendant)?;
    let result = state
        .client
        .is_ancestor(ancestor, descendant, limit)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(result))
}

/// Count the candidate blocks tracked at a height
pub async fn get_candidate_count(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> Result<Json<usize>, ApiError> {
    let count = state
        .client
        .candidate_count(height)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(count))
}

/// Get the hash of a candidate block at a height by submission order
pub async fn get_candidate_at(
    State(state): State<AppState>,
    Path((height, index)): Path<(u64, usize)>,
) -> Result<Json<Option<BlockHash>>, ApiError> {
    let hash = state
        .client
        .candidate_at(height, index)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(hash))
}

/// Get the highest submitted height
pub async fn get_tip(State(state): State<AppState>) -> Result<Json<u64>, ApiError> {
    let tip = state
        .client
        .tip()
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(tip))
}

/// Quote the fee currently required for one inclusion check
pub async fn get_fee(State(state): State<AppState>) -> Result<Json<u64>, ApiError> {
    let fee = state
        .client
        .fee_quote()
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(fee))
}

/// Get the confirmation depth required for finalization
pub async fn get_finalization_parameter(
    State(state): State<AppState>,
) -> Result<Json<u64>, ApiError> {
    let value = state
        .client
        .finalization_parameter()
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(value))
}

/// Pause or resume public header submission (owner only)
pub async fn set_paused(
    State(state): State<AppState>,
    headers_map: HeaderMap,
    Json(req): Json<SetPausedRequest>,
) -> Result<Json<()>, ApiError> {
    check_owner(&state, &headers_map, true)?;
    state
        .client
        .set_paused(req.paused)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(()))
}

/// Raise the confirmation depth (owner only)
pub async fn set_finalization_parameter(
    State(state): State<AppState>,
    headers_map: HeaderMap,
    Json(req): Json<SetValueRequest>,
) -> Result<Json<()>, ApiError> {
    check_owner(&state, &headers_map, true)?;
    state
        .client
        .set_finalization_parameter(req.value)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(()))
}

/// Change the difficulty epoch length (owner only)
pub async fn set_epoch_length(
    State(state): State<AppState>,
    headers_map: HeaderMap,
    Json(req): Json<SetValueRequest>,
) -> Result<Json<()>, ApiError> {
    check_owner(&state, &headers_map, true)?;
    state
        .client
        .set_epoch_length(req.value)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(()))
}

/// Replace the fee and reward parameters (owner only)
pub async fn set_fee_params(
    State(state): State<AppState>,
    headers_map: HeaderMap,
    Json(req): Json<FeeParams>,
) -> Result<Json<()>, ApiError> {
    check_owner(&state, &headers_map, true)?;
    state
        .client
        .set_fee_params(req)
        .await
        .map_err(internal_error)?
        .map_err(relay_error)?;
    Ok(Json(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn event_wire_format_is_tagged_snake_case() {
        let hash = BlockHash::from_byte_array([7u8; 32]);
        let event = RelayEvent::HeaderAdded {
            height: 100,
            hash,
            submitter: "relayer-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "header_added");
        assert_eq!(json["height"], 100);
        assert_eq!(json["submitter"], "relayer-1");
        assert_eq!(json["hash"], hash.to_string());
    }

    #[test]
    fn owner_check_requires_configured_token() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let client = AppClient { tx_requests: tx };
        let state = AppState {
            client: client.clone(),
            owner_token: Some("secret".to_string()),
        };

        let mut headers = HeaderMap::new();
        assert!(check_owner(&state, &headers, false).is_ok());
        assert!(check_owner(&state, &headers, true).is_err());

        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(check_owner(&state, &headers, true).is_ok());

        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(check_owner(&state, &headers, true).is_err());

        let unconfigured = AppState {
            client,
            owner_token: None,
        };
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(check_owner(&unconfigured, &headers, true).is_err());
    }
}
