//! Terminal-facing HTTP endpoint: heartbeats, dispatch pulls, acks.
//!
//! A thin adapter over [`Replicator`]; all pipeline decisions live there.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::{ErrorKind, ReplicationError};
use crate::models::{CommandAck, Heartbeat};
use crate::service::Replicator;

use super::types::{AckReply, CommandWire, ErrorBody, PullQuery};

const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Rejection carrying a pipeline error.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl warp::reject::Reject for ApiError {}

impl From<ReplicationError> for ApiError {
    fn from(err: ReplicationError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

fn reject(err: ReplicationError) -> Rejection {
    warp::reject::custom(ApiError::from(err))
}

/// All routes, with error recovery applied.
pub fn routes(
    replicator: Arc<Replicator>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    // Health check endpoint
    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&json!({
            "status": "ok",
            "service": "tradecopy",
            "timestamp": chrono::Utc::now()
        }))
    });

    let heartbeat = warp::path!("api" / "v1" / "accounts" / String / "heartbeat")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json::<Heartbeat>())
        .and(with_replicator(replicator.clone()))
        .and_then(post_heartbeat);

    let commands = warp::path!("api" / "v1" / "accounts" / String / "commands")
        .and(warp::get())
        .and(warp::query::<PullQuery>())
        .and(with_replicator(replicator.clone()))
        .and_then(get_commands);

    let acks = warp::path!("api" / "v1" / "accounts" / String / "acks")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json::<CommandAck>())
        .and(with_replicator(replicator.clone()))
        .and_then(post_ack);

    let live = warp::path!("api" / "v1" / "accounts" / String / "live")
        .and(warp::get())
        .and(with_replicator(replicator))
        .and_then(get_live);

    health
        .or(heartbeat)
        .or(commands)
        .or(acks)
        .or(live)
        .with(warp::trace::request())
        .recover(handle_rejection)
}

/// Serve until the process exits.
pub async fn serve(replicator: Arc<Replicator>, addr: SocketAddr) {
    tracing::info!(addr = %addr, "Starting dispatch endpoint");
    warp::serve(routes(replicator)).run(addr).await;
}

// Helper function to inject the replicator
fn with_replicator(
    replicator: Arc<Replicator>,
) -> impl Filter<Extract = (Arc<Replicator>,), Error = Infallible> + Clone {
    warp::any().map(move || replicator.clone())
}

/// Always 200 for a parsed heartbeat; failures are listed in the report.
async fn post_heartbeat(
    account_id: String,
    heartbeat: Heartbeat,
    replicator: Arc<Replicator>,
) -> Result<impl Reply, Rejection> {
    let report = replicator.ingest_heartbeat(&account_id, heartbeat).await;
    Ok(warp::reply::json(&report))
}

async fn get_commands(
    account_id: String,
    query: PullQuery,
    replicator: Arc<Replicator>,
) -> Result<impl Reply, Rejection> {
    let commands = replicator
        .pull(&account_id, query.limit)
        .await
        .map_err(reject)?;

    let wire: Vec<CommandWire> = commands.into_iter().map(CommandWire::from).collect();
    Ok(warp::reply::json(&wire))
}

async fn post_ack(
    account_id: String,
    ack: CommandAck,
    replicator: Arc<Replicator>,
) -> Result<impl Reply, Rejection> {
    let reply = match replicator.acknowledge(&account_id, &ack).await {
        Ok(command) => AckReply {
            command_id: command.id,
            status: Some(command.status),
            duplicate: false,
        },
        Err(e) if e.is_benign() => AckReply {
            command_id: ack.command_id,
            status: None,
            duplicate: true,
        },
        Err(e) => return Err(reject(e)),
    };

    Ok(warp::reply::json(&reply))
}

async fn get_live(account_id: String, replicator: Arc<Replicator>) -> Result<impl Reply, Rejection> {
    let state = replicator.live_state(&account_id).await.map_err(reject)?;
    Ok(warp::reply::json(&state))
}

/// Map rejections to `{error, code}` JSON.
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Endpoint not found".to_string())
    } else if let Some(api_error) = err.find::<ApiError>() {
        let code = match api_error.kind {
            ErrorKind::Rejected => StatusCode::BAD_REQUEST,
            ErrorKind::Missing => StatusCode::NOT_FOUND,
            ErrorKind::Benign => StatusCode::CONFLICT,
            ErrorKind::Degraded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => {
                tracing::error!(error = %api_error.message, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (code, api_error.message.clone())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid body: {e}"))
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid query string".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };

    let json = warp::reply::json(&ErrorBody {
        error: message,
        code: code.as_u16(),
    });

    Ok(warp::reply::with_status(json, code))
}
