//! Control service and its HTTP transport.
//!
//! The service answers state queries from the latest published
//! [`AgentState`] and turns restart/upgrade requests into
//! [`ControlCommand`]s for the coordinator. It never operates components
//! itself.
//!
//! ## Routes
//!
//! - `GET /state`: full agent state
//! - `GET /watch`: server-sent events, one per state change
//! - `GET /liveness?failon=failed|degraded`: 200 unless health crosses the
//!   threshold, 500 otherwise
//! - `GET /version`
//! - `POST /restart`
//! - `POST /upgrade` with `{"version": "..."}`

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use convoy_id::AgentId;
use convoy_reconcile::Health;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::status::{AgentState, ComponentStatus};

// =============================================================================
// Commands and errors
// =============================================================================

/// A request routed into the reconciliation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop and start every running component.
    Restart,
    /// Move every desired component to `version`.
    Upgrade { version: String },
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid liveness query: {0}")]
    InvalidQuery(String),

    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    #[error("agent is shutting down")]
    Unavailable,
}

impl ControlError {
    fn code(&self) -> &'static str {
        match self {
            ControlError::InvalidQuery(_) => "invalid_query",
            ControlError::InvalidVersion(_) => "invalid_version",
            ControlError::Unavailable => "unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ControlError::InvalidQuery(_) | ControlError::InvalidVersion(_) => {
                StatusCode::BAD_REQUEST
            }
            ControlError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub version: String,
    pub snapshot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStateResponse {
    pub unit_type: String,
    pub unit_id: String,
    pub state: Health,
    pub message: String,
    /// Unit payload serialized as JSON; empty when the unit sent none.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfoResponse {
    pub name: String,
    pub version: String,
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStateResponse {
    pub id: String,
    pub name: String,
    pub state: Health,
    pub message: String,
    pub units: Vec<UnitStateResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_info: Option<VersionInfoResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    pub info: AgentInfo,
    pub state: Health,
    pub message: String,
    pub fleet_state: Health,
    pub fleet_message: String,
    pub components: Vec<ComponentStateResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub state: Health,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accepted {
    pub accepted: bool,
}

fn component_response(c: &ComponentStatus) -> ComponentStateResponse {
    ComponentStateResponse {
        id: c.id.to_string(),
        name: c
            .program
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default(),
        state: c.health,
        message: c.message.clone(),
        units: c
            .units
            .iter()
            .map(|u| UnitStateResponse {
                unit_type: u.kind.to_string(),
                unit_id: u.id.to_string(),
                state: u.health,
                message: u.message.clone(),
                payload: u
                    .payload
                    .as_ref()
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
            })
            .collect(),
        version_info: c.version_info.as_ref().map(|v| VersionInfoResponse {
            name: v.name.clone(),
            version: v.version.clone(),
            meta: v.meta.clone(),
        }),
    }
}

// =============================================================================
// Liveness
// =============================================================================

const FAILON_KEY: &str = "failon";

/// Which health levels make the liveness probe fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessFailConfig {
    pub degraded: bool,
    pub failed: bool,
}

impl Default for LivenessFailConfig {
    fn default() -> Self {
        Self {
            degraded: false,
            failed: true,
        }
    }
}

impl LivenessFailConfig {
    /// Parse the probe's query parameters. Only `failon` is accepted.
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self, ControlError> {
        if let Some(key) = params.keys().find(|k| k.as_str() != FAILON_KEY) {
            return Err(ControlError::InvalidQuery(format!("unknown key '{key}'")));
        }

        match params.get(FAILON_KEY).map(String::as_str) {
            None | Some("") | Some("failed") => Ok(Self::default()),
            Some("degraded") => Ok(Self {
                degraded: true,
                failed: true,
            }),
            Some(other) => Err(ControlError::InvalidQuery(format!(
                "unexpected value for '{FAILON_KEY}': {other}"
            ))),
        }
    }

    pub fn is_live(&self, health: Health) -> bool {
        match health {
            Health::Failed => !self.failed,
            Health::Degraded => !self.degraded,
            _ => true,
        }
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct ControlService {
    agent_id: AgentId,
    snapshot: bool,
    status: watch::Receiver<AgentState>,
    commands: mpsc::Sender<ControlCommand>,
}

impl ControlService {
    pub fn new(
        agent_id: AgentId,
        snapshot: bool,
        status: watch::Receiver<AgentState>,
        commands: mpsc::Sender<ControlCommand>,
    ) -> Self {
        Self {
            agent_id,
            snapshot,
            status,
            commands,
        }
    }

    pub fn version(&self) -> AgentInfo {
        AgentInfo {
            id: self.agent_id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            snapshot: self.snapshot,
        }
    }

    fn respond(&self, state: &AgentState) -> StateResponse {
        StateResponse {
            info: self.version(),
            state: state.health,
            message: state.message.clone(),
            fleet_state: state.fleet_health,
            fleet_message: state.fleet_message.clone(),
            components: state.components.iter().map(component_response).collect(),
        }
    }

    /// Latest agent state. Always well-formed.
    pub fn state(&self) -> StateResponse {
        let state = self.status.borrow().clone();
        self.respond(&state)
    }

    /// The current state followed by every later change.
    pub fn watch(self: &Arc<Self>) -> impl Stream<Item = StateResponse> + Send + 'static {
        let this = Arc::clone(self);
        WatchStream::new(self.status.clone()).map(move |state| this.respond(&state))
    }

    pub fn liveness(&self, fail: LivenessFailConfig) -> (bool, LivenessResponse) {
        let state = self.status.borrow();
        (
            fail.is_live(state.health),
            LivenessResponse {
                state: state.health,
                message: state.message.clone(),
            },
        )
    }

    pub async fn restart(&self) -> Result<(), ControlError> {
        info!("Restart requested");
        self.enqueue(ControlCommand::Restart).await
    }

    pub async fn upgrade(&self, version: &str) -> Result<(), ControlError> {
        let trimmed = version.trim();
        if trimmed.is_empty() || trimmed != version || version.contains(['/', '\\']) {
            return Err(ControlError::InvalidVersion(version.to_string()));
        }
        info!(version = %version, "Upgrade requested");
        self.enqueue(ControlCommand::Upgrade {
            version: version.to_string(),
        })
        .await
    }

    async fn enqueue(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.commands.send(command).await.map_err(|_| {
            warn!("Coordinator is gone, dropping control command");
            ControlError::Unavailable
        })
    }
}

// =============================================================================
// HTTP
// =============================================================================

pub fn router(service: Arc<ControlService>) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/watch", get(watch_state))
        .route("/liveness", get(liveness))
        .route("/version", get(version))
        .route("/restart", post(restart))
        .route("/upgrade", post(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn get_state(State(service): State<Arc<ControlService>>) -> Json<StateResponse> {
    Json(service.state())
}

async fn watch_state(
    State(service): State<Arc<ControlService>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = service.watch().map(|state| {
        Ok(match Event::default().json_data(&state) {
            Ok(event) => event,
            Err(e) => Event::default().event("error").data(e.to_string()),
        })
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn liveness(
    State(service): State<Arc<ControlService>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ControlError> {
    let fail = LivenessFailConfig::from_query(&params)?;
    let (live, body) = service.liveness(fail);
    let status = if live {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(body)))
}

async fn version(State(service): State<Arc<ControlService>>) -> Json<AgentInfo> {
    Json(service.version())
}

async fn restart(
    State(service): State<Arc<ControlService>>,
) -> Result<impl IntoResponse, ControlError> {
    service.restart().await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted: true })))
}

async fn upgrade(
    State(service): State<Arc<ControlService>>,
    Json(request): Json<UpgradeRequest>,
) -> Result<impl IntoResponse, ControlError> {
    service.upgrade(&request.version).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted: true })))
}
