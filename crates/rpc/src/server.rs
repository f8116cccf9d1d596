use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fidoreg_lifecycle::{CredentialRegistrar, KeyStateMachine, LifecycleError, Transition};
use fidoreg_replication::{
    ReplicaApplier, ReplicationMessage, ReplicationResponse, PEER_TOKEN_HEADER, REPLICATION_PATH,
};
use fidoreg_types::{RegistrationRequest, TransitionRequest};
use serde::Serialize;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Upper bound on request bodies; registrations are a few kilobytes at most.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub const REGISTERED_MESSAGE: &str = "Successfully registered the key";

#[derive(Clone)]
pub struct AppState {
    pub registrar: Arc<CredentialRegistrar>,
    pub state_machine: Arc<KeyStateMachine>,
    /// Present when this node accepts events from peers.
    pub replica: Option<Arc<ReplicaApplier>>,
    pub node_id: String,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        node_id: impl Into<String>,
        registrar: Arc<CredentialRegistrar>,
        state_machine: Arc<KeyStateMachine>,
    ) -> Self {
        Self {
            registrar,
            state_machine,
            replica: None,
            node_id: node_id.into(),
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_replica(mut self, replica: Arc<ReplicaApplier>) -> Self {
        self.replica = Some(replica);
        self
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    uptime_secs: u64,
    accepts_replication: bool,
    req_total: u64,
}

/// `{status, message}` answer of the registration endpoint.
#[derive(Debug, Serialize)]
struct RegistrationResponse {
    status: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TransitionResponse {
    Done {
        response: String,
    },
    Failed {
        #[serde(rename = "errorKey")]
        error_key: String,
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

/// A lifecycle failure together with the HTTP status it maps to.
struct ApiError {
    status: StatusCode,
    key: &'static str,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, key: &'static str, message: S) -> Self {
        Self {
            status,
            key,
            message: message.into(),
        }
    }

    fn bad_request(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
    }

    fn into_registration(self) -> Response {
        let payload = Json(RegistrationResponse {
            status: false,
            message: self.message,
            handle: None,
        });
        (self.status, payload).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let status = match &err {
            LifecycleError::Validation { .. } | LifecycleError::InvalidHandle(_) => {
                StatusCode::BAD_REQUEST
            }
            LifecycleError::DuplicateCredential { .. } => StatusCode::CONFLICT,
            LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::Authorization { .. } => StatusCode::FORBIDDEN,
            LifecycleError::SigningFailure(_)
            | LifecycleError::IntegrityViolation(_)
            | LifecycleError::PersistenceFailure(_)
            | LifecycleError::ReplicationFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.error_key(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(TransitionResponse::Failed {
            error_key: self.key.to_string(),
            error_message: self.message,
        });
        (self.status, payload).into_response()
    }
}

/// Serve the client API on `addr` until `shutdown` resolves.
pub async fn start_server<F>(state: SharedState, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    serve(build_router(state), addr, "RPC", shutdown).await
}

/// Serve the peer replication endpoint on its own listener.
pub async fn start_peer_server<F>(
    state: SharedState,
    addr: &str,
    peer_token: &str,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    serve(build_peer_router(state, peer_token), addr, "peer", shutdown).await
}

async fn serve<F>(app: Router, addr: &str, label: &'static str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = bind_listener(addr).await?;
    info!(addr = %addr, "{label} server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .with_context(|| format!("{label} server terminated unexpectedly"))
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))
    }
}

/// Client-facing API. Replication is not reachable from here.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/fido/keys/register", post(handle_register))
        .route("/fido/keys/activate", post(handle_activate))
        .route("/fido/keys/deactivate", post(handle_deactivate))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Peer-facing API: events are accepted only with the shared peer token.
pub fn build_peer_router(state: SharedState, peer_token: &str) -> Router {
    let auth = PeerAuth {
        token: Arc::from(peer_token),
    };
    Router::new()
        .route(REPLICATION_PATH, post(handle_replication))
        .layer(middleware::from_fn_with_state(auth, require_peer_token))
        .route("/health", get(handle_health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Clone)]
struct PeerAuth {
    token: Arc<str>,
}

impl PeerAuth {
    fn accepts(&self, presented: &str) -> bool {
        let expected = self.token.as_bytes();
        let presented = presented.as_bytes();
        !expected.is_empty()
            && expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |diff, (a, b)| diff | (a ^ b))
                == 0
    }
}

async fn require_peer_token(State(auth): State<PeerAuth>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(PEER_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(token) if auth.accepts(token) => next.run(request).await,
        _ => {
            warn!("replication request without a valid peer token");
            (
                StatusCode::UNAUTHORIZED,
                Json(ReplicationResponse::failed("peer authentication required")),
            )
                .into_response()
        }
    }
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        uptime_secs: state.uptime_seconds(),
        accepts_replication: state.replica.is_some(),
        req_total,
    })
}

async fn handle_register(
    State(state): State<SharedState>,
    payload: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Response {
    state.record_request();
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => return ApiError::bad_request(rejection).into_registration(),
    };
    debug!(request = ?request, "registration request");

    match state.registrar.register(&request).await {
        Ok(credential) => Json(RegistrationResponse {
            status: true,
            message: REGISTERED_MESSAGE.to_string(),
            handle: Some(credential.handle.to_string()),
        })
        .into_response(),
        Err(err) => {
            warn!(error_key = err.error_key(), "registration rejected: {err}");
            ApiError::from(err).into_registration()
        }
    }
}

async fn handle_activate(
    State(state): State<SharedState>,
    payload: Result<Json<TransitionRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    run_transition(&state, Transition::Activate, payload).await
}

async fn handle_deactivate(
    State(state): State<SharedState>,
    payload: Result<Json<TransitionRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    run_transition(&state, Transition::Deactivate, payload).await
}

async fn run_transition(
    state: &AppState,
    transition: Transition,
    payload: Result<Json<TransitionRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    state.record_request();
    let Json(request) = payload.map_err(ApiError::bad_request)?;
    debug!(request = ?request, ?transition, "transition request");

    let response = state
        .state_machine
        .execute(transition, &request)
        .await
        .map_err(|err| {
            warn!(error_key = err.error_key(), "{transition:?} rejected: {err}");
            ApiError::from(err)
        })?;
    Ok(Json(TransitionResponse::Done { response }))
}

async fn handle_replication(
    State(state): State<SharedState>,
    payload: Result<Json<ReplicationMessage>, JsonRejection>,
) -> (StatusCode, Json<ReplicationResponse>) {
    state.record_request();
    let Some(replica) = state.replica.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReplicationResponse::failed(
                "replication is not accepted by this node",
            )),
        );
    };
    let message = match payload {
        Ok(Json(message)) => message,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ReplicationResponse::failed(rejection.body_text())),
            )
        }
    };

    let ack = replica.apply(&message);
    let status = if ack.status {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(ack))
}
