//! HTTP submission boundary.
//!
//! | route | |
//! |-------|---|
//! | `POST /api/execute-query` | run `{query, session?}` |
//! | `POST /api/tokens` | tokens and lint diagnostics for `{query}` |
//! | `GET /api/entities` | the entity registry |
//! | `GET /api/sessions/{id}` | a session's snapshot |
//! | `POST /api/sessions/{id}/cancel` | cancel a session's running query |
//! | `GET /health` | liveness |

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::QuarryConfig;
use crate::engine::{Engine, QueryOutcome};
use crate::error::{QuarryError, QuarryResult};
use crate::lexer::{Diagnostic, Lexer, Token};
use crate::registry::Operation;
use crate::session::{Session, SessionSnapshot};

/// Shared state for the server
#[derive(Debug)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub sessions: DashMap<String, Arc<Session>>,
    session_ttl: Duration,
    max_sessions: usize,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let defaults = QuarryConfig::default();
        Self {
            engine,
            sessions: DashMap::new(),
            session_ttl: defaults.session_ttl(),
            max_sessions: defaults.max_sessions,
        }
    }

    /// Evict sessions idle for at least `ttl`.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Keep at most `max` sessions; the longest idle one makes room.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max.max(1);
        self
    }

    /// Session with this id, created on first use.
    pub fn session(&self, id: &str) -> Arc<Session> {
        if let Some(existing) = self.sessions.get(id) {
            return Arc::clone(existing.value());
        }
        if self.sessions.len() >= self.max_sessions {
            self.prune_sessions();
            self.evict_to_capacity();
        }

        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::debug!("New session {}", id);
                Arc::new(Session::new(Arc::clone(&self.engine)))
            })
            .clone()
    }

    /// Drop sessions idle past the TTL. Running sessions are kept.
    pub fn prune_sessions(&self) -> usize {
        let ttl = self.session_ttl;
        let mut evicted = 0;
        self.sessions.retain(|id, session| match session.idle_for() {
            Some(idle) if idle >= ttl => {
                tracing::debug!("Evicting idle session {}", id);
                evicted += 1;
                false
            }
            _ => true,
        });
        if evicted > 0 {
            tracing::info!("Evicted {} idle session(s)", evicted);
        }
        evicted
    }

    fn evict_to_capacity(&self) {
        while self.sessions.len() >= self.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .filter_map(|entry| entry.value().idle_for().map(|idle| (entry.key().clone(), idle)))
                .max_by_key(|(_, idle)| *idle);
            match oldest {
                Some((id, _)) => {
                    self.sessions.remove_if(&id, |_, session| session.idle_for().is_some());
                }
                // Every session is running a query.
                None => break,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub query: String,
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokensRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct TokensResponse<'a> {
    pub tokens: Vec<Token<'a>>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Serialize)]
pub struct EntityView {
    pub name: String,
    pub accessor: String,
    pub operations: Vec<Operation>,
    pub fields: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub entities: usize,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type Failure = (StatusCode, Json<ErrorResponse>);

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        entities: state.engine.registry().len(),
        sessions: state.sessions.len(),
    })
}

pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> (StatusCode, Json<QueryOutcome>) {
    let outcome = match request.session.as_deref() {
        Some(id) => {
            let session = state.session(id);
            let result = session.submit(&request.query).await;
            QueryOutcome::from_result(result.map(|set| (*set).clone()))
        }
        None => state.engine.execute_query(&request.query).await,
    };
    (status(outcome.status_code()), Json(outcome))
}

pub async fn tokens(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokensRequest>,
) -> Json<serde_json::Value> {
    let lexer = Lexer::with_registry(&request.query, state.engine.registry());
    let tokens: Vec<Token<'_>> = lexer.collect();
    let diagnostics = tokens.iter().filter_map(Token::diagnostic).collect();
    let body = TokensResponse { tokens, diagnostics };
    Json(serde_json::to_value(&body).unwrap_or(serde_json::Value::Null))
}

pub async fn entities(State(state): State<Arc<AppState>>) -> Json<Vec<EntityView>> {
    Json(
        state
            .engine
            .registry()
            .entities()
            .iter()
            .map(|entity| EntityView {
                name: entity.name().to_string(),
                accessor: entity.accessor().to_string(),
                operations: entity.operations().to_vec(),
                fields: entity.fields().to_vec(),
            })
            .collect(),
    )
}

fn unknown_session(id: &str) -> Failure {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Unknown session '{}'", id),
            code: "UNKNOWN_SESSION".to_string(),
        }),
    )
}

pub async fn session_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, Failure> {
    let session = state
        .sessions
        .get(&id)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| unknown_session(&id))?;
    Ok(Json(session.snapshot()))
}

pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Failure> {
    let session = state
        .sessions
        .get(&id)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| unknown_session(&id))?;
    let cancelled = session.cancel();
    tracing::info!("Cancel requested for session {} (running: {})", id, cancelled);
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

/// Create the router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/execute-query", post(execute_query))
        .route("/api/tokens", post(tokens))
        .route("/api/entities", get(entities))
        .route("/api/sessions/{id}", get(session_snapshot))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Open the engine described by `config` and serve until the process stops.
pub async fn serve(config: &QuarryConfig) -> QuarryResult<()> {
    let engine = Arc::new(Engine::open(config).await?);
    let state = Arc::new(
        AppState::new(engine)
            .with_session_ttl(config.session_ttl())
            .with_max_sessions(config.max_sessions),
    );
    let sweeper = spawn_session_sweeper(Arc::clone(&state));
    let router = create_router(state);

    let addr = &config.bind_address;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| QuarryError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

    tracing::info!("quarry listening on {}", addr);
    tracing::info!("   POST /api/execute-query - Run a query");
    tracing::info!("   GET  /health            - Health check");

    let served = axum::serve(listener, router).await;
    sweeper.abort();
    served?;
    Ok(())
}

fn spawn_session_sweeper(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let period = (state.session_ttl / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        loop {
            ticks.tick().await;
            state.prune_sessions();
        }
    })
}
