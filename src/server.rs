//! HTTP surface
//!
//! - `GET /` liveness
//! - `GET /ws?userId=..[&token=..]` WebSocket upgrade
//! - `POST /internal/deliver` live delivery of a persisted message (token only)
//! - `GET /api/online` current online user ids

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection;
use crate::error::{ApiError, Result};
use crate::events::ChatMessage;
use crate::hub::Hub;
use crate::identity::{self, HandshakeQuery, IdentityVerifier};
use crate::presence::PresenceBroadcaster;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub hub: Arc<Hub>,
    pub router: MessageRouter,
    pub verifier: Option<Arc<IdentityVerifier>>,
}

impl AppState {
    /// Wire registry, hub and router around one presence topic
    pub fn new(config: Config) -> Self {
        let presence = PresenceBroadcaster::new();
        let registry = Arc::new(ConnectionRegistry::new(presence.clone()));
        let hub = Arc::new(Hub::new(presence));
        let router = MessageRouter::new(registry.clone(), hub.clone());
        let verifier = config
            .handshake_secret
            .as_deref()
            .map(|secret| Arc::new(IdentityVerifier::new(secret)));

        Self {
            config: Arc::new(config),
            registry,
            hub,
            router,
            verifier,
        }
    }
}

/// Build the HTTP router.
///
/// `/internal/deliver` is only mounted when a deliver token is configured,
/// and sits outside the CORS layer so browsers never reach it cross-origin.
pub fn build_router(state: AppState) -> Router {
    let cors = configure_cors(&state.config.allowed_origins);

    let mut router = Router::new()
        .route("/", get(root))
        .route("/ws", get(ws_upgrade))
        .route("/api/online", get(online_users))
        .layer(cors);

    if state.config.deliver_token.is_some() {
        router = router.route("/internal/deliver", post(deliver));
    } else {
        warn!("no CHATCAST_DELIVER_TOKEN configured, /internal/deliver disabled");
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Allow-listed origins, `GET`/`POST` only, credentials permitted.
fn configure_cors(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        info!("no CORS origins configured, cross-origin requests disabled");
    } else {
        info!(origins = ?allowed, "configured CORS allow-list");
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

async fn root() -> &'static str {
    "Server is working"
}

async fn ws_upgrade(
    State(state): State<AppState>,
    query: std::result::Result<Query<HandshakeQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    // An unreadable handshake connects anonymously
    let query = match query {
        Ok(Query(query)) => query,
        Err(e) => {
            debug!(error = %e, "unreadable handshake query, connecting anonymously");
            HandshakeQuery::default()
        }
    };
    let user_id = identity::resolve(&query, state.verifier.as_deref());
    debug!(claimed = ?query.user_id, resolved = ?user_id, "websocket handshake");

    ws.on_upgrade(move |socket| connection::run_connection(socket, state, user_id))
}

async fn deliver(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(message): Json<ChatMessage>,
) -> Result<Response> {
    authorize(&state.config, &headers)?;

    if message.sender_id.trim().is_empty() || message.receiver_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "senderId and receiverId are required".to_string(),
        ));
    }

    let outcome = state.router.deliver(message);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "delivered": outcome.is_delivered() })),
    )
        .into_response())
}

async fn online_users(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.online_users())
}

fn authorize(config: &Config, headers: &HeaderMap) -> Result<()> {
    let expected = config
        .deliver_token
        .as_deref()
        .ok_or(ApiError::Unauthorized)?;

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}
