//! HTTP handlers for the Beacon server.
//!
//! This module wires the event stream, presence, and publish endpoints to
//! the core services and runs the server until a shutdown signal arrives.

use crate::auth::{AuthError, Authenticator, TrustedHeaderAuthenticator};
use crate::config::Config;
use crate::limits::{rate_limit, RateScope, ScopedLimit};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use beacon_core::{
    Broker, BrokerError, Gateway, GatewayConfig, GatewayError, LocalBroker, MemoryPresenceStore,
    PresenceStatus, PresenceStore, PresenceTracker, RateGovernor, RedisBroker, RedisPresenceStore,
    RedisRateStore, StoreError,
};
use beacon_protocol::{codec, Envelope};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use futures_util::{future, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Most users a single presence query may ask about.
const MAX_PRESENCE_QUERY: usize = 1000;

/// Shared server state.
pub struct AppState {
    /// Opens event stream sessions; owns the broker and presence tracker.
    pub gateway: Gateway,
    /// Request rate limiter.
    pub governor: RateGovernor,
    /// Resolves the user behind a request.
    pub auth: Arc<dyn Authenticator>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Assemble state from its parts.
    #[must_use]
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        presence_store: Arc<dyn PresenceStore>,
        governor: RateGovernor,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let presence = Arc::new(
            PresenceTracker::with_threshold(presence_store, config.presence.offline_threshold())
                .with_store_timeout(config.redis.command_timeout()),
        );
        let gateway = Gateway::new(
            broker,
            presence,
            GatewayConfig {
                keepalive_interval: config.gateway.keepalive_interval(),
                max_rooms: config.gateway.max_rooms,
            },
        );

        Self {
            gateway,
            governor: governor.with_store_timeout(config.redis.command_timeout()),
            auth,
            config,
        }
    }

    /// Build state from configuration, connecting to Redis when configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the auth header name is invalid or Redis cannot
    /// be reached.
    pub async fn build(config: Config) -> Result<Self> {
        let auth = Arc::new(
            TrustedHeaderAuthenticator::new(&config.auth.user_header)
                .with_context(|| format!("Invalid auth.user_header: {}", config.auth.user_header))?,
        );
        let capacity = config.gateway.channel_capacity;

        let broker: Arc<dyn Broker>;
        let presence_store: Arc<dyn PresenceStore>;
        let governor;

        match &config.redis.url {
            Some(url) => {
                let client = redis::Client::open(url.as_str()).context("Invalid redis.url")?;
                let timeout = config.redis.command_timeout();
                let manager_config = ConnectionManagerConfig::new()
                    .set_connection_timeout(timeout)
                    .set_response_timeout(timeout);
                let conn = ConnectionManager::new_with_config(client.clone(), manager_config)
                    .await
                    .context("Failed to connect to Redis")?;
                let prefix = config.redis.key_prefix.clone();

                info!(prefix = %prefix, "Using Redis broker and stores");
                broker = Arc::new(RedisBroker::start(client, conn.clone(), prefix.clone(), capacity));
                presence_store = Arc::new(RedisPresenceStore::new(
                    conn.clone(),
                    prefix.clone(),
                    config.presence.record_ttl(),
                ));
                governor = RateGovernor::with_store(Arc::new(RedisRateStore::new(conn, prefix)));
            }
            None => {
                warn!("No Redis configured; broker, presence, and rate limits are process-local");
                broker = Arc::new(LocalBroker::with_capacity(capacity));
                presence_store = Arc::new(MemoryPresenceStore::new());
                governor = RateGovernor::local();
            }
        }

        Ok(Self::new(config, broker, presence_store, governor, auth))
    }
}

/// API errors, rendered as `{"error": "..."}` with a matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The caller could not be authenticated.
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// The caller may not access the resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The request is malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The endpoint is disabled.
    #[error("Not found")]
    NotFound,

    /// A backing service is unavailable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::InvalidChannel(reason) => Self::BadRequest(reason.to_string()),
            BrokerError::Encode(e) => Self::BadRequest(e.to_string()),
            e @ (BrokerError::Unavailable(_) | BrokerError::Redis(_)) => {
                Self::Unavailable(e.to_string())
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Broker(e) => e.into(),
            e @ GatewayError::TooManyRooms { .. } => Self::BadRequest(e.to_string()),
            e @ GatewayError::ShuttingDown => Self::Unavailable(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
            metrics::record_error(match self {
                Self::Unavailable(_) => "unavailable",
                _ => "internal",
            });
        }

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let stream = Router::new().route(&state.config.gateway.path, get(events_handler));
    let presence = Router::new()
        .route("/presence/query", post(presence_query_handler))
        .route("/presence/heartbeat", post(heartbeat_handler));
    let publish = Router::new().route("/internal/publish", post(publish_handler));

    Router::new()
        .route("/health", get(health_handler))
        .merge(limited(stream, &state, RateScope::Stream))
        .merge(limited(presence, &state, RateScope::Presence))
        .merge(limited(publish, &state, RateScope::Publish))
        .with_state(state)
}

fn limited(
    routes: Router<Arc<AppState>>,
    state: &Arc<AppState>,
    scope: RateScope,
) -> Router<Arc<AppState>> {
    routes.route_layer(middleware::from_fn_with_state(
        ScopedLimit::new(state, scope),
        rate_limit,
    ))
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::build(config.clone()).await?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let sweeper = spawn_sweeper(&state);
    let app = router(Arc::clone(&state));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Beacon server listening on {}", addr);
    info!("Event stream endpoint: http://{}{}", addr, config.gateway.path);
    if config.publish.token.is_none() {
        info!("Internal publish endpoint disabled (no publish.token)");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.gateway.clone()))
    .await?;

    sweeper.abort();
    info!("Beacon server stopped");

    Ok(())
}

/// Wait for Ctrl-C or SIGTERM, then end every open stream.
async fn shutdown_signal(gateway: Gateway) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("Shutdown signal received");
    gateway.shutdown();
}

/// Periodically mark offline users whose heartbeats stopped without a
/// clean disconnect.
fn spawn_sweeper(state: &Arc<AppState>) -> JoinHandle<()> {
    let presence = Arc::clone(state.gateway.presence());
    let threshold = state.config.presence.offline_threshold();
    let period = state.config.presence.sweep_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_once(&presence, threshold).await;
        }
    })
}

async fn sweep_once(presence: &PresenceTracker, threshold: Duration) -> usize {
    match presence.sweep_stale(threshold).await {
        Ok(swept) => {
            metrics::record_swept(swept);
            swept
        }
        Err(e) => {
            warn!(error = %e, "Presence sweep failed");
            metrics::record_error("presence_sweep");
            0
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = state.gateway.broker();
    let healthy = broker.is_healthy();

    Json(serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "broker": broker.name(),
        "brokerHealthy": healthy,
    }))
}

/// Event stream query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated chat room ids.
    #[serde(default)]
    pub rooms: Option<String>,
}

/// Split a comma-separated room list, dropping blanks and duplicates.
fn parse_rooms(rooms: Option<&str>) -> Vec<String> {
    let mut parsed: Vec<String> = Vec::new();
    for room in rooms.unwrap_or_default().split(',').map(str::trim) {
        if !room.is_empty() && !parsed.iter().any(|r| r == room) {
            parsed.push(room.to_string());
        }
    }
    parsed
}

/// Event stream handler.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let user_id = state.auth.authenticate(&headers).await?;

    let rooms = parse_rooms(query.rooms.as_deref());
    for room in &rooms {
        if !state.auth.can_join_room(&user_id, room).await {
            return Err(ApiError::Forbidden(format!("room {room}")));
        }
    }

    let session = state.gateway.connect(&user_id, &rooms).await?;
    let connection_id = session.connection_id().to_string();
    debug!(connection = %connection_id, user = %user_id, "Event stream opened");

    // Dropped with the body, when the client goes away.
    let metrics_guard = ConnectionMetricsGuard::new();

    let events = session.into_stream().filter_map(move |envelope| {
        let _ = &metrics_guard;
        let event = match serde_json::to_string(envelope.as_ref()) {
            Ok(json) if json.len() <= codec::MAX_FRAME_SIZE => {
                metrics::record_envelope(envelope.kind(), json.len());
                Some(Ok::<Event, Infallible>(Event::default().data(json)))
            }
            Ok(json) => {
                warn!(
                    connection = %connection_id,
                    size = json.len(),
                    "Dropping oversized envelope"
                );
                metrics::record_error("encode");
                None
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Dropping unencodable envelope");
                metrics::record_error("encode");
                None
            }
        };
        future::ready(event)
    });

    Ok(([("x-accel-buffering", "no")], Sse::new(events)).into_response())
}

/// Presence query body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceQuery {
    /// Users to look up.
    pub user_ids: Vec<String>,
}

/// Presence query handler.
async fn presence_query_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(query): Json<PresenceQuery>,
) -> Result<Json<HashMap<String, PresenceStatus>>, ApiError> {
    let user_id = state.auth.authenticate(&headers).await?;

    if query.user_ids.len() > MAX_PRESENCE_QUERY {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_PRESENCE_QUERY} users per query"
        )));
    }

    if let Err(e) = state.gateway.presence().touch(&user_id).await {
        warn!(user = %user_id, error = %e, "Presence refresh failed");
    }

    let statuses = state.gateway.presence().get_many(&query.user_ids).await?;
    Ok(Json(statuses))
}

/// Presence heartbeat handler.
async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = state.auth.authenticate(&headers).await?;
    state.gateway.presence().touch(&user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Publish request body.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Target channel.
    pub channel: String,
    /// Envelope to deliver.
    pub envelope: Envelope,
}

/// Internal publish handler, for services without a broker connection.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(expected) = state.config.publish.token.as_deref() else {
        return Err(ApiError::NotFound);
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(AuthError::Missing)?;
    if !tokens_match(presented.trim(), expected) {
        return Err(AuthError::Invalid("publish token mismatch").into());
    }

    let delivered = state
        .gateway
        .broker()
        .publish(&request.channel, &request.envelope)
        .await?;

    let family = request.channel.split(':').next().unwrap_or_default();
    metrics::record_published(family);
    debug!(channel = %request.channel, delivered, "Published via HTTP");

    Ok(Json(serde_json::json!({ "delivered": delivered })))
}

/// Compare tokens in time independent of where they first differ.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use beacon_core::{PresenceStore, RateQuota};
    use beacon_protocol::kinds;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn state_with(config: Config) -> Arc<AppState> {
        Arc::new(AppState::build(config).await.unwrap())
    }

    fn user(id: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-authenticated-user", HeaderValue::from_static(id));
        headers
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_parse_rooms() {
        assert!(parse_rooms(None).is_empty());
        assert!(parse_rooms(Some("")).is_empty());
        assert_eq!(parse_rooms(Some("m1, m2,,m1 ,m3")), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_health() {
        let state = state_with(Config::default()).await;
        let body = body_json(health_handler(State(state)).await.into_response()).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["broker"], "local");
    }

    #[tokio::test]
    async fn test_events_requires_authentication() {
        let state = state_with(Config::default()).await;

        let err = events_handler(State(state), HeaderMap::new(), Query(EventsQuery::default()))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Unauthorized(AuthError::Missing)));
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_events_streams_frames() {
        let state = state_with(Config::default()).await;
        let query = EventsQuery {
            rooms: Some("m1".to_string()),
        };

        let response = events_handler(State(state.clone()), user("u1"), Query(query))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let mut body = response.into_body().into_data_stream();
        let mut wire = BytesMut::new();

        wire.extend_from_slice(&body.next().await.unwrap().unwrap());
        let connected = codec::decode_from(&mut wire).unwrap().unwrap();
        assert_eq!(connected.kind(), kinds::CONNECTED);
        assert_eq!(connected.str_field("userId"), Some("u1"));

        let message = Envelope::new(kinds::NEW_MESSAGE)
            .with_field("matchId", "m1")
            .with_field("content", "hi");
        state
            .gateway
            .broker()
            .publish("chat-room:m1", &message)
            .await
            .unwrap();

        wire.extend_from_slice(&body.next().await.unwrap().unwrap());
        assert_eq!(codec::decode_from(&mut wire).unwrap(), Some(message));

        let online = state.gateway.presence().get_many(&["u1".to_string()]).await.unwrap();
        assert!(online["u1"].is_online);

        drop(body);
        settle().await;

        let offline = state.gateway.presence().get_many(&["u1".to_string()]).await.unwrap();
        assert!(!offline["u1"].is_online);
    }

    #[tokio::test]
    async fn test_events_rejects_too_many_rooms() {
        let mut config = Config::default();
        config.gateway.max_rooms = 1;
        let state = state_with(config).await;
        let query = EventsQuery {
            rooms: Some("a,b".to_string()),
        };

        let err = events_handler(State(state), user("u1"), Query(query))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    struct NoRooms;

    #[async_trait]
    impl Authenticator for NoRooms {
        async fn authenticate(&self, _: &HeaderMap) -> Result<String, AuthError> {
            Ok("u1".to_string())
        }

        async fn can_join_room(&self, _: &str, _: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_events_forbidden_room() {
        let state = Arc::new(AppState::new(
            Config::default(),
            Arc::new(LocalBroker::new()),
            Arc::new(MemoryPresenceStore::new()),
            RateGovernor::local(),
            Arc::new(NoRooms),
        ));
        let query = EventsQuery {
            rooms: Some("m1".to_string()),
        };

        let err = events_handler(State(state.clone()), HeaderMap::new(), Query(query))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let status = state.gateway.presence().get_many(&["u1".to_string()]).await.unwrap();
        assert_eq!(status["u1"], PresenceStatus::UNKNOWN);
    }

    #[tokio::test]
    async fn test_heartbeat_then_query() {
        let state = state_with(Config::default()).await;

        let status = heartbeat_handler(State(state.clone()), user("u1")).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let query = PresenceQuery {
            user_ids: vec!["u1".to_string(), "ghost".to_string()],
        };
        let Json(statuses) = presence_query_handler(State(state), user("u2"), Json(query))
            .await
            .unwrap();

        assert!(statuses["u1"].is_online);
        assert!(statuses["u1"].last_seen.is_some());
        assert_eq!(statuses["ghost"], PresenceStatus::UNKNOWN);
    }

    #[tokio::test]
    async fn test_presence_query_refreshes_caller() {
        let state = state_with(Config::default()).await;
        let query = PresenceQuery {
            user_ids: vec!["u2".to_string()],
        };

        let Json(statuses) = presence_query_handler(State(state.clone()), user("u2"), Json(query))
            .await
            .unwrap();

        assert!(statuses["u2"].is_online);
        assert!(statuses["u2"].last_seen.is_some());
    }

    #[tokio::test]
    async fn test_presence_query_limit() {
        let state = state_with(Config::default()).await;
        let query = PresenceQuery {
            user_ids: (0..=MAX_PRESENCE_QUERY).map(|i| format!("u{i}")).collect(),
        };

        let err = presence_query_handler(State(state), user("u1"), Json(query))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    fn publish_request() -> PublishRequest {
        PublishRequest {
            channel: "user-notifications:u1".to_string(),
            envelope: Envelope::new("notification").with_field("title", "New like"),
        }
    }

    fn bearer(token: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(token));
        headers
    }

    #[tokio::test]
    async fn test_publish_disabled_without_token() {
        let state = state_with(Config::default()).await;

        let err = publish_handler(State(state), bearer("Bearer x"), Json(publish_request()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_publish_with_token() {
        let mut config = Config::default();
        config.publish.token = Some("s3cret".to_string());
        let state = state_with(config).await;

        let err = publish_handler(State(state.clone()), bearer("Bearer nope"), Json(publish_request()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        let mut subscription = state
            .gateway
            .broker()
            .subscribe("user-notifications:u1")
            .await
            .unwrap();

        let Json(body) = publish_handler(State(state), bearer("Bearer s3cret"), Json(publish_request()))
            .await
            .unwrap();
        assert_eq!(body["delivered"], 1);
        assert_eq!(subscription.recv().await.unwrap().str_field("title"), Some("New like"));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cres", "s3cret"));
        assert!(!tokens_match("s3cre", "s3cret"));
        assert!(!tokens_match("", "s3cret"));
    }

    #[tokio::test]
    async fn test_publish_invalid_channel() {
        let mut config = Config::default();
        config.publish.token = Some("s3cret".to_string());
        let state = state_with(config).await;
        let request = PublishRequest {
            channel: String::new(),
            envelope: Envelope::ping(),
        };

        let err = publish_handler(State(state), bearer("Bearer s3cret"), Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sweep_marks_stale_users_offline() {
        let store = Arc::new(MemoryPresenceStore::new());
        store.set_online("stale", 0).await.unwrap();
        let presence = PresenceTracker::new(store);

        assert_eq!(sweep_once(&presence, Duration::from_secs(300)).await, 1);
        assert_eq!(sweep_once(&presence, Duration::from_secs(300)).await, 0);
    }

    async fn send(addr: SocketAddr, request: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.to_ascii_lowercase()
    }

    #[tokio::test]
    async fn test_rate_limit_over_http() {
        let mut config = Config::default();
        config.rate_limits.presence = RateQuota::new(2, 60);
        let state = state_with(config).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let heartbeat = "POST /presence/heartbeat HTTP/1.1\r\nhost: beacon\r\n\
            x-authenticated-user: u1\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

        let first = send(addr, heartbeat).await;
        assert!(first.starts_with("http/1.1 204"), "{first}");
        assert!(first.contains("x-ratelimit-remaining: 1"));
        assert!(send(addr, heartbeat).await.starts_with("http/1.1 204"));

        let denied = send(addr, heartbeat).await;
        assert!(denied.starts_with("http/1.1 429"), "{denied}");
        assert!(denied.contains("retry-after: "));
        assert!(denied.contains("x-ratelimit-limit: 2"));

        let other_client = send(
            addr,
            "POST /presence/heartbeat HTTP/1.1\r\nhost: beacon\r\nx-real-ip: 203.0.113.9\r\n\
             x-authenticated-user: u1\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(other_client.starts_with("http/1.1 204"), "{other_client}");

        let health = send(
            addr,
            "GET /health HTTP/1.1\r\nhost: beacon\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(health.starts_with("http/1.1 200"), "{health}");
    }
}
