//! Server assembly: state construction, router, middleware layering, and
//! lifecycle (startup, background tasks, graceful shutdown).

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::agent::health::spawn_health_monitor;
use crate::agent::orchestrator::Orchestrator;
use crate::api::{admin, openai::routes as openai_routes};
use crate::audit::{self, AuditRecorder};
use crate::auth::{Authenticator, jwt::JwtValidator, middleware::auth_middleware, static_key::StaticKeyAuth};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::persistence::{PersistenceLayer, postgres::PostgresProvider};
use crate::ratelimit::CallerRateLimiter;
use crate::telemetry;

/// Build the shared application state and spawn every background task:
/// agent supervision, health monitoring, the audit writer, JWKS refresh,
/// and rate-limit eviction.
pub async fn build_state(config: Arc<AppConfig>) -> anyhow::Result<AppState> {
    let shutdown = CancellationToken::new();

    let persistence: Option<Arc<dyn PersistenceLayer>> =
        match config.persistence.db_url.as_deref() {
            Some(url) => {
                let provider = PostgresProvider::new(url).await?;
                info!("persistence enabled");
                Some(Arc::new(provider))
            }
            None => {
                info!("no DB_URL configured, running without persistence");
                None
            }
        };

    let static_key = config.auth.static_key.as_deref().map(|key| {
        StaticKeyAuth::new(
            key,
            config
                .auth
                .static_user_id
                .clone()
                .unwrap_or_else(|| "static-admin".to_owned()),
            config
                .auth
                .static_org_id
                .clone()
                .unwrap_or_else(|| "default".to_owned()),
            config.auth.static_email.clone(),
            config.auth.static_name.clone(),
        )
    });
    let jwt = config.auth.jwks_url.clone().map(|jwks_url| {
        Arc::new(JwtValidator::new(
            jwks_url,
            config.auth.jwt_issuer.clone(),
            config.auth.jwt_default_org.clone(),
        ))
    });
    if let Some(jwt) = &jwt {
        // Warm the key cache; a cold cache heals itself on first use.
        if let Err(err) = jwt.refresh().await {
            tracing::warn!(error = %err, "initial JWKS fetch failed");
        }
        jwt.spawn_refresh(shutdown.clone());
    }
    let authenticator = Arc::new(Authenticator::new(
        static_key,
        persistence.clone(),
        jwt,
    ));

    let audit_config = config.audit_config();
    let audit = AuditRecorder::new(audit_config.queue_capacity);
    audit::spawn_writer(
        audit.clone(),
        audit_config,
        persistence.clone(),
        shutdown.clone(),
    );

    let limiter = Arc::new(CallerRateLimiter::new(
        config.limits.rate_limit_rpm,
        config.limits.rate_limit_burst,
    ));
    limiter.spawn_eviction(shutdown.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        config.agent_specs(),
        config.model_aliases(),
        config.orchestrator_config(),
    ));
    orchestrator.start().await;
    spawn_health_monitor(
        Arc::clone(&orchestrator),
        config.health_config(),
        shutdown.clone(),
    );

    let metrics = if config.server.metrics_enabled {
        telemetry::install_metrics()
    } else {
        None
    };

    Ok(AppState {
        config,
        authenticator,
        orchestrator,
        audit,
        limiter,
        persistence,
        metrics,
        shutdown,
        started_at: Instant::now(),
    })
}

/// Assemble the router: public liveness and metrics, everything else behind
/// the authentication middleware.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(openai_routes::chat_completions))
        .route("/v1/models", get(openai_routes::list_models))
        .route("/status", get(admin::status))
        .route(
            "/api/v1/platform/admins",
            get(admin::list_admins).post(admin::add_admin),
        )
        .route("/api/v1/platform/admins/{email}", delete(admin::remove_admin))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let request_timeout = state.config.request_timeout();
    let cors = if state.config.server.cors_enabled {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(admin::health))
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.config.limits.body_limit_bytes))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| async move {
                // Covers handler latency up to response headers; streaming
                // bodies carry their own deadline.
                match tokio::time::timeout(request_timeout + Duration::from_secs(5), next.run(req))
                    .await
                {
                    Ok(response) => response,
                    Err(_) => GatewayError::UpstreamTimeout.into_response(),
                }
            },
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [("Content-Type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => GatewayError::NotFound.into_response(),
    }
}

/// Start the Axum server with the provided configuration and serve until
/// SIGTERM / ctrl-c, then stop agents and flush the audit queue.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let state = build_state(config.clone()).await?;
    let orchestrator = Arc::clone(&state.orchestrator);
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        agents = ?config.agent_specs().iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down: stopping agents and flushing audit queue");
    orchestrator.stop_all(Duration::from_secs(5)).await;
    shutdown.cancel();
    // Give the audit writer one batch interval to drain.
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
