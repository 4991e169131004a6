// Trano Tracker API v0.1
use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::AppConfig;
use services::poller::{PollerState, SharedPollerState};
use services::supervisor::Supervisor;
use services::upstream::UpstreamClient;

/// Trano Tracker API — OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Trano Tracker API",
        version = "0.1.0",
        description = "Live progress tracking for a fleet of scheduled trains. Polls an \
            upstream running-status provider, reconciles each response against the \
            tracked state of every in-progress run, and serves the result over a \
            read-only HTTP API.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health and database connectivity check"),
        (name = "Trains", description = "Train schedules, routes, and runs"),
        (name = "Runs", description = "Single-run tracked state"),
        (name = "Poller", description = "Background poll loop status"),
        (name = "Stations", description = "Stations referenced by schedules and routes"),
    ),
    paths(
        routes::health::health_check,
        routes::trains::list_trains,
        routes::trains::get_train_schedule,
        routes::trains::list_runs_for_train,
        routes::runs::get_run,
        routes::poller::get_poller_status,
        routes::stations::list_stations,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::trains::TrainListItem,
            routes::trains::RoutePoint,
            routes::trains::ScheduleResponse,
            routes::runs::RunSummary,
            routes::runs::RunResponse,
            routes::runs::RunErrorsView,
            routes::runs::ErrorCounterView,
            services::poller::PollerState,
            services::poller::CycleCounters,
            routes::stations::StationItem,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trano_tracker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections)
        .min_connections(config.db_pool_min_connections)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Database migrations completed");

    if let Err(e) = services::seed::seed_if_empty(&pool).await {
        tracing::error!("Failed to seed fixture schedules: {}", e);
    }

    let upstream = UpstreamClient::new(
        config.poller.proxy_url.as_deref(),
        config.poller.rate_limit_period_ms,
        config.poller.rate_limit_burst,
    );

    let supervisor = Supervisor::new(config.server.shutdown_timeout);
    let signal_handle = supervisor.spawn_signal_listener();

    let poller_state: SharedPollerState = Arc::new(RwLock::new(PollerState::new()));
    let poller_handle = tokio::spawn(services::poller::run_poller(
        pool.clone(),
        upstream,
        config.timezone,
        config.poller.concurrency,
        config.poller.window,
        config.poller.static_error_threshold,
        config.poller.total_error_threshold,
        poller_state.clone(),
        supervisor.cancel.clone(),
    ));

    let expander_handle = tokio::spawn(services::expander::run_expander(
        pool.clone(),
        config.timezone,
        supervisor.cancel.clone(),
    ));

    // CORS — read-only API, restrict methods to GET.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any);

    let build_app = {
        let pool = pool.clone();
        let poller_state = poller_state.clone();
        let cors = cors.clone();
        move || {
            let train_routes = Router::new()
                .route("/api/v1/trains", get(routes::trains::list_trains))
                .route(
                    "/api/v1/trains/:train_no/schedule",
                    get(routes::trains::get_train_schedule),
                )
                .route(
                    "/api/v1/trains/:train_no/runs",
                    get(routes::trains::list_runs_for_train),
                )
                .with_state(pool.clone());

            let run_routes = Router::new()
                .route("/api/v1/runs/:run_id", get(routes::runs::get_run))
                .with_state(pool.clone());

            let health_routes = Router::new()
                .route("/api/v1/health", get(routes::health::health_check))
                .with_state(pool.clone());

            let poller_routes = Router::new()
                .route(
                    "/api/v1/poller/status",
                    get(routes::poller::get_poller_status),
                )
                .with_state(poller_state.clone());

            let station_routes = Router::new()
                .route("/api/v1/stations", get(routes::stations::list_stations))
                .with_state(pool.clone());

            Router::new()
                .merge(health_routes)
                .merge(train_routes)
                .merge(run_routes)
                .merge(poller_routes)
                .merge(station_routes)
                .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
                .layer(cors.clone())
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.server.port
    );

    // The listener is rebuilt on every SIGHUP so an operator can pick up a
    // config reload without disturbing the poller or schedule expander.
    loop {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("Failed to bind TCP listener");
        tracing::info!("API server listening on {}", addr);

        let restart_api = supervisor.restart_api.clone();
        let cancel = supervisor.cancel.clone();
        let shutdown_signal = async move {
            tokio::select! {
                _ = restart_api.notified() => {}
                _ = cancel.cancelled() => {}
            }
        };

        axum::serve(listener, build_app())
            .with_graceful_shutdown(shutdown_signal)
            .await
            .expect("Server terminated unexpectedly");

        if supervisor.cancel.is_cancelled() {
            break;
        }
        tracing::info!("rebuilding API listener after SIGHUP");
    }

    supervisor
        .wait_for_background_tasks(vec![poller_handle, expander_handle])
        .await;
    let _ = signal_handle.await;
}
