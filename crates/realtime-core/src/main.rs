//! Fanline realtime core.
//!
//! Hosts the in-process realtime components: the connection registry, the
//! cross-instance fan-out router, presence, call signaling, messaging, and
//! fulfillment windows. The client transport (WebSocket session layer) and
//! HTTP API live in the edge gateway, which links this crate as a library;
//! this binary runs the components standalone with the health surface for
//! deployment probes.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Connect the database pool and run migrations
//! 3. Connect the Redis broker
//! 4. Wire registry, router, presence, and services
//! 5. Spawn the fan-out subscriber
//! 6. Start the health HTTP server
//! 7. Wait for shutdown signal, drain, stop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use realtime_core::broker::{Broker, RedisBroker};
use realtime_core::config::Config;
use realtime_core::media::{HttpMediaProvider, MediaProvider};
use realtime_core::notify::{HttpNotificationDispatch, NotificationDispatch};
use realtime_core::observability::health::{health_router, HealthState};
use realtime_core::presence::{PresenceFanout, PresenceTracker};
use realtime_core::registry::ConnectionRegistry;
use realtime_core::router::{EventSink, FanoutRouter};
use realtime_core::services::calls::CallSignaling;
use realtime_core::services::fulfillment::FulfillmentWindows;
use realtime_core::services::messaging::Messaging;
use realtime_core::store::postgres::PgStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Fanline realtime core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        window_seconds = config.window_seconds,
        "Configuration loaded successfully"
    );

    // Initialize database connection pool
    info!("Connecting to database...");
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;
    info!("Database connection established");

    sqlx::migrate!("./migrations").run(&db_pool).await.map_err(|e| {
        error!("Failed to run migrations: {}", e);
        e
    })?;
    info!("Migrations applied");

    // Connect the Redis fan-out broker
    info!("Connecting to Redis broker...");
    let broker = RedisBroker::connect(&config.redis_url).await.map_err(|e| {
        error!("Failed to connect to Redis: {}", e);
        anyhow::anyhow!(e)
    })?;
    info!("Redis broker connected");

    // Wire the realtime components
    let health_state = Arc::new(HealthState::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(FanoutRouter::new(
        Arc::clone(&registry),
        Arc::new(broker) as Arc<dyn Broker>,
        config.instance_id.clone(),
    ));

    let media = Arc::new(HttpMediaProvider::new(
        config.media_base_url.clone(),
        config.media_service_token.clone(),
    )?) as Arc<dyn MediaProvider>;
    let notify = Arc::new(HttpNotificationDispatch::new(config.push_base_url.clone())?)
        as Arc<dyn NotificationDispatch>;

    let presence = Arc::new(PresenceTracker::new(
        Arc::clone(&registry),
        Arc::clone(&media),
    ));

    let store = Arc::new(PgStore::new(db_pool));
    let sink = Arc::clone(&router) as Arc<dyn EventSink>;

    let calls = Arc::new(CallSignaling::new(
        store.clone(),
        Arc::clone(&sink),
        Arc::clone(&media),
        Arc::clone(&presence),
        Arc::clone(&notify),
    ));
    let messaging = Arc::new(Messaging::new(
        store.clone(),
        store.clone(),
        Arc::clone(&sink),
        Arc::clone(&presence),
        Arc::clone(&notify),
    ));
    let fulfillment = Arc::new(FulfillmentWindows::new(
        store.clone(),
        store.clone(),
        Arc::clone(&presence),
        Arc::clone(&sink),
        Arc::clone(&notify),
        config.window_seconds,
    ));

    // The gateway picks these up through its session layer; keep the
    // handles alive for the lifetime of the process.
    let _services = (calls, messaging, fulfillment);

    // Spawn the fan-out subscriber and the presence forwarder
    let shutdown_token = CancellationToken::new();
    let subscriber = router.spawn_subscriber(shutdown_token.child_token());
    info!("Fan-out subscriber started");

    let presence_fanout = Arc::new(PresenceFanout::new(Arc::clone(&sink)));
    presence_fanout.spawn(registry.subscribe_presence(), shutdown_token.child_token());
    info!("Presence fan-out started");

    // Start the health HTTP server. Bind before spawning to fail fast.
    let health_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        anyhow::anyhow!("invalid bind address {}: {e}", config.bind_address)
    })?;
    let app = health_router(Arc::clone(&health_state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(
            10,
        )));
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            e
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    health_state.set_ready();
    info!("Realtime core running - press Ctrl+C to shutdown");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer drains us first.
    health_state.set_not_ready();
    shutdown_token.cancel();

    // Give the subscriber and health server time to wind down.
    let _ = tokio::time::timeout(Duration::from_secs(5), subscriber).await;

    info!("Realtime core shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
