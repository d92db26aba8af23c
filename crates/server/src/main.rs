use std::sync::Arc;

use anyhow::Context;
use tandem_server::{
    api::AppState,
    app::build_router,
    auth::jwt::JwtAccessTokenService,
    broadcast::{self, hub::ConnectionHub, memory::MemoryBus, postgres::PgNotifyBus, EventBroadcaster, MessageBus},
    clock::Clock,
    config::{BusKind, LogFormat, ServerConfig},
    cors::cors_layer,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    locks::{LockManager, LockStore},
    membership::MembershipStore,
    presence::{PresenceStore, PresenceTracker},
    streams::{EventStore, StreamEventLog},
    sweeper,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("TANDEM_JWT_SECRET is unset; using the development secret");
    }
    let jwt = Arc::new(JwtAccessTokenService::new(&config.jwt_secret).context("invalid tandem JWT secret")?);

    let database_url = config.database_url.as_deref().context("TANDEM_DATABASE_URL must be set")?;
    let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
    check_pool_health(&pool).await?;
    run_migrations(&pool).await?;

    let bus: Arc<dyn MessageBus> = match config.bus {
        BusKind::Postgres => Arc::new(PgNotifyBus::new(pool.clone(), config.sse_buffer)),
        BusKind::Memory => Arc::new(MemoryBus::default()),
    };
    let broadcaster = EventBroadcaster::new(bus);
    let log = StreamEventLog::new(EventStore::Postgres(pool.clone()), broadcaster.clone());
    let clock = Clock::System;
    let locks = LockManager::new(LockStore::Postgres(pool.clone()), log.clone(), clock.clone(), config.lock_ttl);
    let presence =
        PresenceTracker::new(PresenceStore::Postgres(pool.clone()), log.clone(), clock, config.presence_ttl);
    let hub = ConnectionHub::new(config.sse_buffer);

    let cancel = CancellationToken::new();
    let fanout = broadcast::start_fanout(&broadcaster, log.clone(), hub.clone(), cancel.clone()).await?;
    let sweep = config
        .sweep_interval
        .map(|interval| tokio::spawn(sweeper::run(locks.clone(), presence.clone(), interval, cancel.clone())));

    let state = AppState {
        jwt,
        memberships: MembershipStore::Postgres(pool),
        locks,
        presence,
        log,
        hub: hub.clone(),
        sse_keepalive: config.sse_keepalive,
    };
    let app = build_router(state, cors_layer(config.cors_origins.as_deref()));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind tandem listener on {}", config.listen_addr))?;
    info!(listen_addr = %config.listen_addr, bus = ?config.bus, "starting tandem server");

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
            // Ends every open SSE body so the graceful drain can finish.
            hub.close_all();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("tandem server exited unexpectedly")?;

    cancel.cancel();
    let _ = fanout.await;
    if let Some(sweep) = sweep {
        let _ = sweep.await;
    }
    info!("tandem server stopped");
    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
