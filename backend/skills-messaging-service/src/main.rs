use actix_web::{middleware::Logger, web, App, HttpServer};
use futures::future::join_all;
use skills_messaging_service::{
    config, db, error, logging,
    queue::{RedisJobQueue, DELIVERY_QUEUE, RECEIPT_QUEUE},
    redis_client::RedisClient,
    repository::PgStore,
    routes,
    services::{
        ClassDirectory, DenyAllClassDirectory, HttpClassDirectory, HttpPushNotifier,
        LogPushNotifier, PushNotifier,
    },
    state::{AppState, Backends},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const QUEUE_GAUGE_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;

    // Initialize DB pool
    let pool = db::init_pool(&cfg.database_url, cfg.db_max_connections).await?;

    let redis = RedisClient::from_url(&cfg.redis_url)
        .await
        .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;

    let push: Arc<dyn PushNotifier> = match cfg.push_gateway_url.clone() {
        Some(url) => {
            tracing::info!(%url, "offline push via gateway");
            Arc::new(
                HttpPushNotifier::new(url)
                    .map_err(|e| error::AppError::StartServer(format!("push gateway: {e}")))?,
            )
        }
        None => {
            tracing::warn!("PUSH_GATEWAY_URL not set, offline push notifications are only logged");
            Arc::new(LogPushNotifier)
        }
    };

    let classes: Arc<dyn ClassDirectory> = match cfg.enrollment_service_url.clone() {
        Some(url) => Arc::new(HttpClassDirectory::new(url)?),
        None => {
            tracing::warn!("ENROLLMENT_SERVICE_URL not set, class messaging is disabled");
            Arc::new(DenyAllClassDirectory)
        }
    };

    let prefix = cfg.delivery.key_prefix.clone();
    let backends = Backends {
        store: Arc::new(PgStore::new(pool)),
        delivery_queue: Arc::new(RedisJobQueue::new(redis.clone(), &prefix, DELIVERY_QUEUE)),
        receipt_queue: Arc::new(RedisJobQueue::new(redis, &prefix, RECEIPT_QUEUE)),
        push,
        classes,
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    let (state, workers) = AppState::assemble(cfg, backends);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = workers.spawn(shutdown_rx.clone());

    // Keep queue depth gauges fresh for scrapes
    let gauge_delivery = state.delivery.clone();
    let mut gauge_shutdown = shutdown_rx;
    background.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(QUEUE_GAUGE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = gauge_delivery.queue_stats().await {
                        tracing::warn!(error = %e, "failed to refresh queue gauges");
                    }
                }
                changed = gauge_shutdown.changed() => {
                    if changed.is_err() || *gauge_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    tracing::info!(%bind_addr, "starting skills-messaging-service");

    // actix-web HttpServer futures are not Send; run in the foreground
    let server = HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind: {e}")))?
    .run();

    let result = server
        .await
        .map_err(|e| error::AppError::StartServer(format!("server: {e}")));

    tracing::info!("server stopped, draining background workers");
    let _ = shutdown_tx.send(true);
    for joined in join_all(background).await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "background task panicked");
        }
    }

    result
}
