use crate::error::{AppError, AppResult};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{error, info};

// Embedded so startup does not depend on the working directory
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_create_conversations",
        include_str!("../migrations/0001_create_conversations.sql"),
    ),
    (
        "0002_create_messages",
        include_str!("../migrations/0002_create_messages.sql"),
    ),
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the pool, verify one connection and apply migrations
pub async fn init_pool(database_url: &str, max_connections: usize) -> AppResult<Pool> {
    let pg_config: PgConfig = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(max_connections.max(1))
        .build()
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    match tokio::time::timeout(CONNECT_TIMEOUT, pool.get()).await {
        Ok(Ok(client)) => {
            client.simple_query("SELECT 1").await?;
        }
        Ok(Err(e)) => {
            error!(error = %e, "Database connection verification failed");
            return Err(e.into());
        }
        Err(_) => {
            error!(
                timeout_secs = CONNECT_TIMEOUT.as_secs(),
                "Database connection verification timeout"
            );
            return Err(AppError::StartServer("database connect timeout".into()));
        }
    }

    run_migrations(&pool).await?;
    info!(max_connections, "Database pool created and verified");
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> AppResult<()> {
    let client = pool.get().await?;
    for (label, sql) in MIGRATIONS {
        client.batch_execute(sql).await.map_err(|e| {
            error!(migration = %label, error = %e, "migration failed");
            AppError::Database(format!("migration {label}: {e}"))
        })?;
        info!(migration = %label, "migration applied");
    }
    Ok(())
}
