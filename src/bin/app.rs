use mailroom::{config::AppConfig, dns::DnsResolver, init_tracing, run_platform, shutdown_signal};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let database_url =
        std::env::var("DATABASE_URL").expect("Missing DATABASE_URL environment variable");

    let connect_options: PgConnectOptions = database_url
        .parse::<PgConnectOptions>()?
        .options([("statement_timeout", "10000")]);

    let pool = PgPoolOptions::new()
        .max_connections(30)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect_with(connect_options)
        .await?;

    #[cfg(feature = "apply-db-migrations")]
    {
        info!("applying database migrations");
        sqlx::migrate!().run(&pool).await?;
    }

    let config = AppConfig::from_env();
    info!(environment = ?config.environment, "starting mailroom");

    let shutdown = CancellationToken::new();

    run_platform(pool, config, DnsResolver::new(), shutdown.clone()).await;

    shutdown_signal(shutdown.clone()).await;
    shutdown.cancel();
    info!("shutting down");

    // grace period for in-flight tasks to settle their bookkeeping
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    Ok(())
}
