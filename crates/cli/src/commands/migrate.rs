//! `attestgate migrate` — apply the `users`/`query_logs` schema.

use attestgate_core::config::AppConfig;
use attestgate_telemetry::SqlxQueryLogStore;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let pool = SqlxQueryLogStore::connect(&config.database.dsn).await?;
    SqlxQueryLogStore::migrate(&pool).await?;
    println!("migrations applied");
    Ok(())
}
