mod browser;
mod catalog;
mod chain;
mod config;
mod error;
mod extractor;
mod pipeline;
mod storage;
mod strategy;
mod validate;

use std::env;

use dotenv::dotenv;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env();

    let db_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    // Robust Connection Retry Loop
    println!("🔌 Connecting to catalog database...");
    let pool = {
        let mut attempts = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await
            {
                Ok(p) => {
                    println!("✅ Catalog database connected!");
                    break p;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= 15 {
                        eprintln!("🔥 CRITICAL: Failed to connect to catalog after 15 attempts.");
                        return Err(e.into());
                    }
                    println!(
                        "⚠️ Catalog connect failed ({}), retrying in 2s... (Attempt {}/15)",
                        e, attempts
                    );
                    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
                }
            }
        }
    };

    catalog::init_db(&pool).await?;

    let storage = storage::StorageManager::new().await?;

    // Per-item failures are reported in the statistics, not through the
    // exit code. A non-zero exit means setup itself failed.
    let stats = pipeline::run(&config, &pool, &storage).await?;

    println!("📊 {}", stats.summary());
    for failure in &stats.failures {
        println!("   ❌ {}: {}", failure.label, failure.reason);
    }

    Ok(())
}
