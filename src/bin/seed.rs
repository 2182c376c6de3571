//! Seed script for development — populates a fresh database with sample
//! tenant configurations and a burst of classified events.
//!
//! Usage: `cargo run --bin seed`
//!
//! Requires `DATABASE_URL` (reads .env).

use sqlx::PgPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    // Run migrations first
    sqlx::migrate!("./migrations").run(&pool).await?;

    println!("=== WafSentry Seed Script ===");

    seed_tenants(&pool).await?;
    seed_sample_delivery(&pool).await?;

    println!("\n=== Seed complete! ===");
    println!("Ingest endpoint: POST /api/v1/ingest/acme-prod");

    Ok(())
}

async fn seed_tenants(pool: &PgPool) -> anyhow::Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenant_configs")
        .fetch_one(pool)
        .await?;

    if count > 0 {
        println!("[skip] Tenant configs already exist ({count})");
        return Ok(());
    }

    let tenants = vec![
        ("acme-prod", "acme-prod-blocklist", 900i64, 5i32, 86400i64, true),
        ("acme-staging", "acme-staging-blocklist", 300, 3, 3600, true),
        ("globex-prod", "globex-blocklist", 900, 10, 86400, false),
    ];

    for (tenant_id, ipset_name, window_secs, threshold, ttl_secs, enabled) in tenants {
        sqlx::query(
            "INSERT INTO tenant_configs
             (tenant_id, ipset_name, window_secs, event_threshold, block_ttl_secs,
              suppression_secs, webhook_url, enabled)
             VALUES ($1, $2, $3, $4, $5, 1800, $6, $7)",
        )
        .bind(tenant_id)
        .bind(ipset_name)
        .bind(window_secs)
        .bind(threshold)
        .bind(ttl_secs)
        .bind(format!("https://hooks.example.com/{tenant_id}"))
        .bind(enabled)
        .execute(pool)
        .await?;
    }

    println!("[done] Created 3 sample tenants (globex-prod disabled)");
    Ok(())
}

/// Run a sample delivery through the full pipeline so a fresh environment
/// has classified events, an escalated campaign, and a block to look at.
async fn seed_sample_delivery(pool: &PgPool) -> anyhow::Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(pool)
        .await?;

    if count > 0 {
        println!("[skip] Events already exist ({count})");
        return Ok(());
    }

    let fixture_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/waf_delivery_sample.json");

    if !fixture_path.exists() {
        println!("[skip] Fixture file not found at {}", fixture_path.display());
        return Ok(());
    }

    let data = std::fs::read(&fixture_path)?;

    let config = wafsentry::config::AppConfig::from_env()?;
    let state = wafsentry::AppState {
        db: pool.clone(),
        config,
        ipset: wafsentry::services::ipset::IpSetBackend::Memory(
            wafsentry::services::ipset::MemoryIpSet::new(),
        ),
        http: reqwest::Client::new(),
    };

    let summary =
        wafsentry::services::pipeline::process_delivery(&state, "acme-prod", &data).await?;

    println!(
        "[done] Processed sample delivery: {} records, {} persisted, {} escalations, {} blocks",
        summary.total_records, summary.persisted, summary.escalations, summary.blocks_applied
    );

    Ok(())
}
