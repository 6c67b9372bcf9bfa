// Main entry point for the ride-hailing server

use anyhow::{Context, Result};
use chairway_server::{kernel::spawn_dispatcher, server::build_app, Config};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chairway_server=debug,sqlx=warn,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting Chairway server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let port = config.port;

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Build application (rebuilds the in-process tier from the database)
    let (router, kernel) = build_app(config, pool).await?;

    // Start the background dispatcher
    let _dispatcher = spawn_dispatcher(kernel);
    tracing::info!("Dispatcher started");

    // Start server
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router).await.context("Server error")?;

    Ok(())
}
