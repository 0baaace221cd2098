/**
 * Coread Server Entry Point
 *
 * Main entry point for the coread sync server: initializes tracing, loads
 * configuration from the environment, and serves the Axum application.
 */

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config = coread::backend::server::ServerConfig::from_env();
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = coread::backend::server::create_app(config);

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
