use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use shipwatch_server::config::Config;
use shipwatch_server::db::Database;
use shipwatch_server::github::GitHubClient;
use shipwatch_server::notify::HttpEventPublisher;
use shipwatch_server::secrets::SecretCipher;
use shipwatch_server::{webhook, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting shipwatch deployment tracker");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let db_path = config.state_dir.join("shipwatch.db");
    info!("Using state database: {}", db_path.display());
    let db = Database::new(&db_path).expect("Failed to initialize SQLite database");

    let github_client = GitHubClient::new(config.github_app_id, config.github_private_key);
    let publisher = HttpEventPublisher::new(config.events_gateway_url, config.events_gateway_token);

    let state = AppState {
        db: Arc::new(db),
        comparer: Arc::new(github_client),
        publisher: Arc::new(publisher),
        cipher: SecretCipher::new(&config.secrets_key),
    };

    let app = webhook::router(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
