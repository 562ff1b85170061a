mod dispatch;
mod maintenance;
mod problem;
mod ratelimit;
mod router;
mod telemetry;
mod webhook;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tracing::info;

use golive_discord::DiscordClient;
use golive_storage::Database;
use golive_twitch::{HelixClient, TwitchOAuthClient};
use golive_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let helix = HelixClient::new(
        config.twitch_client_id.clone(),
        config.twitch_helix_url.clone(),
        http.clone(),
    );
    let oauth = TwitchOAuthClient::new(
        config.twitch_client_id.clone(),
        config.twitch_client_secret.clone(),
        config.twitch_oauth_url.clone(),
        http.clone(),
    );
    let discord = DiscordClient::new(
        config.discord_bot_token.clone(),
        config.discord_api_url.clone(),
        http,
    );

    let secret: Arc<[u8]> =
        Arc::from(config.eventsub_secret.clone().into_bytes().into_boxed_slice());
    let state = router::AppState::new(
        metrics,
        database,
        secret,
        helix,
        oauth,
        discord,
        config.rate_limits,
        Duration::from_secs(config.delivery_timeout_secs),
    );

    let clock: dispatch::Clock = Arc::new(chrono::Utc::now);
    maintenance::SweepWorker::new(state.replay_guard(), state.limits(), clock).spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
