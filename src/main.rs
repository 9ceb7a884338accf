use tracing_subscriber::EnvFilter;

use wa_relay::Config;

const DEFAULT_LOG_FILTER: &str = "wa_relay=info,warn";

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(2);
        }
    };

    if let Err(err) = wa_relay::run(config).await {
        tracing::error!(error = %err, "server stopped");
        std::process::exit(1);
    }
}
