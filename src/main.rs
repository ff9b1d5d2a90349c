use std::process::ExitCode;

use parcel_optimizer::api;
use parcel_optimizer::config::AppConfig;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // .env may set RUST_LOG, so load it before the subscriber
    let dotenv = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = dotenv {
        let missing = matches!(
            err,
            dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound
        );
        if !missing {
            warn!("Could not load .env: {}", err);
        }
    }

    let app_config = AppConfig::from_env();
    let api_config = app_config.api.clone();
    let settings = app_config.optimizer.clone();

    let tariff = match app_config.tariff.load() {
        Ok(rates) => rates,
        Err(err) => {
            error!(%err, "could not load tariff");
            return ExitCode::FAILURE;
        }
    };
    // fail fast instead of rejecting every request later
    if let Err(err) = tariff.table(settings.optimizer_config().max_parcel_mass) {
        error!(%err, "invalid tariff");
        return ExitCode::FAILURE;
    }

    info!("Parcel optimizer service starting...");
    match api::start_api_server(api_config, settings, tariff).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "API server terminated with an error");
            ExitCode::FAILURE
        }
    }
}
