#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use ssh_cli_server::server::{CliHandler, CliServer, ServerConfig};
use tracing::{info, warn};

mod demo;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("Starting CLI server on {}:{}", config.bind_address(), config.port());
    if config.noauth_enabled() {
        warn!("Unauthenticated logins are enabled (CLI_SERVER_NOAUTH)");
    }

    let server = CliServer::new(CliHandler::per_session::<demo::DemoCli>(), config);
    server.set_exception_handler(|e| warn!("CLI server fault: {}", e));

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, closing");
            stopper.close();
        }
    });

    // Serve in the foreground until closed from a session or by Ctrl-C
    server.run().await?;

    Ok(())
}
