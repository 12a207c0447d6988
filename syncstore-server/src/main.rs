//! Sync Storage Server
#[macro_use]
extern crate slog_scope;

use std::error::Error;

use docopt::Docopt;
use serde::Deserialize;

use syncstore_server::logging::init_logging;
use syncstore_server::{logging, server};
use syncstore_settings::Settings;

const USAGE: &str = "
Usage: syncstore-server [options]

Options:
    -h, --help               Show this message.
    --config=CONFIGFILE      Syncstore configuration file path.
";

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: Option<String>,
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let settings = Settings::with_env_and_config_file(args.flag_config.as_deref())?;
    init_logging(!settings.human_logs).expect("Logging failed to initialize");
    debug!("Starting up...");

    let banner = settings.banner();
    let server = server::Server::with_settings(settings).await?;
    info!("Server running on {}", banner);
    server.await?;
    info!("Server closing");
    logging::reset_logging();

    Ok(())
}
