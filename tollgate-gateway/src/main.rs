//! Token-gated LLM reverse proxy: binary entrypoint. Mirrors
//! `syncserver/src/main.rs`'s docopt-and-go shape.
#[macro_use]
extern crate slog_scope;

use std::error::Error;

use docopt::Docopt;
use serde::Deserialize;
use tollgate_gateway::logging::init_logging;
use tollgate_gateway::server;
use tollgate_settings::Settings;

const USAGE: &str = "
Usage: tollgate-gateway [options]

Options:
    -h, --help          Show this message.
    --config=CONFIGFILE Gateway configuration file path.
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
    init_logging(!settings.human_logs).expect("logging failed to initialize");
    debug!("starting up");

    let logger = slog_scope::logger();
    let (http_server, handles) = server::build_and_run(settings, logger).await?;

    info!("gateway running");
    http_server.await?;
    info!("listener closed, draining background components");
    handles.shutdown().await;

    tollgate_gateway::logging::reset_logging();
    Ok(())
}
