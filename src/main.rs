use std::process::ExitCode;

use clap::Parser;
use geoblock_proxy::config::AppConfig;
use geoblock_proxy::controller::Controller;
use log::{error, info};

const DEFAULT_CONFIG_PATH: &str = "geoblock-proxy.yml";

#[derive(Parser, Debug)]
#[command(name = "geoblock-proxy", version, about)]
struct Opts {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "GEOBLOCK_PROXY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init();

    let opts = Opts::parse();
    info!("loading configuration from {}", opts.config);

    let config = match AppConfig::load(&opts.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The `logger` key overrides whatever level RUST_LOG selected; absent it,
    // the environment variable alone governs verbosity.
    if let Some(level) = config.logger.as_deref() {
        match level.parse() {
            Ok(level) => log::set_max_level(level),
            Err(_) => error!("ignoring invalid logger level {level:?} in configuration"),
        }
    }

    let controller = match Controller::build(&config).await {
        Ok(controller) => controller,
        Err(e) => {
            error!("could not start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let controller = std::sync::Arc::new(controller);
    let running = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run().await })
    };

    let result = tokio::select! {
        result = running => result.unwrap_or_else(|e| {
            Err(std::io::Error::other(format!("proxy task panicked: {e}")))
        }),
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, closing");
            controller.close();
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("proxy fleet stopped: {e}");
        return ExitCode::FAILURE;
    }

    info!("closing");
    ExitCode::SUCCESS
}
