#[macro_use]
extern crate lazy_static;

mod config;
mod crypt;
mod error;
mod http;
mod messages;
mod metrics;
mod mumble;
mod peer;
mod proto;
mod registry;
mod supervisor;
mod sync;
mod time;
mod varint;
mod voice;
mod ws;

use std::sync::Arc;

use config::{GatewayConfig, Whitelist};

#[actix_web_codegen::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = GatewayConfig::from_env();

    let whitelist = match Whitelist::load(&config.servers_config_path) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(
                path = %config.servers_config_path.display(),
                "failed to load server whitelist: {e}"
            );
            return;
        }
    };

    tracing::info!(servers = whitelist.servers.len(), "loaded server whitelist");

    if let Err(e) = http::run(Arc::new(whitelist), config).await {
        tracing::error!("gateway http server error: {e}");
    }
}
