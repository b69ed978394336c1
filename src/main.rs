use auth::config::GatewayConfig;
use proxy::{bg_services::AuthBackgroundService, proxy::EdgeProxy};
use slipper_gate::observability::init_tracing;
use std::sync::Arc;

use pingora::{prelude::background_service, proxy::http_proxy_service, server::Server};

fn main() {
    let config = match GatewayConfig::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("slipper-gate: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);
    if config.ephemeral_signing_key {
        tracing::warn!("no session signing key configured, sessions will not survive a restart");
    }

    let mut server = Server::new(None).expect("pingora server to initialize");
    server.bootstrap();

    let mut edge = http_proxy_service(&server.configuration, EdgeProxy::new(config.clone()));
    edge.add_tcp(&config.listen_addr);
    let auth = background_service("auth", AuthBackgroundService::new(config.clone()));

    tracing::info!(
        listen = %config.listen_addr,
        upstream = %config.upstream.host,
        "starting gateway"
    );
    server.add_service(edge);
    server.add_service(auth);
    server.run_forever();
}
