pub mod body;
pub mod config;
mod copy;
pub mod errors;
pub mod merger;
pub mod metrics_defs;
pub mod orchestrator;
pub mod paths;
pub mod rewrite;
pub mod router;
#[cfg(test)]
pub mod testutils;
pub mod transport;

use location::LocationResolver;
use router::{Dispatcher, DispatcherService};
use shared::admin_service::{AdminService, Readiness};
use shared::http::run_http_service;
use shared::metrics_defs::describe_all;
use shared::tls::{TlsError, client_connector, server_acceptor};
use std::sync::Arc;
use transport::Transport;

#[derive(thiserror::Error, Debug)]
pub enum DispatcherError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("relay rule error: {0}")]
    Location(#[from] location::LocationError),
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),
    #[error("invalid configuration: {0}")]
    Validation(#[from] config::ValidationError),
}

/// Serves the dispatcher and its admin listener until either fails.
pub async fn run(config: config::Config) -> Result<(), DispatcherError> {
    config.validate()?;
    describe_all(metrics_defs::ALL_METRICS);
    describe_all(location::metrics_defs::ALL_METRICS);

    let resolver = Arc::new(LocationResolver::from_file(
        &config.relay_rule,
        config.separator(),
        config.min_reload_interval(),
    )?);

    let connector = config
        .backend_ca_file
        .as_deref()
        .map(client_connector)
        .transpose()?;
    let acceptor = config
        .tls
        .as_ref()
        .map(|tls| server_acceptor(&tls.cert_file, &tls.key_file))
        .transpose()?;

    let transport = Transport::from_config(&config, connector);
    let dispatcher = Arc::new(Dispatcher::new(&config, resolver.clone(), transport));

    let probe_resolver = resolver.clone();
    let admin = AdminService::new(move || {
        if probe_resolver.is_stale() {
            Readiness::NotReady("relay rule is invalid, serving the previous rules".to_string())
        } else {
            Readiness::Ready
        }
    });

    let dispatcher_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        DispatcherService::new(dispatcher),
        acceptor,
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin,
        None,
    );

    tokio::try_join!(dispatcher_task, admin_task)?;
    Ok(())
}
