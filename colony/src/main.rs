mod config;

use clap::Parser;
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use location::{FileRuleSource, LocationTable, Mode, RuleSource};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "colony", version, about = "Multi-tenant relay in front of Swift clusters")]
enum CliCommand {
    /// Run the dispatcher and its admin listener
    Dispatcher {
        #[arg(long)]
        config_file: PathBuf,
    },
    /// Validate a relay rule file and list the locations it defines
    CheckRules {
        #[arg(long)]
        relay_rule: PathBuf,
        #[arg(long, default_value_t = ':')]
        separator: char,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config file has no {0} section")]
    MissingSection(&'static str),
    #[error("invalid log level: {0}")]
    LogLevel(String),
    #[error("cannot set up statsd: {0}")]
    Metrics(String),
    #[error("cannot start the runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Dispatcher(#[from] dispatcher::DispatcherError),
    #[error(transparent)]
    Rules(#[from] location::LocationError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Dispatcher { config_file } => run_dispatcher(&config_file),
        CliCommand::CheckRules {
            relay_rule,
            separator,
        } => check_rules(&relay_rule, separator),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Exiting");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_dispatcher(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    let _sentry = init_logging(config.common.logging.as_ref())?;
    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }
    let dispatcher_config = config
        .dispatcher
        .ok_or(CliError::MissingSection("dispatcher"))?;

    tracing::info!(config = %path.display(), "Starting dispatcher");
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatcher::run(dispatcher_config))?;
    Ok(())
}

/// Installs the fmt subscriber, plus the sentry layer when a DSN is configured.
/// The returned guard flushes sentry events on drop.
fn init_logging(
    logging: Option<&LoggingConfig>,
) -> Result<Option<sentry::ClientInitGuard>, CliError> {
    let level = logging.map_or("info", |l| l.level.as_str());
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| CliError::LogLevel(e.to_string()))?,
    };

    let guard = logging
        .and_then(|l| l.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();
    Ok(guard)
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some("colony"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    Ok(())
}

fn check_rules(path: &Path, separator: char) -> Result<(), CliError> {
    let rules = FileRuleSource::new(path).load()?;
    let table = LocationTable::build(rules, separator)?;

    println!("{}: {} location(s)", path.display(), table.len());
    for location in table.locations() {
        let mode = match location.mode() {
            Mode::Normal => "normal",
            Mode::Merged => "merged",
        };
        println!("  {} ({mode})", location.prefix());
        for (servers, prefix) in location.clusters().iter().zip(location.container_prefixes()) {
            let servers: Vec<&str> = servers.iter().map(|s| s.as_str()).collect();
            match prefix {
                Some(prefix) => println!("    [{prefix}] {}", servers.join(", ")),
                None => println!("    {}", servers.join(", ")),
            }
        }
    }
    Ok(())
}
