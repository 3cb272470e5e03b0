use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use sender_ratelimit::config::{LoggingConfig, ThrottleConfig};
use sender_ratelimit::installer::LimiterInstaller;
use sender_ratelimit::ratelimit::{
    Interrupt, RateLimiter, RateLimiterBackend, RulesFile, SleepWaiter, SystemClock,
};
use sender_ratelimit::sender::{HttpSender, Initiator};

/// Dry-run outbound request throttling against a rules file.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Service configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rules file, overriding the configured path
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Component the requests are attributed to
    #[arg(short, long, default_value = "manual_request")]
    initiator: Initiator,

    /// Print the entries snapshot as JSON
    #[arg(long)]
    json: bool,

    /// Request URLs, throttled in order
    urls: Vec<Url>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ThrottleConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Starting sender rate limiter dry run");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules_path = args
        .rules
        .or(config.rate_limiting.rules_path.clone())
        .context("No rules file given; use --rules or rate_limiting.rules_path")?;
    let rules = RulesFile::from_file(&rules_path)?;

    let interrupt = Interrupt::new();
    let limiter = Arc::new(RateLimiter::with_time(
        Arc::new(SystemClock),
        Arc::new(SleepWaiter::with_interrupt(&interrupt)),
    ));
    let sender = Arc::new(HttpSender::new());
    let installer = Arc::new(LimiterInstaller::new(Arc::clone(&sender), Arc::clone(&limiter)));

    for error in installer.apply(&rules.rules) {
        warn!(error = %error, "Rejected rate limit rule");
    }
    info!(
        rules = limiter.rules().len(),
        active = installer.installed().is_active(),
        "Rules loaded"
    );

    let reload = config
        .rate_limiting
        .reload_interval()
        .map(|interval| Arc::clone(&installer).spawn_reload(rules_path.clone(), interval));

    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            interrupt.trigger();
        });
    }

    for url in &args.urls {
        let started = Instant::now();
        match sender.before_send(url, args.initiator).await {
            Ok(()) => info!(
                url = %url,
                held_ms = started.elapsed().as_millis() as u64,
                "Request released"
            ),
            Err(e) => {
                warn!(url = %url, error = %e, "Request aborted");
                break;
            }
        }
    }

    if let Some(reload) = reload {
        reload.abort();
    }

    let entries = limiter.entries();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!("{}", entry);
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, interrupting pending waits");
        }
        _ = terminate => {
            info!("Received SIGTERM, interrupting pending waits");
        }
    }
}
