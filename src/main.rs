//! ssfront - CLI entry point

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use ssfront::{Core, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ssfront")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Multi-password Shadowsocks front-end relay")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        .event_interval(61)
        .global_queue_interval(31)
        .thread_name("ssfront-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ssfront=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("ssfront v{}", VERSION);
    info!(config = %args.config.display(), "loading configuration");

    if args.test {
        match ssfront::Config::load(&args.config) {
            Ok(_) => {
                info!("configuration test passed");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "configuration test failed");
                std::process::exit(1);
            }
        }
    }

    let core = match Core::start(args.config).await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to start core");
            std::process::exit(1);
        }
    };

    spawn_sighup_handler(core.clone());

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    Ok(())
}

#[cfg(unix)]
fn spawn_sighup_handler(core: Arc<Core>) {
    tokio::spawn(async move {
        let mut stream = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to register SIGHUP handler");
                return;
            }
        };
        loop {
            stream.recv().await;
            info!("SIGHUP received, reloading configuration");
            if let Err(e) = core.reload().await {
                error!(error = %e, "reload failed");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_sighup_handler(_core: Arc<Core>) {}
