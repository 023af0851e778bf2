//! Transport Supervisor - CLI Entry Point
//!
//! The same binary also runs the bundled transports: when the supervisor
//! launches it as a child, the namespaced `SERVICE` variable is set and
//! the process speaks the handshake on stdout instead.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transport_supervisor::server::{bundled_transports, is_service_process, run_service};
use transport_supervisor::service::DEFAULT_NAMESPACE;
use transport_supervisor::transport::NAMESPACE_FLAG;
use transport_supervisor::{Config, Supervisor, VERSION};

#[derive(Parser, Debug)]
#[command(name = "transport-supervisor")]
#[command(version = VERSION)]
#[command(about = "Keeps one circumvention transport connected")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Print the shareable encoding of every configured connection and exit
    #[arg(long = "encode")]
    encode: bool,
}

/// Namespace passed by a supervisor to a bundled transport
fn service_namespace() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == NAMESPACE_FLAG {
            if let Some(ns) = args.next() {
                return ns;
            }
        } else if let Some(ns) = arg.strip_prefix(&format!("{}=", NAMESPACE_FLAG)) {
            return ns.to_string();
        }
    }
    DEFAULT_NAMESPACE.to_string()
}

fn main() -> anyhow::Result<()> {
    let namespace = service_namespace();
    if is_service_process(&namespace) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("transport-worker")
            .build()?;
        return runtime.block_on(service_main(namespace));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("supervisor-worker")
        .build()?;

    runtime.block_on(async_main())
}

/// Running as a supervised transport: stdout is the handshake channel.
async fn service_main(namespace: String) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("transport_supervisor=info".parse()?))
        .init();

    let transports = bundled_transports();
    if let Err(e) = run_service(&namespace, &transports).await {
        error!("transport exited: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match Config::load_async(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("transport_supervisor={}", level).parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("Transport Supervisor v{}", VERSION);
    info!("Loaded configuration from: {}", args.config.display());

    if args.encode {
        for connection in &config.connections {
            println!("{}\t{}", connection.display_name(), connection.encode()?);
        }
        return Ok(());
    }

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let supervisor = match Supervisor::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize supervisor: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.run().await {
        error!("Supervisor error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
