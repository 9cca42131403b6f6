use std::path::PathBuf;
use std::sync::Arc;

use docsync_host::config::Config;
use docsync_host::{ws, AuthorityRegistry, Router};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("docsync-host - collaborative document authority");
    println!();
    println!("USAGE:");
    println!("    docsync-host [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config FILE  Config file to load");
    println!("    -b, --bind ADDR    Address to listen on");
    println!("    -p, --port PORT    Port to listen on");
    println!("    -h, --help         Print help information");
    println!("    -v, --version      Print version");
    println!();
    println!("CONFIG:");
    println!("    ~/.config/docsync/config.toml");
    println!();
    println!("LOGGING:");
    println!("    RUST_LOG=docsync_host=debug docsync-host");
}

/// Command line overrides
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<Args>> {
    let mut parsed = Args::default();
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--version" | "-v", _) => {
                println!("docsync-host {VERSION}");
                return Ok(None);
            }
            ("--help" | "-h", _) => {
                print_help();
                return Ok(None);
            }
            ("--config" | "-c", Some(path)) => parsed.config = Some(PathBuf::from(path)),
            ("--bind" | "-b", Some(bind)) => parsed.bind = Some(bind.clone()),
            ("--port" | "-p", Some(port)) => parsed.port = Some(port.parse()?),
            (other, _) => anyhow::bail!("unexpected argument: {other}"),
        }
        i += 2;
    }
    Ok(Some(parsed))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let raw: Vec<String> = std::env::args().collect();
    let Some(args) = parse_args(&raw)? else {
        return Ok(());
    };

    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => {
            let path = Config::default_config_path();
            if let Err(e) = Config::create_default_if_missing(&path) {
                eprintln!("  \x1b[1;33m[warn]\x1b[0m   {e}");
            }
            Config::load()?
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    eprintln!(
        "  \x1b[1;32m[config]\x1b[0m Loaded from {}",
        args.config
            .unwrap_or_else(Config::default_config_path)
            .display()
    );

    let shutdown = CancellationToken::new();
    let registry = AuthorityRegistry::shared(config.authority.clone());
    let sweeper = registry.spawn_sweeper(shutdown.clone());
    let router = Arc::new(Router::new(registry.clone()));

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;
    eprintln!(
        "  \x1b[1;32m[ws]\x1b[0m     Listening on \x1b[1;96mws://{}\x1b[0m",
        listener.local_addr()?
    );
    match config.authority.idle_timeout() {
        Some(idle) => eprintln!(
            "  \x1b[1;32m[docs]\x1b[0m   Idle documents compacted after {}s",
            idle.as_secs()
        ),
        None => eprintln!("  \x1b[1;32m[docs]\x1b[0m   Idle compaction disabled"),
    }
    eprintln!();
    eprintln!("  \x1b[2mPress Ctrl+C to stop\x1b[0m");
    eprintln!();

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                        tracing::error!(error = %e, "Failed to listen for SIGTERM");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                () = ctrl_c => {},
                () = terminate => {},
            }
            eprintln!();
            eprintln!("  \x1b[1;33m[stop]\x1b[0m   Graceful shutdown initiated...");
            shutdown.cancel();
        }
    };
    tokio::spawn(shutdown_signal);

    ws::serve(listener, router, config.connection.clone(), shutdown.clone()).await?;

    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    eprintln!(
        "  \x1b[1;32m[done]\x1b[0m   {} documents open at shutdown",
        registry.len().await
    );
    Ok(())
}
