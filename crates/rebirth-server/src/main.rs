use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use rebirth::config::Settings;
use rebirth_server::routes;
use rebirth_server::state::AppState;

#[derive(Parser)]
#[command(author, version, about = "Rebirth narrative game backend", long_about = None)]
struct Cli {
    /// Override the bind host from settings.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port from settings.
    #[arg(long)]
    port: Option<u16>,

    /// Directory for rolling log files (stdout only when unset).
    #[arg(long)]
    log_dir: Option<std::path::PathBuf>,
}

fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rebirth=debug,rebirth_server=debug"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rebirth-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let mut settings = Settings::from_env();
    if let Some(host) = cli.host {
        settings.bind_host = host;
    }
    if let Some(port) = cli.port {
        settings.bind_port = port;
    }

    let bind_addr = format!("{}:{}", settings.bind_host, settings.bind_port);
    let state = AppState::from_settings(settings).await?;
    let app = routes::configure(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "rebirth server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
