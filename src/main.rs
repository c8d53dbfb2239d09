use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use maildrop::config::{self, SmtpConfig, WatchConfig};
use maildrop::mailer::{Mailer, SmtpMailer};
use maildrop::pipeline::DispatchPipeline;
use maildrop::watcher::DirectoryWatcher;

#[derive(Parser, Debug)]
#[command(name = "maildrop")]
#[command(version, about = "Send an email for every <address>.SendMail file dropped into a directory", long_about = None)]
struct Cli {
    /// Directory to watch (overrides WATCH_DIR)
    watch_dir: Option<PathBuf>,

    /// Env file to load (default: SendMail.env next to the binary, then ./SendMail.env)
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Env file first so it can carry RUST_LOG and LOG_DIR
    let env_file = config::load_env_file(cli.env_file.as_deref());

    let _log_guard = init_tracing();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    info!("Starting maildrop v{}", env!("CARGO_PKG_VERSION"));
    match env_file {
        Ok(Some(path)) => info!(path = %path.display(), "Loaded env file"),
        Ok(None) => warn!("No {} found, using process environment", config::ENV_FILE_NAME),
        Err(e) => return Err(e).context("loading env file"),
    }

    let smtp = SmtpConfig::from_env().context("reading SMTP configuration")?;
    info!(server = %smtp.host, port = smtp.port, user = %smtp.username, "Loaded SMTP configuration");

    let mut watch = WatchConfig::from_env().context("reading watch configuration")?;
    if let Some(dir) = cli.watch_dir {
        watch.watch_dir = dir;
    }

    let (watcher, changes) = DirectoryWatcher::start(&watch.watch_dir)
        .with_context(|| format!("watching {}", watch.watch_dir.display()))?;

    let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer::new(smtp));
    let pipeline = DispatchPipeline::new(watch, mailer);
    info!(dir = %pipeline.watch_dir().display(), "Watching for *.SendMail files");

    tokio::select! {
        _ = pipeline.run(changes) => {
            warn!("Dispatch pipeline stopped");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    drop(watcher);
    Ok(())
}

/// Console logging, plus a daily rolling file when `LOG_DIR` is set.
///
/// The returned guard must stay alive for the file writer to flush.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "maildrop.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
