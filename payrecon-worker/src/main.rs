use anyhow::Context;
use payrecon_worker::{app, load_dotenv, LogFormat, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = load_dotenv();
    init_tracing(LogFormat::from_env());
    if let Err(error) = dotenv {
        warn!(error = %error, "[worker.config] ignoring unreadable .env file");
    }

    let settings = Settings::from_env().context("invalid configuration")?;
    info!(
        environment = %settings.environment,
        reconciliation = settings.paytr.is_some(),
        "[worker.start] configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                info!("[worker.shutdown] signal received; finishing in-flight work");
                signal_token.cancel();
            }
            Err(error) => error!(error = %error, "[worker.shutdown] cannot listen for signals"),
        }
    });

    app::run(settings, shutdown).await
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("payrecon=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
