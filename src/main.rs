use scalegate::config::Config;
use scalegate::proxy::Proxy;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scalegate=debug".parse().expect("valid log directive")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path, error = %e, "Failed to parse config file");
                e
            })?;
            info!(path = %path, "Configuration loaded");
            config
        }
        None => Config::from_defaults(),
    };

    let proxy = Proxy::new(config).await?;

    // SIGTERM is the forceful path: kill side-cars and the server, then
    // leave immediately.
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let proxy = proxy.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            warn!("Killing...");
            proxy.kill().await;
            warn!("Killed");
            std::process::exit(0);
        });
    }

    let runner = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.start().await })
    };

    tokio::signal::ctrl_c().await?;
    warn!("Shutting down...");
    proxy.stop().await;
    let _ = runner.await;
    debug!("Stopped");

    Ok(())
}
