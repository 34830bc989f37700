use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use longshot_poll::Mutator;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tower_longshot::AppState;
use tower_longshot::Config;
use tower_longshot::Limiters;
use tower_longshot::router;
use tracing_subscriber::EnvFilter;

/// Long polling and rate limiting over HTTP.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(short, long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }

    let token = CancellationToken::new();
    spawn_signal_handlers(token.clone());

    let state = AppState::from_config(&config);
    let limiters = Limiters::from_config(&config)?;

    let max_step = config.long_poll.max_score_step;
    let mutator = Mutator::spawn_with_token(
        state.events.clone(),
        config.long_poll.mutator(),
        move |score| score + rand::rng().random_range(1..=max_step),
        token.child_token(),
    );

    let janitor = (config.server.idle_eviction_secs > 0).then(|| {
        spawn_janitor(
            limiters.clone(),
            Duration::from_secs(config.server.idle_eviction_secs),
            token.child_token(),
        )
    });

    let app = router(state, &limiters);
    let listener = tokio::net::TcpListener::bind(config.server.addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let shutdown = token.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    token.cancel();
    mutator.shutdown().await;
    if let Some(janitor) = janitor {
        if let Err(err) = janitor.await {
            tracing::error!(%err, "janitor task failed");
        }
    }
    tracing::info!("shut down");
    Ok(())
}

fn spawn_signal_handlers(token: CancellationToken) {
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_ok() {
                    match hits.fetch_add(1, Ordering::Relaxed) {
                        0 => {
                            tracing::info!("Ctrl+C, shutting down (press again to force)");
                            token.cancel();
                        }
                        _ => {
                            tracing::warn!("forced exit");
                            std::process::exit(130);
                        }
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        tokio::spawn(async move {
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                tracing::info!("SIGTERM, shutting down");
                token.cancel();
            }
        });
    }
}

/// Periodically drops rate limit state for clients that went quiet.
fn spawn_janitor(
    limiters: Limiters,
    idle: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(idle);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticks.tick() => {
                    let evicted = limiters.evict_idle(idle);
                    if evicted > 0 {
                        tracing::debug!(evicted, "idle clients evicted");
                    }
                }
            }
        }
    })
}
