use std::time::Duration;

use anyhow::Context;
use sparring::{auth::Identity, config::Config, store::Store, AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SESSION_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("applying schema")?;

    let stale = store.sweep_stale_searches().await.context("sweeping stale searches")?;
    if stale.rooms > 0 || stale.judges > 0 {
        info!(rooms = stale.rooms, judges = stale.judges, "dropped searches left by the last run");
    }

    if let Some(path) = &config.questions_file {
        let titles = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        store.seed_questions(titles.lines()).await?;
    }

    let state = AppState::new(
        store,
        Identity::new(&config.jwt_secret),
        config.turns,
        config.group_capacity,
    );
    let sessions = state.sessions.clone();
    let app = sparring::router(state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    if tokio::time::timeout(SESSION_DRAIN, sessions.shutdown()).await.is_err() {
        warn!(sessions = sessions.live(), "sessions still open after {SESSION_DRAIN:?}");
    }
    Ok(())
}

async fn shutdown() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
