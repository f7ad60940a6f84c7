use std::path::Path;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use taskmill::config::Settings;
use taskmill::scheduler::{Scheduler, SchedulerConfig};
use taskmill::storage::{self, TaskRepo};
use taskmill::submit::SubmitService;
use taskmill::web::{self, AppState};
use taskmill::{logging, Result};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::load()?;
    logging::init(&settings.log_level);

    let pool = storage::open_pool(&settings.db_path).await?;
    let applied = storage::apply_migrations(&pool, Path::new("migrations")).await?;
    info!(db_path = %settings.db_path.display(), applied, "store ready");

    let repo = TaskRepo::new(pool.clone());
    let submit = SubmitService::new(pool.clone(), settings.max_attempts);

    let mut scheduler = Scheduler::new(repo.clone(), SchedulerConfig::from_settings(&settings));
    scheduler.start().await;

    let app = web::router(AppState { repo, submit });
    let listener = TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    info!(host = %settings.host, port = settings.port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop(Duration::from_secs(5)).await;
    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
