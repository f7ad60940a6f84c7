//! Apply pending migrations to the configured database and exit.

use std::path::Path;

use tracing::info;

use taskmill::config::Settings;
use taskmill::{logging, storage, Result};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::load()?;
    logging::init(&settings.log_level);

    let pool = storage::open_pool(&settings.db_path).await?;
    let applied = storage::apply_migrations(&pool, Path::new("migrations")).await?;
    pool.close().await;

    info!(db_path = %settings.db_path.display(), applied, "database initialized");
    Ok(())
}
