use anyhow::Context;
use dotenvy::dotenv;
use lectern::config::settings::AppConfig;
use lectern::infrastructure::db::pool::{connect_to_db, run_migrations};
use lectern::infrastructure::db::video::PgVideoRepository;
use lectern::infrastructure::encoder::FfmpegEncoder;
use lectern::modules::video::repository::Repositories;
use lectern::state::AppState;
use lectern::workers::transcoder::start_transcoder_workers;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    info!("Starting server...");

    let config = AppConfig::new().context("DATABASE_URL and JWT_SECRET must be set")?;

    let pool = connect_to_db(&config.database_url).await?;
    run_migrations(&pool).await?;

    let repos = Repositories::from_shared(Arc::new(PgVideoRepository::new(pool)));
    let encoder = Arc::new(FfmpegEncoder::new(
        config.ffmpeg_path.clone(),
        config.ffprobe_path.clone(),
        config.encode_timeout(),
    ));

    tokio::fs::create_dir_all(&config.media_dir).await?;
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let (state, transcoder, receiver) = AppState::assemble(config.clone(), repos, encoder);

    let interrupted = transcoder.reconcile_interrupted().await?;
    if interrupted > 0 {
        info!("🧹 Marked {} interrupted job(s) as failed", interrupted);
    }
    start_transcoder_workers(transcoder, receiver, config.transcode_workers);

    let jobs = state.jobs.clone();
    let ttl = config.job_cache_ttl();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let pruned = jobs.prune_terminal(ttl);
            if pruned > 0 {
                debug!("Pruned {} finished job(s) from cache", pruned);
            }
        }
    });

    let app = lectern::app::create_app(state).await;

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
