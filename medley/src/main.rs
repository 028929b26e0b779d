use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use medley::artifacts::ArtifactManager;
use medley::config::AppConfig;
use medley::database;
use medley::logging;
use medley::pipeline::{EngineSet, JobDispatcher, Orchestrator, SourceMaterializer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before anything reads them
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    // The guard must live until exit or buffered log lines are lost
    let _log_guard = logging::init_logging(&config.log_dir)?;
    let shutdown = CancellationToken::new();
    logging::start_retention_cleanup(config.log_dir.clone(), shutdown.clone());

    info!("medley starting");

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let client = engines::build_client(config.engines.connect_timeout)?;
    let engine_set = EngineSet {
        scene: Arc::new(engines::HttpSceneDetector::new(
            &config.engines.scene_url,
            client.clone(),
        )),
        separator: Arc::new(engines::HttpVocalSeparator::new(
            &config.engines.separator_url,
            client.clone(),
        )),
        transcriber: Arc::new(engines::HttpSpeechTranscriber::new(
            &config.engines.transcriber_url,
            client.clone(),
        )),
    };

    let repo = Arc::new(database::repositories::SqlxJobRepository::new(pool.clone()));
    let artifacts = ArtifactManager::new(config.data_dir.clone());
    let source = SourceMaterializer::new(
        client,
        artifacts.upload_root(),
        config.max_source_bytes,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        repo.clone(),
        artifacts,
        source,
        engine_set,
        config.pipeline.clone(),
    ));
    let dispatcher = Arc::new(JobDispatcher::new(
        repo,
        orchestrator,
        config.dispatcher.clone(),
    ));

    dispatcher.start().await;
    let recovered = dispatcher.recover().await?;
    info!(recovered, "medley ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    shutdown.cancel();
    dispatcher.stop().await;
    pool.close().await;
    info!("medley stopped");
    Ok(())
}
