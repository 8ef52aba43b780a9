//! `meshfs` node entry point.
//!
//! No CLI or embedded API surface here — that's explicitly out of scope for
//! this build. `main` wires the construction graph in the order the rest of
//! the crate expects: metadata store, task controller, network transport,
//! upload/download engines, pub/sub dispatcher, then parks the process so
//! the background workers (task controller, network actor) keep running.

use std::sync::Arc;

use meshfs::config::Config;
use meshfs::distribution::DistributionPlanner;
use meshfs::keys::OwnerKey;
use meshfs::metrics::TaskMetrics;
use meshfs::network_actor::NetworkHandle;
use meshfs::quorum::PeerRegistry;
use meshfs::store::Store;
use meshfs::task_controller::TaskController;
use meshfs::{dispatcher::PubSubDispatcher, download_engine::DownloadEngine, upload_engine::UploadEngine};

#[tokio::main]
async fn main() {
    meshfs::logging::init_logging_safe();

    if let Err(e) = run().await {
        tracing::error!("node exited with error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> meshfs::MeshResult<()> {
    let config = Arc::new(Config::load_or_default(None)?);

    let owner = Arc::new(OwnerKey::load_or_generate_default(&config.keys_dir())?);
    tracing::info!(
        pubkey_hash = %owner.info.pubkey_hash_hex,
        "owner identity ready"
    );

    let store = Arc::new(Store::open(&config.database_dir())?);

    let metrics = TaskMetrics::new();
    let controller = Arc::new(TaskController::start(
        config.task_controller.clone(),
        metrics,
    ));

    let network = NetworkHandle::new(&config).await?;
    let host_id = hex::encode(meshfs::crypto::ecdsa::pubkey_hash(owner.pair.public_key()));

    let dispatcher = Arc::new(PubSubDispatcher::new(
        store.clone(),
        config.clone(),
        network.clone(),
        host_id.clone(),
    ));
    network
        .set_engine(dispatcher.clone() as Arc<dyn meshfs::network_actor::EngineHandle>)
        .await;

    for topic in [
        meshfs::pubsub::set_shared_topic(),
        meshfs::pubsub::search_request_topic(),
        meshfs::pubsub::search_response_topic(),
    ] {
        network.subscribe(&topic).await?;
    }

    let peers = PeerRegistry::new();
    let planner = DistributionPlanner::new();

    let upload_engine = UploadEngine::new(
        store.clone(),
        config.clone(),
        controller.clone(),
        network.clone(),
        planner,
        peers.clone(),
        owner.clone(),
    );
    let download_engine = DownloadEngine::new(
        store.clone(),
        config.clone(),
        controller.clone(),
        network.clone(),
        dispatcher.clone(),
        peers.clone(),
        owner.clone(),
    );

    let _ = (&upload_engine, &download_engine);

    tracing::info!(
        peer_id = %network.local_peer_id(),
        port = config.network.default_port,
        "meshfs node started"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| meshfs::MeshError::Generic(format!("failed to listen for shutdown signal: {e}")))?;
    tracing::info!("shutdown signal received");

    controller.shutdown().await?;
    network.shutdown()?;

    Ok(())
}
