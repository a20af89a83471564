//! `ubt-consumer` entry point. Grounded on the teacher's `main.rs`: parse
//! config, open RocksDB (here, two separate handles -- `meta`/`trie` --
//! rather than the teacher's single handle, per spec §5's split-store
//! design), spawn the service's background tasks, host an axum web server,
//! and wait on whichever task exits first.

use std::sync::Arc;

use clap::Parser;
use tower_http::cors::{Any, CorsLayer};

use ubt_consumer::config::{init_global_config, AppConfig, Cli};
use ubt_consumer::consumer::Consumer;
use ubt_consumer::genesis::run_backfill_direct;
use ubt_consumer::kv::open_db;
use ubt_consumer::metrics::{gather_text, register_all};
use ubt_consumer::outbox::OutboxReader;
use ubt_consumer::query::{router as query_router, QueryState};
use ubt_consumer::recovery::run_startup_recovery;
use ubt_consumer::runner::{Runner, RunnerConfig};
use ubt_consumer::telemetry::{init_tracing, TelemetryConfig};
use ubt_consumer::trie_impl::open_trie_db;
use ubt_consumer::types::{BootstrapMode, ConsumerCheckpoint};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config: AppConfig = cli.into();
    config.validate()?;

    init_tracing(TelemetryConfig::default())?;
    register_all();
    init_global_config(config.clone())?;

    let meta_dir = config.datadir.join("meta");
    let trie_dir = config.datadir.join("trie");
    let anchors_dir = config.datadir.join("anchors");
    std::fs::create_dir_all(&meta_dir)?;
    std::fs::create_dir_all(&trie_dir)?;
    std::fs::create_dir_all(&anchors_dir)?;

    let meta_db = Arc::new(open_db(&meta_dir)?);

    let (checkpoint, checkpoint_fresh) = read_checkpoint(&meta_db)?;

    let (checkpoint, fresh, trie_db) = match open_trie_db(&trie_dir) {
        Ok(db) => (checkpoint, checkpoint_fresh, Arc::new(db)),
        Err(error) => {
            tracing::warn!(%error, "trie db unopenable at startup, running recovery ladder");
            let outcome = run_startup_recovery(meta_db.clone(), &trie_dir, &anchors_dir, checkpoint, config.recovery_strict)?;
            let reopened = open_trie_db(&trie_dir)?;
            (outcome.checkpoint, outcome.fresh, Arc::new(reopened))
        }
    };

    let checkpoint = if fresh && config.bootstrap_mode == BootstrapMode::BackfillDirect {
        tracing::info!("bootstrap-mode=backfill-direct: running genesis import before tail consumption");
        let outbox = OutboxReader::new(
            config.outbox_rpc_endpoint.clone(),
            std::time::Duration::from_millis(config.rpc_timeout_ms),
            std::time::Duration::from_millis(config.reconnect_delay_ms),
        );
        run_backfill_direct(meta_db.clone(), trie_db.clone(), &outbox, &config).await?
    } else {
        checkpoint
    };

    let consumer = Consumer::new(meta_db.clone(), trie_db, trie_dir.clone(), anchors_dir.clone(), config.clone(), checkpoint, fresh)?;

    let runner_config = RunnerConfig {
        compaction_interval: std::time::Duration::from_secs(config.compaction_interval_secs),
        compaction_safety_margin: config.compaction_safety_margin,
        triedb_state_history: config.triedb_state_history,
        lag_refresh_interval: std::time::Duration::from_secs(30),
    };
    let runner = Runner::new(consumer, runner_config);
    let consumer_handle = runner.consumer_handle();
    let cancel = runner.cancellation_token();
    let (consume_handle, maintenance_handle) = runner.spawn();

    let web_handle = if config.query_rpc_enabled {
        Some(tokio::spawn(serve_query_api(consumer_handle.clone(), config.query_rpc_listen_addr.clone(), cancel.clone())))
    } else {
        None
    };

    let mut consume_handle = consume_handle;
    let mut maintenance_handle = maintenance_handle;
    tokio::select! {
        result = &mut consume_handle => {
            cancel.cancel();
            let _ = maintenance_handle.await;
            result??;
        }
        _ = &mut maintenance_handle => {
            cancel.cancel();
            let _ = consume_handle.await;
        }
    }

    if let Some(handle) = web_handle {
        let _ = handle.await;
    }

    // Per spec §5's shutdown sequence, reclaim sole ownership of the
    // consumer now that every task sharing the `Arc<Mutex<_>>` has exited,
    // and run its close path (final commit if safe, journal trie).
    match Arc::try_unwrap(consumer_handle) {
        Ok(mutex) => {
            if let Err(error) = mutex.into_inner().close().await {
                tracing::error!(%error, "error closing consumer at shutdown");
            }
        }
        Err(_) => tracing::warn!("consumer still shared at shutdown, skipping explicit close"),
    }

    Ok(())
}

async fn serve_query_api(consumer: Arc<tokio::sync::Mutex<Consumer>>, listen_addr: String, cancel: tokio_util::sync::CancellationToken) {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let state = QueryState { consumer };
    let app = query_router(state).route("/metrics", axum::routing::get(metrics_handler)).layer(cors);

    let addr: std::net::SocketAddr = match listen_addr.parse() {
        Ok(addr) => addr,
        Err(error) => {
            tracing::error!(%error, listen_addr, "invalid query-rpc-listen-addr");
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, %addr, "failed to bind query rpc listener");
            return;
        }
    };
    tracing::info!(%addr, "query rpc listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(async move { cancel.cancelled().await });
    if let Err(error) = server.await {
        tracing::error!(%error, "query rpc server exited with error");
    }
}

async fn metrics_handler() -> String {
    gather_text().unwrap_or_else(|error| format!("error gathering metrics: {error}"))
}

/// Reads the persisted checkpoint, if any. `fresh` mirrors spec §4.3's
/// "no checkpoint yet" sentinel: true only when nothing has ever been
/// committed, distinct from a checkpoint that happens to be at seq 0.
fn read_checkpoint(meta_db: &rocksdb::DB) -> Result<(ConsumerCheckpoint, bool), Box<dyn std::error::Error>> {
    let cf = meta_db.cf_handle(ubt_consumer::kv::CF_META).ok_or("meta column family missing")?;
    match meta_db.get_cf(&cf, ubt_consumer::kv::CONSUMER_STATE_KEY)? {
        Some(bytes) => Ok((ubt_consumer::kv::decode_checkpoint(&bytes)?, false)),
        None => Ok((ConsumerCheckpoint::fresh(), true)),
    }
}

