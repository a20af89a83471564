//! Migration: operator-invoked wrapper around `genesis::run_backfill_direct`
//! for re-running the genesis import outside of `main.rs`'s automatic
//! fresh-datadir path -- for example, after discarding a corrupt datadir and
//! wanting a `backfill-direct` bootstrap without reaching for
//! `--bootstrap-mode` on the daemon itself. Refuses to run against a datadir
//! that already has a checkpoint, since the import is only meaningful once.
//! Grounded on the teacher's `tools/migration` one-shot schema-migration
//! binaries (direct library call, no daemon wiring).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use ubt_consumer::config::{AppConfig, Cli};
use ubt_consumer::genesis::run_backfill_direct;
use ubt_consumer::kv::{decode_checkpoint, open_db, CF_META, CONSUMER_STATE_KEY};
use ubt_consumer::outbox::OutboxReader;
use ubt_consumer::trie_impl::open_trie_db;

#[derive(Parser)]
struct Args {
    #[arg(long)]
    datadir: std::path::PathBuf,

    #[arg(long)]
    outbox_rpc_endpoint: String,

    #[arg(long, default_value_t = 10_000)]
    rpc_timeout_ms: u64,

    #[arg(long, default_value_t = 2_000)]
    reconnect_delay_ms: u64,

    /// Proceed even if a checkpoint already exists (overwrites block 0).
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let meta_dir = args.datadir.join("meta");
    let trie_dir = args.datadir.join("trie");
    std::fs::create_dir_all(&meta_dir)?;
    std::fs::create_dir_all(&trie_dir)?;

    let meta_db = Arc::new(open_db(&meta_dir)?);
    let trie_db = Arc::new(open_trie_db(&trie_dir)?);

    if !args.force {
        let cf_meta = meta_db.cf_handle(CF_META).ok_or("meta cf missing")?;
        if let Some(bytes) = meta_db.get_cf(&cf_meta, CONSUMER_STATE_KEY)? {
            let checkpoint = decode_checkpoint(&bytes)?;
            return Err(format!(
                "datadir already has a checkpoint at appliedBlock={}; pass --force to overwrite the genesis import",
                checkpoint.applied_block
            )
            .into());
        }
    }

    let outbox = OutboxReader::new(
        args.outbox_rpc_endpoint.clone(),
        Duration::from_millis(args.rpc_timeout_ms),
        Duration::from_millis(args.reconnect_delay_ms),
    );

    // `run_backfill_direct` doesn't read its `config` argument today, but
    // takes one for symmetry with the daemon's own call site in `main.rs`;
    // resolve a real one from the same flags rather than fabricating a
    // throwaway value.
    let cli = Cli::parse_from(["backfill-genesis", "--outbox-rpc-endpoint", &args.outbox_rpc_endpoint, "--datadir", &args.datadir.to_string_lossy()]);
    let config: AppConfig = cli.into();

    let checkpoint = run_backfill_direct(meta_db, trie_db, &outbox, &config).await?;

    println!("genesis import complete");
    println!("appliedBlock: {}", checkpoint.applied_block);
    println!("appliedRoot:  0x{}", hex::encode(checkpoint.applied_root));

    Ok(())
}
