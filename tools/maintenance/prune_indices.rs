//! Maintenance: manually prune per-block root/canonical index entries below
//! a given block number, for operators who want to reclaim space ahead of
//! the daemon's own maintenance-loop schedule (spec §4.5). Mirrors
//! `Consumer::prune_stale_indices_below`'s scan-and-batch-delete shape but
//! runs standalone against an already-stopped daemon's `meta` store,
//! grounded on the teacher's `tools/maintenance/rebuild_address_index.rs`
//! (direct read-write RocksDB maintenance pass).

use clap::Parser;
use rocksdb::{Options, DB};

use ubt_consumer::kv::{block_hash_to_number_key, canonical_block_key, decode_checkpoint, decode_u64, CF_BLOCKS, CF_META, CONSUMER_STATE_KEY};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    datadir: std::path::PathBuf,

    /// Block number below which index entries are dropped.
    #[arg(long)]
    floor_block: u64,

    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let meta_dir = args.datadir.join("meta");

    let opts = Options::default();
    let db = DB::open_cf(&opts, &meta_dir, [CF_META, CF_BLOCKS])?;
    let cf_meta = db.cf_handle(CF_META).ok_or("meta cf missing")?;
    let cf_blocks = db.cf_handle(CF_BLOCKS).ok_or("blocks cf missing")?;

    if let Some(bytes) = db.get_cf(&cf_meta, CONSUMER_STATE_KEY)? {
        let checkpoint = decode_checkpoint(&bytes)?;
        if args.floor_block > checkpoint.applied_block {
            return Err(format!("floor-block {} exceeds appliedBlock {}; refusing to prune the active tip", args.floor_block, checkpoint.applied_block).into());
        }
    }

    let prefix = b"UBTBlockRoot/";
    let iter = db.prefix_iterator_cf(&cf_blocks, prefix);
    let mut pruned = 0u64;
    for item in iter {
        let (key, _) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        let number = decode_u64(&key[prefix.len()..]);
        if number >= args.floor_block {
            continue;
        }

        if args.dry_run {
            pruned += 1;
            continue;
        }

        if let Some(canonical_bytes) = db.get_cf(&cf_blocks, canonical_block_key(number))? {
            if let Ok(canonical) = bincode::deserialize::<ubt_consumer::types::CanonicalBlock>(&canonical_bytes) {
                db.delete_cf(&cf_blocks, block_hash_to_number_key(&canonical.hash))?;
            }
        }
        db.delete_cf(&cf_blocks, &key)?;
        db.delete_cf(&cf_blocks, canonical_block_key(number))?;
        pruned += 1;
    }

    if args.dry_run {
        println!("would prune {pruned} block-root entries below block {}", args.floor_block);
    } else {
        println!("pruned {pruned} block-root entries below block {}", args.floor_block);
    }

    Ok(())
}
