//! Diagnostic: print the persisted `ConsumerCheckpoint` and recovery-anchor
//! manifest count. Grounded on the teacher's `tools/diagnostics/check_db.rs`
//! (read-only RocksDB open, plain `println!` report).

use clap::Parser;
use rocksdb::{Options, DB};

use ubt_consumer::kv::{decode_checkpoint, CF_ANCHORS, CF_META, CONSUMER_STATE_KEY, RECOVERY_ANCHOR_COUNT_KEY};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    datadir: std::path::PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let meta_dir = args.datadir.join("meta");

    let opts = Options::default();
    let db = DB::open_cf_for_read_only(&opts, &meta_dir, [CF_META, CF_ANCHORS], false)?;
    let cf_meta = db.cf_handle(CF_META).ok_or("meta cf missing")?;

    println!("=== CONSUMER CHECKPOINT ===");
    match db.get_cf(&cf_meta, CONSUMER_STATE_KEY)? {
        Some(bytes) => {
            let checkpoint = decode_checkpoint(&bytes)?;
            println!("appliedSeq:    {}", checkpoint.applied_seq);
            println!("appliedBlock:  {}", checkpoint.applied_block);
            println!("appliedRoot:   0x{}", hex::encode(checkpoint.applied_root));
            println!("pendingSeq:    {}", checkpoint.pending_seq);
            println!("pendingStatus: {:?}", checkpoint.pending_status);
        }
        None => println!("no checkpoint persisted yet (fresh datadir)"),
    }

    match db.get_cf(&cf_meta, RECOVERY_ANCHOR_COUNT_KEY)? {
        Some(bytes) => println!("recovery anchors: {}", ubt_consumer::kv::decode_u64(&bytes)),
        None => println!("recovery anchors: 0"),
    }

    Ok(())
}
