//! Diagnostic: dump a single materialized recovery-anchor manifest by id,
//! or the latest-ready one if no id is given. Grounded on the teacher's
//! `tools/diagnostics/inspect_leveldb.rs` (single-record inspection tool).

use clap::Parser;
use rocksdb::{Options, DB};

use ubt_consumer::kv::{decode_manifest, recovery_anchor_manifest_key, CF_ANCHORS, CF_META, RECOVERY_ANCHOR_LATEST_READY_KEY};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    datadir: std::path::PathBuf,

    #[arg(long)]
    anchor_id: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let meta_dir = args.datadir.join("meta");

    let opts = Options::default();
    let db = DB::open_cf_for_read_only(&opts, &meta_dir, [CF_META, CF_ANCHORS], false)?;
    let cf_meta = db.cf_handle(CF_META).ok_or("meta cf missing")?;
    let cf_anchors = db.cf_handle(CF_ANCHORS).ok_or("anchors cf missing")?;

    let anchor_id = match args.anchor_id {
        Some(id) => id,
        None => match db.get_cf(&cf_meta, RECOVERY_ANCHOR_LATEST_READY_KEY)? {
            Some(bytes) => ubt_consumer::kv::decode_u64(&bytes),
            None => {
                println!("no materialized recovery anchor has ever been marked ready");
                return Ok(());
            }
        },
    };

    match db.get_cf(&cf_anchors, recovery_anchor_manifest_key(anchor_id))? {
        Some(bytes) => {
            let manifest = decode_manifest(&bytes)?;
            println!("anchorId:     {}", manifest.anchor_id);
            println!("seq:          {}", manifest.seq);
            println!("blockNumber:  {}", manifest.block_number);
            println!("blockRoot:    0x{}", hex::encode(manifest.block_root));
            println!("createdAt:    {}", manifest.created_at);
            println!("formatVersion:{}", manifest.format_version);
            println!("state:        {:?}", manifest.state);
        }
        None => println!("no manifest found for anchor id {anchor_id}"),
    }

    Ok(())
}
