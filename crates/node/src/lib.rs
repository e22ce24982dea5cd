pub mod config;
pub mod import;
pub mod interface;
pub mod mempool;
pub mod node;
pub mod orphans;
pub mod policy;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod writer;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use utxod_chainstate::{BlockStore, BlockStoreOptions, ChainState};
use utxod_consensus::{chain_params, consensus_params};
use utxod_log::{log_info, log_warn};
use utxod_primitives::hash256_to_hex;
use utxod_storage::KeyValueStore;

pub use config::{parse_args, parse_args_from, usage, CliAction, Config};
pub use interface::{NullTransport, PeerId, Severity, Transport};
pub use mempool::{Mempool, MempoolAcceptance, MempoolEntry, MempoolError, MempoolErrorKind};
pub use node::{Node, NodeError};
pub use policy::MempoolPolicy;
pub use sync::SyncConfig;

const TICK_INTERVAL_SECS: u64 = 1;
const STATUS_INTERVAL_SECS: u64 = 60;
/// Writer backlog above which bootstrap import pauses.
const IMPORT_QUEUE_LIMIT: usize = 256;

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("utxod {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    let db_dir = config.db_dir();
    let blocks_dir = config.blocks_dir();
    let Config {
        backend,
        data_dir,
        conf_path,
        network,
        log,
        mempool: mempool_policy,
        chain: chain_options,
        sync: sync_config,
        load_blocks,
    } = config;

    utxod_log::init(log).map_err(|err| format!("failed to open log file: {err}"))?;
    fs::create_dir_all(&data_dir)
        .map_err(|err| format!("failed to create data dir {}: {err}", data_dir.display()))?;
    let _lock = store::lock_data_dir(&data_dir)?;

    log_info!(
        "Startup: network={:?} backend={:?} data_dir={} conf={}",
        network,
        backend,
        data_dir.display(),
        conf_path.display()
    );

    let magic = chain_params(network).message_start;
    let db = store::Store::open(backend, &db_dir)
        .map_err(|err| format!("failed to open database: {err}"))?;
    let blocks = BlockStore::open(BlockStoreOptions::new(blocks_dir, magic))
        .map_err(|err| format!("failed to open block files: {err}"))?;
    let chain = ChainState::open(Arc::new(db), blocks, consensus_params(network), chain_options)
        .map_err(|err| format!("failed to open chain state: {err}"))?;
    let tip = chain.tip();
    log_info!(
        "Chain tip {} at height {}",
        hash256_to_hex(&tip.hash),
        tip.height
    );

    let node = Arc::new(Node::new(
        Arc::new(chain),
        mempool_policy,
        sync_config,
        Arc::new(NullTransport),
    ));
    node.start().map_err(|err| err.to_string())?;

    if !load_blocks.is_empty() {
        let importer = Arc::clone(&node);
        tokio::task::spawn_blocking(move || import_files(&importer, &load_blocks, magic))
            .await
            .map_err(|err| format!("block import task failed: {err}"))?
            .map_err(|err| err.to_string())?;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
    let mut status = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    log_warn!("Failed to listen for Ctrl-C: {err}");
                }
                break;
            }
            _ = ticker.tick() => node.tick(mempool::now_secs()),
            _ = status.tick() => log_status(&node),
        }
        if node.chain().is_halted() {
            node.shutdown();
            return Err("chain state halted after a storage failure".to_string());
        }
    }

    log_info!("Shutdown requested");
    node.shutdown();
    log_status(&node);
    Ok(())
}

fn import_files<S: KeyValueStore + 'static>(
    node: &Node<S>,
    files: &[PathBuf],
    magic: [u8; 4],
) -> Result<(), NodeError> {
    for path in files {
        log_info!("Importing blocks from {}", path.display());
        import::import_block_file(path, magic, |block| {
            while node.queued_commands() > IMPORT_QUEUE_LIMIT {
                thread::sleep(Duration::from_millis(10));
            }
            node.submit_block(block)
        })?;
    }
    Ok(())
}

fn log_status<S: KeyValueStore + 'static>(node: &Node<S>) {
    let tip = node.get_chain_tip();
    let info = node.mempool_info();
    log_info!(
        "Status: height {} tip {} mempool {} txs {} bytes ({} orphans) peers {}",
        tip.height,
        hash256_to_hex(&tip.hash),
        info.size,
        info.bytes,
        info.orphans,
        node.sync().peer_count()
    );
}
