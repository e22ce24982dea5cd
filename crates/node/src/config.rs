//! Command-line flags layered over `utxod.conf`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use utxod_chainstate::ChainStateOptions;
use utxod_consensus::money::Amount;
use utxod_consensus::Network;
use utxod_log::{Format, Level, LogConfig};

use crate::policy::MempoolPolicy;
use crate::store::Backend;
use crate::sync::SyncConfig;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "utxod.conf";

pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log: LogConfig,
    pub mempool: MempoolPolicy,
    pub chain: ChainStateOptions,
    pub sync: SyncConfig,
    /// Bootstrap files imported before syncing, in order.
    pub load_blocks: Vec<PathBuf>,
}

impl Config {
    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

/// Flags that take a value, with the config file key each one overrides.
const VALUE_FLAGS: &[(&str, &str)] = &[
    ("--network", "network"),
    ("--backend", "backend"),
    ("--log-level", "loglevel"),
    ("--log-format", "logformat"),
    ("--log-file", "logfile"),
    ("--maxmempool", "maxmempool"),
    ("--minrelaytxfee", "minrelaytxfee"),
    ("--incrementalrelayfee", "incrementalrelayfee"),
    ("--maxorphantx", "maxorphantx"),
    ("--maxorphanblocks", "maxorphanblocks"),
    ("--reorg-step-blocks", "reorgstepblocks"),
    ("--prune", "prune"),
    ("--par", "par"),
    ("--block-timeout-secs", "blocktimeout"),
    ("--blocks-in-flight", "blocksinflight"),
    ("--loadblock", "loadblock"),
    ("--checkblocks", "checkblocks"),
];

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut cli: HashMap<String, Vec<String>> = HashMap::new();
    let mut args = raw_args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = Some(PathBuf::from(value));
            }
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                conf_path = Some(PathBuf::from(value));
            }
            "--no-log-timestamps" => {
                cli.entry("logtimestamps".to_string())
                    .or_default()
                    .push("0".to_string());
            }
            "--acceptnonstdtxn" => {
                cli.entry("acceptnonstdtxn".to_string())
                    .or_default()
                    .push("1".to_string());
            }
            flag => {
                let Some((_, key)) = VALUE_FLAGS.iter().find(|(name, _)| *name == flag) else {
                    return Err(format!("unknown argument '{flag}'\n{}", usage()));
                };
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))?;
                cli.entry(key.to_string()).or_default().push(value);
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf = match &conf_path {
        Some(path) => load_conf(path)?
            .ok_or_else(|| format!("config file {} not found", path.display()))?,
        None => load_conf(&data_dir.join(CONF_FILE_NAME))?.unwrap_or_default(),
    };
    let conf_path = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let settings = Settings {
        cli,
        conf,
        conf_path: &conf_path,
    };

    let network = match settings.value("network") {
        Some(raw) => parse_network(&raw).ok_or_else(|| {
            format!("invalid network '{raw}' (expected mainnet|testnet|regtest)\n{}", usage())
        })?,
        None if settings.flag("regtest")?.unwrap_or(false) => Network::Regtest,
        None if settings.flag("testnet")?.unwrap_or(false) => Network::Testnet,
        None => Network::Mainnet,
    };
    let backend = match settings.value("backend") {
        Some(raw) => Backend::parse(&raw)
            .ok_or_else(|| format!("invalid backend '{raw}' (expected memory|fjall)\n{}", usage()))?,
        None => Backend::Fjall,
    };

    let mut log = LogConfig::default();
    if let Some(raw) = settings.value("loglevel") {
        log.level = Level::parse(&raw).ok_or_else(|| format!("invalid log level '{raw}'"))?;
    }
    if let Some(raw) = settings.value("logformat") {
        log.format = Format::parse(&raw).ok_or_else(|| format!("invalid log format '{raw}'"))?;
    }
    if let Some(timestamps) = settings.flag("logtimestamps")? {
        log.timestamps = timestamps;
    }
    log.file = settings.value("logfile").map(PathBuf::from);

    let mut mempool = MempoolPolicy::for_network(network);
    if let Some(mib) = settings.number::<usize>("maxmempool")? {
        mempool.max_bytes = mib.saturating_mul(1024 * 1024);
    }
    if let Some(rate) = settings.fee_rate("minrelaytxfee")? {
        mempool.min_relay_fee_per_kb = rate;
    }
    if let Some(rate) = settings.fee_rate("incrementalrelayfee")? {
        mempool.incremental_relay_fee_per_kb = rate;
    }
    if let Some(accept) = settings.flag("acceptnonstdtxn")? {
        mempool.require_standard = !accept;
    }
    if let Some(max) = settings.number::<usize>("maxorphantx")? {
        mempool.max_orphans = max;
    }

    let mut chain = ChainStateOptions::default();
    if let Some(step) = settings.number::<usize>("reorgstepblocks")? {
        if step == 0 {
            return Err("reorgstepblocks must be at least 1".to_string());
        }
        chain.reorg_step_blocks = step;
    }
    if let Some(depth) = settings.number::<u32>("prune")? {
        chain.prune_depth = depth;
    }
    if let Some(threads) = settings.number::<usize>("par")? {
        chain.script_threads = threads;
    }
    if let Some(count) = settings.number::<u32>("checkblocks")? {
        chain.check_blocks = count;
    }

    let mut sync = SyncConfig::default();
    if let Some(max) = settings.number::<usize>("maxorphanblocks")? {
        sync.max_orphan_blocks = max;
    }
    if let Some(secs) = settings.number::<u64>("blocktimeout")? {
        sync.block_timeout_secs = secs.max(1);
    }
    if let Some(count) = settings.number::<usize>("blocksinflight")? {
        sync.blocks_in_flight = count.max(1);
    }

    let load_blocks = settings
        .all("loadblock")
        .into_iter()
        .map(PathBuf::from)
        .collect();

    Ok(CliAction::Run(Config {
        backend,
        data_dir,
        conf_path,
        network,
        log,
        mempool,
        chain,
        sync,
        load_blocks,
    }))
}

/// Command-line values first, then the config file.
struct Settings<'a> {
    cli: HashMap<String, Vec<String>>,
    conf: HashMap<String, Vec<String>>,
    conf_path: &'a Path,
}

impl Settings<'_> {
    fn value(&self, key: &str) -> Option<String> {
        self.cli
            .get(key)
            .or_else(|| self.conf.get(key))
            .and_then(|values| values.last())
            .cloned()
    }

    /// Repeatable keys accumulate, file entries before command-line ones.
    fn all(&self, key: &str) -> Vec<String> {
        let mut values = self.conf.get(key).cloned().unwrap_or_default();
        values.extend(self.cli.get(key).cloned().unwrap_or_default());
        values
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, String> {
        match self.value(key) {
            Some(raw) => parse_conf_bool(&raw)
                .map(Some)
                .ok_or_else(|| self.invalid(key, &raw)),
            None => Ok(None),
        }
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        match self.value(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| self.invalid(key, &raw)),
            None => Ok(None),
        }
    }

    fn fee_rate(&self, key: &str) -> Result<Option<Amount>, String> {
        match self.number::<Amount>(key)? {
            Some(rate) if rate < 0 => Err(self.invalid(key, &rate.to_string())),
            other => Ok(other),
        }
    }

    fn invalid(&self, key: &str, raw: &str) -> String {
        format!(
            "invalid {key} value '{raw}' (from the command line or {})",
            self.conf_path.display()
        )
    }
}

fn parse_network(value: &str) -> Option<Network> {
    match value.trim().to_ascii_lowercase().as_str() {
        "mainnet" | "main" => Some(Network::Mainnet),
        "testnet" | "test" => Some(Network::Testnet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

/// Reads `key=value` lines; `None` when the file does not exist.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  utxod [options]",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --data-dir <dir>  Base data directory (default: ./data)",
        "  --conf <file>  Config file path (default: <data-dir>/utxod.conf)",
        "  --network <name>  mainnet|testnet|regtest (default: mainnet)",
        "  --backend <name>  Storage backend, memory|fjall (default: fjall)",
        "  --log-level <level>  error|warn|info|debug|trace (default: info)",
        "  --log-format <format>  text|json (default: text)",
        "  --no-log-timestamps  Omit timestamps from text logs",
        "  --log-file <file>  Also append log lines to this file",
        "  --maxmempool <MiB>  Mempool size budget (default: 300)",
        "  --minrelaytxfee <sat/kvB>  Minimum relay fee rate (default: 1000)",
        "  --incrementalrelayfee <sat/kvB>  Extra fee rate for replacements and a full pool (default: 1000)",
        "  --acceptnonstdtxn  Relay non-standard transactions",
        "  --maxorphantx <n>  Orphan transactions kept (default: 100)",
        "  --maxorphanblocks <n>  Orphan blocks kept (default: 64)",
        "  --reorg-step-blocks <n>  Blocks disconnected plus connected per activation step (default: 64)",
        "  --prune <depth>  Delete block files buried deeper than this; 0 keeps all (default: 0)",
        "  --par <n>  Script verification threads; 0 uses all cores (default: 0)",
        "  --block-timeout-secs <secs>  Block request timeout before requeue (default: 60)",
        "  --blocks-in-flight <n>  Outstanding block requests per peer (default: 16)",
        "  --loadblock <file>  Import blocks from a bootstrap file on startup (repeatable)",
        "  --checkblocks <n>  Recent blocks verified on startup (default: 6)",
        "",
        "Every option except --data-dir and --conf can also be set in utxod.conf",
        "as key=value, using the option name without dashes (block-timeout-secs",
        "is blocktimeout, blocks-in-flight is blocksinflight, log-level is",
        "loglevel). regtest=1 and testnet=1 select a network.",
    ]
    .join("\n")
}
