//! Append-only block body files: `blkNNNNN.dat`, each record `magic || len || bytes`.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use utxod_log::{log_debug, log_warn};

pub const DEFAULT_MAX_BLOCKFILE_SIZE: u64 = 128 * 1024 * 1024;
const RECORD_HEADER_LEN: u64 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    /// Offset of the record header, not of the payload.
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }

    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_LEN + self.len as u64
    }
}

#[derive(Debug)]
pub enum BlockStoreError {
    Io(std::io::Error),
    InvalidLocation,
    BadMagic,
    LengthMismatch,
}

impl std::fmt::Display for BlockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStoreError::Io(err) => write!(f, "{err}"),
            BlockStoreError::InvalidLocation => write!(f, "invalid block file location"),
            BlockStoreError::BadMagic => write!(f, "block record has wrong network magic"),
            BlockStoreError::LengthMismatch => write!(f, "block record length mismatch"),
        }
    }
}

impl std::error::Error for BlockStoreError {}

impl From<std::io::Error> for BlockStoreError {
    fn from(err: std::io::Error) -> Self {
        BlockStoreError::Io(err)
    }
}

#[derive(Clone, Debug)]
pub struct BlockStoreOptions {
    pub dir: PathBuf,
    pub magic: [u8; 4],
    pub max_file_size: u64,
}

impl BlockStoreOptions {
    pub fn new(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Self {
        Self {
            dir: dir.into(),
            magic,
            max_file_size: DEFAULT_MAX_BLOCKFILE_SIZE,
        }
    }
}

pub struct BlockStore {
    dir: PathBuf,
    magic: [u8; 4],
    max_file_size: u64,
    state: Mutex<BlockStoreState>,
}

#[derive(Debug)]
struct BlockStoreState {
    current_file: u32,
    current_len: u64,
    unsynced: bool,
}

impl BlockStore {
    pub fn open(options: BlockStoreOptions) -> Result<Self, BlockStoreError> {
        std::fs::create_dir_all(&options.dir)?;
        let (current_file, current_len) =
            locate_active_file(&options.dir, options.magic, options.max_file_size)?;
        log_debug!(
            "block store opened at {} (file {current_file}, {current_len} bytes)",
            options.dir.display()
        );
        Ok(Self {
            dir: options.dir,
            magic: options.magic,
            max_file_size: options.max_file_size,
            state: Mutex::new(BlockStoreState {
                current_file,
                current_len,
                unsynced: false,
            }),
        })
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, BlockStoreError> {
        let len = u32::try_from(bytes.len()).map_err(|_| BlockStoreError::LengthMismatch)?;
        let mut state = self.state.lock().expect("block store lock");
        let needed = RECORD_HEADER_LEN + bytes.len() as u64;
        if state.current_len > 0 && state.current_len + needed > self.max_file_size {
            self.sync_locked(&mut state)?;
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut record = Vec::with_capacity(needed as usize);
        record.extend_from_slice(&self.magic);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(bytes);
        file.write_all(&record)?;
        file.flush()?;
        state.current_len += needed;
        state.unsynced = true;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, BlockStoreError> {
        if location.len == 0 {
            return Err(BlockStoreError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(BlockStoreError::BadMagic);
        }
        let stored_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if stored_len != location.len {
            return Err(BlockStoreError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Forces appended records to disk. Index entries pointing at a record
    /// must not be committed before this returns.
    pub fn sync(&self) -> Result<(), BlockStoreError> {
        let mut state = self.state.lock().expect("block store lock");
        self.sync_locked(&mut state)
    }

    pub fn remove_file(&self, file_id: u32) -> Result<(), BlockStoreError> {
        let state = self.state.lock().expect("block store lock");
        if file_id >= state.current_file {
            return Err(BlockStoreError::InvalidLocation);
        }
        match std::fs::remove_file(self.file_path(file_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn current_file(&self) -> u32 {
        self.state.lock().expect("block store lock").current_file
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sync_locked(&self, state: &mut BlockStoreState) -> Result<(), BlockStoreError> {
        if !state.unsynced {
            return Ok(());
        }
        let path = self.file_path(state.current_file);
        File::open(&path)?.sync_data()?;
        state.unsynced = false;
        Ok(())
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        block_file_path(&self.dir, file_id)
    }
}

fn block_file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("blk{file_id:05}.dat"))
}

fn parse_block_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("blk")?.strip_suffix(".dat")?;
    if digits.len() < 5 || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Finds the newest file and cuts off a partially written trailing record.
/// Pruned files leave gaps, so the directory is listed rather than probed.
fn locate_active_file(
    dir: &Path,
    magic: [u8; 4],
    max_file_size: u64,
) -> Result<(u32, u64), BlockStoreError> {
    let mut last: Option<u32> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(file_id) = entry.file_name().to_str().and_then(parse_block_file_name) else {
            continue;
        };
        last = Some(last.map_or(file_id, |current| current.max(file_id)));
    }
    let Some(file_id) = last else {
        return Ok((0, 0));
    };

    let path = block_file_path(dir, file_id);
    let valid_len = scan_complete_records(&path, magic)?;
    let actual_len = std::fs::metadata(&path)?.len();
    if valid_len < actual_len {
        log_warn!(
            "truncating {} from {actual_len} to {valid_len} bytes after incomplete write",
            path.display()
        );
        OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_len(valid_len)?;
    }
    if valid_len >= max_file_size {
        Ok((file_id + 1, 0))
    } else {
        Ok((file_id, valid_len))
    }
}

fn scan_complete_records(path: &Path, magic: [u8; 4]) -> Result<u64, BlockStoreError> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut offset = 0u64;
    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    while offset + RECORD_HEADER_LEN <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut header)?;
        if header[0..4] != magic {
            break;
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let end = offset + RECORD_HEADER_LEN + len;
        if end > file_len {
            break;
        }
        offset = end;
    }
    Ok(offset)
}
