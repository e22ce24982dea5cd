//! Bootstrap import of `magic || len || block` record files.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use utxod_consensus::constants::MAX_BLOCK_SERIALIZED_SIZE;
use utxod_primitives::block::Block;

use crate::node::NodeError;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImportStats {
    pub blocks: usize,
    /// Records that could not be decoded.
    pub corrupt: usize,
    /// Bytes skipped while searching for the next magic.
    pub skipped_bytes: u64,
}

/// Streams every block record in `path` to `submit`, resynchronizing on the
/// network magic after garbage or a damaged record.
pub fn import_block_file<F>(path: &Path, magic: [u8; 4], mut submit: F) -> Result<ImportStats, NodeError>
where
    F: FnMut(Block) -> Result<(), NodeError>,
{
    let mut reader = BufReader::new(File::open(path)?);
    let mut stats = ImportStats::default();
    loop {
        if !seek_magic(&mut reader, magic, &mut stats)? {
            break;
        }
        let mut len = [0u8; 4];
        if !read_full(&mut reader, &mut len)? {
            break;
        }
        let len = u32::from_le_bytes(len);
        if len < 80 || len > MAX_BLOCK_SERIALIZED_SIZE {
            stats.corrupt += 1;
            continue;
        }
        let mut payload = vec![0u8; len as usize];
        if !read_full(&mut reader, &mut payload)? {
            utxod_log::log_warn!("{}: truncated block record at end of file", path.display());
            stats.corrupt += 1;
            break;
        }
        match Block::consensus_decode(&payload) {
            Ok(block) => {
                submit(block)?;
                stats.blocks += 1;
            }
            Err(err) => {
                utxod_log::log_warn!("{}: undecodable block record: {err:?}", path.display());
                stats.corrupt += 1;
            }
        }
    }
    utxod_log::log_info!(
        "imported {} blocks from {} ({} corrupt records, {} bytes skipped)",
        stats.blocks,
        path.display(),
        stats.corrupt,
        stats.skipped_bytes
    );
    Ok(stats)
}

/// Consumes bytes up to and including the next `magic`. Returns false at EOF.
fn seek_magic<R: Read>(reader: &mut R, magic: [u8; 4], stats: &mut ImportStats) -> Result<bool, NodeError> {
    let mut window = [0u8; 4];
    let mut filled = 0usize;
    let mut byte = [0u8; 1];
    loop {
        if !read_full(reader, &mut byte)? {
            stats.skipped_bytes += filled as u64;
            return Ok(false);
        }
        if filled < 4 {
            window[filled] = byte[0];
            filled += 1;
        } else {
            window.rotate_left(1);
            window[3] = byte[0];
            stats.skipped_bytes += 1;
        }
        if filled == 4 && window == magic {
            return Ok(true);
        }
    }
}

/// Fills `buf` completely; false when the stream ends first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, NodeError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}
