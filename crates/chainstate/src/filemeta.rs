use utxod_primitives::encoding::{Decoder, Encoder};

/// Summary of one `blkNNNNN.dat` file, kept so pruning can pick whole files
/// without reading them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    pub size: u64,
    pub height_first: i32,
    pub height_last: i32,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: i32, record_len: u64) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || height > self.height_last {
            self.height_last = height;
        }
        self.blocks += 1;
        self.size += record_len;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(20);
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let blocks = decoder.read_u32_le().ok()?;
        let size = decoder.read_u64_le().ok()?;
        let height_first = decoder.read_i32_le().ok()?;
        let height_last = decoder.read_i32_le().ok()?;
        if !decoder.is_empty() {
            return None;
        }
        Some(Self {
            blocks,
            size,
            height_first,
            height_last,
        })
    }
}

pub fn block_file_key(file_id: u32) -> [u8; 4] {
    file_id.to_be_bytes()
}

pub fn parse_block_file_key(key: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(key.try_into().ok()?))
}
