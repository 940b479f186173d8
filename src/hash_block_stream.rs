//! Hash-verified block framing used by the KDBX3 payload.
//!
//! Each block on the wire is `{u32le index, 32 byte SHA-256, u32le size,
//! data}`; a block with size 0 and an all-zero hash terminates the stream.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::BlockStreamError;
use crate::io::SliceReader;

/// Default block size when writing, 1 MiB
const BLOCK_SIZE: usize = 1024 * 1024;

/// Read a hash block stream into a raw buffer, verifying every block hash
pub(crate) fn read_hash_block_stream(data: &[u8]) -> Result<Vec<u8>, BlockStreamError> {
    let mut reader = SliceReader::new(data, "hash block stream");
    let mut out = Vec::new();

    loop {
        let block_index = u64::from(reader.read_u32().map_err(|_| BlockStreamError::Truncated)?);
        let hash = reader.read_bytes(32).map_err(|_| BlockStreamError::Truncated)?;
        let size = reader.read_u32().map_err(|_| BlockStreamError::Truncated)? as usize;

        if size == 0 {
            break;
        }

        let block = reader
            .read_bytes(size)
            .map_err(|_| BlockStreamError::Truncated)?;

        if hash != crate::crypt::calculate_sha256(&[block]).as_slice() {
            return Err(BlockStreamError::BlockHashMismatch { block_index });
        }

        out.extend_from_slice(block);
    }

    Ok(out)
}

/// Write a raw buffer as a hash block stream
pub(crate) fn write_hash_block_stream(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();

    let mut index_buf = [0u8; 4];
    let mut size_buf = [0u8; 4];

    for (block_index, block) in data.chunks(BLOCK_SIZE).enumerate() {
        LittleEndian::write_u32(&mut index_buf, block_index as u32);
        LittleEndian::write_u32(&mut size_buf, block.len() as u32);

        out.extend_from_slice(&index_buf);
        out.extend_from_slice(&crate::crypt::calculate_sha256(&[block]));
        out.extend_from_slice(&size_buf);
        out.extend_from_slice(block);
    }

    // terminator: next index, zero hash, zero size
    let terminator_index = data.len().div_ceil(BLOCK_SIZE) as u32;
    LittleEndian::write_u32(&mut index_buf, terminator_index);
    out.extend_from_slice(&index_buf);
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&[0u8; 4]);

    out
}
