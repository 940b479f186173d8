//! HMAC-verified block framing used by the KDBX4 payload.
//!
//! Each block on the wire is `{32 byte HMAC-SHA-256, u32le size, data}`. The
//! HMAC key for block `i` is `SHA-512(u64le(i) ∥ H)` where `H` is derived
//! from the master seed and the transformed key; the key for index
//! `u64::MAX` authenticates the outer header.

use byteorder::{ByteOrder, LittleEndian};
use cipher::generic_array::{typenum::U64, GenericArray};
use hex_literal::hex;

use crate::error::{BlockStreamError, CryptographyError};
use crate::io::SliceReader;

/// Trailing byte of the HMAC base key derivation
pub const HMAC_KEY_END: [u8; 1] = hex!("01");

/// Default block size when writing, 1 MiB
const BLOCK_SIZE: usize = 1024 * 1024;

/// Read from a HMAC block stream into a raw buffer
pub(crate) fn read_hmac_block_stream(
    data: &[u8],
    key: &GenericArray<u8, U64>,
) -> Result<Vec<u8>, BlockStreamError> {
    let mut reader = SliceReader::new(data, "hmac block stream");
    let mut out = Vec::new();

    let mut block_index: u64 = 0;

    loop {
        let hmac = reader.read_bytes(32).map_err(|_| BlockStreamError::Truncated)?;
        let size_bytes = reader.read_bytes(4).map_err(|_| BlockStreamError::Truncated)?;
        let size = LittleEndian::read_u32(size_bytes) as usize;
        let block = reader
            .read_bytes(size)
            .map_err(|_| BlockStreamError::Truncated)?;

        let hmac_block_key = get_hmac_block_key(block_index, key)?;
        let mut block_index_buf = [0u8; 8];
        LittleEndian::write_u64(&mut block_index_buf, block_index);

        if hmac
            != crate::crypt::calculate_hmac(&[&block_index_buf, size_bytes, block], &hmac_block_key)?
                .as_slice()
        {
            return Err(BlockStreamError::BlockHmacMismatch { block_index });
        }

        // a zero-size block with a valid HMAC terminates the stream
        if size == 0 {
            break;
        }

        out.extend_from_slice(block);
        block_index += 1;
    }

    Ok(out)
}

/// Write a raw buffer as a HMAC block stream
pub(crate) fn write_hmac_block_stream(
    data: &[u8],
    key: &GenericArray<u8, U64>,
) -> Result<Vec<u8>, CryptographyError> {
    let mut out = Vec::new();

    let mut write_block = |block_index: u64, block: &[u8]| -> Result<(), CryptographyError> {
        let mut size_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut size_bytes, block.len() as u32);

        let hmac_block_key = get_hmac_block_key(block_index, key)?;
        let mut block_index_buf = [0u8; 8];
        LittleEndian::write_u64(&mut block_index_buf, block_index);

        let hmac = crate::crypt::calculate_hmac(&[&block_index_buf, &size_bytes, block], &hmac_block_key)?;

        out.extend_from_slice(&hmac);
        out.extend_from_slice(&size_bytes);
        out.extend_from_slice(block);

        Ok(())
    };

    let mut block_index: u64 = 0;
    for block in data.chunks(BLOCK_SIZE) {
        write_block(block_index, block)?;
        block_index += 1;
    }

    // the end of the HMAC block stream is an empty block with a valid HMAC
    write_block(block_index, &[])?;

    Ok(out)
}

pub(crate) fn get_hmac_block_key(
    block_index: u64,
    key: &GenericArray<u8, U64>,
) -> Result<GenericArray<u8, U64>, CryptographyError> {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, block_index);
    Ok(crate::crypt::calculate_sha512(&[&buf, key]))
}
