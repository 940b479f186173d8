mod dump;
mod parse;

pub(crate) use dump::dump_kdbx3;
pub(crate) use parse::{decrypt_kdbx3, parse_kdbx3};

use crate::config::{CompressionConfig, InnerCipherConfig, OuterCipherConfig};

/// Header entry denoting the end of the header
pub const HEADER_END: u8 = 0;
/// Header entry denoting a comment
pub const HEADER_COMMENT: u8 = 1;
/// A UUID specifying which cipher suite should be used to encrypt the payload
pub const HEADER_OUTER_ENCRYPTION_ID: u8 = 2;
/// First byte determines compression of payload
pub const HEADER_COMPRESSION_ID: u8 = 3;
/// Master seed for deriving the master key
pub const HEADER_MASTER_SEED: u8 = 4;
/// Seed of the AES key transformation
pub const HEADER_TRANSFORM_SEED: u8 = 5;
/// Round count of the AES key transformation
pub const HEADER_TRANSFORM_ROUNDS: u8 = 6;
/// Initialization Vector for decrypting the payload
pub const HEADER_ENCRYPTION_IV: u8 = 7;
/// Key for the inner stream cipher protecting values in the body
pub const HEADER_PROTECTED_STREAM_KEY: u8 = 8;
/// First bytes of the decrypted payload, to detect a wrong key
pub const HEADER_STREAM_START_BYTES: u8 = 9;
/// ID of the inner stream cipher
pub const HEADER_INNER_RANDOM_STREAM_ID: u8 = 10;

/// Length of the plaintext verification prefix
pub const STREAM_START_BYTES_SIZE: usize = 32;

pub(crate) struct Kdbx3OuterHeader {
    pub(crate) version: crate::format::DatabaseVersion,
    pub(crate) outer_cipher_config: OuterCipherConfig,
    pub(crate) compression_config: CompressionConfig,
    pub(crate) master_seed: Vec<u8>,
    pub(crate) transform_seed: Vec<u8>,
    pub(crate) transform_rounds: u64,
    pub(crate) outer_iv: Vec<u8>,
    pub(crate) protected_stream_key: Vec<u8>,
    pub(crate) stream_start: Vec<u8>,
    pub(crate) inner_cipher_config: InnerCipherConfig,
    pub(crate) unknown_fields: Vec<crate::config::RawHeaderField>,
}
