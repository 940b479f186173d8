#![doc = include_str!("../README.md")]
#![recursion_limit = "1024"]

mod cancel;
mod compression;
pub mod config;
pub(crate) mod crypt;
pub mod db;
pub mod error;
pub(crate) mod format;
pub(crate) mod hash_block_stream;
pub(crate) mod hmac_block_stream;
pub mod ident;
mod io;
pub mod key;
pub mod placeholder;
pub mod query;
pub mod variant_dictionary;
pub mod xml_db;

pub use self::cancel::CancelToken;
pub use self::config::DatabaseConfig;
pub use self::db::*;
pub use self::key::DatabaseKey;

// see https://keepass.info/help/kb/kdbx_4.html for file format details
