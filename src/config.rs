//! Configuration options for how to compress and encrypt databases

use std::convert::TryFrom;

use hex_literal::hex;

pub use crate::format::DatabaseVersion;

use crate::{
    compression,
    crypt::{ciphers, ciphers::Cipher, kdf},
    error::{
        CompressionConfigError, CryptographyError, InnerCipherConfigError, KdfConfigError,
        OuterCipherConfigError,
    },
    format::KDBX4_CURRENT_MINOR_VERSION,
    variant_dictionary::VariantDictionary,
};

/// Environment variable with a comma-separated list of cipher/KDF names that
/// must not be used, e.g. `twofish,argon2d`
pub const BLACKLIST_ENV: &str = "KDBX_DB_BLACKLIST";

const CIPHERSUITE_AES128: [u8; 16] = hex!("61ab05a1946441c38d743a563df8dd35");
const CIPHERSUITE_AES256: [u8; 16] = hex!("31c1f2e6bf714350be5805216afc5aff");
const CIPHERSUITE_TWOFISH: [u8; 16] = hex!("ad68f29f576f4bb9a36ad47af965346c");
const CIPHERSUITE_SERPENT: [u8; 16] = hex!("098563ffddf74f9886198079f6db897a");
const CIPHERSUITE_CHACHA20: [u8; 16] = hex!("d6038a2b8b6f4cb5a524339a31dbb59a");
const CIPHERSUITE_SALSA20: [u8; 16] = hex!("716e1c8aee174bdc93aea977b882833a");

// Internal IDs for the inner stream ciphers
const PLAIN: u32 = 0;
const SALSA_20: u32 = 2;
const CHA_CHA_20: u32 = 3;

fn blacklisted(name: &'static str) -> bool {
    std::env::var(BLACKLIST_ENV)
        .map(|list| list.split(',').any(|item| item.trim().eq_ignore_ascii_case(name)))
        .unwrap_or(false)
}

/// Configuration of how a database should be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Version of the outer database file
    pub version: DatabaseVersion,

    /// Whether saving may raise `version` to the minimum required by the
    /// database content. When locked, the configured version is kept as-is.
    pub version_locked: bool,

    /// What encryption to use for the outer encryption
    pub outer_cipher_config: OuterCipherConfig,

    /// What algorithm to use to compress the inner data
    pub compression_config: CompressionConfig,

    /// What encryption to use for protected fields inside the database
    pub inner_cipher_config: InnerCipherConfig,

    /// Settings for the Key Derivation Function (KDF)
    pub kdf_config: KdfConfig,

    /// Plugin data stored unencrypted in the outer header (KDBX4)
    pub public_custom_data: VariantDictionary,

    /// Outer header fields this library does not recognize, preserved so
    /// they survive a load/save cycle
    pub unknown_header_fields: Vec<RawHeaderField>,
}

/// An unrecognized outer header field, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeaderField {
    pub field_type: u8,
    pub data: Vec<u8>,
}

/// Sensible default configuration for new databases
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            version: DatabaseVersion::KDB4(KDBX4_CURRENT_MINOR_VERSION),
            version_locked: false,
            outer_cipher_config: OuterCipherConfig::AES256,
            compression_config: CompressionConfig::GZip,
            inner_cipher_config: InnerCipherConfig::ChaCha20,
            kdf_config: KdfConfig::Argon2 {
                iterations: 50,
                memory: 1024 * 1024,
                parallelism: 4,
                version: argon2::Version::Version13,
            },
            public_custom_data: VariantDictionary::new(),
            unknown_header_fields: Vec::new(),
        }
    }
}

/// Choices for outer encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OuterCipherConfig {
    /// AES-128/CBC, supported for reading old files only
    AES128,
    AES256,
    Twofish,
    Serpent,
    ChaCha20,
}

impl OuterCipherConfig {
    pub(crate) fn get_cipher(
        &self,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Box<dyn ciphers::Cipher>, CryptographyError> {
        match self {
            OuterCipherConfig::AES128 => {
                // the raw key is always 32 bytes; this legacy suite consumes
                // the first half
                let key = key.get(..16).unwrap_or(key);
                Ok(Box::new(ciphers::Aes128Cipher::new(key, iv)?))
            }
            OuterCipherConfig::AES256 => Ok(Box::new(ciphers::Aes256Cipher::new(key, iv)?)),
            OuterCipherConfig::Twofish => Ok(Box::new(ciphers::TwofishCipher::new(key, iv)?)),
            OuterCipherConfig::Serpent => Ok(Box::new(ciphers::SerpentCipher::new(key, iv)?)),
            OuterCipherConfig::ChaCha20 => Ok(Box::new(ciphers::ChaCha20Cipher::new_key_iv(key, iv)?)),
        }
    }

    pub(crate) fn get_iv_size(&self) -> usize {
        match self {
            OuterCipherConfig::AES128 => ciphers::Aes128Cipher::iv_size(),
            OuterCipherConfig::AES256 => ciphers::Aes256Cipher::iv_size(),
            OuterCipherConfig::Twofish => ciphers::TwofishCipher::iv_size(),
            OuterCipherConfig::Serpent => ciphers::SerpentCipher::iv_size(),
            OuterCipherConfig::ChaCha20 => ciphers::ChaCha20Cipher::iv_size(),
        }
    }

    pub(crate) fn dump(&self) -> [u8; 16] {
        match self {
            OuterCipherConfig::AES128 => CIPHERSUITE_AES128,
            OuterCipherConfig::AES256 => CIPHERSUITE_AES256,
            OuterCipherConfig::Twofish => CIPHERSUITE_TWOFISH,
            OuterCipherConfig::Serpent => CIPHERSUITE_SERPENT,
            OuterCipherConfig::ChaCha20 => CIPHERSUITE_CHACHA20,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            OuterCipherConfig::AES128 => "aes128",
            OuterCipherConfig::AES256 => "aes256",
            OuterCipherConfig::Twofish => "twofish",
            OuterCipherConfig::Serpent => "serpent",
            OuterCipherConfig::ChaCha20 => "chacha20",
        }
    }
}

impl TryFrom<&[u8]> for OuterCipherConfig {
    type Error = OuterCipherConfigError;

    fn try_from(v: &[u8]) -> Result<OuterCipherConfig, Self::Error> {
        let config = if v == CIPHERSUITE_AES128 {
            OuterCipherConfig::AES128
        } else if v == CIPHERSUITE_AES256 {
            OuterCipherConfig::AES256
        } else if v == CIPHERSUITE_TWOFISH {
            OuterCipherConfig::Twofish
        } else if v == CIPHERSUITE_SERPENT {
            OuterCipherConfig::Serpent
        } else if v == CIPHERSUITE_CHACHA20 {
            OuterCipherConfig::ChaCha20
        } else {
            return Err(OuterCipherConfigError::InvalidOuterCipherId { cid: v.to_vec() });
        };

        if blacklisted(config.name()) {
            return Err(OuterCipherConfigError::Blacklisted { name: config.name() });
        }

        Ok(config)
    }
}

/// Choices for encrypting protected values inside of databases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerCipherConfig {
    Plain,
    Salsa20,
    ChaCha20,
}

impl InnerCipherConfig {
    pub(crate) fn get_cipher(&self, key: &[u8]) -> Result<Box<dyn ciphers::Cipher>, CryptographyError> {
        match self {
            InnerCipherConfig::Plain => Ok(Box::new(ciphers::PlainCipher::new(key)?)),
            InnerCipherConfig::Salsa20 => Ok(Box::new(ciphers::Salsa20Cipher::new(key)?)),
            InnerCipherConfig::ChaCha20 => Ok(Box::new(ciphers::ChaCha20Cipher::new(key)?)),
        }
    }

    pub(crate) fn dump(&self) -> u32 {
        match self {
            InnerCipherConfig::Plain => PLAIN,
            InnerCipherConfig::Salsa20 => SALSA_20,
            InnerCipherConfig::ChaCha20 => CHA_CHA_20,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            InnerCipherConfig::Plain => "plain",
            InnerCipherConfig::Salsa20 => "salsa20",
            InnerCipherConfig::ChaCha20 => "chacha20",
        }
    }
}

impl TryFrom<u32> for InnerCipherConfig {
    type Error = InnerCipherConfigError;

    fn try_from(v: u32) -> Result<InnerCipherConfig, Self::Error> {
        let config = match v {
            PLAIN => InnerCipherConfig::Plain,
            SALSA_20 => InnerCipherConfig::Salsa20,
            CHA_CHA_20 => InnerCipherConfig::ChaCha20,
            _ => return Err(InnerCipherConfigError::InvalidInnerCipherId { cid: v }),
        };

        if blacklisted(config.name()) {
            return Err(InnerCipherConfigError::Blacklisted { name: config.name() });
        }

        Ok(config)
    }
}

// Name of the KDF fields in the variant dictionaries.
const KDF_ID: &str = "$UUID";
// KDF fields used by Argon2.
const KDF_MEMORY: &str = "M";
const KDF_SALT: &str = "S";
const KDF_ITERATIONS: &str = "I";
const KDF_PARALLELISM: &str = "P";
const KDF_VERSION: &str = "V";
// KDF fields used by AES.
const KDF_SEED: &str = "S";
const KDF_ROUNDS: &str = "R";

/// Choices for Key Derivation Functions (KDFs)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfConfig {
    /// Derive keys with repeated AES encryption
    Aes { rounds: u64 },
    /// Derive keys with Argon2d
    Argon2 {
        iterations: u64,
        memory: u64,
        parallelism: u32,
        version: argon2::Version,
    },
    /// Derive keys with Argon2id
    Argon2id {
        iterations: u64,
        memory: u64,
        parallelism: u32,
        version: argon2::Version,
    },
}

impl KdfConfig {
    pub(crate) fn seed_size(&self) -> usize {
        match self {
            KdfConfig::Aes { .. } => 32,
            KdfConfig::Argon2 { .. } => 32,
            KdfConfig::Argon2id { .. } => 32,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            KdfConfig::Aes { .. } => "aes-kdf",
            KdfConfig::Argon2 { .. } => "argon2d",
            KdfConfig::Argon2id { .. } => "argon2id",
        }
    }

    /// For writing out a database, generate a fresh random seed and return
    /// the seeded KDF together with it
    pub(crate) fn get_kdf_and_seed(&self) -> Result<(Box<dyn kdf::Kdf>, Vec<u8>), getrandom::Error> {
        let mut kdf_seed = vec![0; self.seed_size()];
        getrandom::getrandom(&mut kdf_seed)?;

        let kdf = self.get_kdf_seeded(&kdf_seed);

        Ok((kdf, kdf_seed))
    }

    /// For reading a database, generate a KDF from the KDF config and a provided seed
    pub(crate) fn get_kdf_seeded(&self, seed: &[u8]) -> Box<dyn kdf::Kdf> {
        match self {
            KdfConfig::Aes { rounds } => Box::new(kdf::AesKdf {
                seed: seed.to_vec(),
                rounds: *rounds,
            }),
            KdfConfig::Argon2 {
                memory,
                iterations,
                parallelism,
                version,
            } => Box::new(kdf::Argon2Kdf {
                memory: *memory,
                salt: seed.to_vec(),
                iterations: *iterations,
                parallelism: *parallelism,
                version: *version,
                variant: argon2::Variant::Argon2d,
            }),
            KdfConfig::Argon2id {
                memory,
                iterations,
                parallelism,
                version,
            } => Box::new(kdf::Argon2Kdf {
                memory: *memory,
                salt: seed.to_vec(),
                iterations: *iterations,
                parallelism: *parallelism,
                version: *version,
                variant: argon2::Variant::Argon2id,
            }),
        }
    }

    /// Serialize for the KDBX4 outer header.
    ///
    /// Databases whose key carries challenge-response components use the
    /// challenge-response AES-KDF UUID; everything else is written with the
    /// plain UUID for interoperability.
    pub(crate) fn to_variant_dictionary(&self, seed: &[u8], has_challenge_keys: bool) -> VariantDictionary {
        let mut vd = VariantDictionary::new();

        match self {
            KdfConfig::Aes { rounds } => {
                if has_challenge_keys {
                    vd.set(KDF_ID, KDF_AES_KDBX4.to_vec());
                } else {
                    vd.set(KDF_ID, KDF_AES_KDBX3.to_vec());
                }
                vd.set(KDF_ROUNDS, *rounds);
                vd.set(KDF_SEED, seed.to_vec());
            }
            KdfConfig::Argon2 {
                memory,
                iterations,
                parallelism,
                version,
            } => {
                vd.set(KDF_ID, KDF_ARGON2.to_vec());
                vd.set(KDF_MEMORY, *memory);
                vd.set(KDF_SALT, seed.to_vec());
                vd.set(KDF_ITERATIONS, *iterations);
                vd.set(KDF_PARALLELISM, *parallelism);
                vd.set(KDF_VERSION, version.as_u32());
            }
            KdfConfig::Argon2id {
                memory,
                iterations,
                parallelism,
                version,
            } => {
                vd.set(KDF_ID, KDF_ARGON2ID.to_vec());
                vd.set(KDF_MEMORY, *memory);
                vd.set(KDF_SALT, seed.to_vec());
                vd.set(KDF_ITERATIONS, *iterations);
                vd.set(KDF_PARALLELISM, *parallelism);
                vd.set(KDF_VERSION, version.as_u32());
            }
        }

        vd
    }
}

const KDF_AES_KDBX3: [u8; 16] = hex!("c9d9f39a628a4460bf740d08c18a4fea");
const KDF_AES_KDBX4: [u8; 16] = hex!("7c02bb8279a74ac0927d114a00648238");
const KDF_ARGON2: [u8; 16] = hex!("ef636ddf8c29444b91f7a9a403e30a0c");
const KDF_ARGON2ID: [u8; 16] = hex!("9e298b1956db4773b23dfc3ec6f0a1e6");

fn parse_argon2_version(version: u32) -> Result<argon2::Version, KdfConfigError> {
    match version {
        0x10 => Ok(argon2::Version::Version10),
        0x13 => Ok(argon2::Version::Version13),
        _ => Err(KdfConfigError::InvalidKdfVersion { version }),
    }
}

impl TryFrom<&VariantDictionary> for (KdfConfig, Vec<u8>) {
    type Error = KdfConfigError;

    fn try_from(vd: &VariantDictionary) -> Result<(KdfConfig, Vec<u8>), Self::Error> {
        let uuid = vd.get::<Vec<u8>>(KDF_ID)?;

        let (config, seed) = if uuid == &KDF_ARGON2ID || uuid == &KDF_ARGON2 {
            let memory: u64 = *vd.get(KDF_MEMORY)?;
            let salt: Vec<u8> = vd.get::<Vec<u8>>(KDF_SALT)?.clone();
            let iterations: u64 = *vd.get(KDF_ITERATIONS)?;
            let parallelism: u32 = *vd.get(KDF_PARALLELISM)?;
            let version = parse_argon2_version(*vd.get(KDF_VERSION)?)?;

            let config = if uuid == &KDF_ARGON2ID {
                KdfConfig::Argon2id {
                    memory,
                    iterations,
                    parallelism,
                    version,
                }
            } else {
                KdfConfig::Argon2 {
                    memory,
                    iterations,
                    parallelism,
                    version,
                }
            };

            (config, salt)
        } else if uuid == &KDF_AES_KDBX4 || uuid == &KDF_AES_KDBX3 {
            let rounds: u64 = *vd.get(KDF_ROUNDS)?;
            let seed: Vec<u8> = vd.get::<Vec<u8>>(KDF_SEED)?.clone();

            (KdfConfig::Aes { rounds }, seed)
        } else {
            return Err(KdfConfigError::InvalidKdfUuid { uuid: uuid.clone() });
        };

        if blacklisted(config.name()) {
            return Err(KdfConfigError::Blacklisted { name: config.name() });
        }

        Ok((config, seed))
    }
}

/// Choices of compression algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionConfig {
    None,
    GZip,
}

impl CompressionConfig {
    pub(crate) fn get_compression(&self) -> Box<dyn compression::Compression> {
        match self {
            CompressionConfig::None => Box::new(compression::NoCompression),
            CompressionConfig::GZip => Box::new(compression::GZipCompression),
        }
    }

    pub(crate) fn dump(&self) -> [u8; 4] {
        match self {
            CompressionConfig::None => [0, 0, 0, 0],
            CompressionConfig::GZip => [1, 0, 0, 0],
        }
    }
}

impl TryFrom<u32> for CompressionConfig {
    type Error = CompressionConfigError;

    fn try_from(v: u32) -> Result<CompressionConfig, Self::Error> {
        match v {
            0 => Ok(CompressionConfig::None),
            1 => Ok(CompressionConfig::GZip),
            _ => Err(CompressionConfigError::InvalidCompressionSuite { cid: v }),
        }
    }
}

#[cfg(test)]
mod config_tests {
    use std::convert::TryFrom;

    use super::*;
    use crate::error::Warnings;

    #[test]
    fn outer_cipher_ids_round_trip() {
        for config in [
            OuterCipherConfig::AES128,
            OuterCipherConfig::AES256,
            OuterCipherConfig::Twofish,
            OuterCipherConfig::Serpent,
            OuterCipherConfig::ChaCha20,
        ] {
            let parsed = OuterCipherConfig::try_from(&config.dump()[..]).unwrap();
            assert_eq!(parsed, config);
        }

        assert!(matches!(
            OuterCipherConfig::try_from(&[0u8; 16][..]),
            Err(OuterCipherConfigError::InvalidOuterCipherId { .. })
        ));
    }

    #[test]
    fn inner_cipher_ids_round_trip() {
        for config in [
            InnerCipherConfig::Plain,
            InnerCipherConfig::Salsa20,
            InnerCipherConfig::ChaCha20,
        ] {
            let parsed = InnerCipherConfig::try_from(config.dump()).unwrap();
            assert_eq!(parsed, config);
        }

        assert!(InnerCipherConfig::try_from(77).is_err());
    }

    #[test]
    fn kdf_config_round_trip() {
        let configs = [
            KdfConfig::Aes { rounds: 31337 },
            KdfConfig::Argon2 {
                iterations: 10,
                memory: 65536,
                parallelism: 2,
                version: argon2::Version::Version13,
            },
            KdfConfig::Argon2id {
                iterations: 3,
                memory: 1024 * 1024,
                parallelism: 4,
                version: argon2::Version::Version10,
            },
        ];

        for config in configs {
            let seed = vec![0xABu8; config.seed_size()];
            let vd = config.to_variant_dictionary(&seed, false);

            let (parsed, parsed_seed) = <(KdfConfig, Vec<u8>)>::try_from(&vd).unwrap();
            assert_eq!(parsed, config);
            assert_eq!(parsed_seed, seed);
        }
    }

    #[test]
    fn aes_kdf_uuid_depends_on_challenge_keys() {
        let config = KdfConfig::Aes { rounds: 100 };
        let seed = vec![0u8; 32];

        let plain = config.to_variant_dictionary(&seed, false);
        let challenged = config.to_variant_dictionary(&seed, true);

        assert_eq!(plain.get::<Vec<u8>>("$UUID").unwrap(), &KDF_AES_KDBX3.to_vec());
        assert_eq!(challenged.get::<Vec<u8>>("$UUID").unwrap(), &KDF_AES_KDBX4.to_vec());
    }

    #[test]
    fn invalid_argon2_version_is_rejected() {
        let mut vd = VariantDictionary::new();
        vd.set(KDF_ID, KDF_ARGON2.to_vec());
        vd.set(KDF_MEMORY, 65536u64);
        vd.set(KDF_SALT, vec![0u8; 32]);
        vd.set(KDF_ITERATIONS, 10u64);
        vd.set(KDF_PARALLELISM, 2u32);
        vd.set(KDF_VERSION, 0x42u32);

        assert!(matches!(
            <(KdfConfig, Vec<u8>)>::try_from(&vd),
            Err(KdfConfigError::InvalidKdfVersion { version: 0x42 })
        ));
    }

    #[test]
    fn kdf_parameters_survive_dictionary_serialization() {
        let config = KdfConfig::Argon2 {
            iterations: 17,
            memory: 65536,
            parallelism: 3,
            version: argon2::Version::Version13,
        };
        let seed = vec![0x5Au8; 32];

        let mut buffer = Vec::new();
        config.to_variant_dictionary(&seed, false).dump(&mut buffer).unwrap();

        let vd = VariantDictionary::parse(&buffer, &mut Warnings::new()).unwrap();
        let (parsed, parsed_seed) = <(KdfConfig, Vec<u8>)>::try_from(&vd).unwrap();

        assert_eq!(parsed, config);
        assert_eq!(parsed_seed, seed);
    }
}
