use aes::Aes256;
use cipher::{
    generic_array::{
        typenum::{U16, U32},
        GenericArray,
    },
    BlockEncrypt, KeyInit,
};
use zeroize::Zeroize;

use crate::cancel::CancelToken;
use crate::error::CryptographyError;

/// Environment variable forcing the single-threaded AES-KDF path
pub const NO_PARALLEL_ENV: &str = "KDBX_DB_NO_PARALLEL";

/// Rounds below which spawning worker threads costs more than it saves
const PARALLEL_ROUNDS_THRESHOLD: u64 = 100_000;

/// How many rounds to run between cancellation checkpoints
const CANCEL_CHECK_INTERVAL: u64 = 0x10000;

pub(crate) trait Kdf {
    fn transform_key(
        &self,
        composite_key: &GenericArray<u8, U32>,
        cancel: &CancelToken,
    ) -> Result<GenericArray<u8, U32>, CryptographyError>;
}

pub struct AesKdf {
    pub seed: Vec<u8>,
    pub rounds: u64,
}

impl AesKdf {
    fn transform_sequential(
        &self,
        cipher: &Aes256,
        composite_key: &GenericArray<u8, U32>,
        cancel: &CancelToken,
    ) -> Result<(GenericArray<u8, U16>, GenericArray<u8, U16>), CryptographyError> {
        let mut block1 = GenericArray::clone_from_slice(&composite_key[..16]);
        let mut block2 = GenericArray::clone_from_slice(&composite_key[16..]);

        for i in 0..self.rounds {
            if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                block1.as_mut_slice().fill(0);
                block2.as_mut_slice().fill(0);
                return Err(CryptographyError::Cancelled);
            }
            cipher.encrypt_block(&mut block1);
            cipher.encrypt_block(&mut block2);
        }

        Ok((block1, block2))
    }

    fn transform_parallel(
        &self,
        cipher: &Aes256,
        composite_key: &GenericArray<u8, U32>,
        cancel: &CancelToken,
    ) -> Result<(GenericArray<u8, U16>, GenericArray<u8, U16>), CryptographyError> {
        fn transform_half(
            cipher: &Aes256,
            half: &[u8],
            rounds: u64,
            cancel: &CancelToken,
        ) -> Result<GenericArray<u8, U16>, CryptographyError> {
            let mut block = GenericArray::clone_from_slice(half);

            for i in 0..rounds {
                if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                    block.as_mut_slice().fill(0);
                    return Err(CryptographyError::Cancelled);
                }
                cipher.encrypt_block(&mut block);
            }

            Ok(block)
        }

        let (res1, res2) = std::thread::scope(|scope| {
            let worker1 = scope.spawn(|| transform_half(cipher, &composite_key[..16], self.rounds, cancel));
            let worker2 = scope.spawn(|| transform_half(cipher, &composite_key[16..], self.rounds, cancel));
            (worker1.join(), worker2.join())
        });

        let block1 = match res1 {
            Ok(res) => res?,
            Err(payload) => std::panic::resume_unwind(payload),
        };
        let block2 = match res2 {
            Ok(res) => res?,
            Err(payload) => std::panic::resume_unwind(payload),
        };

        Ok((block1, block2))
    }

    fn use_parallel(&self) -> bool {
        self.rounds >= PARALLEL_ROUNDS_THRESHOLD
            && std::env::var_os(NO_PARALLEL_ENV).is_none()
            && std::thread::available_parallelism()
                .map(|n| n.get() > 1)
                .unwrap_or(false)
    }
}

impl Kdf for AesKdf {
    fn transform_key(
        &self,
        composite_key: &GenericArray<u8, U32>,
        cancel: &CancelToken,
    ) -> Result<GenericArray<u8, U32>, CryptographyError> {
        let cipher = Aes256::new_from_slice(&self.seed)?;

        let (mut block1, mut block2) = if self.use_parallel() {
            self.transform_parallel(&cipher, composite_key, cancel)?
        } else {
            self.transform_sequential(&cipher, composite_key, cancel)?
        };

        let transformed = crate::crypt::calculate_sha256(&[&block1, &block2]);

        block1.as_mut_slice().fill(0);
        block2.as_mut_slice().fill(0);

        Ok(transformed)
    }
}

pub struct Argon2Kdf {
    pub memory: u64,
    pub salt: Vec<u8>,
    pub iterations: u64,
    pub parallelism: u32,
    pub version: argon2::Version,
    pub variant: argon2::Variant,
}

impl Kdf for Argon2Kdf {
    fn transform_key(
        &self,
        composite_key: &GenericArray<u8, U32>,
        cancel: &CancelToken,
    ) -> Result<GenericArray<u8, U32>, CryptographyError> {
        if cancel.is_cancelled() {
            return Err(CryptographyError::Cancelled);
        }

        let config = argon2::Config {
            ad: &[],
            hash_length: 32,
            lanes: self.parallelism,
            mem_cost: (self.memory / 1024) as u32,
            secret: &[],
            time_cost: self.iterations as u32,
            variant: self.variant,
            version: self.version,
        };

        // out-of-range parameters are reported by the argon2 library, never
        // clamped here
        let mut key = argon2::hash_raw(composite_key, &self.salt, &config)?;

        if cancel.is_cancelled() {
            key.zeroize();
            return Err(CryptographyError::Cancelled);
        }

        let out = GenericArray::clone_from_slice(&key);
        key.zeroize();

        Ok(out)
    }
}
