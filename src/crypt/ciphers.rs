use byteorder::{ByteOrder, LittleEndian};
use cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit,
    StreamCipher, StreamCipherSeek,
};

use crate::error::CryptographyError;

/// A fully-keyed cipher instance.
///
/// Block-mode implementations handle PKCS#7 padding internally, so `encrypt`
/// and `decrypt` operate on whole messages. Stream implementations apply
/// their keystream incrementally; consecutive calls continue where the
/// previous call left off, which is what keeps the inner stream in sync with
/// the XML document order.
pub(crate) trait Cipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError>;
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError>;

    /// The number of bytes expected by the cipher as an initialization vector.
    fn iv_size() -> usize
    where
        Self: Sized;

    /// The number of bytes expected by the cipher as a key.
    fn key_size() -> usize
    where
        Self: Sized;
}

pub(crate) struct Aes256Cipher {
    encryptor: cbc::Encryptor<aes::Aes256>,
    decryptor: cbc::Decryptor<aes::Aes256>,
}

impl Aes256Cipher {
    pub(crate) fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptographyError> {
        Ok(Aes256Cipher {
            encryptor: KeyIvInit::new_from_slices(key, iv)?,
            decryptor: KeyIvInit::new_from_slices(key, iv)?,
        })
    }
}

impl Cipher for Aes256Cipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        Ok(self.encryptor.clone().encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let mut out = vec![0; ciphertext.len()];

        let len = self
            .decryptor
            .clone()
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, &mut out)?
            .len();

        out.truncate(len);

        Ok(out)
    }

    fn iv_size() -> usize {
        16
    }

    fn key_size() -> usize {
        32
    }
}

/// AES-128/CBC, kept for reading old databases
pub(crate) struct Aes128Cipher {
    encryptor: cbc::Encryptor<aes::Aes128>,
    decryptor: cbc::Decryptor<aes::Aes128>,
}

impl Aes128Cipher {
    pub(crate) fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptographyError> {
        Ok(Aes128Cipher {
            encryptor: KeyIvInit::new_from_slices(key, iv)?,
            decryptor: KeyIvInit::new_from_slices(key, iv)?,
        })
    }
}

impl Cipher for Aes128Cipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        Ok(self.encryptor.clone().encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let mut out = vec![0; ciphertext.len()];

        let len = self
            .decryptor
            .clone()
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, &mut out)?
            .len();

        out.truncate(len);

        Ok(out)
    }

    fn iv_size() -> usize {
        16
    }

    fn key_size() -> usize {
        16
    }
}

pub(crate) struct TwofishCipher {
    encryptor: cbc::Encryptor<twofish::Twofish>,
    decryptor: cbc::Decryptor<twofish::Twofish>,
}

impl TwofishCipher {
    pub(crate) fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptographyError> {
        Ok(TwofishCipher {
            encryptor: KeyIvInit::new_from_slices(key, iv)?,
            decryptor: KeyIvInit::new_from_slices(key, iv)?,
        })
    }
}

impl Cipher for TwofishCipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        Ok(self.encryptor.clone().encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let mut out = vec![0; ciphertext.len()];

        let len = self
            .decryptor
            .clone()
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, &mut out)?
            .len();

        out.truncate(len);

        Ok(out)
    }

    fn iv_size() -> usize {
        16
    }

    fn key_size() -> usize {
        32
    }
}

pub(crate) struct SerpentCipher {
    encryptor: cbc::Encryptor<serpent::Serpent>,
    decryptor: cbc::Decryptor<serpent::Serpent>,
}

impl SerpentCipher {
    pub(crate) fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptographyError> {
        Ok(SerpentCipher {
            encryptor: KeyIvInit::new_from_slices(key, iv)?,
            decryptor: KeyIvInit::new_from_slices(key, iv)?,
        })
    }
}

impl Cipher for SerpentCipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        Ok(self.encryptor.clone().encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let mut out = vec![0; ciphertext.len()];

        let len = self
            .decryptor
            .clone()
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, &mut out)?
            .len();

        out.truncate(len);

        Ok(out)
    }

    fn iv_size() -> usize {
        16
    }

    fn key_size() -> usize {
        32
    }
}

pub(crate) struct Salsa20Cipher {
    cipher: salsa20::Salsa20,
}

impl Salsa20Cipher {
    /// Create as an inner cipher from a KDBX protected stream key.
    ///
    /// The stream key is SHA-256 hashed; the IV is the constant mandated by
    /// the format.
    pub(crate) fn new(key: &[u8]) -> Result<Self, CryptographyError> {
        let key = crate::crypt::calculate_sha256(&[key]);
        let iv = GenericArray::from([0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A]);

        Ok(Salsa20Cipher {
            cipher: KeyIvInit::new(&key, &iv),
        })
    }
}

impl Cipher for Salsa20Cipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let mut buffer = Vec::from(plaintext);
        self.cipher.apply_keystream(&mut buffer);
        Ok(buffer)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let mut buffer = Vec::from(ciphertext);
        self.cipher.apply_keystream(&mut buffer);
        Ok(buffer)
    }

    fn iv_size() -> usize {
        8
    }

    fn key_size() -> usize {
        32
    }
}

pub(crate) struct ChaCha20Cipher {
    cipher: chacha20::ChaCha20,
}

impl ChaCha20Cipher {
    /// Create as an inner cipher by splitting up a SHA-512 hash of the
    /// protected stream key into cipher key and nonce.
    pub(crate) fn new(key: &[u8]) -> Result<Self, CryptographyError> {
        let hash = crate::crypt::calculate_sha512(&[key]);
        let key = GenericArray::from_slice(&hash[0..32]);
        let nonce = GenericArray::from_slice(&hash[32..44]);

        Ok(ChaCha20Cipher {
            cipher: chacha20::ChaCha20::new(key, nonce),
        })
    }

    /// Create as an outer cipher from separately-specified key and IV.
    ///
    /// The wire IV is the 12-byte nonce; a 16-byte IV carries a 4-byte
    /// little-endian block counter prefix before the nonce.
    pub(crate) fn new_key_iv(key: &[u8], iv: &[u8]) -> Result<Self, CryptographyError> {
        let (counter, nonce) = if iv.len() == 16 {
            (LittleEndian::read_u32(&iv[0..4]), &iv[4..16])
        } else {
            (0, iv)
        };

        let mut cipher = chacha20::ChaCha20::new_from_slices(key, nonce)?;
        if counter != 0 {
            cipher.seek(u64::from(counter) * 64);
        }

        Ok(ChaCha20Cipher { cipher })
    }
}

impl Cipher for ChaCha20Cipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let mut buffer = Vec::from(plaintext);
        self.cipher.apply_keystream(&mut buffer);
        Ok(buffer)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        let mut buffer = Vec::from(ciphertext);
        self.cipher.apply_keystream(&mut buffer);
        Ok(buffer)
    }

    fn iv_size() -> usize {
        12
    }

    fn key_size() -> usize {
        32
    }
}

/// No-op cipher for databases with an unprotected inner stream
pub(crate) struct PlainCipher;

impl PlainCipher {
    pub(crate) fn new(_: &[u8]) -> Result<Self, CryptographyError> {
        Ok(PlainCipher)
    }
}

impl Cipher for PlainCipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        Ok(Vec::from(plaintext))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptographyError> {
        Ok(Vec::from(ciphertext))
    }

    fn iv_size() -> usize {
        1
    }

    fn key_size() -> usize {
        1
    }
}

#[cfg(test)]
mod cipher_tests {
    use super::*;

    fn round_trip(cipher_for_encrypt: &mut dyn Cipher, cipher_for_decrypt: &mut dyn Cipher) {
        let plaintext = b"The quick brown fox jumps over the lazy dog".to_vec();

        let ciphertext = cipher_for_encrypt.encrypt(&plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);

        let decrypted = cipher_for_decrypt.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn block_cipher_round_trips() {
        let key = [0x42u8; 32];
        let iv = [0x24u8; 16];

        round_trip(
            &mut Aes256Cipher::new(&key, &iv).unwrap(),
            &mut Aes256Cipher::new(&key, &iv).unwrap(),
        );
        round_trip(
            &mut TwofishCipher::new(&key, &iv).unwrap(),
            &mut TwofishCipher::new(&key, &iv).unwrap(),
        );
        round_trip(
            &mut SerpentCipher::new(&key, &iv).unwrap(),
            &mut SerpentCipher::new(&key, &iv).unwrap(),
        );
    }

    #[test]
    fn stream_cipher_round_trips() {
        let key = [0x37u8; 64];

        round_trip(
            &mut Salsa20Cipher::new(&key).unwrap(),
            &mut Salsa20Cipher::new(&key).unwrap(),
        );
        round_trip(
            &mut ChaCha20Cipher::new(&key).unwrap(),
            &mut ChaCha20Cipher::new(&key).unwrap(),
        );

        let outer_key = [0x11u8; 32];
        let nonce = [0x22u8; 12];
        round_trip(
            &mut ChaCha20Cipher::new_key_iv(&outer_key, &nonce).unwrap(),
            &mut ChaCha20Cipher::new_key_iv(&outer_key, &nonce).unwrap(),
        );
    }

    #[test]
    fn chacha20_counter_prefix_skips_blocks() {
        let key = [0x11u8; 32];
        let nonce = [0x22u8; 12];

        // 16-byte IV with counter 1 must produce the keystream starting at
        // byte 64 of the counter-0 keystream
        let mut iv16 = vec![1, 0, 0, 0];
        iv16.extend_from_slice(&nonce);

        let mut plain = vec![0u8; 128];
        let keystream = ChaCha20Cipher::new_key_iv(&key, &nonce)
            .unwrap()
            .encrypt(&plain)
            .unwrap();

        plain.truncate(64);
        let shifted = ChaCha20Cipher::new_key_iv(&key, &iv16)
            .unwrap()
            .encrypt(&plain)
            .unwrap();

        assert_eq!(&keystream[64..], &shifted[..]);
    }

    #[test]
    fn stream_ciphers_are_stateful() {
        // two sequential encryptions must continue the keystream, not restart it
        let key = [0x99u8; 32];

        let mut one_shot = Salsa20Cipher::new(&key).unwrap();
        let full = one_shot.encrypt(&[0u8; 32]).unwrap();

        let mut split = Salsa20Cipher::new(&key).unwrap();
        let mut parts = split.encrypt(&[0u8; 16]).unwrap();
        parts.extend(split.encrypt(&[0u8; 16]).unwrap());

        assert_eq!(full, parts);
    }

    #[test]
    fn wrong_key_fails_padding_check() {
        let mut encryptor = Aes256Cipher::new(&[1u8; 32], &[0u8; 16]).unwrap();
        let ciphertext = encryptor.encrypt(b"payload").unwrap();

        let mut decryptor = Aes256Cipher::new(&[2u8; 32], &[0u8; 16]).unwrap();
        assert!(decryptor.decrypt(&ciphertext).is_err());
    }
}
