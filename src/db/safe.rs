use chacha20::ChaCha20;
use cipher::generic_array::GenericArray;
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Keeps protected string plaintexts encrypted while the database is locked.
///
/// The safe owns a ChaCha20 keystream under a random 64-byte key that is
/// unrelated to the database's inner stream key. Each locked value occupies
/// a contiguous keystream range, recorded as an append-only slot list, so
/// individual values can be peeked at out of order by seeking a cipher clone
/// to the slot's offset.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Safe {
    key: Vec<u8>,
    records: Vec<SafeRecord>,
    offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize)]
struct SafeRecord {
    offset: u64,
    len: usize,
}

impl Safe {
    pub(crate) fn new() -> Result<Self, getrandom::Error> {
        let mut key = vec![0u8; 64];
        getrandom::getrandom(&mut key)?;

        Ok(Safe {
            key,
            records: Vec::new(),
            offset: 0,
        })
    }

    fn cipher_at(&self, offset: u64) -> ChaCha20 {
        let hash = crate::crypt::calculate_sha512(&[&self.key]);
        let key = GenericArray::from_slice(&hash[0..32]);
        let nonce = GenericArray::from_slice(&hash[32..44]);

        let mut cipher = ChaCha20::new(key, nonce);
        cipher.seek(offset);
        cipher
    }

    /// Number of values currently stored
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encrypt a plaintext into the keystream, returning its slot number and
    /// ciphertext. The caller is responsible for zeroing the plaintext.
    pub(crate) fn add(&mut self, plaintext: &[u8]) -> (usize, Vec<u8>) {
        let mut buffer = plaintext.to_vec();
        self.cipher_at(self.offset).apply_keystream(&mut buffer);

        let slot = self.records.len();
        self.records.push(SafeRecord {
            offset: self.offset,
            len: buffer.len(),
        });
        self.offset += buffer.len() as u64;

        (slot, buffer)
    }

    /// Decrypt a single slot without touching the rest of the keystream
    pub(crate) fn peek(&self, slot: usize, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let record = self.records.get(slot)?;
        if record.len != ciphertext.len() {
            return None;
        }

        let mut buffer = ciphertext.to_vec();
        self.cipher_at(record.offset).apply_keystream(&mut buffer);
        Some(buffer)
    }
}

impl std::fmt::Debug for Safe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Safe")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod safe_tests {
    use super::Safe;

    #[test]
    fn add_then_peek_in_any_order() {
        let mut safe = Safe::new().unwrap();

        let (slot_a, cipher_a) = safe.add(b"first secret");
        let (slot_b, cipher_b) = safe.add(b"second secret");
        let (slot_c, cipher_c) = safe.add(b"third");

        assert_eq!(safe.len(), 3);
        assert_ne!(cipher_a, b"first secret".to_vec());

        // peeks work out of order and repeatedly
        assert_eq!(safe.peek(slot_c, &cipher_c).unwrap(), b"third");
        assert_eq!(safe.peek(slot_a, &cipher_a).unwrap(), b"first secret");
        assert_eq!(safe.peek(slot_b, &cipher_b).unwrap(), b"second secret");
        assert_eq!(safe.peek(slot_a, &cipher_a).unwrap(), b"first secret");
    }

    #[test]
    fn peek_rejects_bad_slots() {
        let mut safe = Safe::new().unwrap();
        let (slot, ciphertext) = safe.add(b"value");

        assert!(safe.peek(slot + 1, &ciphertext).is_none());
        assert!(safe.peek(slot, b"wrong-length").is_none());
    }

    #[test]
    fn keystreams_differ_between_safes() {
        let mut one = Safe::new().unwrap();
        let mut two = Safe::new().unwrap();

        let (_, cipher_one) = one.add(b"same plaintext");
        let (_, cipher_two) = two.add(b"same plaintext");

        assert_ne!(cipher_one, cipher_two);
    }
}
