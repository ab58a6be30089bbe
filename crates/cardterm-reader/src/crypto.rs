//! Triple-DES primitive and the SAM mutual-authentication math.
//!
//! The reader consumes a keyed block cipher through [`BlockCipher`] and
//! builds the handshake on top of it:
//!
//! 1. GET CHALLENGE returns `E(K, RndB)`; the terminal decrypts it.
//! 2. The terminal picks `RndA` and sends `E(K, RndA || rotl(RndB))`.
//! 3. The module answers `E(K, rotl(RndA))`; the terminal decrypts and
//!    compares in constant time.
//! 4. The session key is `RndA[0..4] || RndB[0..4] || RndA[4..8] || RndB[4..8]`.
//!
//! All blocks are processed in ECB mode. Randoms and keys live in
//! [`Zeroizing`] buffers and are never logged.

use std::fmt;
use std::sync::Arc;

use cardterm_core::constants::CHALLENGE_LENGTH;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use des::{TdesEde2, TdesEde3};
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::trace;
use zeroize::Zeroizing;

/// DES block size in bytes.
pub const BLOCK_SIZE: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: expected 16 or 24 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid data length {0}: must be a non-zero multiple of {BLOCK_SIZE}")]
    InvalidDataLength(usize),

    #[error("Cryptogram does not match the expected value")]
    Mismatch,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Keyed block cipher consumed by the authentication handshake.
pub trait BlockCipher: Send + Sync {
    fn encrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;
}

/// Triple-DES in ECB mode.
///
/// A 16-byte key selects two-key EDE, a 24-byte key three-key EDE.
#[derive(Debug, Clone, Copy, Default)]
pub struct TripleDes;

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

enum Keyed {
    Two(TdesEde2),
    Three(TdesEde3),
}

impl Keyed {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => TdesEde2::new_from_slice(key)
                .map(Keyed::Two)
                .map_err(|_| CryptoError::InvalidKeyLength(key.len())),
            24 => TdesEde3::new_from_slice(key)
                .map(Keyed::Three)
                .map_err(|_| CryptoError::InvalidKeyLength(key.len())),
            other => Err(CryptoError::InvalidKeyLength(other)),
        }
    }

    fn apply(&self, data: &[u8], direction: Direction) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(BLOCK_SIZE) {
            let mut block = GenericArray::clone_from_slice(chunk);
            match (self, direction) {
                (Keyed::Two(c), Direction::Encrypt) => c.encrypt_block(&mut block),
                (Keyed::Two(c), Direction::Decrypt) => c.decrypt_block(&mut block),
                (Keyed::Three(c), Direction::Encrypt) => c.encrypt_block(&mut block),
                (Keyed::Three(c), Direction::Decrypt) => c.decrypt_block(&mut block),
            }
            out.extend_from_slice(&block);
        }
        out
    }
}

fn check_data(data: &[u8]) -> Result<()> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidDataLength(data.len()));
    }
    Ok(())
}

impl BlockCipher for TripleDes {
    fn encrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        check_data(data)?;
        trace!(len = data.len(), "3DES-ECB encrypt");
        Ok(Keyed::new(key)?.apply(data, Direction::Encrypt))
    }

    fn decrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        check_data(data)?;
        trace!(len = data.len(), "3DES-ECB decrypt");
        Ok(Keyed::new(key)?.apply(data, Direction::Decrypt))
    }
}

/// Rotate a block left by one byte.
pub fn rotate_left(block: &[u8]) -> Vec<u8> {
    let mut out = block.to_vec();
    if !out.is_empty() {
        out.rotate_left(1);
    }
    out
}

/// Fresh terminal random `RndA`.
pub fn generate_challenge() -> Zeroizing<Vec<u8>> {
    let mut rnd = Zeroizing::new(vec![0u8; CHALLENGE_LENGTH]);
    OsRng.fill_bytes(&mut rnd);
    rnd
}

/// Decrypt the module challenge `E(K, RndB)`.
pub fn decrypt_challenge(
    cipher: &dyn BlockCipher,
    key: &[u8],
    encrypted: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if encrypted.len() != CHALLENGE_LENGTH {
        return Err(CryptoError::InvalidDataLength(encrypted.len()));
    }
    Ok(Zeroizing::new(cipher.decrypt(key, encrypted)?))
}

/// Build the EXTERNAL AUTHENTICATE payload `E(K, RndA || rotl(RndB))`.
pub fn build_authenticate_blob(
    cipher: &dyn BlockCipher,
    key: &[u8],
    rnd_a: &[u8],
    rnd_b: &[u8],
) -> Result<Vec<u8>> {
    let mut plain = Zeroizing::new(Vec::with_capacity(rnd_a.len() + rnd_b.len()));
    plain.extend_from_slice(rnd_a);
    plain.extend_from_slice(&rotate_left(rnd_b));
    cipher.encrypt(key, &plain)
}

/// Check the module cryptogram against `E(K, rotl(RndA))`.
///
/// # Errors
/// `Mismatch` if the decrypted value differs from `rotl(RndA)`.
pub fn verify_cryptogram(
    cipher: &dyn BlockCipher,
    key: &[u8],
    rnd_a: &[u8],
    cryptogram: &[u8],
) -> Result<()> {
    let decrypted = Zeroizing::new(cipher.decrypt(key, cryptogram)?);
    let expected = Zeroizing::new(rotate_left(rnd_a));
    let matches = decrypted.len() == expected.len()
        && bool::from(decrypted.as_slice().ct_eq(expected.as_slice()));
    if matches {
        Ok(())
    } else {
        Err(CryptoError::Mismatch)
    }
}

/// Session key `RndA[0..4] || RndB[0..4] || RndA[4..8] || RndB[4..8]`.
pub fn derive_session_key(rnd_a: &[u8], rnd_b: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if rnd_a.len() != CHALLENGE_LENGTH {
        return Err(CryptoError::InvalidDataLength(rnd_a.len()));
    }
    if rnd_b.len() != CHALLENGE_LENGTH {
        return Err(CryptoError::InvalidDataLength(rnd_b.len()));
    }
    let mut key = Zeroizing::new(Vec::with_capacity(2 * CHALLENGE_LENGTH));
    key.extend_from_slice(&rnd_a[0..4]);
    key.extend_from_slice(&rnd_b[0..4]);
    key.extend_from_slice(&rnd_a[4..8]);
    key.extend_from_slice(&rnd_b[4..8]);
    Ok(key)
}

/// Cipher keyed with the session key of a successful authentication.
#[derive(Clone)]
pub struct SessionCipher {
    cipher: Arc<dyn BlockCipher>,
    key: Zeroizing<Vec<u8>>,
}

impl SessionCipher {
    pub fn new(cipher: Arc<dyn BlockCipher>, key: Zeroizing<Vec<u8>>) -> Self {
        Self { cipher, key }
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.cipher.encrypt(&self.key, data)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.cipher.decrypt(&self.key, data)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCipher(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const KEY: [u8; 16] = [
        0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E,
        0x4F,
    ];

    /// The module side of the handshake.
    fn module_answer(rnd_b: &[u8], blob: &[u8]) -> Vec<u8> {
        let plain = TripleDes.decrypt(&KEY, blob).unwrap();
        assert_eq!(&plain[8..], rotate_left(rnd_b).as_slice());
        TripleDes.encrypt(&KEY, &rotate_left(&plain[..8])).unwrap()
    }

    #[rstest]
    #[case(16)]
    #[case(24)]
    fn test_round_trip_for_key_sizes(#[case] key_len: usize) {
        let key = vec![0x5Au8; key_len];
        let data = [0x11u8; 16];
        let ct = TripleDes.encrypt(&key, &data).unwrap();
        assert_ne!(ct, data);
        assert_eq!(TripleDes.decrypt(&key, &ct).unwrap(), data);
    }

    #[rstest]
    #[case(8)]
    #[case(15)]
    #[case(32)]
    fn test_invalid_key_length(#[case] key_len: usize) {
        let key = vec![0u8; key_len];
        assert_eq!(
            TripleDes.encrypt(&key, &[0u8; 8]),
            Err(CryptoError::InvalidKeyLength(key_len))
        );
    }

    #[test]
    fn test_invalid_data_length() {
        assert_eq!(
            TripleDes.encrypt(&KEY, &[0u8; 7]),
            Err(CryptoError::InvalidDataLength(7))
        );
        assert_eq!(
            TripleDes.decrypt(&KEY, &[]),
            Err(CryptoError::InvalidDataLength(0))
        );
    }

    #[test]
    fn test_rotate_left() {
        assert_eq!(rotate_left(&[1, 2, 3, 4]), vec![2, 3, 4, 1]);
        assert!(rotate_left(&[]).is_empty());
    }

    #[test]
    fn test_session_key_layout() {
        let a = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7];
        let b = [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7];
        let key = derive_session_key(&a, &b).unwrap();
        assert_eq!(
            key.as_slice(),
            &[
                0xA0, 0xA1, 0xA2, 0xA3, 0xB0, 0xB1, 0xB2, 0xB3, 0xA4, 0xA5, 0xA6, 0xA7, 0xB4, 0xB5,
                0xB6, 0xB7
            ]
        );
        assert!(derive_session_key(&a[..4], &b).is_err());
    }

    #[test]
    fn test_session_cipher_debug_is_redacted() {
        let cipher = SessionCipher::new(Arc::new(TripleDes), Zeroizing::new(KEY.to_vec()));
        assert_eq!(format!("{cipher:?}"), "SessionCipher(<redacted>)");
        let ct = cipher.encrypt(&[1u8; 8]).unwrap();
        assert_eq!(cipher.decrypt(&ct).unwrap(), vec![1u8; 8]);
    }

    proptest! {
        /// Property: an honest module's cryptogram always verifies.
        #[test]
        fn prop_handshake_round_trip(
            rnd_a in prop::array::uniform8(any::<u8>()),
            rnd_b in prop::array::uniform8(any::<u8>()),
        ) {
            let challenge = TripleDes.encrypt(&KEY, &rnd_b).unwrap();
            let decrypted_b = decrypt_challenge(&TripleDes, &KEY, &challenge).unwrap();
            prop_assert_eq!(decrypted_b.as_slice(), &rnd_b[..]);

            let blob = build_authenticate_blob(&TripleDes, &KEY, &rnd_a, &decrypted_b).unwrap();
            let cryptogram = module_answer(&rnd_b, &blob);
            prop_assert!(verify_cryptogram(&TripleDes, &KEY, &rnd_a, &cryptogram).is_ok());
        }

        /// Property: flipping any single bit of the cryptogram fails
        /// verification.
        #[test]
        fn prop_single_bit_corruption_fails(
            rnd_a in prop::array::uniform8(any::<u8>()),
            rnd_b in prop::array::uniform8(any::<u8>()),
            bit in 0usize..64,
        ) {
            let blob = build_authenticate_blob(&TripleDes, &KEY, &rnd_a, &rnd_b).unwrap();
            let mut cryptogram = module_answer(&rnd_b, &blob);
            cryptogram[bit / 8] ^= 1 << (bit % 8);
            prop_assert_eq!(
                verify_cryptogram(&TripleDes, &KEY, &rnd_a, &cryptogram),
                Err(CryptoError::Mismatch)
            );
        }
    }
}
