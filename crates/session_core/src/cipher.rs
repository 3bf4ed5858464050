use aes_gcm::{
    aead::{consts::U16, generic_array::GenericArray, AeadInPlace, KeyInit},
    aes::Aes256,
    AesGcm,
};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = SALT_LEN + IV_LEN + TAG_LEN;
pub const PBKDF2_ROUNDS: u32 = 100_000;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("sealed blob is truncated: {len} bytes")]
    Truncated { len: usize },
    #[error("sealed blob failed authentication")]
    Authentication,
    #[error("encryption failed")]
    Seal,
}

/// Symmetric protection for credential blobs at rest.
pub trait Cipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// AES-256-GCM with a PBKDF2-SHA256 key derived per blob.
///
/// Layout: `salt(16) || iv(16) || tag(16) || ciphertext`.
pub struct AesGcmCipher {
    secret: Zeroizing<Vec<u8>>,
}

impl AesGcmCipher {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2_hmac::<Sha256>(&self.secret, salt, PBKDF2_ROUNDS, &mut key[..]);
        key
    }
}

impl Cipher for AesGcmCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt);
        let aead = Aes256Gcm16::new(GenericArray::from_slice(&key[..]));
        let mut buffer = plaintext.to_vec();
        let tag = aead
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| CipherError::Seal)?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + buffer.len());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&tag);
        sealed.extend_from_slice(&buffer);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < HEADER_LEN {
            return Err(CipherError::Truncated { len: sealed.len() });
        }
        let (salt, rest) = sealed.split_at(SALT_LEN);
        let (iv, rest) = rest.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let key = self.derive_key(salt);
        let aead = Aes256Gcm16::new(GenericArray::from_slice(&key[..]));
        let mut buffer = ciphertext.to_vec();
        aead.decrypt_in_place_detached(
            GenericArray::from_slice(iv),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CipherError::Authentication)?;
        Ok(buffer)
    }
}

/// Stores blobs in the clear. Only for tests and local development.
pub struct PassthroughCipher;

impl Cipher for PassthroughCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(sealed.to_vec())
    }
}

#[cfg(test)]
#[path = "tests/cipher_tests.rs"]
mod tests;
