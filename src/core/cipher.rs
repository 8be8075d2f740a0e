use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};

use crate::core::error::{DecryptError, EncryptError};

/// AES-GCM nonce length.
pub const IV_SIZE: usize = 12;

/// Index key length (AES-256).
pub const KEY_SIZE: usize = 32;

/// Ciphertext plus the IV needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
}

pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, EncryptError>;
    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, DecryptError>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        AesGcmCipher {
            cipher: Aes256Gcm::new(&(*key).into()),
        }
    }

    pub fn generate_key() -> [u8; KEY_SIZE] {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut out = [0u8; KEY_SIZE];
        out.copy_from_slice(key.as_slice());
        out
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, EncryptError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptError::Failed)?;
        Ok(Sealed {
            ciphertext,
            iv: nonce.to_vec(),
        })
    }

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, DecryptError> {
        if iv.len() != IV_SIZE {
            return Err(DecryptError::InvalidIv(iv.len()));
        }
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| DecryptError::Failed)
    }
}
