//! Sealing message bodies into index entries, and opening them again.
//!
//! Small ciphertexts are stored inline in the row. Anything above the inline
//! threshold goes to its own file under the user's content directory, and the
//! row only keeps the path.

use std::fs;
use std::path::Path;

use crate::core::cipher::Cipher;
use crate::core::error::{DecryptError, EncryptError};
use crate::core::models::{EntryContent, IndexEntry};

const CONTENT_FILE_EXTENSION: &str = "bin";

/// Encrypt `body` and attach it to `entry`.
pub fn seal_entry(
    mut entry: IndexEntry,
    body: &str,
    cipher: &dyn Cipher,
    inline_threshold: usize,
    content_dir: &Path,
) -> Result<IndexEntry, EncryptError> {
    let sealed = cipher.encrypt(body.as_bytes())?;
    entry.content_size = sealed.ciphertext.len() as i64;

    entry.content = if sealed.ciphertext.len() <= inline_threshold {
        EntryContent::Inline {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
        }
    } else {
        fs::create_dir_all(content_dir).map_err(|source| EncryptError::ContentFile {
            path: content_dir.to_path_buf(),
            source,
        })?;
        let path = content_dir.join(format!(
            "{}.{CONTENT_FILE_EXTENSION}",
            uuid::Uuid::new_v4()
        ));
        fs::write(&path, &sealed.ciphertext).map_err(|source| EncryptError::ContentFile {
            path: path.clone(),
            source,
        })?;
        log::debug!(
            "Stored {} byte body of {} out of line at {}",
            sealed.ciphertext.len(),
            entry.message_id,
            path.display()
        );
        EntryContent::File {
            path,
            iv: sealed.iv,
        }
    };
    entry.decryption_failed = false;
    Ok(entry)
}

/// Decrypt the body of `entry`.
pub fn open_content(entry: &IndexEntry, cipher: &dyn Cipher) -> Result<String, DecryptError> {
    let plaintext = match &entry.content {
        EntryContent::None => return Err(DecryptError::NoContent),
        EntryContent::Inline { ciphertext, iv } => cipher.decrypt(ciphertext, iv)?,
        EntryContent::File { path, iv } => {
            let ciphertext = fs::read(path).map_err(|source| DecryptError::ContentFile {
                path: path.clone(),
                source,
            })?;
            cipher.decrypt(&ciphertext, iv)?
        }
    };
    String::from_utf8(plaintext).map_err(|_| DecryptError::NotUtf8)
}
