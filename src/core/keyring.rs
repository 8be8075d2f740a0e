use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::core::cipher::{AesGcmCipher, KEY_SIZE};
use crate::core::models::UserId;

const SERVICE: &str = "nevermail-search";

fn key_id(user_id: &UserId) -> String {
    format!("index-key@{user_id}")
}

fn entry(user_id: &UserId) -> Result<keyring::Entry, String> {
    let key = key_id(user_id);
    keyring::Entry::new(SERVICE, &key).map_err(|e| {
        log::error!("keyring Entry::new failed for key={key:?}: {e}");
        format!("keyring error: {e}")
    })
}

/// Fetch the user's index key, generating and storing one on first use.
pub fn get_or_create_index_key(user_id: &UserId) -> Result<[u8; KEY_SIZE], String> {
    let entry = entry(user_id)?;
    log::debug!("keyring GET: service={SERVICE:?} user={user_id}");
    match entry.get_password() {
        Ok(encoded) => decode_key(&encoded),
        Err(keyring::Error::NoEntry) => {
            log::info!("No index key for {user_id}, generating one");
            let key = AesGcmCipher::generate_key();
            entry.set_password(&BASE64.encode(key)).map_err(|e| {
                log::error!("keyring set_password failed for user={user_id}: {e}");
                format!("keyring set: {e}")
            })?;
            Ok(key)
        }
        Err(e) => {
            log::warn!("keyring get_password failed for user={user_id}: {e}");
            Err(format!("keyring get: {e}"))
        }
    }
}

pub fn delete_index_key(user_id: &UserId) -> Result<(), String> {
    let entry = entry(user_id)?;
    log::debug!("keyring DELETE: service={SERVICE:?} user={user_id}");
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => {
            log::warn!("keyring delete failed for user={user_id}: {e}");
            Err(format!("keyring delete: {e}"))
        }
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_SIZE], String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| format!("stored index key is not base64: {e}"))?;
    <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
        .map_err(|_| format!("stored index key has {} bytes", bytes.len()))
}
