//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use nevermail_search::core::cipher::{Sealed, KEY_SIZE};
use nevermail_search::core::content::seal_entry;
use nevermail_search::{
    AesGcmCipher, Cipher, DecryptError, EncryptError, IndexEntry, IndexHandle, IndexLifecycle,
    SearchConfig, UserId,
};

/// Bodies starting with this prefix cannot be decrypted by [`TestCipher`].
pub const POISON: &str = "poison";

/// Real AES-GCM, except that plaintexts starting with [`POISON`] fail to decrypt.
pub struct TestCipher {
    inner: AesGcmCipher,
}

impl TestCipher {
    pub fn new() -> Self {
        TestCipher {
            inner: AesGcmCipher::new(&[42u8; KEY_SIZE]),
        }
    }

    pub fn shared() -> Arc<dyn Cipher> {
        Arc::new(Self::new())
    }
}

impl Cipher for TestCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, EncryptError> {
        self.inner.encrypt(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let plaintext = self.inner.decrypt(ciphertext, iv)?;
        if plaintext.starts_with(POISON.as_bytes()) {
            return Err(DecryptError::Failed);
        }
        Ok(plaintext)
    }
}

pub fn user(name: &str) -> UserId {
    UserId::new(name).expect("valid user id")
}

/// `m007` style ids sort the same way as their times.
pub fn message_id(time: i64) -> String {
    format!("m{time:03}")
}

/// Temporary index directory.
pub struct IndexDir {
    temp_dir: TempDir,
}

impl IndexDir {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self { temp_dir }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn lifecycle(&self) -> IndexLifecycle {
        IndexLifecycle::new(self.path(), Duration::from_secs(1))
    }

    pub fn config(&self) -> SearchConfig {
        SearchConfig {
            index_dir: self.path().to_path_buf(),
            ..SearchConfig::default()
        }
    }

    pub fn content_dir(&self, user_id: &UserId) -> PathBuf {
        self.lifecycle().content_dir_for(user_id)
    }

    /// Handle on a standalone index file named after `user_id`.
    pub fn open(&self, user_id: &UserId) -> IndexHandle {
        let path = self.path().join(format!("{user_id}.sqlite3"));
        IndexHandle::open(user_id.clone(), &path, Duration::from_secs(1)).expect("open index")
    }
}

/// Builder for sealed index entries.
pub struct EntryBuilder {
    entry: IndexEntry,
    body: Option<String>,
}

impl EntryBuilder {
    pub fn new(time: i64) -> Self {
        Self {
            entry: IndexEntry::new(message_id(time), time),
            body: None,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn labels(mut self, labels: &[&str]) -> Self {
        self.entry.label_ids = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn build(self, cipher: &dyn Cipher, content_dir: &Path) -> IndexEntry {
        match self.body {
            Some(body) => seal_entry(self.entry, &body, cipher, 64 * 1024, content_dir)
                .expect("seal entry"),
            None => self.entry,
        }
    }
}

/// Insert entries with times `1..=count`; `body(time)` gives each body.
pub async fn seed(
    handle: &IndexHandle,
    cipher: &dyn Cipher,
    content_dir: &Path,
    count: i64,
    body: impl Fn(i64) -> String,
) {
    for time in 1..=count {
        let entry = EntryBuilder::new(time).body(body(time)).build(cipher, content_dir);
        handle.insert(entry).await.expect("insert entry");
    }
}

/// [`TestCipher`] that runs `hook` each time it decrypts `trigger`, letting a
/// test act on the cache while a build is in flight.
pub struct HookCipher {
    inner: TestCipher,
    trigger: String,
    hook: Box<dyn Fn() + Send + Sync>,
}

impl HookCipher {
    pub fn new(trigger: impl Into<String>, hook: impl Fn() + Send + Sync + 'static) -> Self {
        HookCipher {
            inner: TestCipher::new(),
            trigger: trigger.into(),
            hook: Box::new(hook),
        }
    }
}

impl Cipher for HookCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, EncryptError> {
        self.inner.encrypt(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let plaintext = self.inner.decrypt(ciphertext, iv)?;
        if plaintext == self.trigger.as_bytes() {
            (self.hook)();
        }
        Ok(plaintext)
    }
}
