/// Operator secret storage
///
/// Secrets live in the keyring file, encrypted with a master key. The
/// master key itself sits in the master-key envelope, encrypted with a
/// scramble that is stored in the keyring file's plaintext header, so
/// neither file alone is enough to recover a secret. One master-key file
/// can serve several keyrings; entries are keyed by the keyring's absolute
/// path.
pub mod master_key;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::KeyringError;
use crate::utils::generate_strong_password;
use master_key::MasterKeyFile;

const KEY_LENGTH: usize = 32;
const SIGNATURE: &[u8; 4] = b"KRNG";

/// The keyring file: a plaintext scramble header plus the encrypted
/// name -> secret records.
pub struct KeyringFile {
    header: String,
    entries: BTreeMap<String, String>,
}

impl Default for KeyringFile {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyringFile {
    pub fn new() -> Self {
        Self {
            header: String::new(),
            entries: BTreeMap::new(),
        }
    }

    pub fn set_header(&mut self, header: impl Into<String>) {
        self.header = header.into();
    }

    pub fn store(&mut self, name: impl Into<String>, secret: impl Into<String>) {
        self.entries.insert(name.into(), secret.into());
    }

    pub fn fetch(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Read just the scramble header, without any key.
    pub fn read_header(path: &Path) -> Result<String, KeyringError> {
        let data = fs::read(path)?;
        if data.len() < SIGNATURE.len() + 4 || &data[..SIGNATURE.len()] != SIGNATURE {
            return Err(KeyringError::Other(format!(
                "Invalid keyring file {}",
                path.display()
            )));
        }
        let header_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let header = data
            .get(8..8 + header_len)
            .ok_or_else(|| {
                KeyringError::Other(format!("Invalid keyring file {}", path.display()))
            })?;
        Ok(String::from_utf8_lossy(header).into_owned())
    }

    pub fn load(path: &Path, key: &str) -> Result<Self, KeyringError> {
        let data = fs::read(path)?;
        if data.len() < SIGNATURE.len() + 4 || &data[..SIGNATURE.len()] != SIGNATURE {
            return Err(KeyringError::Other(format!(
                "Invalid keyring file {}",
                path.display()
            )));
        }
        let header_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let header_end = 8 + header_len;
        if data.len() < header_end {
            return Err(KeyringError::Other(format!(
                "Invalid keyring file {}",
                path.display()
            )));
        }
        let header = String::from_utf8_lossy(&data[8..header_end]).into_owned();

        let mut entries = BTreeMap::new();
        if data.len() > header_end {
            let plaintext = master_key::decrypt(&data[header_end..], key)?;
            let mut offset = 0usize;
            while offset + 4 <= plaintext.len() {
                let length = u32::from_le_bytes([
                    plaintext[offset],
                    plaintext[offset + 1],
                    plaintext[offset + 2],
                    plaintext[offset + 3],
                ]) as usize;
                offset += 4;
                let Some(frame) = plaintext.get(offset..offset + length) else {
                    return Err(KeyringError::Other(format!(
                        "Invalid keyring file {}: truncated record",
                        path.display()
                    )));
                };
                offset += length;
                let name_end = frame.iter().position(|&b| b == 0).ok_or_else(|| {
                    KeyringError::Other(format!(
                        "Invalid keyring file {}: unterminated record name",
                        path.display()
                    ))
                })?;
                entries.insert(
                    String::from_utf8_lossy(&frame[..name_end]).into_owned(),
                    String::from_utf8_lossy(&frame[name_end + 1..]).into_owned(),
                );
            }
        }

        Ok(Self { header, entries })
    }

    pub fn save(&self, path: &Path, key: &str) -> Result<(), KeyringError> {
        let mut records = Vec::new();
        for (name, secret) in &self.entries {
            let length = (name.len() + 1 + secret.len()) as u32;
            records.extend_from_slice(&length.to_le_bytes());
            records.extend_from_slice(name.as_bytes());
            records.push(0);
            records.extend_from_slice(secret.as_bytes());
        }
        let ciphertext = master_key::encrypt(&records, key);

        let mut out = Vec::with_capacity(8 + self.header.len() + ciphertext.len());
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&(self.header.len() as u32).to_le_bytes());
        out.extend_from_slice(self.header.as_bytes());
        out.extend_from_slice(&ciphertext);

        master_key::write_atomically(path, &out, true)?;
        Ok(())
    }
}

/// Owns the keyring, its path and its key; injected into whatever needs
/// secrets instead of living in process-wide slots.
pub struct KeyringManager {
    keyring: KeyringFile,
    path: PathBuf,
    key: String,
}

impl KeyringManager {
    /// Open (or, with `create_if_needed`, create) the keyring/master-key
    /// file pair.
    pub fn init(
        keyring_path: &Path,
        master_key_path: &Path,
        create_if_needed: bool,
    ) -> Result<Self, KeyringError> {
        let keyring_id = absolute_path(keyring_path).display().to_string();

        let mut master_file = MasterKeyFile::new(master_key_path);
        match master_file.load() {
            Ok(()) => {}
            Err(KeyringError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound && create_if_needed => {}
            Err(e) => return Err(e),
        }

        let mut master_scramble = match KeyringFile::read_header(keyring_path) {
            Ok(header) if header.is_empty() => {
                return Err(KeyringError::Other(format!(
                    "Keyring file '{}' was created in an old version and needs to be \
                     recreated. Please delete and bootstrap again.",
                    keyring_path.display()
                )))
            }
            Ok(header) => header,
            Err(KeyringError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound && create_if_needed =>
            {
                String::new()
            }
            Err(e) => return Err(e),
        };

        let mut master_key = if master_scramble.is_empty() {
            String::new()
        } else {
            master_file
                .get(&keyring_id, &master_scramble)?
                .unwrap_or_default()
        };

        let mut created_master_key = false;
        if master_key.is_empty() {
            if !create_if_needed {
                return Err(KeyringError::Other(format!(
                    "Master key for keyring at '{}' could not be read",
                    keyring_path.display()
                )));
            }
            master_key = generate_strong_password(KEY_LENGTH);
            master_scramble = generate_strong_password(KEY_LENGTH);
            master_file.add(keyring_id, &master_key, &master_scramble);
            created_master_key = true;
        }

        let (keyring, existed) = match KeyringFile::load(keyring_path, &master_key) {
            Ok(keyring) => (keyring, true),
            Err(e) => {
                if !create_if_needed {
                    return Err(e);
                }
                let mut keyring = KeyringFile::new();
                keyring.set_header(&master_scramble);
                (keyring, false)
            }
        };

        let manager = Self {
            keyring,
            path: keyring_path.to_path_buf(),
            key: master_key,
        };
        if !existed {
            manager.flush()?;
        }
        if created_master_key {
            master_file.save()?;
        }
        Ok(manager)
    }

    /// Password for `name`; an absent entry is reported and resolves to
    /// an empty secret.
    pub fn fetch_or_empty(&self, name: &str) -> String {
        match self.keyring.fetch(name) {
            Some(secret) => secret.to_string(),
            None => {
                warn!("No keyring entry for '{name}', using an empty password");
                String::new()
            }
        }
    }

    pub fn fetch(&self, name: &str) -> Option<&str> {
        self.keyring.fetch(name)
    }

    pub fn store(&mut self, name: impl Into<String>, secret: impl Into<String>) {
        self.keyring.store(name, secret);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.keyring.remove(name)
    }

    /// Persist the keyring file.
    pub fn flush(&self) -> Result<(), KeyringError> {
        self.keyring.save(&self.path, &self.key)
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring");

        let mut keyring = KeyringFile::new();
        keyring.set_header("the-scramble");
        keyring.store("metadata_user", "s3cret!");
        keyring.store("another_user", "hunter2");
        keyring.save(&path, "master-key").unwrap();

        let reloaded = KeyringFile::load(&path, "master-key").unwrap();
        assert_eq!(reloaded.header, "the-scramble");
        assert_eq!(reloaded.fetch("metadata_user"), Some("s3cret!"));
        assert_eq!(reloaded.fetch("another_user"), Some("hunter2"));
        assert_eq!(reloaded.fetch("missing"), None);
    }

    #[test]
    fn test_read_header_needs_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring");

        let mut keyring = KeyringFile::new();
        keyring.set_header("scramble-without-key");
        keyring.store("user", "pw");
        keyring.save(&path, "master-key").unwrap();

        assert_eq!(
            KeyringFile::read_header(&path).unwrap(),
            "scramble-without-key"
        );
    }

    #[test]
    fn test_load_with_wrong_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring");

        let mut keyring = KeyringFile::new();
        keyring.set_header("scramble");
        keyring.store("user", "pw");
        keyring.save(&path, "master-key").unwrap();

        match KeyringFile::load(&path, "not-the-master-key") {
            Err(_) => {}
            Ok(reloaded) => assert_ne!(reloaded.fetch("user"), Some("pw")),
        }
    }

    #[test]
    fn test_manager_creates_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let keyring_path = dir.path().join("keyring");
        let master_path = dir.path().join("mrkf");

        let mut manager = KeyringManager::init(&keyring_path, &master_path, true).unwrap();
        manager.store("metadata_user", "the-password");
        manager.flush().unwrap();

        // both files exist now
        assert!(keyring_path.exists());
        assert!(master_path.exists());

        // a fresh manager recovers the secret through the file pair
        let reopened = KeyringManager::init(&keyring_path, &master_path, false).unwrap();
        assert_eq!(reopened.fetch("metadata_user"), Some("the-password"));
        assert_eq!(reopened.fetch_or_empty("metadata_user"), "the-password");
        assert_eq!(reopened.fetch_or_empty("nobody"), "");
    }

    #[test]
    fn test_manager_refuses_missing_files_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let result = KeyringManager::init(
            &dir.path().join("keyring"),
            &dir.path().join("mrkf"),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_manager_remove() {
        let dir = tempfile::tempdir().unwrap();
        let keyring_path = dir.path().join("keyring");
        let master_path = dir.path().join("mrkf");

        let mut manager = KeyringManager::init(&keyring_path, &master_path, true).unwrap();
        manager.store("user", "pw");
        assert!(manager.remove("user"));
        assert!(!manager.remove("user"));
        assert_eq!(manager.fetch("user"), None);
    }
}
