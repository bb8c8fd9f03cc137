/// The master-key envelope file
///
/// Layout: the 5-byte signature "MRKF\0", then entries framed as a
/// little-endian u32 length followed by a nul-terminated name and the
/// ciphertext occupying the rest of the frame. Entries are AES-256-CBC
/// encrypted with a fixed IV; the file is written atomically and kept
/// owner-only.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::KeyringError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub(crate) const AES_IV: [u8; 16] = [
    0x39, 0x62, 0x9f, 0x52, 0x7f, 0x76, 0x9a, 0xae, 0xcd, 0xca, 0xf7, 0x04, 0x65, 0x8e, 0x5d,
    0x88,
];

const SIGNATURE: &[u8; 5] = b"MRKF\0";

fn cipher_key(key: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (slot, byte) in out.iter_mut().zip(key.bytes()) {
        *slot = byte;
    }
    out
}

pub(crate) fn encrypt(plaintext: &[u8], key: &str) -> Vec<u8> {
    Aes256CbcEnc::new(&cipher_key(key).into(), &AES_IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub(crate) fn decrypt(ciphertext: &[u8], key: &str) -> Result<Vec<u8>, KeyringError> {
    Aes256CbcDec::new(&cipher_key(key).into(), &AES_IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| KeyringError::DecryptionError)
}

/// Write-temp-then-rename so readers never observe a partial file.
pub(crate) fn write_atomically(path: &Path, contents: &[u8], private: bool) -> io::Result<()> {
    let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    fs::write(&temp_path, contents)?;
    if private {
        make_file_private(&temp_path)?;
    }
    fs::rename(&temp_path, path)?;
    if private {
        // re-tighten in case the destination pre-existed with wider bits
        make_file_private(path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_file_private(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn make_file_private(_path: &Path) -> io::Result<()> {
    Ok(())
}

pub struct MasterKeyFile {
    path: PathBuf,
    entries: Vec<(String, Vec<u8>)>,
}

impl MasterKeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
        }
    }

    pub fn load(&mut self) -> Result<(), KeyringError> {
        if self.path.is_dir() {
            return Err(KeyringError::InvalidMasterKeyFile(format!(
                "{} is a directory",
                self.path.display()
            )));
        }
        let data = fs::read(&self.path)?;
        if data.len() < SIGNATURE.len() || &data[..SIGNATURE.len()] != SIGNATURE {
            return Err(KeyringError::InvalidMasterKeyFile(
                self.path.display().to_string(),
            ));
        }

        self.entries.clear();
        let mut offset = SIGNATURE.len();
        while offset + 4 <= data.len() {
            let length = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            offset += 4;
            let Some(frame) = data.get(offset..offset + length) else {
                return Err(KeyringError::Other(format!(
                    "Error reading from master key file {}: truncated entry",
                    self.path.display()
                )));
            };
            offset += length;

            let name_end = frame.iter().position(|&b| b == 0).ok_or_else(|| {
                KeyringError::Other(format!(
                    "Error reading from master key file {}: unterminated entry name",
                    self.path.display()
                ))
            })?;
            let name = String::from_utf8_lossy(&frame[..name_end]).into_owned();
            let value = frame[name_end + 1..].to_vec();
            self.entries.push((name, value));
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), KeyringError> {
        let mut out = Vec::with_capacity(SIGNATURE.len() + 64 * self.entries.len());
        out.extend_from_slice(SIGNATURE);
        for (name, value) in &self.entries {
            let length = (name.len() + 1 + value.len()) as u32;
            out.extend_from_slice(&length.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.extend_from_slice(value);
        }
        write_atomically(&self.path, &out, true)?;
        Ok(())
    }

    /// Store `value` under `id`, encrypted with `key`.
    pub fn add(&mut self, id: impl Into<String>, value: &str, key: &str) {
        let ciphertext = encrypt(value.as_bytes(), key);
        self.entries.push((id.into(), ciphertext));
    }

    /// Decrypt the entry named `id` with `key`; `None` when absent.
    pub fn get(&self, id: &str, key: &str) -> Result<Option<String>, KeyringError> {
        for (name, ciphertext) in &self.entries {
            if name == id {
                let plaintext = decrypt(ciphertext, key)?;
                return Ok(Some(String::from_utf8_lossy(&plaintext).into_owned()));
            }
        }
        Ok(None)
    }

    pub fn entries(&self) -> &[(String, Vec<u8>)] {
        &self.entries
    }
}
