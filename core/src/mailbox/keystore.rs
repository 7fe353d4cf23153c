/*
 * keystore.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte, a cross-platform email client.
 *
 * Tagliacarte is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Tagliacarte is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Tagliacarte.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Passphrase-protected encrypted container for mailbox credentials,
//! long-term signing keys, and socket snapshots.
//!
//! File layout: `salt[16] || nonce[16] || tag[16] || ciphertext`. The key is
//! derived with Argon2id (time=16, memory=102400 KiB, parallelism=8,
//! output=32 bytes); the plaintext JSON object is sealed with AES-256-GCM
//! using a 16-byte nonce (one-shot `aead::Aead::encrypt`, tag split out of
//! the combined output so it can be stored ahead of the ciphertext rather
//! than appended to it).

use super::endpoint::Endpoint;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AesGcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

type Aes256Gcm16 = AesGcm<aes::Aes256, U16>;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;
const ARGON2_MEMORY_KIB: u32 = 102_400;
const ARGON2_TIME: u32 = 16;
const ARGON2_PARALLELISM: u32 = 8;
const ARGON2_OUTPUT_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed key store file: {0}")]
    Malformed(String),
    #[error("wrong passphrase or corrupted key store")]
    Decrypt,
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A stored login credential (email account).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Plaintext contents of the key store, serialized as JSON before sealing.
/// Endpoint-pair-keyed maps are stored as association lists because JSON
/// object keys must be strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyStoreData {
    pub email_credentials: HashMap<String, Credential>,
    pub local_keys: Vec<((Endpoint, Endpoint), Vec<u8>)>,
    pub remote_keys: Vec<((Endpoint, Endpoint), Vec<u8>)>,
    pub socket_dumps: Vec<((Endpoint, Endpoint), Vec<u8>)>,
}

impl KeyStoreData {
    pub fn local_key(&self, pair: &(Endpoint, Endpoint)) -> Option<&[u8]> {
        self.local_keys
            .iter()
            .find(|(p, _)| p == pair)
            .map(|(_, b)| b.as_slice())
    }

    pub fn remote_key(&self, pair: &(Endpoint, Endpoint)) -> Option<&[u8]> {
        self.remote_keys
            .iter()
            .find(|(p, _)| p == pair)
            .map(|(_, b)| b.as_slice())
    }

    pub fn set_local_key(&mut self, pair: (Endpoint, Endpoint), bytes: Vec<u8>) {
        self.local_keys.retain(|(p, _)| p != &pair);
        self.local_keys.push((pair, bytes));
    }

    pub fn set_remote_key(&mut self, pair: (Endpoint, Endpoint), bytes: Vec<u8>) {
        self.remote_keys.retain(|(p, _)| p != &pair);
        self.remote_keys.push((pair, bytes));
    }

    pub fn set_socket_dump(&mut self, pair: (Endpoint, Endpoint), bytes: Vec<u8>) {
        self.socket_dumps.retain(|(p, _)| p != &pair);
        self.socket_dumps.push((pair, bytes));
    }

    pub fn take_socket_dump(&mut self, pair: &(Endpoint, Endpoint)) -> Option<Vec<u8>> {
        let idx = self.socket_dumps.iter().position(|(p, _)| p == pair)?;
        Some(self.socket_dumps.remove(idx).1)
    }
}

fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN]) -> Result<[u8; ARGON2_OUTPUT_LEN], KeyStoreError> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME,
        ARGON2_PARALLELISM,
        Some(ARGON2_OUTPUT_LEN),
    )
    .map_err(|e| KeyStoreError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; ARGON2_OUTPUT_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| KeyStoreError::Kdf(e.to_string()))?;
    Ok(key)
}

/// Seal `data` with `passphrase`, returning the full file contents.
pub fn seal(data: &KeyStoreData, passphrase: &str) -> Result<Vec<u8>, KeyStoreError> {
    let plaintext = serde_json::to_vec(data)?;

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm16::new_from_slice(&key).expect("32-byte key");
    let nonce = Nonce::<U16>::from_slice(&nonce_bytes);
    let combined = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|_| KeyStoreError::Decrypt)?;
    let (ciphertext, tag) = combined.split_at(combined.len() - TAG_LEN);

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Open a sealed key store file with `passphrase`.
pub fn open(bytes: &[u8], passphrase: &str) -> Result<KeyStoreData, KeyStoreError> {
    if bytes.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(KeyStoreError::Malformed("file too short".into()));
    }
    let salt: [u8; SALT_LEN] = bytes[..SALT_LEN].try_into().unwrap();
    let nonce_bytes = &bytes[SALT_LEN..SALT_LEN + NONCE_LEN];
    let tag = &bytes[SALT_LEN + NONCE_LEN..SALT_LEN + NONCE_LEN + TAG_LEN];
    let ciphertext = &bytes[SALT_LEN + NONCE_LEN + TAG_LEN..];

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm16::new_from_slice(&key).expect("32-byte key");
    let nonce = Nonce::<U16>::from_slice(nonce_bytes);

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    let plaintext = cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|_| KeyStoreError::Decrypt)?;
    let data = serde_json::from_slice(&plaintext)?;
    Ok(data)
}

/// Load the key store at `path`, or return an empty one if it doesn't exist
/// yet (the caller will `save` it once credentials/keys are added).
pub fn load_or_default(path: &Path, passphrase: &str) -> Result<KeyStoreData, KeyStoreError> {
    match fs::read(path) {
        Ok(bytes) => open(&bytes, passphrase),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(KeyStoreData::default()),
        Err(e) => Err(e.into()),
    }
}

/// Save the key store to `path` with 0600 permissions (where supported).
pub fn save(path: &Path, data: &KeyStoreData, passphrase: &str) -> Result<(), KeyStoreError> {
    let bytes = seal(data, passphrase)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path)?;
    use std::io::Write;
    file.write_all(&bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trip() {
        let mut data = KeyStoreData::default();
        data.email_credentials.insert(
            "alice@example.com".into(),
            Credential {
                username: "alice".into(),
                password: "hunter2".into(),
            },
        );
        let pair = (Endpoint::new("a@x.com", "1"), Endpoint::new("b@x.com", "1"));
        data.set_local_key(pair.clone(), vec![1, 2, 3]);
        data.set_socket_dump(pair.clone(), vec![9, 9, 9]);

        let bytes = seal(&data, "correct horse battery staple").unwrap();
        assert!(bytes.len() > SALT_LEN + NONCE_LEN + TAG_LEN);

        let reopened = open(&bytes, "correct horse battery staple").unwrap();
        assert_eq!(reopened.local_key(&pair), Some(&[1u8, 2, 3][..]));
        assert!(reopened.email_credentials.contains_key("alice@example.com"));
    }

    #[test]
    fn wrong_passphrase_fails() {
        let data = KeyStoreData::default();
        let bytes = seal(&data, "right").unwrap();
        assert!(matches!(open(&bytes, "wrong"), Err(KeyStoreError::Decrypt)));
    }
}
