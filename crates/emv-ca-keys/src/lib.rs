//! EMV CA Keys - Certificate Authority public key management
//!
//! Payment scheme CA keys are distributed as tab-separated text, one key per
//! line:
//!
//! ```text
//! # Scheme  Exponent  Index  RID         Modulus  KeyLength  Hash
//! Visa      03        92     A000000003  B83E...  176        429C...
//! ```
//!
//! The key file is not bundled; point [`CaKeyStore::load`] at a copy of it.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use rsa::{BigUint, RsaPublicKey};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CaKeyError {
    #[error("failed to read CA key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One CA public key as listed in the key file
#[derive(Debug, Clone)]
pub struct CaPublicKey {
    pub scheme: String,
    pub rid: Vec<u8>,
    pub index: u8,
    pub key: RsaPublicKey,
}

/// CA keys indexed by RID and CA public key index
#[derive(Debug, Clone, Default)]
pub struct CaKeyStore {
    keys: HashMap<(Vec<u8>, u8), CaPublicKey>,
}

impl CaKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a key file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CaKeyError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| CaKeyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let store: CaKeyStore = contents.parse().unwrap_or_default();
        debug!(path = %path.display(), keys = store.len(), "Loaded CA public keys");
        Ok(store)
    }

    pub fn insert(&mut self, key: CaPublicKey) {
        self.keys.insert((key.rid.clone(), key.index), key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get CA (Certificate Authority) public key by RID and index
    ///
    /// # Arguments
    /// * `rid` - Registered Application Provider Identifier (5 bytes)
    /// * `ca_index` - CA Public Key Index (1 byte, tag 8F)
    pub fn get(&self, rid: &[u8], ca_index: u8) -> Option<&RsaPublicKey> {
        self.keys.get(&(rid.to_vec(), ca_index)).map(|k| &k.key)
    }

    /// Get all available CA public keys for a given RID, ordered by index
    pub fn keys_for_rid(&self, rid: &[u8]) -> Vec<&CaPublicKey> {
        let mut keys: Vec<&CaPublicKey> =
            self.keys.values().filter(|k| k.rid == rid).collect();
        keys.sort_by_key(|k| k.index);
        keys
    }
}

impl FromStr for CaKeyStore {
    type Err = std::convert::Infallible;

    /// Lines that do not parse are skipped with a warning
    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        let mut store = CaKeyStore::new();

        for (line_no, line) in contents.lines().enumerate() {
            // Skip empty lines and comments
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some(key) => store.insert(key),
                None => warn!(line = line_no + 1, "Skipping unparseable CA key line"),
            }
        }

        Ok(store)
    }
}

fn parse_line(line: &str) -> Option<CaPublicKey> {
    let parts: Vec<&str> = line.split('\t').map(str::trim).collect();
    if parts.len() < 5 {
        return None;
    }

    // Format: Scheme, Exponent, Index, RID, Modulus, KeyLength, Hash
    let index = u8::from_str_radix(parts[2], 16).ok()?;
    let rid = hex::decode(parts[3]).ok()?;
    let exponent = BigUint::parse_bytes(parts[1].as_bytes(), 16)?;
    let modulus = BigUint::parse_bytes(parts[4].as_bytes(), 16)?;
    let key = RsaPublicKey::new(modulus, exponent).ok()?;

    Some(CaPublicKey {
        scheme: parts[0].to_string(),
        rid,
        index,
        key,
    })
}

/// Common RIDs for major payment schemes
pub mod rids {
    /// Visa RID
    pub const VISA: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x03];

    /// Mastercard RID
    pub const MASTERCARD: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x04];

    /// American Express RID
    pub const AMEX: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x02];

    /// Discover RID
    pub const DISCOVER: &[u8] = &[0xA0, 0x00, 0x00, 0x01, 0x52];

    /// JCB RID
    pub const JCB: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x65];

    /// UnionPay RID
    pub const UNIONPAY: &[u8] = &[0xA0, 0x00, 0x00, 0x03, 0x33];
}
