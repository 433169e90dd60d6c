//! Short and long content hashing.
//!
//! The short hash is a fast per-file fingerprint (FNV-1a 64-bit by default);
//! the long hash is cryptographic (SHA-256 by default) and keys the object
//! store and all composite hashes. The chosen identifiers are persisted in
//! the cache config and must match across runs.

use std::hash::Hasher;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortHashAlgo {
    #[default]
    Fnv64,
    /// SHA-256 truncated to 64 bits, for caches that want one hash family.
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LongHashAlgo {
    #[default]
    Sha256,
    Sha512,
}

impl std::str::FromStr for ShortHashAlgo {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fnv64" | "fnv" => Ok(ShortHashAlgo::Fnv64),
            "sha256" => Ok(ShortHashAlgo::Sha256),
            other => Err(EngineError::ConfigError(format!(
                "unknown short hash algorithm '{}'",
                other
            ))),
        }
    }
}

impl std::str::FromStr for LongHashAlgo {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(LongHashAlgo::Sha256),
            "sha512" => Ok(LongHashAlgo::Sha512),
            other => Err(EngineError::ConfigError(format!(
                "unknown long hash algorithm '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ShortHashAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShortHashAlgo::Fnv64 => write!(f, "fnv64"),
            ShortHashAlgo::Sha256 => write!(f, "sha256"),
        }
    }
}

impl std::fmt::Display for LongHashAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LongHashAlgo::Sha256 => write!(f, "sha256"),
            LongHashAlgo::Sha512 => write!(f, "sha512"),
        }
    }
}

pub fn short_hash(algo: ShortHashAlgo, bytes: &[u8]) -> String {
    match algo {
        ShortHashAlgo::Fnv64 => {
            let mut hasher = fnv::FnvHasher::default();
            hasher.write(bytes);
            format!("{:016x}", hasher.finish())
        }
        ShortHashAlgo::Sha256 => {
            let digest = Sha256::digest(bytes);
            hex(&digest[..8])
        }
    }
}

pub fn long_hash(algo: LongHashAlgo, bytes: &[u8]) -> String {
    match algo {
        LongHashAlgo::Sha256 => hex(&Sha256::digest(bytes)),
        LongHashAlgo::Sha512 => hex(&Sha512::digest(bytes)),
    }
}

/// Fingerprint a file by streaming its contents through the short hash.
pub fn file_fingerprint(algo: ShortHashAlgo, path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = [0u8; 8192];
    match algo {
        ShortHashAlgo::Fnv64 => {
            let mut hasher = fnv::FnvHasher::default();
            loop {
                let count = file.read(&mut buffer)?;
                if count == 0 {
                    break;
                }
                hasher.write(&buffer[..count]);
            }
            Ok(format!("{:016x}", hasher.finish()))
        }
        ShortHashAlgo::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let count = file.read(&mut buffer)?;
                if count == 0 {
                    break;
                }
                hasher.update(&buffer[..count]);
            }
            let digest = hasher.finalize();
            Ok(hex(&digest[..8]))
        }
    }
}

/// Deterministic per-target seed: the first 64 bits of
/// `long_hash(root_seed || target_name)`.
pub fn seed_for(algo: LongHashAlgo, root_seed: u64, target: &str) -> u64 {
    let mut bytes = root_seed.to_le_bytes().to_vec();
    bytes.extend_from_slice(target.as_bytes());
    let digest = long_hash(algo, &bytes);
    u64::from_str_radix(&digest[..16], 16).expect("hex digest")
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
