//! Binary identity hash (ABH)
//!
//! The digest of the running executable binds challenge responses to one
//! build artifact. It is computed once when the hasher is created and read
//! from any thread afterwards.

use std::fmt::Write as _;
use std::io::Read;
use std::path::{Path, PathBuf};

use aws_lc_rs::digest;
use thiserror::Error;
use tracing::debug;

const READ_CHUNK: usize = 64 * 1024;

/// Binary hashing errors
#[derive(Debug, Error)]
pub enum AbhError {
    /// The running executable could not be located
    #[error("failed to locate current executable: {0}")]
    Locate(std::io::Error),

    /// The executable could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// Executable path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

/// Source of the binary identity hash
#[cfg_attr(test, mockall::automock)]
pub trait BinaryHashSource: Send + Sync {
    /// SHA-256 of the agent binary
    fn binary_hash(&self) -> Vec<u8>;
}

/// Hashes an executable file once and caches the digest
#[derive(Debug, Clone)]
pub struct ExecutableHasher {
    path: PathBuf,
    hash: Vec<u8>,
}

impl ExecutableHasher {
    /// Hash the currently running executable
    pub fn current() -> Result<Self, AbhError> {
        let exe = std::env::current_exe().map_err(AbhError::Locate)?;
        let path = exe.canonicalize().unwrap_or(exe);
        Self::from_path(path)
    }

    /// Hash the executable at `path`
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, AbhError> {
        let path = path.into();
        let hash = hash_file(&path).map_err(|source| AbhError::Read {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "computed binary identity hash");
        Ok(Self { path, hash })
    }

    /// Path that was hashed
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lowercase hex rendering of the hash
    pub fn hex(&self) -> String {
        to_hex(&self.hash)
    }
}

impl BinaryHashSource for ExecutableHasher {
    fn binary_hash(&self) -> Vec<u8> {
        self.hash.clone()
    }
}

/// A precomputed binary hash
///
/// Used where the hash is known ahead of time, such as a gateway emulating
/// an agent build.
#[derive(Debug, Clone)]
pub struct FixedBinaryHash(pub Vec<u8>);

impl BinaryHashSource for FixedBinaryHash {
    fn binary_hash(&self) -> Vec<u8> {
        self.0.clone()
    }
}

fn hash_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut ctx = digest::Context::new(&digest::SHA256);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    Ok(ctx.finish().as_ref().to_vec())
}

/// Lowercase hex encoding
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}
