//! Streaming SHA-512 content hashing.
//!
//! Digests are rendered as URL-safe base64 without padding so they can be
//! used directly as file names in the page cache and as index node ids.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha512};

use crate::error::Result;

const CHUNK_SIZE: usize = 4096;

/// Hash a file's bytes in fixed-size chunks.
///
/// Fails only when the file cannot be opened or read.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha512::new();
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }

    Ok(URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

/// Hash an in-memory buffer with the same encoding as [`hash_file`].
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
