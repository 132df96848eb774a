use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::IndexError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Content fingerprint of a file: lowercase hex SHA-256 of its full bytes
/// plus the number of bytes hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub sha256: String,
    pub size_bytes: u64,
}

/// Streaming SHA-256 over a file's contents. Identical bytes always give the
/// same hash, whatever the path.
pub fn hash_file(path: &Path) -> Result<ContentHash, IndexError> {
    let file = File::open(path).map_err(|e| IndexError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut size_bytes = 0u64;
    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| IndexError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size_bytes += bytes_read as u64;
    }

    Ok(ContentHash {
        sha256: format!("{:x}", hasher.finalize()),
        size_bytes,
    })
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
