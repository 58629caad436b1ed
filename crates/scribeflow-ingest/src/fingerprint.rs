//! Content fingerprints in the `sha256:<hex>` form recorded by manifests.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use scribeflow_core::Result;
use sha2::{Digest, Sha256};

const PREFIX: &str = "sha256:";
const READ_BUFFER: usize = 64 * 1024;

/// Fingerprint an in-memory buffer.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}{}", PREFIX, hex::encode(hasher.finalize()))
}

/// Fingerprint a file by streaming it through SHA-256.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{}{}", PREFIX, hex::encode(hasher.finalize())))
}
