//! Content digests using SHA-256
//!
//! Tags compute digests on-device with `sha256sum`, so the local side must use
//! the same algorithm and the same lowercase hex encoding to be comparable.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest as _, Sha256};

/// Read buffer size used when hashing streams
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A SHA-256 content digest (256-bit)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::finish(hasher)
    }

    /// Hash a stream until exhaustion, reading in bounded chunks
    ///
    /// # Errors
    /// Returns an error if the stream cannot be read to completion. No digest
    /// is produced for a partially read stream.
    pub fn from_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self::finish(hasher))
    }

    /// Hash a file by path
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or read
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    fn finish(hasher: Sha256) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// Convert to lowercase hex, the encoding `sha256sum` prints
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare against a hex digest produced elsewhere.
    ///
    /// Plain case-sensitive string equality, no normalization.
    #[must_use]
    pub fn matches_hex(&self, other: &str) -> bool {
        self.to_hex() == other
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentDigest({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
