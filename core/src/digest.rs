//! Content digests.
//!
//! A [`Digest`] is the sole identity of immutable content: the SHA-256 hash
//! of a byte sequence, rendered as `sha256:<64 hex chars>`. Two byte-identical
//! inputs always produce the same digest; a digest is never reused for
//! different content.

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{CaskError, Result};

/// Digest algorithm name. SHA-256 is the only supported algorithm.
const ALGORITHM: &str = "sha256";

/// Length of a SHA-256 digest in hex characters.
const HEX_LEN: usize = 64;

/// Chunk size for streaming digest computation.
const CHUNK_SIZE: usize = 64 * 1024;

/// A content digest: `sha256:<hex>`.
///
/// Stored in canonical string form so serialization is stable and the value
/// can key maps directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Compute the digest of a byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(format!("{}:{}", ALGORITHM, hex::encode(hasher.finalize())))
    }

    /// Compute the digest of a reader, streaming in fixed-size chunks.
    ///
    /// Never buffers the whole input; memory use is bounded regardless of
    /// input size. A read failure surfaces as [`CaskError::Io`], not as a
    /// hashing error.
    pub fn of_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest(format!(
            "{}:{}",
            ALGORITHM,
            hex::encode(hasher.finalize())
        )))
    }

    /// Parse a digest from its canonical string form.
    ///
    /// Rejects unknown algorithms and malformed hex.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (algo, hex_part) = s.split_once(':').ok_or_else(|| {
            CaskError::InvalidReference(format!("digest '{}' missing algorithm prefix", s))
        })?;

        if algo != ALGORITHM {
            return Err(CaskError::InvalidReference(format!(
                "unsupported digest algorithm '{}'",
                algo
            )));
        }
        if hex_part.len() != HEX_LEN
            || !hex_part.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(CaskError::InvalidReference(format!(
                "malformed digest hex in '{}'",
                s
            )));
        }

        Ok(Digest(s.to_string()))
    }

    /// The hex portion, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[ALGORITHM.len() + 1..]
    }

    /// The full canonical string, `sha256:<hex>`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An [`io::Write`] adapter that maintains running hash state.
///
/// Bytes written through it are hashed incrementally; [`DigestWriter::finalize`]
/// yields the digest and the total byte count. Used to hash content while it
/// streams to its destination without a second pass.
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> DigestWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Finish hashing, returning the digest, the total bytes written, and the
    /// inner writer.
    pub fn finalize(self) -> (Digest, u64, W) {
        let digest = Digest(format!(
            "{}:{}",
            ALGORITHM,
            hex::encode(self.hasher.finalize())
        ));
        (digest, self.bytes, self.inner)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
