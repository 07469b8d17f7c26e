//! Identifier production: hashing, wire decoding, and reference points.

use super::types::Id;
use anyhow::{anyhow, Result};
use sha1::{Digest, Sha1};

/// Pluggable identifier source. Fixes the identifier width L and produces
/// identifiers from raw bytes, from wire text, and from ring geometry.
pub trait IdFactory: Send + Sync {
    /// Identifier width in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Digests arbitrary bytes into an identifier.
    fn hash(&self, data: &[u8]) -> Id;

    /// Parses a base64 wire identifier, enforcing the factory's width.
    fn decode(&self, text: &str) -> Result<Id> {
        let id = Id::from_base64(text).map_err(|e| anyhow!("bad identifier encoding: {e}"))?;
        if id.len() != self.len() {
            return Err(anyhow!(
                "identifier width {} does not match ring width {}",
                id.len(),
                self.len()
            ));
        }
        Ok(id)
    }

    /// `2^(8L) >> n`, the ring diameter divided by 2^n. Used for finger
    /// placement and coverage thresholds. A negative `n` counts from the
    /// small end: `reference_point(-1)` is 1, `reference_point(-2)` is 2,
    /// and so on.
    fn reference_point(&self, n: i32) -> Id {
        let len = self.len();
        let bits = len as i32 * 8;
        let n = if n < 0 { bits + n + 1 } else { n };
        // One extra byte so the full diameter 2^(8L) is representable before
        // the shift; the result is then reduced back to L bytes.
        let mut buf = vec![0u8; len + 1];
        buf[0] = 0x01;
        let whole = (n / 8) as usize;
        let rem = n % 8;
        if whole < buf.len() {
            for i in (0..buf.len()).rev() {
                let mut b = if i >= whole { buf[i - whole] } else { 0 };
                if rem > 0 {
                    let upper = if i >= whole + 1 { buf[i - whole - 1] } else { 0 };
                    b = (b >> rem) | (upper << (8 - rem));
                }
                buf[i] = b;
            }
        } else {
            buf.fill(0);
        }
        Id::from_bytes(&buf[1..])
    }
}

/// The default identifier source: 20-byte SHA-1 digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha1Factory;

impl Sha1Factory {
    pub const LEN: usize = 20;
}

impl IdFactory for Sha1Factory {
    fn len(&self) -> usize {
        Self::LEN
    }

    fn hash(&self, data: &[u8]) -> Id {
        // Empty input maps to the zero identifier rather than the digest of
        // the empty string.
        if data.is_empty() {
            return Id::zero(Self::LEN);
        }
        let mut hasher = Sha1::new();
        hasher.update(data);
        Id::from_bytes(&hasher.finalize())
    }
}
