//! The identifier value type and its modular arithmetic.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::cmp::Ordering;
use std::fmt;

/// A point on the ring: an immutable big-endian byte string read as an
/// unsigned integer modulo 2^(8L), where L is its length in bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Id(Box<[u8]>);

impl Id {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Id(bytes.into())
    }

    /// The additive identity of the given width.
    pub fn zero(len: usize) -> Self {
        Id(vec![0u8; len].into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Zero-extends to `len` bytes (prepending zeroes); truncation keeps the
    /// least significant bytes, which is the modulo-2^(8·len) reduction.
    fn padded(&self, len: usize) -> Box<[u8]> {
        let mut out = vec![0u8; len];
        if self.0.len() >= len {
            out.copy_from_slice(&self.0[self.0.len() - len..]);
        } else {
            out[len - self.0.len()..].copy_from_slice(&self.0);
        }
        out.into()
    }

    /// `(self + other) mod 2^(8L)` with L the wider operand's length.
    /// Carry propagates byte-wise from the least significant end; overflow
    /// past the most significant byte is discarded.
    pub fn add(&self, other: &Id) -> Id {
        let len = self.0.len().max(other.0.len());
        let a = self.padded(len);
        let b = other.padded(len);
        let mut out = vec![0u8; len];
        let mut carry = 0u16;
        for i in (0..len).rev() {
            let sum = a[i] as u16 + b[i] as u16 + carry;
            out[i] = (sum & 0xFF) as u8;
            carry = sum >> 8;
        }
        Id(out.into())
    }

    /// `(self - other) mod 2^(8L)`, as addition of the two's complement.
    pub fn sub(&self, other: &Id) -> Id {
        let len = self.0.len().max(other.0.len());
        let negated = other.negated(len);
        Id(self.padded(len)).add(&negated)
    }

    /// Two's complement of `other` at the given width: `(x ^ 0xFF..) + 1`.
    fn negated(&self, len: usize) -> Id {
        let padded = self.padded(len);
        let mut flipped = vec![0u8; len];
        for i in 0..len {
            flipped[i] = !padded[i];
        }
        let mut one = vec![0u8; len];
        one[len - 1] = 1;
        Id(flipped.into()).add(&Id(one.into()))
    }

    /// Unsigned comparison after zero-padding the shorter operand.
    pub fn compare(&self, other: &Id) -> Ordering {
        let len = self.0.len().max(other.0.len());
        self.padded(len).cmp(&other.padded(len))
    }

    /// True iff `self` lies in the half-open circular interval `[from, to)`,
    /// computed as `(self - from) mod 2^(8L) < (to - from) mod 2^(8L)`.
    /// `from == to` denotes the empty interval, never the full circle.
    pub fn between(&self, from: &Id, to: &Id) -> bool {
        self.sub(from).compare(&to.sub(from)) == Ordering::Less
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(text: &str) -> Result<Id, base64::DecodeError> {
        Ok(Id(BASE64.decode(text)?.into()))
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id(")?;
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}
