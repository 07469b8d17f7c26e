//! Circular Identifier Space
//!
//! Fixed-length big-endian identifiers interpreted as unsigned integers
//! modulo 2^(8L), arranged on a circle. All arithmetic is byte-wise with
//! carry/borrow propagation; interval membership is computed via subtraction
//! and unsigned comparison so exactness is preserved at the modulus boundary.
//!
//! Identifiers are produced by a pluggable hash factory (`IdFactory`); the
//! default digests a canonical `"host:port"` string with SHA-1.

pub mod factory;
pub mod types;

pub use factory::{IdFactory, Sha1Factory};
pub use types::Id;

#[cfg(test)]
mod tests;
