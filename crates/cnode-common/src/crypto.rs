//! Cookie-based challenge digests for the distribution handshake.
//!
//! Both sides share a secret cookie. Each side sends a random 32-bit
//! challenge and the other proves knowledge of the cookie by answering with
//! `MD5(cookie ++ decimal(challenge))`, the digest Erlang nodes compute.

use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Length of a challenge digest in bytes.
pub const DIGEST_LEN: usize = 16;

/// Draws a fresh challenge from the OS random source.
#[must_use]
pub fn gen_challenge() -> u32 {
    OsRng.next_u32()
}

/// Computes the digest answering `challenge` under `cookie`.
///
/// # Examples
///
/// ```
/// use cnode_common::crypto;
///
/// let a = crypto::gen_digest(7, "secretcookie");
/// let b = crypto::gen_digest(7, "secretcookie");
/// assert_eq!(a, b);
/// assert_ne!(a, crypto::gen_digest(8, "secretcookie"));
/// ```
#[must_use]
pub fn gen_digest(challenge: u32, cookie: &str) -> [u8; DIGEST_LEN] {
    let mut hasher = Md5::new();
    hasher.update(cookie.as_bytes());
    hasher.update(challenge.to_string().as_bytes());
    hasher.finalize().into()
}

/// Checks a digest against `challenge` and `cookie` in constant time.
///
/// # Examples
///
/// ```
/// use cnode_common::crypto;
///
/// let digest = crypto::gen_digest(42, "secretcookie");
/// assert!(crypto::verify_digest(42, "secretcookie", &digest));
/// assert!(!crypto::verify_digest(42, "othercookie", &digest));
/// ```
#[must_use]
pub fn verify_digest(challenge: u32, cookie: &str, digest: &[u8]) -> bool {
    let expected = gen_digest(challenge, cookie);
    expected.as_slice().ct_eq(digest).into()
}
