//! # Key Digests
//!
//! Keys are routed through the index cascade by a fixed-width digest. The
//! digest function is chosen at file-creation time and its width is
//! recorded in the header; the default is 16-byte MD5. The engine assumes
//! the digest is injective over the set of live keys; collisions are not
//! tolerated, which is why the plaintext key is still stored beside every
//! KeyLocator.

use eyre::{ensure, Result};
use md5::{Digest as _, Md5};

use crate::error::ErrorKind;

/// A pluggable digest: the function plus the width it produces.
#[derive(Clone, Copy)]
pub struct DigestFn {
    pub func: fn(&[u8]) -> Vec<u8>,
    pub size: u8,
}

impl std::fmt::Debug for DigestFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestFn").field("size", &self.size).finish()
    }
}

impl Default for DigestFn {
    fn default() -> Self {
        Self {
            func: md5_digest,
            size: 16,
        }
    }
}

impl DigestFn {
    /// Digests a key, checking the function honors its declared width.
    pub fn digest(&self, key: &[u8]) -> Result<Vec<u8>> {
        let digest = (self.func)(key);
        ensure!(
            digest.len() == self.size as usize,
            ErrorKind::corrupt(format!(
                "digest function produced {} bytes, header says {}",
                digest.len(),
                self.size
            ))
        );
        Ok(digest)
    }
}

fn md5_digest(key: &[u8]) -> Vec<u8> {
    Md5::digest(key).to_vec()
}
