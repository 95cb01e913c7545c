//! Shared-secret authentication for gossip.
//!
//! Broadcast bodies and UDP datagrams are prefixed with an HMAC-SHA256 tag
//! keyed by the cluster secret. Anything that fails verification is dropped.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC tag length (SHA-256 output).
pub const TAG_LEN: usize = 32;

/// The cluster secret. `Debug` never prints the key.
#[derive(Clone)]
pub struct ClusterSecret {
    key: Vec<u8>,
}

impl ClusterSecret {
    pub fn from_password(password: &str) -> Self {
        Self {
            key: password.as_bytes().to_vec(),
        }
    }

    /// Computes an HMAC-SHA256 tag over `payload`.
    pub fn sign(&self, payload: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().into()
    }

    /// Verifies an HMAC-SHA256 tag in constant time.
    pub fn verify(&self, payload: &[u8], tag: &[u8]) -> bool {
        if tag.len() != TAG_LEN {
            return false;
        }
        let expected = self.sign(payload);
        bool::from(expected.ct_eq(tag))
    }

    /// Returns `tag || payload`.
    pub fn seal(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(TAG_LEN + payload.len());
        frame.extend_from_slice(&self.sign(payload));
        frame.extend_from_slice(payload);
        frame
    }

    /// Splits a sealed frame and returns the payload if its tag verifies.
    pub fn open<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        if frame.len() < TAG_LEN {
            return None;
        }
        let (tag, payload) = frame.split_at(TAG_LEN);
        self.verify(payload, tag).then_some(payload)
    }
}

impl std::fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSecret")
            .field("key", &"[redacted]")
            .finish()
    }
}
