//! The 256-byte authorization key shared with the server.

use crate::sha1;

/// A long-lived authorization key produced by the DH handshake, together
/// with the two identifiers derived from its SHA-1.
///
/// `key_id` (SHA-1 bytes 12..20) names the key in every encrypted envelope;
/// `aux_hash` (SHA-1 bytes 0..8) feeds the new-nonce hash during the
/// handshake confirmation step.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
}

impl AuthKey {
    /// Build an `AuthKey` from the raw DH output, precomputing identifiers.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let digest = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&digest[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&digest[12..20]);
        Self { data, aux_hash, key_id }
    }

    /// The raw 256 key bytes.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The 8-byte key identifier sent in the clear with every message.
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }

    /// The `new_nonce_hashN` value expected in the `dh_gen_*` reply,
    /// where `number` is 1, 2 or 3 for ok, retry and fail respectively.
    pub fn new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let mut buf = Vec::with_capacity(32 + 1 + 8);
        buf.extend_from_slice(new_nonce);
        buf.push(number);
        buf.extend_from_slice(&self.aux_hash);
        let digest = sha1!(&buf);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey({:016x})", u64::from_le_bytes(self.key_id))
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_sha1_tail() {
        let mut data = [0u8; 256];
        data.iter_mut().enumerate().for_each(|(i, x)| *x = i as u8);
        let key = AuthKey::from_bytes(data);
        let digest = sha1!(&data);
        assert_eq!(key.key_id(), digest[12..20]);
        assert_eq!(key.aux_hash, digest[..8]);
    }
}
