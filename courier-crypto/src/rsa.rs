//! RSA encryption for the unencrypted phase of key exchange.
//!
//! Uses the original block format: `SHA1(data) + data + random padding`
//! filled to 255 bytes, then raw modular exponentiation with the server's
//! public key. No OAEP.

use crate::sha1;
use num_bigint::BigUint;

/// An RSA public key `(n, e)`.
pub struct Key {
    n: BigUint,
    e: BigUint,
}

impl Key {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    /// The 64-bit fingerprint servers use to name this key: the low 8 bytes
    /// of `SHA1(serialized(n) + serialized(e))`, where both numbers are
    /// length-prefixed big-endian byte strings.
    pub fn fingerprint(&self) -> i64 {
        let mut buf = Vec::new();
        serialize_bytes(&mut buf, &self.n.to_bytes_be());
        serialize_bytes(&mut buf, &self.e.to_bytes_be());
        let digest = sha1!(&buf);
        i64::from_le_bytes(digest[12..20].try_into().unwrap())
    }
}

// Length-prefixed, 4-byte aligned byte string, as used on the wire.
fn serialize_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len <= 253 {
        buf.push(len as u8);
    } else {
        buf.push(0xfe);
        buf.push((len & 0xff) as u8);
        buf.push(((len >> 8) & 0xff) as u8);
        buf.push(((len >> 16) & 0xff) as u8);
    }
    buf.extend_from_slice(data);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Encrypt `data` prefixed with its SHA-1, padded with `random_bytes` up to
/// 255 bytes, producing a 256-byte block.
pub fn encrypt_hashed(data: &[u8], key: &Key, random_bytes: &[u8; 256]) -> Vec<u8> {
    let digest = sha1!(data);

    let padding_len = 255 - 20 - data.len();
    let mut block = Vec::with_capacity(255);
    block.extend_from_slice(&digest);
    block.extend_from_slice(data);
    block.extend_from_slice(&random_bytes[..padding_len]);

    let payload = BigUint::from_bytes_be(&block);
    let encrypted = payload.modpow(&key.e, &key.n);
    let mut out = encrypted.to_bytes_be();
    while out.len() < 256 {
        out.insert(0, 0);
    }
    out
}
