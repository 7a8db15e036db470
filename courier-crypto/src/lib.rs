//! Cryptographic primitives for the courier MTProto stack.
//!
//! * AES-256-IGE encrypt/decrypt
//! * SHA-1 / SHA-256 macros
//! * Pollard-rho `pq` factorization
//! * Old-style RSA block encryption and key fingerprints
//! * [`AuthKey`] and the MTProto 2.0 message encryption scheme
//! * DH nonce → (key, iv) derivation for the handshake

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod deque_buffer;
mod factorize;
pub mod rsa;
mod sha;

pub use auth_key::AuthKey;
pub use deque_buffer::DequeBuffer;
pub use factorize::factorize;

/// Fill `buf` from the operating system's secure random source.
pub fn random_bytes(buf: &mut [u8]) {
    getrandom::getrandom(buf).expect("os random source unavailable");
}

// ─── MTProto 2.0 message encryption ──────────────────────────────────────────

/// Why a ciphertext failed to open.
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Shorter than the envelope header or not block-aligned.
    InvalidBuffer,
    /// The envelope names a different authorization key.
    AuthKeyMismatch,
    /// Recomputed `msg_key` disagrees with the envelope.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}

impl std::error::Error for DecryptError {}

/// Which side authored the message; selects the `x` offset in key derivation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Direction {
    FromClient,
    FromServer,
}

impl Direction {
    fn x(&self) -> usize {
        match self {
            Direction::FromClient => 0,
            Direction::FromServer => 8,
        }
    }
}

// Concatenate `parts` into a fixed 32-byte block. The derivation formulas
// below are all "pick ranges of two digests and glue them together".
fn concat32(parts: &[&[u8]]) -> [u8; 32] {
    let mut block = [0u8; 32];
    let mut at = 0;
    for part in parts {
        block[at..at + part.len()].copy_from_slice(part);
        at += part.len();
    }
    debug_assert_eq!(at, 32);
    block
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], dir: Direction) -> ([u8; 32], [u8; 32]) {
    let x = dir.x();
    let a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let b = sha256!(&auth_key.data[40 + x..76 + x], msg_key);

    let aes_key = concat32(&[&a[..8], &b[8..24], &a[24..]]);
    let aes_iv = concat32(&[&b[..8], &a[8..24], &b[24..]]);
    (aes_key, aes_iv)
}

// 12..1024 random bytes, bringing the total to a multiple of 16.
fn padding_for(len: usize) -> usize {
    32 - len % 16
}

/// Encrypt `buffer` in place under MTProto 2.0 as the client. Afterwards it
/// holds `auth_key_id || msg_key || ciphertext`, ready for framing.
pub fn encrypt_data_v2(buffer: &mut DequeBuffer, auth_key: &AuthKey) {
    encrypt_data_v2_as(buffer, auth_key, Direction::FromClient);
}

/// Like [`encrypt_data_v2`] but authored from an explicit side. Server-side
/// sealing exists for in-process peers (mock servers, loopback tests).
pub fn encrypt_data_v2_as(buffer: &mut DequeBuffer, auth_key: &AuthKey, dir: Direction) {
    let mut padding = [0u8; 32];
    random_bytes(&mut padding);
    do_encrypt_data_v2(buffer, auth_key, dir, &padding);
}

fn do_encrypt_data_v2(
    buffer: &mut DequeBuffer,
    auth_key: &AuthKey,
    dir: Direction,
    padding: &[u8; 32],
) {
    let pad = padding_for(buffer.len());
    buffer.extend(padding.iter().take(pad).copied());

    let x = dir.x();
    let msg_key_large = sha256!(&auth_key.data[88 + x..88 + x + 32], buffer.as_ref());
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, dir);
    aes::ige_encrypt(buffer.as_mut(), &key, &iv);

    buffer.extend_front(&msg_key);
    buffer.extend_front(&auth_key.key_id);
}

/// Decrypt a server-authored MTProto 2.0 envelope, returning the padded
/// plaintext slice. `buffer` must hold `auth_key_id || msg_key || ciphertext`.
pub fn decrypt_data_v2<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
) -> Result<&'a mut [u8], DecryptError> {
    decrypt_data_v2_as(buffer, auth_key, Direction::FromServer)
}

/// Like [`decrypt_data_v2`] but for an envelope authored by an explicit side.
pub fn decrypt_data_v2_as<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
    dir: Direction,
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, dir);
    aes::ige_decrypt(&mut buffer[24..], &key, &iv);

    let x = dir.x();
    let expected = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    if msg_key != expected[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

/// Derive the `(key, iv)` that protects the `server_DH_inner_data` blob.
///
/// Three SHA-1s over the nonce pair are spliced as
/// `key = NS + SN[..12]` and `iv = SN[12..] + NN + new_nonce[..4]`, where
/// `NS`, `SN` and `NN` hash new+server, server+new and new+new.
pub fn generate_key_data_from_nonce(
    server_nonce: &[u8; 16],
    new_nonce: &[u8; 32],
) -> ([u8; 32], [u8; 32]) {
    let ns = sha1!(new_nonce, server_nonce);
    let sn = sha1!(server_nonce, new_nonce);
    let nn = sha1!(new_nonce, new_nonce);

    let key = concat32(&[&ns, &sn[..12]]);
    let iv = concat32(&[&sn[12..], &nn, &new_nonce[..4]]);
    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_auth_key() -> AuthKey {
        let mut data = [0u8; 256];
        data.iter_mut().enumerate().for_each(|(i, x)| *x = i as u8);
        AuthKey::from_bytes(data)
    }

    fn test_msg_key() -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf.iter_mut().enumerate().for_each(|(i, x)| *x = i as u8);
        buf
    }

    #[test]
    fn client_key_derivation() {
        let expected = (
            [
                112, 78, 208, 156, 139, 65, 102, 138, 232, 249, 157, 36, 71, 56, 247, 29, 189,
                220, 68, 70, 155, 107, 189, 74, 168, 87, 61, 208, 66, 189, 5, 158,
            ],
            [
                77, 38, 96, 0, 165, 80, 237, 171, 191, 76, 124, 228, 15, 208, 4, 60, 201, 34, 48,
                24, 76, 211, 23, 165, 204, 156, 36, 130, 253, 59, 147, 24,
            ],
        );
        assert_eq!(
            calc_key(&test_auth_key(), &test_msg_key(), Direction::FromClient),
            expected
        );
    }

    #[test]
    fn server_key_derivation() {
        let expected = (
            [
                33, 119, 37, 121, 155, 36, 88, 6, 69, 129, 116, 161, 252, 251, 200, 131, 144, 104,
                7, 177, 80, 51, 253, 208, 234, 43, 77, 105, 207, 156, 54, 78,
            ],
            [
                102, 154, 101, 56, 145, 122, 79, 165, 108, 163, 35, 96, 164, 49, 201, 22, 11, 228,
                173, 136, 113, 64, 152, 13, 171, 145, 206, 123, 220, 71, 255, 188,
            ],
        );
        assert_eq!(
            calc_key(&test_auth_key(), &test_msg_key(), Direction::FromServer),
            expected
        );
    }

    #[test]
    fn encrypt_v2_known_vector() {
        let mut buffer = DequeBuffer::with_capacity(0, 0);
        buffer.extend(b"Hello, world! This data should remain secure!".iter().copied());
        do_encrypt_data_v2(&mut buffer, &test_auth_key(), Direction::FromClient, &[0; 32]);
        let expected: Vec<u8> = vec![
            50, 209, 88, 110, 164, 87, 223, 200, 168, 23, 41, 212, 109, 181, 64, 25, 162, 191,
            215, 247, 68, 249, 185, 108, 79, 113, 108, 253, 196, 71, 125, 178, 162, 193, 95, 109,
            219, 133, 35, 95, 185, 85, 47, 29, 132, 7, 198, 170, 234, 0, 204, 132, 76, 90, 27,
            246, 172, 68, 183, 155, 94, 220, 42, 35, 134, 139, 61, 96, 115, 165, 144, 153, 44, 15,
            41, 117, 36, 61, 86, 62, 161, 128, 210, 24, 238, 117, 124, 154,
        ];
        assert_eq!(buffer.as_ref(), &expected[..]);
    }

    #[test]
    fn padding_stays_in_bounds() {
        for len in 0..64 {
            let pad = padding_for(len);
            assert!(pad >= 12 && pad <= 32);
            assert_eq!((len + pad) % 16, 0);
        }
    }

    #[test]
    fn nonce_key_derivation() {
        let server_nonce = {
            let mut buf = [0u8; 16];
            buf.iter_mut().enumerate().for_each(|(i, x)| *x = i as u8);
            buf
        };
        let new_nonce = {
            let mut buf = [0u8; 32];
            buf.iter_mut().enumerate().for_each(|(i, x)| *x = i as u8);
            buf
        };
        let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
        assert_eq!(
            key,
            [
                7, 88, 241, 83, 59, 97, 93, 36, 246, 232, 169, 74, 111, 203, 238, 10, 85, 234,
                171, 34, 23, 215, 41, 92, 169, 33, 61, 26, 45, 125, 22, 166
            ]
        );
        assert_eq!(
            iv,
            [
                90, 132, 16, 142, 152, 5, 101, 108, 232, 100, 7, 14, 22, 110, 98, 24, 246, 120,
                62, 133, 17, 71, 26, 90, 183, 128, 44, 242, 0, 1, 2, 3
            ]
        );
    }

    #[test]
    fn roundtrip_under_same_key() {
        let auth_key = test_auth_key();
        let plaintext = b"the quick brown fox".to_vec();

        for dir in [Direction::FromClient, Direction::FromServer] {
            let mut buffer = DequeBuffer::with_capacity(plaintext.len(), 32);
            buffer.extend(plaintext.iter().copied());
            encrypt_data_v2_as(&mut buffer, &auth_key, dir);

            let mut sealed = buffer.into_vec();
            assert_eq!(&sealed[..8], &auth_key.key_id());
            let opened = decrypt_data_v2_as(&mut sealed, &auth_key, dir).unwrap();
            assert_eq!(&opened[..plaintext.len()], &plaintext[..]);
        }
    }

    #[test]
    fn rejects_foreign_key_id() {
        let auth_key = test_auth_key();
        let mut other = [0u8; 256];
        other.iter_mut().enumerate().for_each(|(i, x)| *x = !(i as u8));
        let other_key = AuthKey::from_bytes(other);

        let mut buffer = DequeBuffer::with_capacity(16, 32);
        buffer.extend([0u8; 16]);
        encrypt_data_v2_as(&mut buffer, &auth_key, Direction::FromServer);
        let mut sealed = buffer.into_vec();
        assert_eq!(
            decrypt_data_v2(&mut sealed, &other_key),
            Err(DecryptError::AuthKeyMismatch)
        );
    }
}
