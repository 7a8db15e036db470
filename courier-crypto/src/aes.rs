//! AES-256 in Infinite Garble Extension (IGE) mode.
//!
//! IGE chains both the previous plaintext and the previous ciphertext block
//! into each block operation, so the 32-byte IV carries two 16-byte halves:
//! the initial "previous ciphertext" and the initial "previous plaintext".
//! Buffers must already be padded to the 16-byte block size.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

const BLOCK: usize = 16;

/// Encrypt `buffer` in place with AES-256-IGE.
///
/// Panics if `buffer.len()` is not a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert!(buffer.len() % BLOCK == 0, "IGE requires block-aligned input");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for chunk in buffer.chunks_exact_mut(BLOCK) {
        let plain: [u8; BLOCK] = chunk.try_into().unwrap();

        let mut block = GenericArray::clone_from_slice(chunk);
        for (b, p) in block.iter_mut().zip(prev_cipher.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(&mut block);
        for (b, p) in block.iter_mut().zip(prev_plain.iter()) {
            *b ^= p;
        }

        chunk.copy_from_slice(&block);
        prev_cipher.copy_from_slice(chunk);
        prev_plain = plain;
    }
}

/// Decrypt `buffer` in place with AES-256-IGE.
///
/// Panics if `buffer.len()` is not a multiple of 16.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert!(buffer.len() % BLOCK == 0, "IGE requires block-aligned input");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for chunk in buffer.chunks_exact_mut(BLOCK) {
        let cipher_block: [u8; BLOCK] = chunk.try_into().unwrap();

        let mut block = GenericArray::clone_from_slice(chunk);
        for (b, p) in block.iter_mut().zip(prev_plain.iter()) {
            *b ^= p;
        }
        cipher.decrypt_block(&mut block);
        for (b, p) in block.iter_mut().zip(prev_cipher.iter()) {
            *b ^= p;
        }

        chunk.copy_from_slice(&block);
        prev_cipher = cipher_block;
        prev_plain.copy_from_slice(chunk);
    }
}
