//! Token encryption for authenticated write commands.
//!
//! The gateway firmware expects the current session token encrypted with
//! AES-128-CBC under the first 16 bytes of the pre-shared key, using a fixed
//! initialization vector, with the ciphertext hex-encoded.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::EncryptionError;

/// Initialization vector mandated by the gateway firmware.
const INIT_VECTOR: [u8; 16] = [
    0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f, 0x58, 0x56, 0x2e,
];

const BLOCK_SIZE: usize = 16;

/// Encrypt a session token with the gateway's pre-shared key.
///
/// Tokens issued by the firmware are 16 ASCII characters, exactly one cipher
/// block; no padding is applied, so the token length must be a whole number
/// of blocks.
pub fn encrypt(token: &str, key: &str) -> Result<String, EncryptionError> {
    if token.is_empty() {
        return Err(EncryptionError::MissingToken);
    }
    if key.is_empty() {
        return Err(EncryptionError::MissingKey);
    }

    let key_bytes = key.as_bytes();
    if key_bytes.len() < BLOCK_SIZE {
        return Err(EncryptionError::KeyTooShort(key_bytes.len()));
    }

    let token_bytes = token.as_bytes();
    if token_bytes.len() % BLOCK_SIZE != 0 {
        return Err(EncryptionError::BadTokenLength(token_bytes.len()));
    }

    let cipher = Aes128::new(GenericArray::from_slice(&key_bytes[..BLOCK_SIZE]));

    let mut ciphertext = Vec::with_capacity(token_bytes.len());
    let mut previous = INIT_VECTOR;

    for chunk in token_bytes.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        for (i, byte) in chunk.iter().enumerate() {
            block[i] = byte ^ previous[i];
        }

        let mut block = GenericArray::from(block);
        cipher.encrypt_block(&mut block);

        previous.copy_from_slice(block.as_slice());
        ciphertext.extend_from_slice(block.as_slice());
    }

    Ok(hex::encode(ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "1234567890abcdef";
    const KEY: &str = "0987654321qwerty";

    #[test]
    fn test_encrypt_is_deterministic() {
        let a = encrypt(TOKEN, KEY).unwrap();
        let b = encrypt(TOKEN, KEY).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encrypt_output_is_hex_of_one_block() {
        let cipher = encrypt(TOKEN, KEY).unwrap();
        assert_eq!(cipher.len(), 32);
        assert!(cipher.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(cipher, cipher.to_lowercase());
    }

    #[test]
    fn test_encrypt_depends_on_key() {
        let a = encrypt(TOKEN, KEY).unwrap();
        let b = encrypt(TOKEN, "another-key-1234").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_encrypt_cbc_chains_blocks() {
        // First ciphertext block of a two-block token must match the
        // ciphertext of the first block encrypted alone.
        let long_token = "1234567890abcdefFEDCBA0987654321";
        let long = encrypt(long_token, KEY).unwrap();
        let short = encrypt(&long_token[..16], KEY).unwrap();
        assert_eq!(&long[..32], short.as_str());
        assert_eq!(long.len(), 64);
    }

    #[test]
    fn test_encrypt_rejects_missing_inputs() {
        assert!(matches!(
            encrypt("", KEY),
            Err(EncryptionError::MissingToken)
        ));
        assert!(matches!(
            encrypt(TOKEN, ""),
            Err(EncryptionError::MissingKey)
        ));
        assert!(matches!(
            encrypt(TOKEN, "short"),
            Err(EncryptionError::KeyTooShort(5))
        ));
        assert!(matches!(
            encrypt("tooshort", KEY),
            Err(EncryptionError::BadTokenLength(8))
        ));
    }
}
