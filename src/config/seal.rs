//! Encrypted at-rest form of the configuration file
//!
//! Layout: `RKSEAL1:` followed by base64(salt || nonce || ciphertext || tag).
//! The key is derived with Argon2id from a passphrase; the cipher is
//! ChaCha20-Poly1305.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

pub const SEAL_PREFIX: &str = "RKSEAL1:";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

// Fixed key and IV of the hex SM4-CBC files written by the desktop release
const LEGACY_KEY: [u8; 16] = [
    0x68, 0xe4, 0xda, 0x80, 0x59, 0x89, 0x74, 0x60, 0xa2, 0xe2, 0xee, 0xf0, 0xf8, 0xf0, 0x4a, 0xea,
];
const LEGACY_IV: [u8; 16] = [
    0xae, 0xc6, 0x1a, 0x04, 0x9d, 0x06, 0x4e, 0xa7, 0xd0, 0xdc, 0x0f, 0x5e, 0xd0, 0x70, 0xd4, 0x2e,
];

type LegacyDecryptor = cbc::Decryptor<sm4::Sm4>;

// 19 MiB, 2 passes, 1 lane
const KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_ITERATIONS: u32 = 2;
const KDF_PARALLELISM: u32 = 1;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: wrong passphrase or corrupted file")]
    DecryptionFailed,

    #[error("Sealed payload is malformed: {0}")]
    Malformed(String),
}

/// Whether the file contents are in sealed form
pub fn is_sealed(contents: &str) -> bool {
    contents.trim_start().starts_with(SEAL_PREFIX)
}

/// Whether the file contents are the hex SM4-CBC form of the desktop release
pub fn is_legacy(contents: &str) -> bool {
    let hex = contents.trim();
    !hex.is_empty() && hex.len() % 32 == 0 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decrypt a legacy hex SM4-CBC file
pub fn unseal_legacy(contents: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
    let data = hex::decode(contents.trim()).map_err(|e| SealError::Malformed(e.to_string()))?;
    let plain = LegacyDecryptor::new(&LEGACY_KEY.into(), &LEGACY_IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|_| SealError::DecryptionFailed)?;
    Ok(Zeroizing::new(plain))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, SealError> {
    let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, KDF_PARALLELISM, Some(32))
        .map_err(|_| SealError::KeyDerivation)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|_| SealError::KeyDerivation)?;
    Ok(key)
}

/// Encrypt `plaintext` into the sealed text form
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<String, SealError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt)?;
    let cipher =
        ChaCha20Poly1305::new_from_slice(&*key).map_err(|_| SealError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::EncryptionFailed)?;

    let mut payload = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);

    Ok(format!("{}{}", SEAL_PREFIX, BASE64.encode(payload)))
}

/// Decrypt the sealed text form
pub fn unseal(contents: &str, passphrase: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
    let encoded = contents
        .trim()
        .strip_prefix(SEAL_PREFIX)
        .ok_or_else(|| SealError::Malformed("missing header".into()))?;
    let payload = BASE64
        .decode(encoded)
        .map_err(|e| SealError::Malformed(e.to_string()))?;
    if payload.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(SealError::Malformed("payload too short".into()));
    }

    let (salt, rest) = payload.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(passphrase, salt)?;
    let cipher =
        ChaCha20Poly1305::new_from_slice(&*key).map_err(|_| SealError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealError::DecryptionFailed)?;
    Ok(Zeroizing::new(plaintext))
}
