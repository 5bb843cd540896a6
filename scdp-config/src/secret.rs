//! AES-256-GCM encryption for secrets at rest (§6 "Persisted state layout").
//!
//! The on-disk encoding for an encrypted value is `hex(iv):hex(tag):hex(ciphertext)`
//! where `iv` is 16 bytes. A value is recognized as encrypted iff it splits
//! into exactly three non-empty hex parts.

use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::AesGcm;
use aes_gcm::aes::Aes256;
use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

/// The length, in bytes, of the tag AES-GCM appends to its ciphertext.
const TAG_LEN: usize = 16;

/// An `AES-256-GCM` instance parameterized with a 16-byte IV, per the
/// on-disk encoding this module implements (the `aes-gcm` crate's default
/// [`Aes256Gcm`] alias uses a 12-byte nonce).
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// An error encrypting or decrypting a secret.
#[derive(Debug, Error)]
pub enum Error {
    /// The encoded value did not split into exactly three hex parts.
    #[error("value is not a recognized encrypted secret encoding")]
    NotEncrypted,
    /// One of the three parts was not valid hex.
    #[error("malformed hex in encrypted secret: {0}")]
    Hex(#[from] hex::FromHexError),
    /// Decryption (AEAD authentication) failed.
    #[error("decryption failed: ciphertext may be corrupt or the key may be wrong")]
    Decrypt,
}

/// A symmetric key used to encrypt/decrypt secrets at rest.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Derives a key from a passphrase and a salt (the contents of
    /// `.salt`, per §6).
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Generates a fresh random 16-byte salt suitable for `.salt`.
    pub fn generate_salt() -> [u8; 16] {
        let mut salt = [0u8; 16];
        rand::rng().fill_bytes(&mut salt);
        salt
    }
}

/// Encrypts `plaintext` with `key`, returning the `iv:tag:ciphertext` hex
/// encoding.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> String {
    let cipher = Aes256Gcm16::new(GenericArray::from_slice(&key.0));

    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);
    let nonce = GenericArray::from_slice(&iv);

    // SAFETY: encryption with a freshly generated nonce over an in-memory
    // buffer cannot fail.
    let mut sealed = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .expect("AES-GCM encryption failed");

    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    let ciphertext = sealed;

    format!("{}:{}:{}", hex::encode(iv), hex::encode(tag), hex::encode(ciphertext))
}

/// Decrypts a value previously produced by [`encrypt`].
pub fn decrypt(encoded: &str, key: &EncryptionKey) -> Result<String, Error> {
    let (iv, tag, ciphertext) = split_parts(encoded).ok_or(Error::NotEncrypted)?;

    let iv = hex::decode(iv)?;
    let tag = hex::decode(tag)?;
    let ciphertext = hex::decode(ciphertext)?;

    let cipher = Aes256Gcm16::new(GenericArray::from_slice(&key.0));
    let nonce = GenericArray::from_slice(&iv);

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|_| Error::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| Error::Decrypt)
}

/// Returns `true` iff `value` is recognized as an encrypted secret (it splits
/// into exactly three non-empty hex parts).
pub fn is_encrypted(value: &str) -> bool {
    split_parts(value).is_some()
}

/// Splits `value` into its three hex parts, if it has that shape.
fn split_parts(value: &str) -> Option<(&str, &str, &str)> {
    let mut parts = value.split(':');
    let iv = parts.next()?;
    let tag = parts.next()?;
    let ciphertext = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if iv.is_empty() || tag.is_empty() || ciphertext.is_empty() {
        return None;
    }
    if !iv.bytes().all(|b| b.is_ascii_hexdigit())
        || !tag.bytes().all(|b| b.is_ascii_hexdigit())
        || !ciphertext.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return None;
    }
    Some((iv, tag, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_utf8() {
        let key = EncryptionKey::from_passphrase("hunter2", b"somesalt12345678");
        for plaintext in ["", "hello", "日本語", "s3cret-password!@#"] {
            let encoded = encrypt(plaintext, &key);
            assert!(is_encrypted(&encoded));
            assert_eq!(decrypt(&encoded, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn plain_values_are_not_recognized_as_encrypted() {
        assert!(!is_encrypted("s3cret"));
        assert!(!is_encrypted("not:enough"));
        assert!(!is_encrypted("zz:zz:zz"));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key = EncryptionKey::from_passphrase("right", b"salt_salt_salt16");
        let other = EncryptionKey::from_passphrase("wrong", b"salt_salt_salt16");
        let encoded = encrypt("secret value", &key);
        assert!(decrypt(&encoded, &other).is_err());
    }
}
