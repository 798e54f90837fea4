//! Symmetric sealing of pool datagrams.
//!
//! Sealed layout: `[version:1][nonce:12][ciphertext + tag:16]`. The key
//! length selects AES-128, AES-192 or AES-256 in GCM mode.

use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, consts::U12},
    aes::Aes192,
};
use std::fmt;

use stratus_common::{Result, StratusError};

type Aes192Gcm = AesGcm<Aes192, U12>;

const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes added to every sealed datagram
pub(crate) const SEAL_OVERHEAD: usize = 1 + NONCE_LEN + TAG_LEN;

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// Seals and opens datagrams with the cluster's shared secret
pub struct Keyring {
    cipher: Cipher,
}

impl Keyring {
    /// Build a keyring from a raw 16, 24 or 32 byte key
    pub fn new(key: &[u8]) -> Result<Self> {
        let invalid = |e| StratusError::Config(format!("Invalid secret key: {e}"));
        let cipher = match key.len() {
            16 => Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
            24 => Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            32 => Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
            other => {
                return Err(StratusError::Config(format!(
                    "Secret key must be 16, 24 or 32 bytes (got {other})"
                )));
            }
        };
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let ciphertext = match &self.cipher {
            Cipher::Aes128(c) => c.encrypt(&nonce, plaintext),
            Cipher::Aes192(c) => c.encrypt(&nonce, plaintext),
            Cipher::Aes256(c) => c.encrypt(&nonce, plaintext),
        }
        .map_err(|e| StratusError::Encryption(format!("Seal failed: {e}")))?;

        let mut sealed = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        sealed.push(VERSION);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(StratusError::Encryption(format!(
                "Sealed packet too short ({} bytes)",
                sealed.len()
            )));
        }
        if sealed[0] != VERSION {
            return Err(StratusError::Encryption(format!(
                "Unsupported packet version {}",
                sealed[0]
            )));
        }

        let nonce = Nonce::<U12>::from_slice(&sealed[1..1 + NONCE_LEN]);
        let body = &sealed[1 + NONCE_LEN..];
        match &self.cipher {
            Cipher::Aes128(c) => c.decrypt(nonce, body),
            Cipher::Aes192(c) => c.decrypt(nonce, body),
            Cipher::Aes256(c) => c.decrypt(nonce, body),
        }
        .map_err(|e| StratusError::Encryption(format!("Open failed: {e}")))
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self.cipher {
            Cipher::Aes128(_) => "aes-128-gcm",
            Cipher::Aes192(_) => "aes-192-gcm",
            Cipher::Aes256(_) => "aes-256-gcm",
        };
        f.debug_struct("Keyring").field("algorithm", &algorithm).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open_every_key_size() {
        for len in [16usize, 24, 32] {
            let key = vec![7u8; len];
            let keyring = Keyring::new(&key).unwrap();
            let sealed = keyring.seal(b"invalidate users:42").unwrap();

            assert_eq!(sealed.len(), b"invalidate users:42".len() + SEAL_OVERHEAD);
            assert_eq!(keyring.open(&sealed).unwrap(), b"invalidate users:42");
        }
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let ours = Keyring::new(&[1u8; 32]).unwrap();
        let theirs = Keyring::new(&[2u8; 32]).unwrap();

        let sealed = ours.seal(b"secret").unwrap();
        assert!(theirs.open(&sealed).is_err());
    }

    #[test]
    fn test_rejects_bad_key_length() {
        assert!(matches!(
            Keyring::new(&[0u8; 20]),
            Err(StratusError::Config(_))
        ));
    }

    #[test]
    fn test_short_or_tampered_input() {
        let keyring = Keyring::new(&[9u8; 16]).unwrap();
        assert!(keyring.open(&[VERSION; 4]).is_err());

        let mut sealed = keyring.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(keyring.open(&sealed).is_err());

        let mut versioned = keyring.seal(b"payload").unwrap();
        versioned[0] = 0;
        assert!(keyring.open(&versioned).is_err());
    }
}
