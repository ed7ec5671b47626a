#![forbid(unsafe_code)]

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cardveil_kernel_contracts::card::{CardExpiry, DigitFragment, SealedSecret};
use rand::rngs::OsRng;
use rand::RngCore;

const FRAGMENT_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug)]
pub enum SealError {
    InvalidKey,
    Decode(base64::DecodeError),
    Crypto,
    Malformed,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "fragment key must be 32 bytes"),
            Self::Decode(err) => write!(f, "decode error: {err}"),
            Self::Crypto => write!(f, "fragment seal cryptographic operation failed"),
            Self::Malformed => write!(f, "sealed fragment payload is malformed"),
        }
    }
}

impl std::error::Error for SealError {}

impl From<base64::DecodeError> for SealError {
    fn from(value: base64::DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Seals per-profile secrets (blank digits + expiry) at rest. Every profile, real or
/// synthetic, goes through the same sealer so stored slots look alike.
#[derive(Clone)]
pub struct FragmentSealer {
    key: [u8; FRAGMENT_KEY_LEN],
}

impl std::fmt::Debug for FragmentSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FragmentSealer(<key>)")
    }
}

impl FragmentSealer {
    pub fn from_key_bytes(raw: &[u8]) -> Result<Self, SealError> {
        if raw.len() != FRAGMENT_KEY_LEN {
            return Err(SealError::InvalidKey);
        }
        let mut key = [0u8; FRAGMENT_KEY_LEN];
        key.copy_from_slice(raw);
        Ok(Self { key })
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SealError> {
        let decoded = BASE64.decode(encoded.trim().as_bytes())?;
        Self::from_key_bytes(&decoded)
    }

    /// Fresh random key. Secrets sealed with it do not survive a restart unless the key
    /// is exported with [`FragmentSealer::key_base64`].
    pub fn generate() -> Self {
        let mut key = [0u8; FRAGMENT_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn key_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    pub fn seal(
        &self,
        fragment: &DigitFragment,
        expiry: CardExpiry,
    ) -> Result<SealedSecret, SealError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| SealError::InvalidKey)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = format!("{}|{:02}|{:04}", fragment.as_str(), expiry.month, expiry.year);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SealError::Crypto)?;
        Ok(SealedSecret {
            nonce_b64: BASE64.encode(nonce_bytes),
            ciphertext_b64: BASE64.encode(ciphertext),
        })
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<(DigitFragment, CardExpiry), SealError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| SealError::InvalidKey)?;
        let nonce_raw = BASE64.decode(sealed.nonce_b64.as_bytes())?;
        if nonce_raw.len() != NONCE_LEN {
            return Err(SealError::Crypto);
        }
        let nonce = Nonce::from_slice(&nonce_raw);
        let ciphertext = BASE64.decode(sealed.ciphertext_b64.as_bytes())?;
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| SealError::Crypto)?;
        let text = String::from_utf8(plaintext).map_err(|_| SealError::Malformed)?;
        parse_secret(&text).ok_or(SealError::Malformed)
    }
}

fn parse_secret(text: &str) -> Option<(DigitFragment, CardExpiry)> {
    let mut parts = text.split('|');
    let digits = parts.next()?;
    let month = parts.next()?.parse::<u8>().ok()?;
    let year = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let fragment = DigitFragment::new(digits).ok()?;
    let expiry = CardExpiry::v1(month, year).ok()?;
    Some((fragment, expiry))
}
