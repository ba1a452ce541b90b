//! Cryptography module for sealing and opening entry payloads.
//!
//! Keys come from PBKDF2-HMAC-SHA256 over the password with a random 16-byte
//! salt. Payloads are sealed with AES-GCM (128 or 256 bit key); the 16-byte tag
//! is kept detached so the container can record it in the entry's
//! [`EncryptionHeader`]. Salt and nonce are drawn fresh for every sealed entry.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{CryptoError, ValidationError};

pub const SALT_SIZE: usize = 16; // 128 bits for salt
pub const NONCE_SIZE: usize = 12; // 96 bits for GCM
pub const TAG_SIZE: usize = 16;
pub const DEFAULT_ITERATIONS: u32 = 100_000;
pub const MIN_ITERATIONS: u32 = 1_000;
/// Ceiling for both new seals and headers read from an archive.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Serialized size of [`EncryptionHeader`].
pub const HEADER_LEN: usize = 2 + 4 + SALT_SIZE + NONCE_SIZE + TAG_SIZE;
const HEADER_VERSION: u8 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    #[serde(rename = "aes-128")]
    Aes128Gcm,
    #[default]
    #[serde(rename = "aes-256")]
    Aes256Gcm,
}

impl Algorithm {
    pub const fn key_len(self) -> usize {
        match self {
            Algorithm::Aes128Gcm => 16,
            Algorithm::Aes256Gcm => 32,
        }
    }

    const fn tag(self) -> u8 {
        match self {
            Algorithm::Aes128Gcm => 1,
            Algorithm::Aes256Gcm => 3,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Algorithm::Aes128Gcm),
            3 => Some(Algorithm::Aes256Gcm),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Algorithm::Aes128Gcm => "aes-128",
            Algorithm::Aes256Gcm => "aes-256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128" | "aes128" | "aes-128-gcm" => Ok(Algorithm::Aes128Gcm),
            "aes-256" | "aes256" | "aes-256-gcm" => Ok(Algorithm::Aes256Gcm),
            _ => Err(ValidationError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Key material produced by [`derive_key`]. Debug output never shows the bytes.
#[derive(Clone)]
pub struct DerivedKey {
    algorithm: Algorithm,
    bytes: [u8; 32],
}

impl DerivedKey {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.algorithm.key_len()]
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Per-entry encryption record stored next to the sealed payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionHeader {
    pub algorithm: Algorithm,
    pub iterations: u32,
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

impl EncryptionHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = HEADER_VERSION;
        out[1] = self.algorithm.tag();
        out[2..6].copy_from_slice(&self.iterations.to_le_bytes());
        let mut off = 6;
        out[off..off + SALT_SIZE].copy_from_slice(&self.salt);
        off += SALT_SIZE;
        out[off..off + NONCE_SIZE].copy_from_slice(&self.nonce);
        off += NONCE_SIZE;
        out[off..off + TAG_SIZE].copy_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, &'static str> {
        if buf.len() != HEADER_LEN {
            return Err("wrong length");
        }
        if buf[0] != HEADER_VERSION {
            return Err("unknown version");
        }
        let algorithm = Algorithm::from_tag(buf[1]).ok_or("unknown algorithm")?;
        let iterations = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if iterations == 0 {
            return Err("zero iterations");
        }
        if iterations > MAX_ITERATIONS {
            return Err("iteration count above limit");
        }
        let mut h = EncryptionHeader {
            algorithm,
            iterations,
            salt: [0u8; SALT_SIZE],
            nonce: [0u8; NONCE_SIZE],
            tag: [0u8; TAG_SIZE],
        };
        let mut off = 6;
        h.salt.copy_from_slice(&buf[off..off + SALT_SIZE]);
        off += SALT_SIZE;
        h.nonce.copy_from_slice(&buf[off..off + NONCE_SIZE]);
        off += NONCE_SIZE;
        h.tag.copy_from_slice(&buf[off..off + TAG_SIZE]);
        Ok(h)
    }
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Checks a password and iteration count before any work is scheduled.
pub fn validate_policy(password: &str, iterations: u32) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::EmptyPassword);
    }
    if iterations < MIN_ITERATIONS {
        return Err(ValidationError::IterationsTooLow {
            min: MIN_ITERATIONS,
            got: iterations,
        });
    }
    if iterations > MAX_ITERATIONS {
        return Err(ValidationError::IterationsTooHigh {
            max: MAX_ITERATIONS,
            got: iterations,
        });
    }
    Ok(())
}

pub fn derive_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
    algorithm: Algorithm,
) -> Result<DerivedKey, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::EmptyPassword);
    }
    let mut bytes = [0u8; 32];
    let len = algorithm.key_len();
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut bytes[..len]);
    Ok(DerivedKey { algorithm, bytes })
}

fn seal_with<C: KeyInit + AeadInPlace>(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_SIZE], CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)
        .map_err(|_| CryptoError::SealFailed)?;
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(tag.as_slice());
    Ok(out)
}

fn open_with<C: KeyInit + AeadInPlace>(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buf,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypts `buf` in place, returning the ciphertext (same length) and the tag.
pub fn seal(
    mut buf: Vec<u8>,
    key: &DerivedKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE]), CryptoError> {
    let tag = match key.algorithm {
        Algorithm::Aes128Gcm => seal_with::<Aes128Gcm>(key.as_bytes(), nonce, aad, &mut buf)?,
        Algorithm::Aes256Gcm => seal_with::<Aes256Gcm>(key.as_bytes(), nonce, aad, &mut buf)?,
    };
    Ok((buf, tag))
}

/// Decrypts and authenticates `buf` in place. Any mismatch is
/// [`CryptoError::AuthenticationFailed`].
pub fn open(
    mut buf: Vec<u8>,
    tag: &[u8; TAG_SIZE],
    key: &DerivedKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match key.algorithm {
        Algorithm::Aes128Gcm => open_with::<Aes128Gcm>(key.as_bytes(), nonce, aad, &mut buf, tag)?,
        Algorithm::Aes256Gcm => open_with::<Aes256Gcm>(key.as_bytes(), nonce, aad, &mut buf, tag)?,
    }
    Ok(buf)
}

/// Seals one entry payload under a fresh salt and nonce.
pub fn seal_entry(
    plaintext: Vec<u8>,
    password: &str,
    algorithm: Algorithm,
    iterations: u32,
    aad: &[u8],
) -> Result<(Vec<u8>, EncryptionHeader), CryptoError> {
    let salt = generate_salt();
    let nonce = generate_nonce();
    let key = derive_key(password, &salt, iterations, algorithm)?;
    let (ciphertext, tag) = seal(plaintext, &key, &nonce, aad)?;
    Ok((
        ciphertext,
        EncryptionHeader {
            algorithm,
            iterations,
            salt,
            nonce,
            tag,
        },
    ))
}

pub fn open_entry(
    ciphertext: Vec<u8>,
    header: &EncryptionHeader,
    password: &str,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = derive_key(password, &header.salt, header.iterations, header.algorithm)?;
    open(ciphertext, &header.tag, &key, &header.nonce, aad)
}
