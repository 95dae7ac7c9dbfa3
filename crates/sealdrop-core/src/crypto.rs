//! Cryptographic primitives and the session key schedule
//!
//! - X25519 ephemeral key agreement, one key pair per session
//! - HKDF-SHA256 expanding the shared secret into three independent keys
//!   (control, data, validation) under distinct labels
//! - HMAC-SHA256 key confirmation bound to the sender's role
//! - AES-256-GCM with a fresh random 96-bit nonce per message; the wire
//!   format is `nonce (12 bytes) || ciphertext || tag`
//! - BLAKE3 session fingerprint over both identity keys, order independent

use crate::{Error, Fingerprint, Result, Role};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

pub const NONCE_SIZE: usize = 12; // 96 bits
pub const KEY_SIZE: usize = 32;

const CONTROL_LABEL: &[u8] = b"sealdrop/ctrl/v1";
const DATA_LABEL: &[u8] = b"sealdrop/data/v1";
const VALIDATION_LABEL: &[u8] = b"sealdrop/val/v1";
const FINGERPRINT_CONTEXT: &str = "sealdrop 2024 session fingerprint v1";

type HmacSha256 = Hmac<Sha256>;

/// URL-safe base64 without padding, used for every binary field on the wire
pub fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| Error::Crypto(format!("invalid base64: {}", e)))
}

/// Fill a buffer from the OS entropy source
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)
        .map_err(|e| Error::Crypto(format!("entropy source unavailable: {}", e)))?;
    Ok(buf)
}

/// Handshake nonce: 16 random bytes, hex encoded
pub fn handshake_nonce() -> Result<String> {
    Ok(hex::encode(random_bytes::<16>()?))
}

/// Per-session key-agreement key pair
///
/// The secret is consumed by [`EphemeralKeyPair::agree`], so it cannot
/// outlive key derivation.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519Public,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Run X25519 against the remote public key and derive the session keys
    pub fn agree(self, remote_public: &[u8]) -> Result<SessionKeys> {
        let remote: [u8; 32] = remote_public
            .try_into()
            .map_err(|_| Error::Crypto("ephemeral key must be 32 bytes".to_string()))?;

        let shared = self.secret.diffie_hellman(&X25519Public::from(remote));
        if !shared.was_contributory() {
            return Err(Error::Crypto("degenerate shared secret".to_string()));
        }

        SessionKeys::derive(shared.as_bytes())
    }
}

/// Symmetric keys for one session, wiped from memory on drop
pub struct SessionKeys {
    control: Zeroizing<[u8; KEY_SIZE]>,
    data: Zeroizing<[u8; KEY_SIZE]>,
    validation: Zeroizing<[u8; KEY_SIZE]>,
}

impl SessionKeys {
    /// HKDF-SHA256 over the shared secret, one expansion per label
    pub fn derive(shared_secret: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);

        let expand = |label: &[u8]| -> Result<Zeroizing<[u8; KEY_SIZE]>> {
            let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
            hk.expand(label, &mut okm[..])
                .map_err(|_| Error::Crypto("key derivation failed".to_string()))?;
            Ok(okm)
        };

        Ok(Self {
            control: expand(CONTROL_LABEL)?,
            data: expand(DATA_LABEL)?,
            validation: expand(VALIDATION_LABEL)?,
        })
    }

    pub fn control_key(&self) -> &[u8; KEY_SIZE] {
        &self.control
    }

    pub fn data_key(&self) -> &[u8; KEY_SIZE] {
        &self.data
    }

    pub fn validation_key(&self) -> &[u8; KEY_SIZE] {
        &self.validation
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

fn confirmation_input(role: Role) -> String {
    format!("KEY_CONFIRM_{}", role)
}

/// MAC proving possession of the validation key, bound to `role`
pub fn key_confirmation(validation_key: &[u8; KEY_SIZE], role: Role) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(validation_key)
        .map_err(|e| Error::Crypto(format!("invalid MAC key: {}", e)))?;
    mac.update(confirmation_input(role).as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of a remote confirmation MAC for `role`
pub fn verify_key_confirmation(validation_key: &[u8; KEY_SIZE], role: Role, tag: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(validation_key) else {
        return false;
    };
    mac.update(confirmation_input(role).as_bytes());
    mac.verify_slice(tag).is_ok()
}

/// Encrypt with AES-256-GCM under a fresh random nonce.
///
/// Returns: nonce (12 bytes) || ciphertext || tag (16 bytes)
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let nonce_bytes = random_bytes::<NONCE_SIZE>()?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a `nonce || ciphertext` payload produced by [`encrypt`]
pub fn decrypt(key: &[u8; KEY_SIZE], payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < NONCE_SIZE {
        return Err(Error::Crypto("payload shorter than nonce".to_string()));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::Crypto("authentication failed".to_string()))
}

/// Hash of both identity keys, sorted so both ends compute the same value
pub fn fingerprint(a: &VerifyingKey, b: &VerifyingKey) -> Fingerprint {
    let (first, second) = if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    };

    let mut hasher = blake3::Hasher::new_derive_key(FINGERPRINT_CONTEXT);
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());
    Fingerprint(*hasher.finalize().as_bytes())
}
