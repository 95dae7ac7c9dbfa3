//! Long-term Ed25519 identity
//!
//! Each engine instance holds one signing key for its lifetime. HOST uses it
//! to sign connection links and the peer's handshake nonce; PEER uses it to
//! sign the host's nonce. Both sign their ephemeral key-agreement key.

use crate::crypto::{b64_decode, b64_encode};
use crate::{Error, Result, Role};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;

#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    role: Role,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate(role: Role) -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            role,
        }
    }

    /// Rebuild an identity from its 32-byte secret seed
    pub fn from_secret_bytes(role: Role, secret: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
            role,
        }
    }

    /// Load the seed stored at `path`, or create and persist a fresh one
    pub fn load_or_create(role: Role, path: &Path) -> Result<Self> {
        if path.exists() {
            let data = std::fs::read(path)?;
            let secret: [u8; SECRET_KEY_SIZE] = data.as_slice().try_into().map_err(|_| {
                Error::Config(format!(
                    "invalid identity file {}: expected {} bytes, found {}",
                    path.display(),
                    SECRET_KEY_SIZE,
                    data.len()
                ))
            })?;
            return Ok(Self::from_secret_bytes(role, &secret));
        }

        let identity = Self::generate(role);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, identity.signing_key.to_bytes())?;
        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!("Created new identity at {}", path.display());
        Ok(identity)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_b64(&self) -> String {
        b64_encode(self.public_key().as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Signature encoded the way it travels on the wire
    pub fn sign_b64(&self, message: &[u8]) -> String {
        b64_encode(&self.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("role", &self.role)
            .field("public_key", &self.public_key_b64())
            .finish()
    }
}

/// Decode a base64url public key
pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = b64_decode(encoded)?;
    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Crypto("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Crypto(format!("invalid public key: {}", e)))
}

/// Verify a signature over `message`
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    key.verify(message, signature).is_ok()
}

/// Verify a base64url signature; anything undecodable simply fails
pub fn verify_b64(key: &VerifyingKey, message: &[u8], signature: &str) -> bool {
    let Ok(bytes) = b64_decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    verify(key, message, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_verify() {
        let id = Identity::generate(Role::Host);
        let sig = id.sign_b64(b"nonce-123");
        assert!(verify_b64(&id.public_key(), b"nonce-123", &sig));
        assert!(!verify_b64(&id.public_key(), b"nonce-124", &sig));

        let other = Identity::generate(Role::Host);
        assert!(!verify_b64(&other.public_key(), b"nonce-123", &sig));
        assert!(!verify_b64(&id.public_key(), b"nonce-123", "garbage"));
    }

    #[test]
    fn test_deterministic_from_seed() {
        let a = Identity::from_secret_bytes(Role::Peer, &[42u8; 32]);
        let b = Identity::from_secret_bytes(Role::Peer, &[42u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.role(), Role::Peer);
    }

    #[test]
    fn test_public_key_b64_roundtrip() {
        let id = Identity::generate(Role::Host);
        let decoded = decode_public_key(&id.public_key_b64()).unwrap();
        assert_eq!(decoded, id.public_key());
        assert!(decode_public_key("AAAA").is_err());
    }

    #[test]
    fn test_load_or_create_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let created = Identity::load_or_create(Role::Host, &path).unwrap();
        assert!(path.exists());
        let loaded = Identity::load_or_create(Role::Host, &path).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, [1u8; 10]).unwrap();
        assert!(matches!(
            Identity::load_or_create(Role::Host, &path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let id = Identity::from_secret_bytes(Role::Host, &[9u8; 32]);
        let rendered = format!("{:?}", id);
        assert!(rendered.contains("HOST") || rendered.contains("Host"));
        assert!(!rendered.contains("signing_key"));
    }
}
