//! Signed, expiring connection links
//!
//! Format: `version.b64url(hostPublicKey).b64url(relayPayload).expiry.b64url(signature)`
//! where the signature covers the first four dot-joined fields and
//! `expiry` is a Unix timestamp in seconds.

use crate::crypto::{b64_decode, b64_encode};
use crate::identity::{decode_public_key, verify_b64};
use crate::{Error, Identity, Result, Role, PROTOCOL_VERSION};
use ed25519_dalek::VerifyingKey;

/// Number of dot-separated fields in a link
pub const LINK_FIELDS: usize = 5;

/// A validated connection link
#[derive(Debug, Clone)]
pub struct ConnectionLink {
    pub version: String,
    pub host_public_key: VerifyingKey,
    pub relay_payload: Vec<u8>,
    pub expiry: u64,
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Create a link for `relay_payload` that expires `expiry_secs` from now
pub fn generate_link(
    identity: Option<&Identity>,
    relay_payload: &[u8],
    expiry_secs: u64,
) -> Result<String> {
    generate_link_at(identity, relay_payload, expiry_secs, unix_now())
}

/// [`generate_link`] against an explicit clock
pub fn generate_link_at(
    identity: Option<&Identity>,
    relay_payload: &[u8],
    expiry_secs: u64,
    now: u64,
) -> Result<String> {
    let identity =
        identity.ok_or_else(|| Error::Config("host identity is not loaded".to_string()))?;
    if identity.role() != Role::Host {
        return Err(Error::Config(format!(
            "only HOST can generate links, this identity is {}",
            identity.role()
        )));
    }

    let expiry = now.saturating_add(expiry_secs);
    let signed = format!(
        "{}.{}.{}.{}",
        PROTOCOL_VERSION,
        identity.public_key_b64(),
        b64_encode(relay_payload),
        expiry
    );
    let signature = identity.sign_b64(signed.as_bytes());

    Ok(format!("{}.{}", signed, signature))
}

impl ConnectionLink {
    /// Validate a link against the current time
    pub fn parse(link: &str) -> Result<Self> {
        Self::parse_at(link, unix_now())
    }

    /// Validate a link against an explicit clock
    pub fn parse_at(link: &str, now: u64) -> Result<Self> {
        let parts: Vec<&str> = link.trim().split('.').collect();
        if parts.len() != LINK_FIELDS {
            return Err(Error::LinkInvalid(format!(
                "expected {} fields, found {}",
                LINK_FIELDS,
                parts.len()
            )));
        }
        let (version, key, relay, expiry, signature) =
            (parts[0], parts[1], parts[2], parts[3], parts[4]);

        if version != PROTOCOL_VERSION {
            return Err(Error::LinkInvalid(format!(
                "version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, version
            )));
        }

        let expiry: u64 = expiry
            .parse()
            .map_err(|_| Error::LinkInvalid(format!("malformed expiry: {}", expiry)))?;
        if now > expiry {
            return Err(Error::LinkInvalid("link has expired".to_string()));
        }

        let host_public_key = decode_public_key(key)
            .map_err(|e| Error::LinkInvalid(format!("bad host key: {}", e)))?;
        let relay_payload = b64_decode(relay)
            .map_err(|e| Error::LinkInvalid(format!("bad relay payload: {}", e)))?;

        let signed = &link.trim()[..link.trim().len() - signature.len() - 1];
        if !verify_b64(&host_public_key, signed.as_bytes(), signature) {
            return Err(Error::LinkInvalid("signature verification failed".to_string()));
        }

        Ok(Self {
            version: version.to_string(),
            host_public_key,
            relay_payload,
            expiry,
        })
    }

    /// The relay payload as text, when it is valid UTF-8
    pub fn relay_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.relay_payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn host() -> Identity {
        Identity::generate(Role::Host)
    }

    #[test]
    fn test_generate_and_parse() {
        let id = host();
        let link = generate_link_at(Some(&id), b"relay://room/42", 300, NOW).unwrap();
        assert_eq!(link.split('.').count(), LINK_FIELDS);

        let parsed = ConnectionLink::parse_at(&link, NOW + 10).unwrap();
        assert_eq!(parsed.host_public_key, id.public_key());
        assert_eq!(parsed.relay_str(), Some("relay://room/42"));
        assert_eq!(parsed.expiry, NOW + 300);
        assert_eq!(parsed.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_generate_requires_host_identity() {
        assert!(matches!(
            generate_link_at(None, b"x", 60, NOW),
            Err(Error::Config(_))
        ));
        let peer = Identity::generate(Role::Peer);
        assert!(matches!(
            generate_link_at(Some(&peer), b"x", 60, NOW),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_expired_link_rejected() {
        let link = generate_link_at(Some(&host()), b"r", 60, NOW).unwrap();
        assert!(ConnectionLink::parse_at(&link, NOW + 60).is_ok());
        assert!(matches!(
            ConnectionLink::parse_at(&link, NOW + 61),
            Err(Error::LinkInvalid(_))
        ));
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let link = generate_link_at(Some(&host()), b"r", 60, NOW).unwrap();
        let truncated = link.rsplit_once('.').unwrap().0;
        assert!(matches!(
            ConnectionLink::parse_at(truncated, NOW),
            Err(Error::LinkInvalid(_))
        ));
        assert!(ConnectionLink::parse_at(&format!("{}.extra", link), NOW).is_err());
    }

    #[test]
    fn test_any_altered_field_invalidates() {
        let link = generate_link_at(Some(&host()), b"relay", 600, NOW).unwrap();
        let fields: Vec<&str> = link.split('.').collect();
        let stranger = host();

        let replacements = [
            "v2".to_string(),
            stranger.public_key_b64(),
            b64_encode(b"other-relay"),
            (NOW + 601).to_string(),
            stranger.sign_b64(b"whatever"),
        ];

        for (index, replacement) in replacements.iter().enumerate() {
            let mut altered = fields.clone();
            altered[index] = replacement;
            let tampered = altered.join(".");
            assert!(
                matches!(
                    ConnectionLink::parse_at(&tampered, NOW),
                    Err(Error::LinkInvalid(_))
                ),
                "field {} was altered but the link still validated",
                index
            );
        }
    }

    #[test]
    fn test_relay_payload_binary() {
        let link = generate_link_at(Some(&host()), &[0xff, 0x00, 0x10], 60, NOW).unwrap();
        let parsed = ConnectionLink::parse_at(&link, NOW).unwrap();
        assert_eq!(parsed.relay_payload, vec![0xff, 0x00, 0x10]);
        assert!(parsed.relay_str().is_none());
    }
}
