use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;

pub const IDENTITY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// I2P-style base64 alphabet: standard bit packing, `-` and `~` instead of
/// `+` and `/`. Used for on-disk file names and log output.
const B64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~";

/// 32-byte identity hash of a router or destination.
///
/// Equality, ordering and hashing are defined on the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentHash(pub [u8; 32]);

impl IdentHash {
    pub fn from_slice(b: &[u8]) -> Option<Self> {
        b.try_into().ok().map(IdentHash)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Byte-wise XOR, compared lexicographically by the routing metric.
    pub fn xor(&self, other: &IdentHash) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_base64(&self) -> String {
        base64_encode(&self.0)
    }

    /// First base64 character, selects the netDb shard directory.
    pub fn shard_char(&self) -> char {
        B64_ALPHABET[(self.0[0] >> 2) as usize] as char
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        write!(f, "{}..", &b64[..8.min(b64.len())])
    }
}

impl fmt::Display for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

pub fn base64_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    let mut chunks = input.chunks_exact(3);
    for c in &mut chunks {
        let n = (u32::from(c[0]) << 16) | (u32::from(c[1]) << 8) | u32::from(c[2]);
        for shift in [18u32, 12, 6, 0] {
            out.push(B64_ALPHABET[((n >> shift) & 0x3F) as usize] as char);
        }
    }
    match chunks.remainder() {
        [b0] => {
            out.push(B64_ALPHABET[(b0 >> 2) as usize] as char);
            out.push(B64_ALPHABET[((b0 & 0x03) << 4) as usize] as char);
            out.push('=');
            out.push('=');
        }
        [b0, b1] => {
            out.push(B64_ALPHABET[(b0 >> 2) as usize] as char);
            out.push(B64_ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
            out.push(B64_ALPHABET[((b1 & 0x0F) << 2) as usize] as char);
            out.push('=');
        }
        _ => {}
    }
    out
}

/// Public half of a destination or router identity: a raw ed25519
/// verifying key. The identity hash is the SHA-256 of the key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    key: [u8; IDENTITY_LEN],
}

impl Identity {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let key: [u8; IDENTITY_LEN] = b.get(..IDENTITY_LEN)?.try_into().ok()?;
        Some(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.key
    }

    pub fn hash(&self) -> IdentHash {
        let digest = Sha256::digest(self.key);
        IdentHash(digest.into())
    }

    /// Verify `sig` over `message`. A key that does not decode as a valid
    /// ed25519 point verifies nothing.
    pub fn verify(&self, message: &[u8], sig: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(sig) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

/// Full keys of a local destination.
pub struct PrivateIdentity {
    signing_key: SigningKey,
    identity: Identity,
}

impl PrivateIdentity {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing_key)
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let identity = Identity {
            key: signing_key.verifying_key().to_bytes(),
        };
        Self {
            signing_key,
            identity,
        }
    }

    /// Load from the 32-byte secret-key serialization, as written by
    /// `to_bytes`.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let secret: [u8; 32] = b.get(..32)?.try_into().ok()?;
        Some(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn hash(&self) -> IdentHash {
        self.identity.hash()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for PrivateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateIdentity")
            .field("hash", &self.hash())
            .finish_non_exhaustive()
    }
}

/// Load keys from `path`, or generate and persist a fresh identity on
/// first start (atomic write).
pub async fn load_or_create_keys(path: &std::path::Path) -> anyhow::Result<PrivateIdentity> {
    use anyhow::Context;

    if let Ok(bytes) = tokio::fs::read(path).await {
        return PrivateIdentity::from_bytes(&bytes)
            .ok_or_else(|| anyhow::anyhow!("malformed key file {}", path.display()));
    }

    let keys = PrivateIdentity::generate();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("keys.tmp");
    tokio::fs::write(&tmp, keys.to_bytes())
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path).await?;
    tracing::info!(hash = %keys.hash(), file = %path.display(), "new identity created");
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_matches_known_mapping_for_plus_slash() {
        // 0xFB 0xEF 0xFF is "++//" in standard base64; here '+' -> '-'
        // and '/' -> '~'.
        assert_eq!(base64_encode(&[0xFB, 0xEF, 0xFF]), "--~~");
    }

    #[test]
    fn base64_pads() {
        assert_eq!(base64_encode(&[0x00]), "AA==");
        assert_eq!(base64_encode(&[0x00, 0x00]), "AAA=");
        assert_eq!(base64_encode(&[]), "");
    }

    #[test]
    fn shard_char_is_first_b64_char() {
        let mut h = IdentHash([0u8; 32]);
        assert_eq!(h.shard_char(), 'A');
        h.0[0] = 0xFF;
        assert_eq!(h.shard_char(), h.to_base64().chars().next().unwrap());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = PrivateIdentity::generate();
        let sig = keys.sign(b"stream handshake");
        assert!(keys.identity().verify(b"stream handshake", &sig));
        assert!(!keys.identity().verify(b"another message", &sig));
    }

    #[test]
    fn private_identity_serialization() {
        let keys = PrivateIdentity::generate();
        let restored = PrivateIdentity::from_bytes(&keys.to_bytes()).unwrap();
        assert_eq!(restored.hash(), keys.hash());
    }

    #[test]
    fn xor_is_symmetric_and_zero_on_self() {
        let a = IdentHash([0xAB; 32]);
        let b = IdentHash([0x13; 32]);
        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&a), [0u8; 32]);
    }
}
