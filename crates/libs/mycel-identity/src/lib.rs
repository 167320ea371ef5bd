//! Subscriber identities and the crypto capabilities the mesh core relies on:
//! Ed25519 signing keys addressed by their public key ("SID"), SHA-512
//! hashing, and the rhizome author-secret scheme used to re-derive bundle
//! signing keys on any device that holds the author's secret.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha512};
use std::fmt;

pub const SID_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;
pub const FILE_HASH_BYTES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("not a valid Ed25519 public key")]
    InvalidKey,
}

/// A 256-bit subscriber identity: the Ed25519 public key of its keypair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid([u8; SID_BYTES]);

impl Sid {
    pub fn from_bytes(bytes: [u8; SID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != SID_BYTES {
            return Err(IdentityError::InvalidLength {
                expected: SID_BYTES,
                actual: bytes.len(),
            });
        }
        let mut sid = [0u8; SID_BYTES];
        sid.copy_from_slice(bytes);
        Ok(Self(sid))
    }

    pub fn from_hex(text: &str) -> Result<Self, IdentityError> {
        Self::from_slice(&hex::decode(text.trim())?)
    }

    pub fn as_bytes(&self) -> &[u8; SID_BYTES] {
        &self.0
    }

    /// Uppercase hex, the canonical text form used in manifests and logs.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Leading bytes, used by the overlay address abbreviation codec.
    pub fn prefix(&self, len: usize) -> &[u8] {
        &self.0[..len.min(SID_BYTES)]
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({}*)", hex::encode_upper(&self.0[..4]))
    }
}

/// An Ed25519 keypair whose public half is the owner's SID.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate<R: CryptoRngCore>(mut rng: R) -> Self {
        Self { signing: SigningKey::generate(&mut rng) }
    }

    pub fn from_secret_bytes(bytes: &[u8; SID_BYTES]) -> Self {
        Self { signing: SigningKey::from_bytes(bytes) }
    }

    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != SID_BYTES {
            return Err(IdentityError::InvalidLength {
                expected: SID_BYTES,
                actual: bytes.len(),
            });
        }
        let mut secret = [0u8; SID_BYTES];
        secret.copy_from_slice(bytes);
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn secret_bytes(&self) -> [u8; SID_BYTES] {
        self.signing.to_bytes()
    }

    pub fn sid(&self) -> Sid {
        Sid(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_BYTES] {
        self.signing.sign(data).to_bytes()
    }
}

/// Verify a detached signature against the public key a SID embodies.
pub fn verify(sid: &Sid, data: &[u8], signature: &[u8]) -> bool {
    let signature = match Signature::from_slice(signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    let key = match VerifyingKey::from_bytes(sid.as_bytes()) {
        Ok(key) => key,
        Err(_) => return false,
    };
    key.verify_strict(data, &signature).is_ok()
}

pub fn sha512(data: &[u8]) -> [u8; FILE_HASH_BYTES] {
    Sha512::digest(data).into()
}

/// Uppercase hex SHA-512, the payload id format of the content store.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode_upper(sha512(data))
}

/// The per-author rhizome secret. Knowing it (plus the bundle id) recovers
/// the bundle's signing key from the manifest's `BK` field, so an author can
/// republish from any of their devices.
#[derive(Clone)]
pub struct RhizomeSecret([u8; SID_BYTES]);

impl RhizomeSecret {
    pub fn generate<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut secret = [0u8; SID_BYTES];
        rng.fill_bytes(&mut secret);
        Self(secret)
    }

    pub fn from_bytes(bytes: [u8; SID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SID_BYTES] {
        &self.0
    }

    /// `BK = secret XOR SHA512(RS || BID)`. The same operation both wraps
    /// and unwraps, so [`Self::recover`] is an alias.
    pub fn bundle_key(&self, bid: &Sid, bundle_secret: &[u8; SID_BYTES]) -> [u8; SID_BYTES] {
        let mut hasher = Sha512::new();
        hasher.update(self.0);
        hasher.update(bid.as_bytes());
        let pad: [u8; 64] = hasher.finalize().into();
        let mut out = [0u8; SID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = bundle_secret[i] ^ pad[i];
        }
        out
    }

    pub fn recover(&self, bid: &Sid, bundle_key: &[u8; SID_BYTES]) -> [u8; SID_BYTES] {
        self.bundle_key(bid, bundle_key)
    }
}
