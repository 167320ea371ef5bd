//! Bundle manifests.
//!
//! A manifest is a newline-delimited `key=value` text block of at most 8192
//! bytes, a NUL separator, and zero or more trailing signature blocks. Each
//! signature covers the SHA-512 of the text portion inclusive of the NUL.
//! The bundle id is the Ed25519 public key whose secret half signed the
//! manifest; a manifest with a verifying signature of that key is
//! self-signed and therefore tamper-proof end to end.

use mycel_identity::{self as identity, Keypair, RhizomeSecret, Sid, SIGNATURE_BYTES};

use crate::error::RhizomeError;

pub const MAX_MANIFEST_BYTES: usize = 8192;
/// Signature block type byte for Ed25519.
pub const SIG_TYPE_ED25519: u8 = 0x17;

pub const SERVICE_FILE: &str = "file";
pub const SERVICE_MESHMS: &str = "MeshMS";

#[derive(Clone, Default)]
pub struct Manifest {
    vars: Vec<(String, String)>,
    signatures: Vec<(u8, Vec<u8>)>,
    /// Bundle signing secret, when this node knows it.
    secret: Option<[u8; 32]>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.parse().ok()
    }

    /// Set a variable, replacing in place to keep serialization stable.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.vars.iter_mut().find(|(name, _)| name == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key.to_string(), value)),
        }
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set(key, value.to_string());
    }

    pub fn del(&mut self, key: &str) {
        self.vars.retain(|(name, _)| name != key);
    }

    pub fn id(&self) -> Result<Sid, RhizomeError> {
        let text = self.get("id").ok_or_else(|| missing("id"))?;
        Ok(Sid::from_hex(text)?)
    }

    pub fn version(&self) -> Option<u64> {
        self.get_u64("version")
    }

    pub fn filesize(&self) -> Option<u64> {
        self.get_u64("filesize")
    }

    pub fn filehash(&self) -> Option<&str> {
        self.get("filehash")
    }

    pub fn service(&self) -> Option<&str> {
        self.get("service")
    }

    pub fn secret(&self) -> Option<&[u8; 32]> {
        self.secret.as_ref()
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    /// The `key=value` text block, without the NUL terminator.
    pub fn text_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.vars {
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// SHA-512 over the signed region: the text block plus the NUL.
    pub fn manifest_hash(&self) -> [u8; 64] {
        let mut region = self.text_bytes();
        region.push(0);
        identity::sha512(&region)
    }

    /// Full wire form: text, NUL, signature blocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.text_bytes();
        out.push(0);
        for (sig_type, signature) in &self.signatures {
            out.push(*sig_type);
            out.extend_from_slice(signature);
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, RhizomeError> {
        let nul = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RhizomeError::Parse("manifest has no NUL terminator".into()))?;
        if nul + 1 > MAX_MANIFEST_BYTES {
            return Err(RhizomeError::Parse(format!(
                "manifest text of {} bytes exceeds {MAX_MANIFEST_BYTES}",
                nul + 1
            )));
        }
        let text = std::str::from_utf8(&bytes[..nul])
            .map_err(|_| RhizomeError::Parse("manifest text is not utf-8".into()))?;

        let mut vars = Vec::new();
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| RhizomeError::Parse(format!("bad manifest line {line:?}")))?;
            if key.is_empty() {
                return Err(RhizomeError::Parse("empty variable name".into()));
            }
            vars.push((key.to_string(), value.to_string()));
        }

        let mut signatures = Vec::new();
        let mut rest = &bytes[nul + 1..];
        while !rest.is_empty() {
            let sig_type = rest[0];
            match sig_type {
                SIG_TYPE_ED25519 => {
                    if rest.len() < 1 + SIGNATURE_BYTES {
                        return Err(RhizomeError::Parse("truncated signature block".into()));
                    }
                    signatures.push((sig_type, rest[1..1 + SIGNATURE_BYTES].to_vec()));
                    rest = &rest[1 + SIGNATURE_BYTES..];
                }
                other => {
                    return Err(RhizomeError::Parse(format!(
                        "unknown signature type 0x{other:02x}"
                    )));
                }
            }
        }

        Ok(Self { vars, signatures, secret: None })
    }

    /// Bind a fresh bundle id: generate the keypair, set `id`, and when the
    /// author is known record `BK` so they can recover the key later.
    pub fn create_id<R: rand_core::CryptoRngCore>(
        &mut self,
        rng: R,
        author: Option<&RhizomeSecret>,
    ) -> Sid {
        let keypair = Keypair::generate(rng);
        let bid = keypair.sid();
        self.set("id", bid.to_hex());
        let secret = keypair.secret_bytes();
        if let Some(author) = author {
            self.set("BK", hex::encode_upper(author.bundle_key(&bid, &secret)));
        }
        self.secret = Some(secret);
        bid
    }

    /// Install a bundle secret supplied out of band and check it matches
    /// the manifest id.
    pub fn set_secret(&mut self, secret: [u8; 32]) -> Result<(), RhizomeError> {
        let expected = self.id()?;
        if Keypair::from_secret_bytes(&secret).sid() != expected {
            return Err(RhizomeError::Crypto(
                "bundle secret does not match the manifest id".into(),
            ));
        }
        self.secret = Some(secret);
        Ok(())
    }

    /// Recover the bundle secret from `BK` using the author's rhizome
    /// secret.
    pub fn recover_secret(&mut self, author: &RhizomeSecret) -> Result<(), RhizomeError> {
        let bid = self.id()?;
        let bk_hex = self.get("BK").ok_or_else(|| missing("BK"))?;
        let bk_bytes = hex::decode(bk_hex)
            .map_err(|_| RhizomeError::Parse("BK is not valid hex".into()))?;
        if bk_bytes.len() != 32 {
            return Err(RhizomeError::Parse("BK must be 32 bytes".into()));
        }
        let mut bk = [0u8; 32];
        bk.copy_from_slice(&bk_bytes);
        self.set_secret(author.recover(&bid, &bk))
    }

    /// Sign the manifest with its bundle secret, appending an Ed25519
    /// signature block. Mutating any variable afterwards invalidates it.
    pub fn sign(&mut self) -> Result<(), RhizomeError> {
        let secret =
            self.secret.ok_or_else(|| RhizomeError::Crypto("bundle secret unknown".into()))?;
        let keypair = Keypair::from_secret_bytes(&secret);
        if keypair.sid() != self.id()? {
            return Err(RhizomeError::Crypto("signing key does not match id".into()));
        }
        let signature = keypair.sign(&self.manifest_hash());
        self.signatures.push((SIG_TYPE_ED25519, signature.to_vec()));
        Ok(())
    }

    /// A manifest is valid only when it carries at least one signature and
    /// every signature verifies against the id.
    pub fn verify(&self) -> Result<(), RhizomeError> {
        let id = self.id()?;
        if self.signatures.is_empty() {
            return Err(RhizomeError::Crypto("manifest is unsigned".into()));
        }
        let hash = self.manifest_hash();
        for (sig_type, signature) in &self.signatures {
            if *sig_type != SIG_TYPE_ED25519 {
                return Err(RhizomeError::Crypto(format!(
                    "unsupported signature type 0x{sig_type:02x}"
                )));
            }
            if !identity::verify(&id, &hash, signature) {
                return Err(RhizomeError::Crypto("signature verification failed".into()));
            }
        }
        Ok(())
    }

    /// Whether some signature verifies against the manifest id itself.
    pub fn self_signed(&self) -> bool {
        let Ok(id) = self.id() else {
            return false;
        };
        let hash = self.manifest_hash();
        self.signatures
            .iter()
            .any(|(sig_type, signature)| {
                *sig_type == SIG_TYPE_ED25519 && identity::verify(&id, &hash, signature)
            })
    }

    /// Structural sanity rules, checked before anything touches the store.
    pub fn check_sanity(&self) -> Result<(), RhizomeError> {
        let service = self.service().ok_or_else(|| missing("service"))?;
        if service.is_empty() {
            return Err(missing("service"));
        }
        self.id()?;
        self.get_u64("date").ok_or_else(|| missing("date"))?;
        self.version().ok_or_else(|| missing("version"))?;
        let filesize = self.filesize().ok_or_else(|| missing("filesize"))?;
        match (filesize > 0, self.filehash()) {
            (true, None) => return Err(missing("filehash")),
            (false, Some(_)) => {
                return Err(RhizomeError::Validation(
                    "filehash must be absent for an empty payload".into(),
                ))
            }
            _ => {}
        }
        if service.eq_ignore_ascii_case(SERVICE_FILE) {
            self.get("name").ok_or_else(|| missing("name"))?;
        } else if service.eq_ignore_ascii_case(SERVICE_MESHMS) {
            for field in ["sender", "recipient"] {
                let text = self.get(field).ok_or_else(|| missing(field))?;
                Sid::from_hex(text).map_err(|_| {
                    RhizomeError::Validation(format!("{field} is not a subscriber id"))
                })?;
            }
        } else {
            return Err(RhizomeError::Validation(format!("invalid service {service:?}")));
        }
        Ok(())
    }

    /// Check a payload against the declared size and hash.
    pub fn verify_payload(&self, payload: &[u8]) -> Result<(), RhizomeError> {
        let declared = self.filesize().ok_or_else(|| missing("filesize"))?;
        if declared != payload.len() as u64 {
            return Err(RhizomeError::Validation(format!(
                "filesize {declared} does not match payload of {} bytes",
                payload.len()
            )));
        }
        if declared == 0 {
            return Ok(());
        }
        let actual = identity::sha512_hex(payload);
        let expected = self.filehash().ok_or_else(|| missing("filehash"))?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(RhizomeError::Validation("filehash does not match payload".into()));
        }
        Ok(())
    }
}

fn missing(field: &str) -> RhizomeError {
    RhizomeError::Validation(format!("manifest missing {field:?} field"))
}
