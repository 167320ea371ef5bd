//! Bundle Advertisement Records: the fixed-width digest of a bundle that
//! peers exchange for set reconciliation without shipping full manifests.

use crate::error::RhizomeError;
use crate::manifest::Manifest;

pub const BAR_BYTES: usize = 32;
/// How much of the bundle id a BAR carries.
pub const BAR_PREFIX_BYTES: usize = 15;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Bar {
    pub bid_prefix: [u8; BAR_PREFIX_BYTES],
    pub version: u64,
    /// Coarse payload size bucket: the bit length of the payload size.
    pub log_size: u8,
    pub ttl: u8,
}

impl Bar {
    pub fn from_manifest(manifest: &Manifest, ttl: u8) -> Result<Self, RhizomeError> {
        let id = manifest.id()?;
        let mut bid_prefix = [0u8; BAR_PREFIX_BYTES];
        bid_prefix.copy_from_slice(id.prefix(BAR_PREFIX_BYTES));
        let version = manifest
            .version()
            .ok_or_else(|| RhizomeError::Validation("manifest missing \"version\" field".into()))?;
        let filesize = manifest.filesize().unwrap_or(0);
        Ok(Self { bid_prefix, version, log_size: size_bucket(filesize), ttl })
    }

    pub fn encode(&self) -> [u8; BAR_BYTES] {
        let mut out = [0u8; BAR_BYTES];
        out[..BAR_PREFIX_BYTES].copy_from_slice(&self.bid_prefix);
        out[BAR_PREFIX_BYTES..BAR_PREFIX_BYTES + 8].copy_from_slice(&self.version.to_be_bytes());
        out[23] = self.log_size;
        out[24] = self.ttl;
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RhizomeError> {
        if bytes.len() < BAR_BYTES {
            return Err(RhizomeError::Parse(format!(
                "BAR needs {BAR_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        let mut bid_prefix = [0u8; BAR_PREFIX_BYTES];
        bid_prefix.copy_from_slice(&bytes[..BAR_PREFIX_BYTES]);
        let mut version_bytes = [0u8; 8];
        version_bytes.copy_from_slice(&bytes[BAR_PREFIX_BYTES..BAR_PREFIX_BYTES + 8]);
        Ok(Self {
            bid_prefix,
            version: u64::from_be_bytes(version_bytes),
            log_size: bytes[23],
            ttl: bytes[24],
        })
    }
}

pub fn size_bucket(filesize: u64) -> u8 {
    (64 - filesize.leading_zeros()) as u8
}

pub const ADVERT_VERSION: u8 = 1;

/// Encode the bundle advertisement piggybacked on overlay packets: a
/// version byte, the advertiser's HTTP port, and the freshest BARs.
pub fn encode_advert(http_port: u16, bars: &[Bar]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bars.len() * BAR_BYTES);
    out.push(ADVERT_VERSION);
    out.extend_from_slice(&http_port.to_be_bytes());
    out.push(bars.len() as u8);
    for bar in bars {
        out.extend_from_slice(&bar.encode());
    }
    out
}

pub fn decode_advert(bytes: &[u8]) -> Result<(u16, Vec<Bar>), RhizomeError> {
    if bytes.len() < 4 {
        return Err(RhizomeError::Parse("advert shorter than its header".into()));
    }
    if bytes[0] != ADVERT_VERSION {
        return Err(RhizomeError::Parse(format!("unknown advert version {}", bytes[0])));
    }
    let http_port = u16::from_be_bytes([bytes[1], bytes[2]]);
    let count = bytes[3] as usize;
    let mut bars = Vec::with_capacity(count);
    let mut rest = &bytes[4..];
    for _ in 0..count {
        bars.push(Bar::decode(rest)?);
        rest = &rest[BAR_BYTES..];
    }
    Ok((http_port, bars))
}
