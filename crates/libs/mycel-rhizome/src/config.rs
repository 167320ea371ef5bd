//! Rhizome runtime options and the `rhizome.conf` space file.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use mycel_identity::Sid;

/// Default store budget when `rhizome.conf` is absent: 100 MiB.
pub const DEFAULT_SPACE_KIB: u64 = 100 * 1024;

pub const FETCH_INTERVAL_DEFAULT_MS: u64 = 3_000;
pub const FETCH_INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 1..=3_600_000;

#[derive(Clone, Debug)]
pub struct RhizomeConfig {
    pub enable: bool,
    pub fetch_interval_ms: u64,
    /// URI accepting bare-file bundle creation posts, when configured.
    pub addfile_uri: Option<String>,
    /// Only this address may use the bare-file API.
    pub addfile_allowed_address: IpAddr,
    pub addfile_manifest_template: Option<PathBuf>,
    /// Author to bind new bare-file bundles to.
    pub addfile_author: Option<Sid>,
    /// Bundle secret for updating an existing bare-file bundle.
    pub addfile_bundle_secret: Option<[u8; 32]>,
}

impl Default for RhizomeConfig {
    fn default() -> Self {
        Self {
            enable: true,
            fetch_interval_ms: FETCH_INTERVAL_DEFAULT_MS,
            addfile_uri: None,
            addfile_allowed_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            addfile_manifest_template: None,
            addfile_author: None,
            addfile_bundle_secret: None,
        }
    }
}

impl RhizomeConfig {
    pub fn clamp(mut self) -> Self {
        self.fetch_interval_ms = self
            .fetch_interval_ms
            .clamp(*FETCH_INTERVAL_RANGE_MS.start(), *FETCH_INTERVAL_RANGE_MS.end());
        self
    }
}

/// Read the store budget from `<dir>/rhizome.conf`. The only recognised key
/// is `space=<KiB>`.
pub fn read_space_conf(dir: &Path) -> u64 {
    let path = dir.join("rhizome.conf");
    let kib = std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| {
            text.lines().find_map(|line| {
                line.trim().strip_prefix("space=").and_then(|value| value.trim().parse().ok())
            })
        })
        .unwrap_or(DEFAULT_SPACE_KIB);
    kib * 1024
}

pub fn write_space_conf(dir: &Path, kib: u64) -> std::io::Result<()> {
    std::fs::write(dir.join("rhizome.conf"), format!("space={kib}\n"))
}
