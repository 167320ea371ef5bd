//! Daemon configuration: a TOML file mapping onto the interface filter
//! rules, per-type tick cadences, and the rhizome options.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use mycel_identity::Sid;
use mycel_overlay::iface::{InterfaceRule, TickDefaults, PORT_DNA};
use mycel_rhizome::config::RhizomeConfig;

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_instance_dir")]
    pub instance_dir: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Interface filter entries, first match wins: `±name[=type][:port[:bps]]`.
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Static peers to run HTTP sync rounds against, `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Local link addresses handed to discovery.
    #[serde(default)]
    pub addresses: Vec<AddressEntry>,
    #[serde(default)]
    pub rhizome: RhizomeSection,
    #[serde(default)]
    pub mdp: MdpSection,
    /// Whether a call client is attached; without one incoming calls are
    /// rejected.
    #[serde(default)]
    pub accept_calls: bool,
}

fn default_instance_dir() -> PathBuf {
    PathBuf::from("mycel-instance")
}

fn default_port() -> u16 {
    PORT_DNA
}

fn default_http_port() -> u16 {
    4111
}

#[derive(Debug, Deserialize)]
pub struct AddressEntry {
    pub name: String,
    pub addr: IpAddr,
    pub netmask: IpAddr,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RhizomeSection {
    pub enable: bool,
    pub fetch_interval_ms: u64,
    pub api_addfile_uri: Option<String>,
    pub api_addfile_allowed_address: Option<IpAddr>,
    pub api_addfile_manifest_template: Option<PathBuf>,
    pub api_addfile_author: Option<String>,
    pub api_addfile_bundle_secret_key: Option<String>,
}

impl Default for RhizomeSection {
    fn default() -> Self {
        Self {
            enable: true,
            fetch_interval_ms: mycel_rhizome::config::FETCH_INTERVAL_DEFAULT_MS,
            api_addfile_uri: None,
            api_addfile_allowed_address: None,
            api_addfile_manifest_template: None,
            api_addfile_author: None,
            api_addfile_bundle_secret_key: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MdpSection {
    pub ethernet_tick_ms: u64,
    pub wifi_tick_ms: u64,
    pub packetradio_tick_ms: u64,
    pub unknown_tick_ms: u64,
    /// Base directory for `>name` dummy interface files.
    pub interface_folder: Option<PathBuf>,
    /// Per-interface-name tick overrides.
    pub tick_ms_overrides: HashMap<String, u64>,
}

impl Default for MdpSection {
    fn default() -> Self {
        let ticks = TickDefaults::default();
        Self {
            ethernet_tick_ms: ticks.ethernet_ms,
            wifi_tick_ms: ticks.wifi_ms,
            packetradio_tick_ms: ticks.packetradio_ms,
            unknown_tick_ms: ticks.unknown_ms,
            interface_folder: None,
            tick_ms_overrides: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn interface_rules(&self) -> Result<Vec<InterfaceRule>, mycel_overlay::OverlayError> {
        let mut rules = Vec::new();
        for spec in &self.interfaces {
            rules.extend(InterfaceRule::parse_list(spec)?);
        }
        Ok(rules)
    }

    pub fn tick_defaults(&self) -> TickDefaults {
        TickDefaults {
            ethernet_ms: clamp_tick(self.mdp.ethernet_tick_ms),
            wifi_ms: clamp_tick(self.mdp.wifi_tick_ms),
            packetradio_ms: clamp_tick(self.mdp.packetradio_tick_ms),
            unknown_ms: clamp_tick(self.mdp.unknown_tick_ms),
            overrides: self
                .mdp
                .tick_ms_overrides
                .iter()
                .map(|(name, &ms)| (name.clone(), clamp_tick(ms)))
                .collect(),
        }
    }

    pub fn rhizome_config(&self) -> RhizomeConfig {
        let defaults = RhizomeConfig::default();
        RhizomeConfig {
            enable: self.rhizome.enable,
            fetch_interval_ms: self.rhizome.fetch_interval_ms,
            addfile_uri: self.rhizome.api_addfile_uri.clone(),
            addfile_allowed_address: self
                .rhizome
                .api_addfile_allowed_address
                .unwrap_or(defaults.addfile_allowed_address),
            addfile_manifest_template: self.rhizome.api_addfile_manifest_template.clone(),
            addfile_author: self
                .rhizome
                .api_addfile_author
                .as_deref()
                .and_then(|text| Sid::from_hex(text).ok()),
            addfile_bundle_secret: self
                .rhizome
                .api_addfile_bundle_secret_key
                .as_deref()
                .and_then(|text| hex::decode(text).ok())
                .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok()),
        }
        .clamp()
    }

    pub fn dummy_dir(&self) -> PathBuf {
        self.mdp.interface_folder.clone().unwrap_or_else(|| self.instance_dir.clone())
    }
}

/// Tick intervals outside 1..=3600000 ms are clamped; zero stays zero
/// because it means "tickless".
fn clamp_tick(ms: u64) -> u64 {
    if ms == 0 {
        0
    } else {
        ms.clamp(1, 3_600_000)
    }
}
