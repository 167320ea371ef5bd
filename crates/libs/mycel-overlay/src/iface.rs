//! Interface discovery, lifecycle, and link I/O.
//!
//! Interfaces live in a fixed array of slots; a slot is created the first
//! time discovery observes its link and is only ever marked DOWN, never
//! freed, so subscriber references by slot index stay valid. Each sweep
//! marks UP slots DETECTING, feeds the current addresses through the rule
//! list, and closes anything discovery failed to re-observe.
//!
//! Real links are UDP: one socket per interface bound to its unicast address
//! (sends broadcasts, receives unicast) plus a process-wide socket on
//! `INADDR_ANY:port` for platforms that only deliver broadcasts there;
//! datagrams arriving on it are attributed by netmask and dropped when no
//! interface claims them. A `>name` rule makes a file-backed test link whose
//! datagrams are fixed 2048-byte records appended to a shared file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::OverlayError;
use crate::queue::{IfaceView, OutgoingPacket, PacketDest};

pub const OVERLAY_MAX_INTERFACES: usize = 8;
pub const DEFAULT_MTU: usize = 1200;
pub const PORT_DNA: u16 = 4110;
pub const DISCOVERY_INTERVAL_MS: u64 = 5_000;

pub const DUMMY_RECORD_BYTES: usize = 2048;
const DUMMY_HEADER: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
const DUMMY_LENGTH_OFFSET: usize = 110;
const DUMMY_PAYLOAD_OFFSET: usize = 128;
pub const DUMMY_MAX_PAYLOAD: usize = DUMMY_RECORD_BYTES - DUMMY_PAYLOAD_OFFSET;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterfaceType {
    Ethernet,
    Wifi,
    PacketRadio,
    Unknown,
}

impl InterfaceType {
    pub fn parse(text: &str) -> Result<Self, OverlayError> {
        match text.to_ascii_lowercase().as_str() {
            "ethernet" => Ok(Self::Ethernet),
            "wifi" => Ok(Self::Wifi),
            "packetradio" | "catear" => Ok(Self::PacketRadio),
            "other" => Ok(Self::Unknown),
            _ => Err(OverlayError::BadRule(text.to_string())),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterfaceState {
    Down,
    Detecting,
    Up,
}

/// One entry of the discovery filter: `±name[=type][:port[:bps]]`, with a
/// leading `>` in the name marking a file-backed dummy link. An empty name
/// matches every interface; the first matching rule wins.
#[derive(Clone, Debug)]
pub struct InterfaceRule {
    pub exclude: bool,
    pub name: String,
    pub kind: InterfaceType,
    pub port: u16,
    pub bits_per_second: u64,
    pub dummy: bool,
}

impl InterfaceRule {
    pub fn parse(spec: &str) -> Result<Self, OverlayError> {
        let bad = || OverlayError::BadRule(spec.to_string());
        let mut rest = spec.trim();
        let exclude = match rest.chars().next() {
            Some('+') => false,
            Some('-') => true,
            _ => return Err(bad()),
        };
        rest = &rest[1..];

        let mut kind = InterfaceType::Wifi;
        let mut port = PORT_DNA;
        let mut bits_per_second = 1_000_000;

        let mut parts = rest.split(':');
        let head = parts.next().unwrap_or("");
        let name = match head.split_once('=') {
            Some((name, type_text)) => {
                kind = InterfaceType::parse(type_text)?;
                name.to_string()
            }
            None => head.to_string(),
        };
        if let Some(port_text) = parts.next() {
            port = port_text.parse().map_err(|_| bad())?;
        }
        if let Some(speed_text) = parts.next() {
            bits_per_second = parse_quantity(speed_text).ok_or_else(|| bad())?;
            if bits_per_second < 1 {
                return Err(bad());
            }
        }
        if parts.next().is_some() {
            return Err(bad());
        }

        let dummy = name.starts_with('>');
        Ok(Self { exclude, name, kind, port, bits_per_second, dummy })
    }

    /// Parse a comma or newline separated rule list.
    pub fn parse_list(text: &str) -> Result<Vec<Self>, OverlayError> {
        text.split(|c| c == ',' || c == '\n')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(Self::parse)
            .collect()
    }

    fn matches(&self, name: &str) -> bool {
        self.name.is_empty() || self.name.eq_ignore_ascii_case(name)
    }
}

/// Parse a quantity with a single-letter scale suffix, e.g. `1m` or `56K`.
pub fn parse_quantity(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let (digits, suffix) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => text.split_at(split),
        None => (text, ""),
    };
    let value: u64 = digits.parse().ok()?;
    let scale = match suffix {
        "" => 1,
        "k" => 1_000,
        "K" => 1_024,
        "m" => 1_000_000,
        "M" => 1_048_576,
        "g" => 1_000_000_000,
        "G" => 1_073_741_824,
        _ => return None,
    };
    Some(value * scale)
}

/// Per-type tick cadences with per-name overrides (`mdp.<type>.tick_ms`,
/// `mdp.<name>.tick_ms` in the original's configuration).
#[derive(Clone, Debug)]
pub struct TickDefaults {
    pub ethernet_ms: u64,
    pub wifi_ms: u64,
    pub packetradio_ms: u64,
    pub unknown_ms: u64,
    pub overrides: HashMap<String, u64>,
}

impl Default for TickDefaults {
    fn default() -> Self {
        Self {
            ethernet_ms: 500,
            wifi_ms: 500,
            packetradio_ms: 15_000,
            unknown_ms: 500,
            overrides: HashMap::new(),
        }
    }
}

impl TickDefaults {
    fn tick_for(&self, kind: InterfaceType, name: &str) -> u64 {
        let base = match kind {
            InterfaceType::Ethernet => self.ethernet_ms,
            InterfaceType::Wifi => self.wifi_ms,
            InterfaceType::PacketRadio => self.packetradio_ms,
            InterfaceType::Unknown => self.unknown_ms,
        };
        let bare = name.strip_prefix('>').unwrap_or(name);
        self.overrides.get(bare).copied().unwrap_or(base)
    }
}

/// Datagrams and failures surfaced to the core loop by reader tasks.
#[derive(Debug)]
pub enum RxEvent {
    Datagram { iface: usize, src: SocketAddr, bytes: Vec<u8> },
    /// Arrived on the ANY socket; needs interface attribution.
    AnyDatagram { src: SocketAddr, bytes: Vec<u8> },
    SocketError { iface: usize },
}

/// Source of `(name, address, netmask)` triples for discovery. Platform
/// interface enumeration is outside the core; the daemon supplies one.
pub trait AddressProducer {
    fn local_interfaces(&self) -> Vec<(String, Ipv4Addr, Ipv4Addr)>;
}

/// A producer with a fixed address list, for configs and tests.
#[derive(Default)]
pub struct StaticAddressProducer(pub Vec<(String, Ipv4Addr, Ipv4Addr)>);

impl AddressProducer for StaticAddressProducer {
    fn local_interfaces(&self) -> Vec<(String, Ipv4Addr, Ipv4Addr)> {
        self.0.clone()
    }
}

pub struct Interface {
    pub name: String,
    pub kind: InterfaceType,
    pub state: InterfaceState,
    pub address: Option<SocketAddr>,
    pub broadcast: Option<SocketAddr>,
    pub netmask: Option<Ipv4Addr>,
    pub mtu: usize,
    pub bits_per_second: u64,
    pub port: u16,
    pub tick_ms: u64,
    pub last_tick_ms: Option<u64>,
    pub send_broadcasts: bool,
    pub dummy: bool,
    /// Read offset into the dummy file.
    pub recv_offset: u64,
    dummy_path: Option<PathBuf>,
    socket: Option<Arc<UdpSocket>>,
    cancel: Option<CancellationToken>,
}

impl Interface {
    pub fn is_up(&self) -> bool {
        self.state == InterfaceState::Up
    }
}

pub struct InterfaceManager {
    slots: Vec<Interface>,
    rules: Vec<InterfaceRule>,
    ticks: TickDefaults,
    dummy_dir: PathBuf,
    rx: mpsc::UnboundedSender<RxEvent>,
    any_socket: Option<(u16, Arc<UdpSocket>)>,
    cancel: CancellationToken,
    /// Set when any interface came up since the last take; the next
    /// self-announce should then carry the full SID.
    came_up: bool,
}

impl InterfaceManager {
    pub fn new(
        rules: Vec<InterfaceRule>,
        ticks: TickDefaults,
        dummy_dir: impl Into<PathBuf>,
        rx: mpsc::UnboundedSender<RxEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slots: Vec::new(),
            rules,
            ticks,
            dummy_dir: dummy_dir.into(),
            rx,
            any_socket: None,
            cancel,
            came_up: false,
        }
    }

    pub fn slot(&self, idx: usize) -> Option<&Interface> {
        self.slots.get(idx)
    }

    pub fn slot_mut(&mut self, idx: usize) -> Option<&mut Interface> {
        self.slots.get_mut(idx)
    }

    pub fn slots(&self) -> impl Iterator<Item = (usize, &Interface)> {
        self.slots.iter().enumerate()
    }

    pub fn up_count(&self) -> usize {
        self.slots.iter().filter(|iface| iface.is_up()).count()
    }

    /// Views for the TX engine: up/broadcast/MTU per slot.
    pub fn views(&self) -> Vec<IfaceView> {
        self.slots
            .iter()
            .map(|iface| IfaceView {
                up: iface.is_up(),
                send_broadcasts: iface.send_broadcasts,
                mtu: iface.mtu,
            })
            .collect()
    }

    pub fn tick_ms(&self, idx: usize) -> u64 {
        self.slots.get(idx).map(|iface| iface.tick_ms).unwrap_or(0)
    }

    /// True once since the last call if some interface newly came up.
    pub fn take_came_up(&mut self) -> bool {
        std::mem::take(&mut self.came_up)
    }

    /// One discovery sweep. Returns the slots that were closed because the
    /// sweep failed to re-observe them.
    pub async fn discover(&mut self, producer: &dyn AddressProducer, now: u64) -> Vec<usize> {
        for iface in &mut self.slots {
            if iface.state == InterfaceState::Up {
                iface.state = InterfaceState::Detecting;
            }
        }

        let rules = self.rules.clone();
        let mut detect_real = false;
        for rule in &rules {
            if !rule.dummy {
                if !rule.exclude {
                    detect_real = true;
                }
                continue;
            }
            if rule.exclude {
                continue;
            }
            match self.find_by_name(&rule.name) {
                Some(slot) => {
                    if self.slots[slot].state == InterfaceState::Detecting {
                        self.slots[slot].state = InterfaceState::Up;
                    } else if self.slots[slot].state == InterfaceState::Down {
                        if let Err(err) = self.open_dummy(slot) {
                            log::warn!("ov: could not reopen dummy {}: {err}", rule.name);
                        }
                    }
                }
                None => {
                    if let Err(err) = self.init_interface(rule, None, None, now) {
                        log::warn!("ov: could not init dummy interface {}: {err}", rule.name);
                    }
                }
            }
        }

        if detect_real {
            for (name, addr, netmask) in producer.local_interfaces() {
                if let Err(err) = self.register(&name, addr, netmask, now).await {
                    log::warn!("ov: could not register interface {name}: {err}");
                }
            }
        }

        let mut closed = Vec::new();
        for slot in 0..self.slots.len() {
            if self.slots[slot].state == InterfaceState::Detecting {
                self.close(slot);
                closed.push(slot);
            }
        }
        closed
    }

    /// Register (or refresh) one observed link address.
    pub async fn register(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        netmask: Ipv4Addr,
        now: u64,
    ) -> Result<(), OverlayError> {
        let rule = match self.rules.iter().find(|rule| !rule.dummy && rule.matches(name)) {
            Some(rule) => rule.clone(),
            None => return Ok(()),
        };
        if rule.exclude {
            log::debug!("ov: interface {name} is not interesting");
            return Ok(());
        }

        let broadcast = Ipv4Addr::from(u32::from(addr) | !u32::from(netmask));
        let mut exact = None;
        let mut revive = None;
        for (slot, iface) in self.slots.iter().enumerate() {
            let name_match = iface.name.eq_ignore_ascii_case(name);
            let broadcast_match = iface
                .broadcast
                .map(|existing| existing.ip() == std::net::IpAddr::V4(broadcast))
                .unwrap_or(false);
            if name_match && broadcast_match {
                exact = Some((slot, iface.state));
                break;
            }
            if name_match && iface.state == InterfaceState::Down {
                revive = Some(slot);
            }
        }

        if let Some((slot, state)) = exact {
            return match state {
                InterfaceState::Detecting => {
                    self.slots[slot].state = InterfaceState::Up;
                    Ok(())
                }
                InterfaceState::Down => self.bind_socket(slot, addr, netmask, broadcast).await,
                InterfaceState::Up => Ok(()),
            };
        }
        if let Some(slot) = revive {
            return self.bind_socket(slot, addr, netmask, broadcast).await;
        }

        let slot = self.init_interface(&rule, Some((addr, netmask)), Some(name), now)?;
        self.bind_socket(slot, addr, netmask, broadcast).await
    }

    fn init_interface(
        &mut self,
        rule: &InterfaceRule,
        addr: Option<(Ipv4Addr, Ipv4Addr)>,
        name: Option<&str>,
        _now: u64,
    ) -> Result<usize, OverlayError> {
        if self.slots.len() >= OVERLAY_MAX_INTERFACES {
            return Err(OverlayError::TooManyInterfaces(OVERLAY_MAX_INTERFACES));
        }
        let name = name.unwrap_or(&rule.name).to_string();
        let tick_ms = self.ticks.tick_for(rule.kind, &name);
        let send_broadcasts = tick_ms > 0;
        if !send_broadcasts {
            log::info!("ov: interface {name} is running tickless");
        }
        let slot = self.slots.len();
        self.slots.push(Interface {
            name,
            kind: rule.kind,
            state: InterfaceState::Down,
            address: addr.map(|(a, _)| SocketAddr::from(SocketAddrV4::new(a, rule.port))),
            broadcast: None,
            netmask: addr.map(|(_, mask)| mask),
            mtu: DEFAULT_MTU,
            bits_per_second: rule.bits_per_second,
            port: rule.port,
            tick_ms,
            last_tick_ms: None,
            send_broadcasts,
            dummy: rule.dummy,
            recv_offset: 0,
            dummy_path: None,
            socket: None,
            cancel: None,
        });
        if rule.dummy {
            self.open_dummy(slot)?;
        }
        Ok(slot)
    }

    fn dummy_path(&self, name: &str) -> PathBuf {
        let bare = name.strip_prefix('>').unwrap_or(name);
        if let Some(rest) = bare.strip_prefix('/') {
            Path::new("/").join(rest)
        } else {
            self.dummy_dir.join(bare)
        }
    }

    fn open_dummy(&mut self, slot: usize) -> Result<(), OverlayError> {
        let path = self.dummy_path(&self.slots[slot].name.clone());
        let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        // start reading at the current tail, like seeking to EOF
        let start = file.metadata()?.len();
        let iface = &mut self.slots[slot];
        iface.dummy_path = Some(path);
        iface.recv_offset = start;
        iface.state = InterfaceState::Up;
        self.came_up = true;
        log::info!("ov: dummy interface {} is up", iface.name);
        Ok(())
    }

    async fn bind_socket(
        &mut self,
        slot: usize,
        addr: Ipv4Addr,
        netmask: Ipv4Addr,
        broadcast: Ipv4Addr,
    ) -> Result<(), OverlayError> {
        let port = self.slots[slot].port;
        self.ensure_any_socket(port).await?;

        let socket = match UdpSocket::bind(SocketAddrV4::new(addr, port)).await {
            Ok(socket) => socket,
            Err(err) => {
                self.slots[slot].state = InterfaceState::Down;
                return Err(err.into());
            }
        };
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        let cancel = self.cancel.child_token();
        spawn_reader(socket.clone(), Some(slot), self.rx.clone(), cancel.clone());

        let iface = &mut self.slots[slot];
        iface.address = Some(SocketAddr::from(SocketAddrV4::new(addr, port)));
        iface.broadcast = Some(SocketAddr::from(SocketAddrV4::new(broadcast, port)));
        iface.netmask = Some(netmask);
        iface.socket = Some(socket);
        iface.cancel = Some(cancel);
        iface.state = InterfaceState::Up;
        self.came_up = true;
        log::info!("ov: interface {} addr {addr} is up", iface.name);
        Ok(())
    }

    async fn ensure_any_socket(&mut self, port: u16) -> Result<(), OverlayError> {
        if let Some((bound, _)) = &self.any_socket {
            if *bound != port {
                log::warn!("ov: cannot listen for broadcasts on both port {bound} and {port}");
            }
            return Ok(());
        }
        let socket =
            Arc::new(UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?);
        socket.set_broadcast(true)?;
        spawn_reader(socket.clone(), None, self.rx.clone(), self.cancel.child_token());
        self.any_socket = Some((port, socket));
        Ok(())
    }

    pub fn close(&mut self, slot: usize) {
        let iface = &mut self.slots[slot];
        if iface.state == InterfaceState::Down {
            return;
        }
        log::info!("ov: interface {} is down", iface.name);
        if let Some(cancel) = iface.cancel.take() {
            cancel.cancel();
        }
        iface.socket = None;
        iface.state = InterfaceState::Down;
        iface.last_tick_ms = None;
    }

    /// Attribute a datagram from the ANY socket to the interface whose
    /// network contains the source address.
    pub fn find_by_src(&self, src: Ipv4Addr) -> Option<usize> {
        self.slots.iter().position(|iface| {
            if !iface.is_up() {
                return false;
            }
            match (iface.netmask, iface.address) {
                (Some(mask), Some(SocketAddr::V4(addr))) => {
                    u32::from(src) & u32::from(mask)
                        == u32::from(*addr.ip()) & u32::from(mask)
                }
                _ => false,
            }
        })
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        let bare = name.strip_prefix('>').unwrap_or(name);
        self.slots.iter().position(|iface| {
            iface.name.strip_prefix('>').unwrap_or(&iface.name).eq_ignore_ascii_case(bare)
        })
    }

    /// Send an assembled packet out its interface. I/O failure closes the
    /// interface and surfaces the error.
    pub async fn send(&mut self, packet: &OutgoingPacket) -> Result<(), OverlayError> {
        let slot = packet.iface;
        let iface = self.slots.get(slot).ok_or(OverlayError::InterfaceDown(slot))?;
        if !iface.is_up() {
            return Err(OverlayError::InterfaceDown(slot));
        }
        if iface.dummy {
            return self.write_dummy_record(slot, packet.buffer.as_slice());
        }
        let dest = match packet.dest {
            PacketDest::Unicast(addr) => addr,
            PacketDest::Broadcast => {
                iface.broadcast.ok_or(OverlayError::InterfaceDown(slot))?
            }
        };
        let socket = iface.socket.clone().ok_or(OverlayError::InterfaceDown(slot))?;
        match socket.send_to(packet.buffer.as_slice(), dest).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => {
                log::warn!("ov: send on {} failed: {err}", self.slots[slot].name);
                self.close(slot);
                Err(err.into())
            }
        }
    }

    fn write_dummy_record(&mut self, slot: usize, payload: &[u8]) -> Result<(), OverlayError> {
        let iface = &self.slots[slot];
        let path = iface.dummy_path.clone().ok_or(OverlayError::InterfaceDown(slot))?;
        let mut len = payload.len();
        if len > DUMMY_MAX_PAYLOAD {
            log::warn!(
                "ov: truncating {len} byte packet to fit the {DUMMY_MAX_PAYLOAD} byte dummy record"
            );
            len = DUMMY_MAX_PAYLOAD;
        }
        let mut record = [0u8; DUMMY_RECORD_BYTES];
        record[..4].copy_from_slice(&DUMMY_HEADER);
        let pid = std::process::id();
        record[4] = pid as u8;
        record[5] = (pid >> 8) as u8;
        record[DUMMY_LENGTH_OFFSET] = len as u8;
        record[DUMMY_LENGTH_OFFSET + 1] = (len >> 8) as u8;
        record[DUMMY_PAYLOAD_OFFSET..DUMMY_PAYLOAD_OFFSET + len]
            .copy_from_slice(&payload[..len]);

        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&record)?;
        Ok(())
    }

    /// Read any complete records appended to a dummy interface file since
    /// the last poll. Returns the contained packets.
    pub fn dummy_poll(&mut self, slot: usize) -> Result<Vec<Vec<u8>>, OverlayError> {
        let iface = self.slots.get_mut(slot).ok_or(OverlayError::InterfaceDown(slot))?;
        if !iface.dummy || !iface.is_up() {
            return Ok(Vec::new());
        }
        let path = iface.dummy_path.clone().ok_or(OverlayError::InterfaceDown(slot))?;
        let mut file = File::open(&path)?;
        let length = file.metadata()?.len();
        let pending = length.saturating_sub(iface.recv_offset) / DUMMY_RECORD_BYTES as u64;
        if pending > 20 {
            log::warn!("ov: getting behind, {pending} unread records on {}", iface.name);
        }

        let mut packets = Vec::new();
        file.seek(SeekFrom::Start(iface.recv_offset))?;
        let mut record = [0u8; DUMMY_RECORD_BYTES];
        while iface.recv_offset + DUMMY_RECORD_BYTES as u64 <= length {
            file.read_exact(&mut record)?;
            iface.recv_offset += DUMMY_RECORD_BYTES as u64;
            if record[..4] != DUMMY_HEADER {
                log::warn!(
                    "ov: unsupported record version {:02x} {:02x} {:02x} {:02x} on {}",
                    record[0],
                    record[1],
                    record[2],
                    record[3],
                    iface.name
                );
                continue;
            }
            let plen = record[DUMMY_LENGTH_OFFSET] as usize
                | (record[DUMMY_LENGTH_OFFSET + 1] as usize) << 8;
            if plen > DUMMY_MAX_PAYLOAD {
                log::warn!("ov: invalid record length {plen} on {}", iface.name);
                continue;
            }
            packets.push(record[DUMMY_PAYLOAD_OFFSET..DUMMY_PAYLOAD_OFFSET + plen].to_vec());
        }
        Ok(packets)
    }
}

fn spawn_reader(
    socket: Arc<UdpSocket>,
    iface: Option<usize>,
    rx: mpsc::UnboundedSender<RxEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16384];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, src)) => {
                        let event = match iface {
                            Some(slot) => RxEvent::Datagram {
                                iface: slot,
                                src,
                                bytes: buf[..len].to_vec(),
                            },
                            None => RxEvent::AnyDatagram { src, bytes: buf[..len].to_vec() },
                        };
                        if rx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("ov: recv failed: {err}");
                        if let Some(slot) = iface {
                            let _ = rx.send(RxEvent::SocketError { iface: slot });
                        }
                        break;
                    }
                },
            }
        }
    });
}
